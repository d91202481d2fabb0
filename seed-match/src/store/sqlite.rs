//! SQLite state store
//!
//! Persists matching state in the schema created by
//! `seed_common::db::init_database`. Every commit runs in one transaction
//! wrapped in `retry_on_lock`, so concurrent class workers back off instead
//! of failing on SQLite lock contention.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::{ChangeSet, RecordFilter, StateStore};
use crate::error::{MatchError, MatchResult};
use crate::models::{
    AuditNode, CanonicalEntity, FieldValue, ImportBatch, Record, RecordKind, View,
};
use crate::utils::retry_on_lock;

const RECORD_COLUMNS: &str = "id, kind, organization_id, import_batch_id, source_type, \
     data_state, merge_state, fields, extra_data, hash, created_at, updated_at";

const NODE_COLUMNS: &str = "seq, id, record_id, parent1_id, parent2_id, edge, import_filename, \
     organization_id, created_at";

const ENTITY_COLUMNS: &str =
    "id, kind, organization_id, active, merged_into, last_record_id, created_at, updated_at";

const VIEW_COLUMNS: &str =
    "id, entity_id, cycle_id, record_id, organization_id, kind, created_at, updated_at";

/// sqlx-backed [`StateStore`]
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteStore {
    /// Wrap an initialized pool, reading the lock wait budget from settings
    pub async fn open(pool: SqlitePool) -> MatchResult<Self> {
        let max_wait =
            seed_common::db::get_setting_i64(&pool, "database_max_lock_wait_ms", 5000).await?;
        Ok(Self::with_lock_wait(pool, max_wait.max(0) as u64))
    }

    pub fn with_lock_wait(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn corrupt(what: &str, err: impl std::fmt::Display) -> MatchError {
    MatchError::Common(seed_common::Error::Internal(format!(
        "Failed to parse {}: {}",
        what, err
    )))
}

fn parse_uuid(value: &str, what: &str) -> MatchResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| corrupt(what, e))
}

fn parse_opt_uuid(value: Option<String>, what: &str) -> MatchResult<Option<Uuid>> {
    value.map(|v| parse_uuid(&v, what)).transpose()
}

fn parse_ts(value: &str, what: &str) -> MatchResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(what, e))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> MatchResult<T> {
    value.parse::<T>().map_err(|e| corrupt("enum column", e))
}

fn record_from_row(row: &SqliteRow) -> MatchResult<Record> {
    let fields: String = row.try_get("fields")?;
    let extra_data: String = row.try_get("extra_data")?;
    let fields: BTreeMap<String, FieldValue> = serde_json::from_str(&fields)?;
    let extra_data: BTreeMap<String, FieldValue> = serde_json::from_str(&extra_data)?;

    Ok(Record {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "record id")?,
        kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
        organization_id: row.try_get("organization_id")?,
        import_batch_id: parse_opt_uuid(row.try_get("import_batch_id")?, "import_batch_id")?,
        source_type: row.try_get("source_type")?,
        data_state: parse_enum(&row.try_get::<String, _>("data_state")?)?,
        merge_state: parse_enum(&row.try_get::<String, _>("merge_state")?)?,
        fields,
        extra_data,
        hash: row.try_get("hash")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}

fn node_from_row(row: &SqliteRow) -> MatchResult<AuditNode> {
    Ok(AuditNode {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "node id")?,
        sequence: row.try_get("seq")?,
        record_id: parse_uuid(&row.try_get::<String, _>("record_id")?, "node record_id")?,
        parent1: parse_opt_uuid(row.try_get("parent1_id")?, "parent1_id")?,
        parent2: parse_opt_uuid(row.try_get("parent2_id")?, "parent2_id")?,
        edge: parse_enum(&row.try_get::<String, _>("edge")?)?,
        import_filename: row.try_get("import_filename")?,
        organization_id: row.try_get("organization_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
    })
}

fn entity_from_row(row: &SqliteRow) -> MatchResult<CanonicalEntity> {
    Ok(CanonicalEntity {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "entity id")?,
        kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
        organization_id: row.try_get("organization_id")?,
        active: row.try_get::<i64, _>("active")? != 0,
        merged_into: parse_opt_uuid(row.try_get("merged_into")?, "merged_into")?,
        last_record_id: parse_opt_uuid(row.try_get("last_record_id")?, "last_record_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}

fn view_from_row(row: &SqliteRow) -> MatchResult<View> {
    Ok(View {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "view id")?,
        entity_id: parse_uuid(&row.try_get::<String, _>("entity_id")?, "view entity_id")?,
        cycle_id: parse_uuid(&row.try_get::<String, _>("cycle_id")?, "view cycle_id")?,
        record_id: parse_uuid(&row.try_get::<String, _>("record_id")?, "view record_id")?,
        organization_id: row.try_get("organization_id")?,
        kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}

fn batch_from_row(row: &SqliteRow) -> MatchResult<ImportBatch> {
    let report: Option<String> = row.try_get("report")?;
    Ok(ImportBatch {
        id: parse_uuid(&row.try_get::<String, _>("id")?, "batch id")?,
        organization_id: row.try_get("organization_id")?,
        cycle_id: parse_uuid(&row.try_get::<String, _>("cycle_id")?, "batch cycle_id")?,
        kind: parse_enum(&row.try_get::<String, _>("kind")?)?,
        filename: row.try_get("filename")?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        report: report.map(|r| serde_json::from_str(&r)).transpose()?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?, "created_at")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?, "updated_at")?,
    })
}

async fn upsert_record(tx: &mut Transaction<'_, Sqlite>, record: &Record) -> MatchResult<()> {
    let fields = serde_json::to_string(&record.fields)?;
    let extra_data = serde_json::to_string(&record.extra_data)?;

    sqlx::query(
        r#"
        INSERT INTO states (
            id, kind, organization_id, import_batch_id, source_type,
            data_state, merge_state, fields, extra_data, hash, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            import_batch_id = excluded.import_batch_id,
            source_type = excluded.source_type,
            data_state = excluded.data_state,
            merge_state = excluded.merge_state,
            fields = excluded.fields,
            extra_data = excluded.extra_data,
            hash = excluded.hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.kind.as_str())
    .bind(record.organization_id)
    .bind(record.import_batch_id.map(|id| id.to_string()))
    .bind(&record.source_type)
    .bind(record.data_state.as_str())
    .bind(record.merge_state.as_str())
    .bind(fields)
    .bind(extra_data)
    .bind(&record.hash)
    .bind(ts(&record.created_at))
    .bind(ts(&record.updated_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_entity(
    tx: &mut Transaction<'_, Sqlite>,
    entity: &CanonicalEntity,
) -> MatchResult<()> {
    sqlx::query(
        r#"
        INSERT INTO canonical_entities (
            id, kind, organization_id, active, merged_into, last_record_id, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            active = excluded.active,
            merged_into = excluded.merged_into,
            last_record_id = excluded.last_record_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity.id.to_string())
    .bind(entity.kind.as_str())
    .bind(entity.organization_id)
    .bind(entity.active as i64)
    .bind(entity.merged_into.map(|id| id.to_string()))
    .bind(entity.last_record_id.map(|id| id.to_string()))
    .bind(ts(&entity.created_at))
    .bind(ts(&entity.updated_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn upsert_view(tx: &mut Transaction<'_, Sqlite>, view: &View) -> MatchResult<()> {
    sqlx::query(
        r#"
        INSERT INTO views (
            id, entity_id, cycle_id, record_id, organization_id, kind, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id, cycle_id) DO UPDATE SET
            record_id = excluded.record_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(view.id.to_string())
    .bind(view.entity_id.to_string())
    .bind(view.cycle_id.to_string())
    .bind(view.record_id.to_string())
    .bind(view.organization_id)
    .bind(view.kind.as_str())
    .bind(ts(&view.created_at))
    .bind(ts(&view.updated_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn insert_node(tx: &mut Transaction<'_, Sqlite>, node: &AuditNode) -> MatchResult<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_nodes (
            id, record_id, parent1_id, parent2_id, edge, import_filename,
            organization_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(node.id.to_string())
    .bind(node.record_id.to_string())
    .bind(node.parent1.map(|id| id.to_string()))
    .bind(node.parent2.map(|id| id.to_string()))
    .bind(node.edge.label())
    .bind(&node.import_filename)
    .bind(node.organization_id)
    .bind(ts(&node.created_at))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn delete_by_id(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    id: Uuid,
) -> MatchResult<()> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table);
    sqlx::query(&sql)
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn apply_changes(pool: &SqlitePool, changes: &ChangeSet) -> MatchResult<()> {
    let mut tx = pool.begin().await?;

    for id in &changes.records_delete {
        delete_by_id(&mut tx, "states", *id).await?;
    }
    for record in &changes.records_upsert {
        upsert_record(&mut tx, record).await?;
    }
    for id in &changes.nodes_delete {
        delete_by_id(&mut tx, "audit_nodes", *id).await?;
    }
    for node in &changes.nodes_insert {
        insert_node(&mut tx, node).await?;
    }
    for entity in &changes.entities_upsert {
        upsert_entity(&mut tx, entity).await?;
    }
    for id in &changes.views_delete {
        delete_by_id(&mut tx, "views", *id).await?;
    }
    for view in &changes.views_upsert {
        upsert_view(&mut tx, view).await?;
    }

    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_record(&self, id: Uuid) -> MatchResult<Option<Record>> {
        let sql = format!("SELECT {} FROM states WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_records(&self, filter: &RecordFilter) -> MatchResult<Vec<Record>> {
        let mut sql = format!("SELECT {} FROM states WHERE 1 = 1", RECORD_COLUMNS);
        if filter.organization_id.is_some() {
            sql.push_str(" AND organization_id = ?");
        }
        if filter.batch_id.is_some() {
            sql.push_str(" AND import_batch_id = ?");
        }
        if filter.data_state.is_some() {
            sql.push_str(" AND data_state = ?");
        }
        if filter.merge_state.is_some() {
            sql.push_str(" AND merge_state = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        sql.push_str(" ORDER BY rowid");

        let mut query = sqlx::query(&sql);
        if let Some(organization_id) = filter.organization_id {
            query = query.bind(organization_id);
        }
        if let Some(batch_id) = filter.batch_id {
            query = query.bind(batch_id.to_string());
        }
        if let Some(data_state) = filter.data_state {
            query = query.bind(data_state.as_str());
        }
        if let Some(merge_state) = filter.merge_state {
            query = query.bind(merge_state.as_str());
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_audit_node(&self, id: Uuid) -> MatchResult<Option<AuditNode>> {
        let sql = format!("SELECT {} FROM audit_nodes WHERE id = ?", NODE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn audit_nodes_for_record(&self, record_id: Uuid) -> MatchResult<Vec<AuditNode>> {
        let sql = format!(
            "SELECT {} FROM audit_nodes WHERE record_id = ? ORDER BY seq",
            NODE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(record_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn audit_children(&self, node_id: Uuid) -> MatchResult<Vec<AuditNode>> {
        let sql = format!(
            "SELECT {} FROM audit_nodes WHERE parent1_id = ? OR parent2_id = ? ORDER BY seq",
            NODE_COLUMNS
        );
        let node_id = node_id.to_string();
        let rows = sqlx::query(&sql)
            .bind(&node_id)
            .bind(&node_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(node_from_row).collect()
    }

    async fn get_entity(&self, id: Uuid) -> MatchResult<Option<CanonicalEntity>> {
        let sql = format!("SELECT {} FROM canonical_entities WHERE id = ?", ENTITY_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn entities_merged_into(&self, entity_id: Uuid) -> MatchResult<Vec<CanonicalEntity>> {
        let sql = format!(
            "SELECT {} FROM canonical_entities WHERE active = 0 AND merged_into = ? \
             ORDER BY updated_at, id",
            ENTITY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn views_for_record(&self, record_id: Uuid) -> MatchResult<Vec<View>> {
        let sql = format!(
            "SELECT {} FROM views WHERE record_id = ? ORDER BY created_at, id",
            VIEW_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(record_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(view_from_row).collect()
    }

    async fn views_in_cycle(
        &self,
        organization_id: i64,
        cycle_id: Uuid,
        kind: RecordKind,
    ) -> MatchResult<Vec<View>> {
        let sql = format!(
            "SELECT {} FROM views WHERE organization_id = ? AND cycle_id = ? AND kind = ? \
             ORDER BY created_at, id",
            VIEW_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(cycle_id.to_string())
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(view_from_row).collect()
    }

    async fn get_view(&self, entity_id: Uuid, cycle_id: Uuid) -> MatchResult<Option<View>> {
        let sql = format!(
            "SELECT {} FROM views WHERE entity_id = ? AND cycle_id = ?",
            VIEW_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(entity_id.to_string())
            .bind(cycle_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(view_from_row).transpose()
    }

    async fn get_or_create_view(
        &self,
        entity: &CanonicalEntity,
        cycle_id: Uuid,
        record_id: Uuid,
    ) -> MatchResult<(View, bool)> {
        let candidate = View::new(entity, cycle_id, record_id);

        // DO NOTHING keeps the existing binding; rows_affected tells who won
        let created = retry_on_lock("get_or_create_view", self.max_lock_wait_ms, || {
            let candidate = &candidate;
            async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO views (
                        id, entity_id, cycle_id, record_id, organization_id, kind,
                        created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(entity_id, cycle_id) DO NOTHING
                    "#,
                )
                .bind(candidate.id.to_string())
                .bind(candidate.entity_id.to_string())
                .bind(candidate.cycle_id.to_string())
                .bind(candidate.record_id.to_string())
                .bind(candidate.organization_id)
                .bind(candidate.kind.as_str())
                .bind(ts(&candidate.created_at))
                .bind(ts(&candidate.updated_at))
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await?;

        let view = self
            .get_view(entity.id, cycle_id)
            .await?
            .ok_or_else(|| MatchError::NotFound(format!("view for entity {}", entity.id)))?;
        Ok((view, created))
    }

    async fn get_batch(&self, id: Uuid) -> MatchResult<Option<ImportBatch>> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, cycle_id, kind, filename, status, report,
                   created_at, updated_at
            FROM import_batches
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn save_batch(&self, batch: &ImportBatch) -> MatchResult<()> {
        let id = batch.id.to_string();
        let cycle_id = batch.cycle_id.to_string();
        let report = batch.report.as_ref().map(serde_json::to_string).transpose()?;
        let created_at = ts(&batch.created_at);
        let updated_at = ts(&batch.updated_at);

        retry_on_lock("save_batch", self.max_lock_wait_ms, || {
            let (id, cycle_id, report) = (&id, &cycle_id, &report);
            let (created_at, updated_at) = (&created_at, &updated_at);
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO import_batches (
                        id, organization_id, cycle_id, kind, filename, status, report,
                        created_at, updated_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        filename = excluded.filename,
                        status = excluded.status,
                        report = excluded.report,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(id)
                .bind(batch.organization_id)
                .bind(cycle_id)
                .bind(batch.kind.as_str())
                .bind(&batch.filename)
                .bind(batch.status.as_str())
                .bind(report)
                .bind(created_at)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    async fn try_acquire_batch_lock(
        &self,
        batch_id: Uuid,
        owner: Uuid,
        ttl: Duration,
    ) -> MatchResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_ms = now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
        let batch_id = batch_id.to_string();
        let owner = owner.to_string();

        retry_on_lock("try_acquire_batch_lock", self.max_lock_wait_ms, || {
            let (batch_id, owner) = (&batch_id, &owner);
            async move {
                let result = sqlx::query(
                    r#"
                    INSERT INTO batch_locks (batch_id, owner, expires_at) VALUES (?, ?, ?)
                    ON CONFLICT(batch_id) DO UPDATE SET
                        owner = excluded.owner,
                        expires_at = excluded.expires_at
                    WHERE batch_locks.owner = excluded.owner OR batch_locks.expires_at <= ?
                    "#,
                )
                .bind(batch_id)
                .bind(owner)
                .bind(expires_ms)
                .bind(now_ms)
                .execute(&self.pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
        })
        .await
    }

    async fn release_batch_lock(&self, batch_id: Uuid, owner: Uuid) -> MatchResult<()> {
        let batch_id = batch_id.to_string();
        let owner = owner.to_string();

        retry_on_lock("release_batch_lock", self.max_lock_wait_ms, || {
            let (batch_id, owner) = (&batch_id, &owner);
            async move {
                sqlx::query("DELETE FROM batch_locks WHERE batch_id = ? AND owner = ?")
                    .bind(batch_id)
                    .bind(owner)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn commit(&self, changes: ChangeSet) -> MatchResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let rows = changes.len();
        let changes = &changes;
        retry_on_lock("commit", self.max_lock_wait_ms, || async move {
            apply_changes(&self.pool, changes).await
        })
        .await?;

        tracing::debug!(rows, "Committed change set");
        Ok(())
    }
}
