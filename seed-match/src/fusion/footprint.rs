// Footprint Geometry Pairing
//
// Footprint fields hold WKT polygons. A value that fails to parse never
// displaces a valid geometry; it is kept in a "<Label> (Invalid Footprint)"
// extra-data companion instead.

use crate::models::FieldValue;

/// A typed geometry field and the label used for its invalid companion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootprintField {
    pub field: &'static str,
    pub label: &'static str,
}

impl FootprintField {
    /// Extra-data key that holds an unparseable value for this field
    pub fn companion_key(&self) -> String {
        format!("{} (Invalid Footprint)", self.label)
    }
}

pub const FOOTPRINT_FIELDS: &[FootprintField] = &[
    FootprintField {
        field: "property_footprint",
        label: "Property Footprint",
    },
    FootprintField {
        field: "taxlot_footprint",
        label: "Tax Lot Footprint",
    },
];

/// True when `key` is a footprint field or one of their companions
pub fn is_footprint_key(key: &str) -> bool {
    FOOTPRINT_FIELDS
        .iter()
        .any(|f| f.field == key || f.companion_key() == key)
}

/// Whether a stored value is a usable polygon geometry
pub fn is_valid_footprint(value: &FieldValue) -> bool {
    value.as_str().map(is_valid_polygon_wkt).unwrap_or(false)
}

/// Minimal WKT polygon check: `POLYGON ((x y, ...), (x y, ...))`.
///
/// Every ring needs at least four numeric points and must be closed.
pub fn is_valid_polygon_wkt(wkt: &str) -> bool {
    let trimmed = wkt.trim();
    let Some(prefix) = trimmed.get(..7) else {
        return false;
    };
    if !prefix.eq_ignore_ascii_case("POLYGON") {
        return false;
    }

    let body = trimmed[7..].trim();
    let Some(inner) = body.strip_prefix('(').and_then(|b| b.strip_suffix(')')) else {
        return false;
    };

    let inner = inner.trim();
    if inner.is_empty() {
        return false;
    }

    split_rings(inner)
        .map(|rings| !rings.is_empty() && rings.iter().all(|r| is_valid_ring(r)))
        .unwrap_or(false)
}

/// Split "(..), (..)" into ring bodies; None on unbalanced parentheses
fn split_rings(inner: &str) -> Option<Vec<&str>> {
    let mut rings = Vec::new();
    let mut rest = inner;

    loop {
        rest = rest.trim_start();
        let after_open = rest.strip_prefix('(')?;
        let close = after_open.find(')')?;
        let ring = &after_open[..close];
        if ring.contains('(') {
            return None;
        }
        rings.push(ring);

        rest = after_open[close + 1..].trim_start();
        if rest.is_empty() {
            return Some(rings);
        }
        rest = rest.strip_prefix(',')?;
    }
}

fn is_valid_ring(ring: &str) -> bool {
    let mut points = Vec::new();
    for pair in ring.split(',') {
        let coords: Vec<&str> = pair.split_whitespace().collect();
        if coords.len() != 2 {
            return false;
        }
        let (Ok(x), Ok(y)) = (coords[0].parse::<f64>(), coords[1].parse::<f64>()) else {
            return false;
        };
        if !x.is_finite() || !y.is_finite() {
            return false;
        }
        points.push((x, y));
    }

    points.len() >= 4 && points.first() == points.last()
}
