//! Reference data loading: sites and airspace zones from JSON.
//!
//! Records arrive loosely typed from an external configuration source. Each
//! one is validated on its own; a bad record is skipped with a logged reason
//! and never fails the whole load.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::*;

// ---------------------------------------------------------------------------
// Load report
// ---------------------------------------------------------------------------

/// A record that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub index: usize,
    pub id: Option<String>,
    pub reason: String,
}

/// Validated records plus everything that was dropped.
#[derive(Debug, Clone)]
pub struct LoadReport<T> {
    pub items: Vec<T>,
    pub skipped: Vec<SkippedRecord>,
}

impl<T> Default for LoadReport<T> {
    fn default() -> Self {
        LoadReport {
            items: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw record shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSite {
    id: Option<String>,
    name: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    altitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawZone {
    id: Option<String>,
    name: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
    class: Option<String>,
    /// `[lat, lon]` pairs.
    polygon: Option<Vec<[f64; 2]>>,
    lower: Option<AltitudeLimit>,
    upper: Option<AltitudeLimit>,
}

// ---------------------------------------------------------------------------
// Sites
// ---------------------------------------------------------------------------

/// Parse a JSON array of site records.
pub fn parse_sites(json: &str) -> Result<LoadReport<NamedSite>> {
    let records = parse_array(json)?;
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for (index, value) in records.into_iter().enumerate() {
        let id_hint = id_hint(&value);
        let result = serde_json::from_value::<RawSite>(value)
            .map_err(|e| format!("malformed record: {e}"))
            .and_then(validate_site)
            .and_then(|site| {
                if seen.insert(site.id.clone()) {
                    Ok(site)
                } else {
                    Err(format!("duplicate id '{}'", site.id))
                }
            });
        match result {
            Ok(site) => report.items.push(site),
            Err(reason) => skip(&mut report.skipped, "site", index, id_hint, reason),
        }
    }
    Ok(report)
}

/// Read and parse a site file.
pub fn load_sites(path: &Path) -> Result<LoadReport<NamedSite>> {
    let text = read_reference(path)?;
    parse_sites(&text)
}

fn validate_site(raw: RawSite) -> std::result::Result<NamedSite, String> {
    let id = non_empty(raw.id, "id")?;
    let name = non_empty(raw.name, "name")?;
    let kind = match raw.kind.as_deref().map(|k| k.trim().to_ascii_lowercase()) {
        Some(k) if k == "takeoff" || k == "launch" => SiteKind::Takeoff,
        Some(k) if k == "landing" || k == "lz" => SiteKind::Landing,
        Some(k) => return Err(format!("unknown site type '{k}'")),
        None => return Err("missing site type".into()),
    };
    let (lat, lon) = match (raw.lat, raw.lon) {
        (Some(lat), Some(lon)) if LatLon::new(lat, lon).is_valid() => (lat, lon),
        (Some(lat), Some(lon)) => return Err(format!("coordinates out of range ({lat}, {lon})")),
        _ => return Err("missing coordinates".into()),
    };
    let altitude = match raw.altitude {
        Some(a) if a.is_finite() => a,
        Some(_) => return Err("non-finite altitude".into()),
        None => 0.0,
    };

    Ok(NamedSite {
        id,
        name,
        kind,
        lat,
        lon,
        altitude,
    })
}

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

/// Parse a JSON array of airspace zone records.
pub fn parse_zones(json: &str) -> Result<LoadReport<AirspaceZone>> {
    let records = parse_array(json)?;
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for (index, value) in records.into_iter().enumerate() {
        let id_hint = id_hint(&value);
        let result = serde_json::from_value::<RawZone>(value)
            .map_err(|e| format!("malformed record: {e}"))
            .and_then(validate_zone)
            .and_then(|zone| {
                if seen.insert(zone.id.clone()) {
                    Ok(zone)
                } else {
                    Err(format!("duplicate id '{}'", zone.id))
                }
            });
        match result {
            Ok(zone) => report.items.push(zone),
            Err(reason) => skip(&mut report.skipped, "zone", index, id_hint, reason),
        }
    }
    Ok(report)
}

/// Read and parse a zone file.
pub fn load_zones(path: &Path) -> Result<LoadReport<AirspaceZone>> {
    let text = read_reference(path)?;
    parse_zones(&text)
}

fn validate_zone(raw: RawZone) -> std::result::Result<AirspaceZone, String> {
    let id = non_empty(raw.id, "id")?;
    let name = non_empty(raw.name, "name")?;
    let kind = raw
        .kind
        .as_deref()
        .map(ZoneKind::parse)
        .unwrap_or_else(|| ZoneKind::Other("unknown".into()));

    let mut polygon: Vec<LatLon> = raw
        .polygon
        .ok_or("missing polygon")?
        .into_iter()
        .map(|[lat, lon]| LatLon::new(lat, lon))
        .collect();
    if let Some(bad) = polygon.iter().find(|p| !p.is_valid()) {
        return Err(format!("polygon vertex out of range ({}, {})", bad.lat, bad.lon));
    }
    polygon.dedup();
    if polygon.len() > 1 && polygon.first() == polygon.last() {
        polygon.pop();
    }
    let mut distinct: Vec<LatLon> = Vec::with_capacity(polygon.len());
    for p in &polygon {
        if !distinct.contains(p) {
            distinct.push(*p);
        }
    }
    if distinct.len() < 3 {
        return Err(format!(
            "polygon has {} distinct vertices, need at least 3",
            distinct.len()
        ));
    }

    let lower_m = raw.lower.unwrap_or(AltitudeLimit::Ground).to_meters();
    let upper_m = raw.upper.unwrap_or(AltitudeLimit::Unlimited).to_meters();
    if lower_m.is_nan() || upper_m.is_nan() {
        return Err("altitude limit is not a number".into());
    }
    if lower_m > upper_m {
        return Err(format!("lower limit {lower_m:.0} m above upper limit {upper_m:.0} m"));
    }

    let bbox = BoundingBox::from_ring(&polygon).ok_or("empty polygon")?;

    Ok(AirspaceZone {
        id,
        name,
        kind,
        class: raw.class.filter(|c| !c.trim().is_empty()),
        polygon,
        lower_m,
        upper_m,
        bbox,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_reference(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| SkylogError::Reference(format!("{}: {e}", path.display())))
}

fn parse_array(json: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(json)? {
        Value::Array(records) => Ok(records),
        _ => Err(SkylogError::Reference("expected a JSON array of records".into())),
    }
}

fn id_hint(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_string)
}

fn non_empty(value: Option<String>, field: &str) -> std::result::Result<String, String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(format!("missing {field}")),
    }
}

fn skip(
    skipped: &mut Vec<SkippedRecord>,
    what: &str,
    index: usize,
    id: Option<String>,
    reason: String,
) {
    warn!(
        record = index,
        id = id.as_deref().unwrap_or("-"),
        "skipping {what} record: {reason}"
    );
    skipped.push(SkippedRecord { index, id, reason });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sites() {
        let json = r#"[
            {"id": "t1", "name": "Wank Nord", "type": "takeoff", "lat": 47.509, "lon": 11.141, "altitude": 1730},
            {"id": "l1", "name": "Garmisch LZ", "kind": "landing", "lat": 47.497, "lon": 11.120}
        ]"#;
        let report = parse_sites(json).unwrap();
        assert_eq!(report.items.len(), 2);
        assert!(report.skipped.is_empty());
        assert_eq!(report.items[0].kind, SiteKind::Takeoff);
        assert_eq!(report.items[1].kind, SiteKind::Landing);
        assert_eq!(report.items[1].altitude, 0.0);
    }

    #[test]
    fn test_invalid_sites_skipped() {
        let json = r#"[
            {"id": "ok", "name": "Good", "type": "takeoff", "lat": 47.0, "lon": 11.0},
            {"id": "noname", "type": "takeoff", "lat": 47.0, "lon": 11.0},
            {"id": "badtype", "name": "X", "type": "parking", "lat": 47.0, "lon": 11.0},
            {"id": "badlat", "name": "Y", "type": "landing", "lat": 123.0, "lon": 11.0},
            {"id": "nolon", "name": "Z", "type": "landing", "lat": 47.0},
            {"id": "strlat", "name": "W", "type": "landing", "lat": "47.0", "lon": 11.0},
            {"id": "ok", "name": "Dupe", "type": "landing", "lat": 47.0, "lon": 11.0}
        ]"#;
        let report = parse_sites(json).unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.skipped.len(), 6);
        assert_eq!(report.skipped[0].id.as_deref(), Some("noname"));
        assert!(report.skipped[1].reason.contains("parking"));
        assert!(report.skipped[5].reason.contains("duplicate"));
    }

    #[test]
    fn test_parse_zones() {
        let json = r#"[
            {
                "id": "ctr-muc", "name": "CTR Munich", "kind": "CTR", "class": "D",
                "polygon": [[48.3, 11.6], [48.4, 11.9], [48.2, 11.9], [48.3, 11.6]],
                "lower": "ground", "upper": {"feet": 3500}
            },
            {
                "id": "tma", "name": "TMA", "kind": "tma",
                "polygon": [[48.0, 11.0], [48.0, 12.0], [49.0, 12.0]],
                "lower": {"flight_level": 65}
            }
        ]"#;
        let report = parse_zones(json).unwrap();
        assert_eq!(report.items.len(), 2);

        let ctr = &report.items[0];
        assert_eq!(ctr.kind, ZoneKind::Ctr);
        assert_eq!(ctr.polygon.len(), 3, "closing vertex dropped");
        assert_eq!(ctr.lower_m, f64::NEG_INFINITY);
        assert!((ctr.upper_m - 1066.8).abs() < 1e-6);
        assert_eq!(ctr.class.as_deref(), Some("D"));

        let tma = &report.items[1];
        assert!((tma.lower_m - 1981.2).abs() < 1e-6);
        assert_eq!(tma.upper_m, f64::INFINITY);
    }

    #[test]
    fn test_degenerate_zones_skipped() {
        let json = r#"[
            {"id": "line", "name": "Line", "polygon": [[48.0, 11.0], [48.1, 11.1]]},
            {"id": "closed-line", "name": "Closed", "polygon": [[48.0, 11.0], [48.1, 11.1], [48.0, 11.0]]},
            {"id": "inverted", "name": "Inverted", "polygon": [[48.0, 11.0], [48.0, 12.0], [49.0, 12.0]],
             "lower": {"meters": 3000}, "upper": {"meters": 1000}},
            {"id": "nopoly", "name": "NoPoly"},
            {"id": "repeated", "name": "Repeated", "polygon": [[48.0, 11.0], [48.0, 11.0], [48.1, 11.1]]},
            {"id": "back-and-forth", "name": "BackForth", "polygon": [[48.0, 11.0], [48.1, 11.1], [48.0, 11.0], [48.1, 11.1]]}
        ]"#;
        let report = parse_zones(json).unwrap();
        assert!(report.items.is_empty());
        assert_eq!(report.skipped.len(), 6);
        assert!(report.skipped[0].reason.contains("at least 3"));
        assert!(report.skipped[1].reason.contains("at least 3"));
        assert!(report.skipped[2].reason.contains("above upper"));
        assert!(report.skipped[4].reason.contains("2 distinct"));
        assert!(report.skipped[5].reason.contains("2 distinct"));
    }

    #[test]
    fn test_non_array_rejected() {
        assert!(matches!(
            parse_sites(r#"{"id": "x"}"#),
            Err(SkylogError::Reference(_))
        ));
        assert!(matches!(parse_zones("not json"), Err(SkylogError::Json(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.json");
        std::fs::write(
            &path,
            r#"[{"id": "t1", "name": "Launch", "type": "takeoff", "lat": 47.0, "lon": 11.0}]"#,
        )
        .unwrap();
        let report = load_sites(&path).unwrap();
        assert_eq!(report.items.len(), 1);

        let missing = dir.path().join("missing.json");
        assert!(matches!(load_zones(&missing), Err(SkylogError::Reference(_))));
    }
}
