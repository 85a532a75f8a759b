//! Site resolution: label flight endpoints with named takeoffs and landings.
//!
//! Resolution never fails: when no reference site qualifies the endpoint is
//! labelled with its raw coordinates.

use serde::{Deserialize, Serialize};

use crate::geo::distance_m;
use crate::types::*;

/// Horizontal and vertical limits for the proximity lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub proximity_m: f64,
    pub vertical_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        SiteConfig {
            proximity_m: 80.0,
            vertical_m: 100.0,
        }
    }
}

/// Closest site of `kind` and its distance in meters. No cutoff: any site of
/// that kind anywhere qualifies.
pub fn nearest_site_of_type(
    sites: &[NamedSite],
    position: LatLon,
    kind: SiteKind,
) -> Option<(&NamedSite, f64)> {
    sites
        .iter()
        .filter(|s| s.kind == kind)
        .map(|s| (s, distance_m(position, s.position())))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Every site, of any kind, within both proximity limits. Nearest first.
pub fn sites_within_proximity<'a>(
    sites: &'a [NamedSite],
    position: LatLon,
    altitude: f64,
    limits: &SiteConfig,
) -> Vec<(&'a NamedSite, f64)> {
    let mut hits: Vec<(&NamedSite, f64)> = sites
        .iter()
        .map(|s| (s, distance_m(position, s.position())))
        .filter(|(s, d)| *d <= limits.proximity_m && (s.altitude - altitude).abs() <= limits.vertical_m)
        .collect();
    hits.sort_by(|a, b| a.1.total_cmp(&b.1));
    hits
}

/// Fallback label for an endpoint with no usable reference site.
pub fn coordinate_label(kind: SiteKind, position: LatLon) -> String {
    format!("Unknown {} ({:.5}, {:.5})", kind, position.lat, position.lon)
}

/// Owns the site list and applies the resolution order.
#[derive(Debug, Clone, Default)]
pub struct SiteResolver {
    sites: Vec<NamedSite>,
    config: SiteConfig,
}

impl SiteResolver {
    pub fn new(sites: Vec<NamedSite>, config: SiteConfig) -> Self {
        SiteResolver { sites, config }
    }

    pub fn sites(&self) -> &[NamedSite] {
        &self.sites
    }

    /// Label an endpoint: nearest site of the expected kind, then any site in
    /// proximity, then raw coordinates.
    pub fn resolve(&self, position: LatLon, altitude: f64, kind: SiteKind) -> ResolvedSite {
        if let Some((site, dist)) = nearest_site_of_type(&self.sites, position, kind) {
            return ResolvedSite {
                name: site.name.clone(),
                site_id: Some(site.id.clone()),
                distance_m: Some(dist),
                source: SiteSource::NearestOfType,
            };
        }

        if let Some((site, dist)) =
            sites_within_proximity(&self.sites, position, altitude, &self.config).first()
        {
            return ResolvedSite {
                name: site.name.clone(),
                site_id: Some(site.id.clone()),
                distance_m: Some(*dist),
                source: SiteSource::Proximity,
            };
        }

        ResolvedSite {
            name: coordinate_label(kind, position),
            site_id: None,
            distance_m: None,
            source: SiteSource::Coordinates,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination;

    const ORIGIN: LatLon = LatLon::new(46.68, 7.86);

    fn site(id: &str, kind: SiteKind, pos: LatLon, altitude: f64) -> NamedSite {
        NamedSite {
            id: id.into(),
            name: format!("Site {id}"),
            kind,
            lat: pos.lat,
            lon: pos.lon,
            altitude,
        }
    }

    #[test]
    fn test_nearest_ignores_distance() {
        let far = destination(ORIGIN, 90.0, 450.0);
        let sites = vec![site("t1", SiteKind::Takeoff, far, 1000.0)];

        let (found, dist) = nearest_site_of_type(&sites, ORIGIN, SiteKind::Takeoff).unwrap();
        assert_eq!(found.id, "t1");
        assert!((dist - 450.0).abs() < 0.5);
    }

    #[test]
    fn test_nearest_picks_closest_of_kind() {
        let sites = vec![
            site("l-close", SiteKind::Landing, destination(ORIGIN, 0.0, 10.0), 0.0),
            site("t-far", SiteKind::Takeoff, destination(ORIGIN, 0.0, 900.0), 0.0),
            site("t-near", SiteKind::Takeoff, destination(ORIGIN, 180.0, 300.0), 0.0),
        ];
        let (found, _) = nearest_site_of_type(&sites, ORIGIN, SiteKind::Takeoff).unwrap();
        assert_eq!(found.id, "t-near");
        assert!(nearest_site_of_type(&[], ORIGIN, SiteKind::Landing).is_none());
    }

    #[test]
    fn test_proximity_dual_threshold() {
        let limits = SiteConfig::default();
        let sites = vec![
            site("in", SiteKind::Landing, destination(ORIGIN, 10.0, 60.0), 580.0),
            site("too-far", SiteKind::Landing, destination(ORIGIN, 10.0, 95.0), 600.0),
            site("too-high", SiteKind::Takeoff, destination(ORIGIN, 10.0, 20.0), 750.0),
            site("closest", SiteKind::Takeoff, destination(ORIGIN, 10.0, 5.0), 610.0),
        ];
        let hits = sites_within_proximity(&sites, ORIGIN, 600.0, &limits);
        let ids: Vec<&str> = hits.iter().map(|(s, _)| s.id.as_str()).collect();
        assert_eq!(ids, vec!["closest", "in"]);
    }

    #[test]
    fn test_resolve_prefers_expected_kind() {
        let resolver = SiteResolver::new(
            vec![
                site("lz", SiteKind::Landing, destination(ORIGIN, 0.0, 10.0), 600.0),
                site("launch", SiteKind::Takeoff, destination(ORIGIN, 90.0, 450.0), 600.0),
            ],
            SiteConfig::default(),
        );
        let r = resolver.resolve(ORIGIN, 600.0, SiteKind::Takeoff);
        assert_eq!(r.name, "Site launch");
        assert_eq!(r.source, SiteSource::NearestOfType);
    }

    #[test]
    fn test_resolve_falls_back_to_proximity() {
        let resolver = SiteResolver::new(
            vec![site("launch", SiteKind::Takeoff, destination(ORIGIN, 0.0, 40.0), 600.0)],
            SiteConfig::default(),
        );
        let r = resolver.resolve(ORIGIN, 620.0, SiteKind::Landing);
        assert_eq!(r.site_id.as_deref(), Some("launch"));
        assert_eq!(r.source, SiteSource::Proximity);
    }

    #[test]
    fn test_resolve_falls_back_to_coordinates() {
        let resolver = SiteResolver::new(Vec::new(), SiteConfig::default());
        let r = resolver.resolve(ORIGIN, 600.0, SiteKind::Landing);
        assert_eq!(r.name, "Unknown Landing (46.68000, 7.86000)");
        assert_eq!(r.source, SiteSource::Coordinates);
        assert!(r.site_id.is_none());

        let r = resolver.resolve(ORIGIN, 600.0, SiteKind::Takeoff);
        assert!(r.name.starts_with("Unknown Takeoff"));
    }
}
