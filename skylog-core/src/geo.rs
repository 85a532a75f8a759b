//! Geodesy helpers: haversine distance, bearing, destination, point-in-polygon.
//!
//! Spherical earth model. Good to a few meters at paragliding scales, which is
//! all the detector and airspace tracker need.

use crate::types::LatLon;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn distance_m(a: LatLon, b: LatLon) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Initial bearing from `a` to `b` in degrees, normalized to [0, 360).
pub fn bearing_deg(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let x = dlon.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

    let bearing = x.atan2(y).to_degrees().rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if bearing >= 360.0 {
        0.0
    } else {
        bearing
    }
}

/// Point reached by travelling `distance` meters from `origin` on `bearing` degrees.
pub fn destination(origin: LatLon, bearing: f64, distance: f64) -> LatLon {
    let delta = distance / EARTH_RADIUS_M;
    let theta = bearing.to_radians();
    let lat1 = origin.lat.to_radians();
    let lon1 = origin.lon.to_radians();

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * theta.cos()).asin();
    let lon2 = lon1
        + (theta.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    LatLon::new(
        lat2.to_degrees(),
        (lon2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0,
    )
}

/// Even-odd ray casting test in the lon/lat plane.
///
/// Rings with fewer than three vertices contain nothing. The ring may be open
/// or closed. Boundary points follow the half-open crossing rule: an edge
/// counts when `lat` lies in `[min(lat_i, lat_j), max(lat_i, lat_j))`, and a
/// crossing counts when it lies strictly east of the point. Points on the
/// southern or western boundary therefore test inside, points on the northern
/// or eastern boundary outside. Rings spanning the antimeridian are not
/// supported.
pub fn point_in_polygon(point: LatLon, ring: &[LatLon]) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (pi, pj) = (ring[i], ring[j]);
        if (pi.lat > point.lat) != (pj.lat > point.lat) {
            let cross_lon = pi.lon + (point.lat - pi.lat) * (pj.lon - pi.lon) / (pj.lat - pi.lat);
            if point.lon < cross_lon {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
