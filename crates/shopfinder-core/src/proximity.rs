//! Radius search over geohash cells.
//!
//! Stores without a spatial index approximate "within r metres" by matching
//! the geohash prefix of each row against a small set of cells around the
//! query point. Cells are 7 characters (about 150m square at the equator).
//! The set grows with the radius:
//!
//! | radius | cells |
//! |--------|-------|
//! | < 100m | the query cell |
//! | 100m to 200m | query cell + 8 neighbors |
//! | > 200m | 5x5 block: the 9 above plus a second ring of 16 |
//!
//! The second ring is enumerated from [`SECOND_RING`]: each entry names a
//! first-ring neighbor and the direction of one more step. Matches near a
//! cell edge can lie outside the radius; callers that need exact answers
//! filter with [`haversine_m`].

use crate::error::{StoreError, StoreResult};
use crate::geohash::{self, Direction, GeohashError};
use crate::models::Coord;

/// Geohash length used for proximity cells.
pub const PRECISION: usize = 7;

const SINGLE_CELL_MAX_M: f64 = 100.0;
const RING_MAX_M: f64 = 200.0;

const EARTH_RADIUS_M: f64 = 6_371_008.8;
const METRES_PER_DEGREE: f64 = 111_320.0;

/// Second ring of the 5x5 block as (first-ring neighbor, extra step).
pub const SECOND_RING: [(Direction, Direction); 16] = [
    (Direction::North, Direction::North),
    (Direction::NorthEast, Direction::North),
    (Direction::NorthEast, Direction::NorthEast),
    (Direction::NorthEast, Direction::East),
    (Direction::East, Direction::East),
    (Direction::SouthEast, Direction::East),
    (Direction::SouthEast, Direction::SouthEast),
    (Direction::SouthEast, Direction::South),
    (Direction::South, Direction::South),
    (Direction::SouthWest, Direction::South),
    (Direction::SouthWest, Direction::SouthWest),
    (Direction::SouthWest, Direction::West),
    (Direction::West, Direction::West),
    (Direction::NorthWest, Direction::West),
    (Direction::NorthWest, Direction::NorthWest),
    (Direction::NorthWest, Direction::North),
];

/// Parse a radius such as `"500m"`, `"1km"`, `"1.5km"` or `"300"` into metres.
pub fn parse_radius(radius: &str) -> StoreResult<f64> {
    let raw = radius.trim().to_ascii_lowercase();
    let (number, scale) = if let Some(n) = raw.strip_suffix("km") {
        (n, 1000.0)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 1.0)
    } else {
        (raw.as_str(), 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| StoreError::validation(format!("invalid radius: {radius:?}")))?;
    let metres = value * scale;
    if !metres.is_finite() || metres <= 0.0 {
        return Err(StoreError::validation(format!(
            "radius must be positive: {radius:?}"
        )));
    }
    Ok(metres)
}

/// Cells to scan for a search of `radius_m` around the cell `center`.
///
/// The result always starts with `center` itself and has 1, 9 or 25
/// distinct entries at the precision of `center`.
pub fn cells_for_radius(center: &str, radius_m: f64) -> Result<Vec<String>, GeohashError> {
    let center = geohash::normalize(center)?;
    if radius_m < SINGLE_CELL_MAX_M {
        return Ok(vec![center]);
    }

    let ring = geohash::neighbors(&center)?;
    let mut cells = Vec::with_capacity(25);
    cells.push(center);
    cells.extend(ring.iter().cloned());
    if radius_m <= RING_MAX_M {
        return Ok(cells);
    }

    for (base, step) in SECOND_RING {
        let idx = Direction::ALL
            .iter()
            .position(|d| *d == base)
            .unwrap_or_default();
        cells.push(geohash::neighbor(&ring[idx], step)?);
    }
    Ok(cells)
}

/// Encode the query point at [`PRECISION`] and expand it for `radius`.
pub fn area(lat: f64, lon: f64, radius: &str) -> StoreResult<Vec<String>> {
    let metres = parse_radius(radius)?;
    let center = geohash::encode(Coord::new(lat, lon), PRECISION)?;
    Ok(cells_for_radius(&center, metres)?)
}

/// Great-circle distance in metres.
pub fn haversine_m(a: Coord, b: Coord) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Longest geohash whose cells at `lat` are at least `radius_m` on each side.
///
/// A 3x3 block of such cells around any point covers the whole circle, which
/// is what term-matching stores rely on before exact filtering.
pub fn covering_precision(radius_m: f64, lat: f64) -> usize {
    let lat_scale = lat.to_radians().cos().abs().max(0.01);
    (1..=geohash::MAX_PRECISION)
        .rev()
        .find(|&p| {
            let (h, w) = cell_size_m(p, lat_scale);
            h >= radius_m && w >= radius_m
        })
        .unwrap_or(1)
}

/// Centre cell plus neighbors at [`covering_precision`] for `radius_m`.
pub fn covering_cells(center: Coord, radius_m: f64) -> Result<Vec<String>, GeohashError> {
    let precision = covering_precision(radius_m, center.lat);
    let hash = geohash::encode(center, precision)?;
    let mut cells = vec![hash.clone()];
    cells.extend(geohash::neighbors(&hash)?);
    cells.sort();
    cells.dedup();
    Ok(cells)
}

fn cell_size_m(precision: usize, lat_scale: f64) -> (f64, f64) {
    let bits = precision * 5;
    let lat_bits = (bits / 2) as i32;
    let lon_bits = bits as i32 - lat_bits;
    let lat_deg = 180.0 / 2f64.powi(lat_bits);
    let lon_deg = 360.0 / 2f64.powi(lon_bits);
    (
        lat_deg * METRES_PER_DEGREE,
        lon_deg * METRES_PER_DEGREE * lat_scale,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const SAMPLES: [&str; 6] = ["wecpk8t", "wecnvgm", "u4pruyd", "9q8yyk8", "s000000", "ezzzzzz"];

    #[test]
    fn parses_radius_units() {
        assert_eq!(parse_radius("500m").unwrap(), 500.0);
        assert_eq!(parse_radius("1km").unwrap(), 1000.0);
        assert_eq!(parse_radius(" 1.5KM ").unwrap(), 1500.0);
        assert_eq!(parse_radius("300").unwrap(), 300.0);
    }

    #[test]
    fn rejects_bad_radius() {
        for bad in ["", "km", "-5m", "0", "far", "NaNm"] {
            assert!(
                matches!(parse_radius(bad), Err(StoreError::Validation(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn seventy_metres_is_one_cell() {
        for hash in SAMPLES {
            assert_eq!(cells_for_radius(hash, 70.0).unwrap(), vec![hash.to_string()]);
        }
    }

    #[test]
    fn one_fifty_metres_is_nine_distinct_cells() {
        for hash in SAMPLES {
            let cells = cells_for_radius(hash, parse_radius("150m").unwrap()).unwrap();
            assert_eq!(cells.len(), 9, "{hash}");
            assert_eq!(cells[0], hash);
            let unique: HashSet<_> = cells.iter().collect();
            assert_eq!(unique.len(), 9, "{hash}");
        }
    }

    #[test]
    fn large_radius_is_five_by_five_block() {
        let center = "wecpk8t";
        let cb = geohash::decode_bounds(center).unwrap();
        let cells = cells_for_radius(center, 700.0).unwrap();
        assert_eq!(cells.len(), 25);

        let mut offsets = HashSet::new();
        for cell in &cells {
            let c = geohash::decode(cell).unwrap();
            let dx = ((c.lon - cb.center().lon) / cb.lon_span()).round() as i32;
            let dy = ((c.lat - cb.center().lat) / cb.lat_span()).round() as i32;
            assert!(dx.abs() <= 2 && dy.abs() <= 2, "{cell}");
            offsets.insert((dx, dy));
        }
        assert_eq!(offsets.len(), 25);
    }

    #[test]
    fn area_encodes_query_point() {
        let cells = area(22.2819, 114.1582, "70m").unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].len(), PRECISION);
        assert!(area(22.2819, 114.1582, "nearby").is_err());
        assert!(area(95.0, 114.1582, "70m").is_err());
    }

    #[test]
    fn haversine_matches_known_distance() {
        // one degree of latitude
        let d = haversine_m(Coord::new(0.0, 0.0), Coord::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 100.0, "{d}");
        assert_eq!(haversine_m(Coord::new(22.3, 114.2), Coord::new(22.3, 114.2)), 0.0);
    }

    #[test]
    fn covering_cells_contain_every_point_in_radius() {
        let center = Coord::new(22.2819, 114.1582);
        let radius = 700.0;
        let cells = covering_cells(center, radius).unwrap();
        let precision = cells[0].len();
        // points on the circle in eight directions
        for i in 0..8 {
            let angle = (i as f64) * std::f64::consts::FRAC_PI_4;
            let dlat = radius * 0.99 * angle.cos() / METRES_PER_DEGREE;
            let dlon = radius * 0.99 * angle.sin()
                / (METRES_PER_DEGREE * center.lat.to_radians().cos());
            let p = Coord::new(center.lat + dlat, center.lon + dlon);
            let hash = geohash::encode(p, precision).unwrap();
            assert!(cells.contains(&hash), "{hash} not covered");
        }
    }
}
