//! GCJ-02 <-> WGS-84 conversion.
//!
//! GCJ-02 is the obfuscated datum used by mainland Chinese map providers.
//! Both directions apply the same polynomial offset, so converting back is
//! accurate to a metre or two.

use std::f64::consts::PI;

use shopfinder_core::models::Coord;

/// WGS-84 semi-major axis in metres.
const EARTH_A: f64 = 6_378_137.0;
const EE: f64 = 0.006_693_421_622_965_943;

/// Shift a WGS-84 coordinate onto GCJ-02.
pub fn wgs_to_gcj(wgs: Coord) -> Coord {
    let (dlat, dlon) = delta(wgs.lat, wgs.lon);
    Coord::new(wgs.lat + dlat, wgs.lon + dlon)
}

/// Approximate inverse of [`wgs_to_gcj`].
pub fn gcj_to_wgs(gcj: Coord) -> Coord {
    let (dlat, dlon) = delta(gcj.lat, gcj.lon);
    Coord::new(gcj.lat - dlat, gcj.lon - dlon)
}

fn delta(lat: f64, lon: f64) -> (f64, f64) {
    let (mut dlat, mut dlon) = transform(lon - 105.0, lat - 35.0);
    let rad_lat = lat.to_radians();
    let magic = 1.0 - EE * rad_lat.sin().powi(2);
    let sqrt_magic = magic.sqrt();
    dlat = (dlat * 180.0) / ((EARTH_A * (1.0 - EE)) / (magic * sqrt_magic) * PI);
    dlon = (dlon * 180.0) / (EARTH_A / sqrt_magic * rad_lat.cos() * PI);
    (dlat, dlon)
}

fn transform(x: f64, y: f64) -> (f64, f64) {
    let xy = x * y;
    let abs_x = x.abs().sqrt();
    let (x_pi, y_pi) = (x * PI, y * PI);
    let d = 20.0 * (6.0 * x_pi).sin() + 20.0 * (2.0 * x_pi).sin();

    let mut lat = d;
    let mut lon = d;
    lat += 20.0 * y_pi.sin() + 40.0 * (y_pi / 3.0).sin();
    lon += 20.0 * x_pi.sin() + 40.0 * (x_pi / 3.0).sin();
    lat += 160.0 * (y_pi / 12.0).sin() + 320.0 * (y_pi / 30.0).sin();
    lon += 150.0 * (x_pi / 12.0).sin() + 300.0 * (x_pi / 30.0).sin();
    lat *= 2.0 / 3.0;
    lon *= 2.0 / 3.0;

    lat += -100.0 + 2.0 * x + 3.0 * y + 0.2 * y * y + 0.1 * xy + 0.2 * abs_x;
    lon += 300.0 + x + 2.0 * y + 0.1 * x * x + 0.1 * xy + 0.1 * abs_x;
    (lat, lon)
}
