//! Geohash encoding, decoding and neighbor lookup.
//!
//! Bits are interleaved starting with longitude and packed five at a time
//! into the base-32 alphabet below. Neighbor lookup is table-driven: each
//! cardinal direction has a substitution string and a border set per hash
//! parity, so adjacent cells are found without any trigonometry.

use thiserror::Error;

use crate::models::Coord;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MAX_PRECISION: usize = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeohashError {
    #[error("coordinate out of range: ({lat}, {lon})")]
    InvalidCoord { lat: f64, lon: f64 },
    #[error("invalid geohash character {0:?}")]
    InvalidChar(char),
    #[error("geohash precision must be between 1 and {MAX_PRECISION}, got {0}")]
    InvalidPrecision(usize),
    #[error("empty geohash")]
    Empty,
}

/// Compass direction for neighbor lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    /// All eight directions, clockwise from north.
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];
}

/// Bounding box of a geohash cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    pub fn center(&self) -> Coord {
        Coord::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn lat_span(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    pub fn lon_span(&self) -> f64 {
        self.max_lon - self.min_lon
    }
}

/// Encode a coordinate at `precision` characters.
pub fn encode(coord: Coord, precision: usize) -> Result<String, GeohashError> {
    if !(1..=MAX_PRECISION).contains(&precision) {
        return Err(GeohashError::InvalidPrecision(precision));
    }
    if !coord.is_valid() {
        return Err(GeohashError::InvalidCoord {
            lat: coord.lat,
            lon: coord.lon,
        });
    }

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0;
    let mut idx = 0usize;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if coord.lon >= mid {
                idx = idx * 2 + 1;
                lon_lo = mid;
            } else {
                idx *= 2;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if coord.lat >= mid {
                idx = idx * 2 + 1;
                lat_lo = mid;
            } else {
                idx *= 2;
                lat_hi = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            hash.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    Ok(hash)
}

/// Cell bounds of `hash`. Case-insensitive.
pub fn decode_bounds(hash: &str) -> Result<Bounds, GeohashError> {
    if hash.is_empty() {
        return Err(GeohashError::Empty);
    }
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for c in hash.chars() {
        let idx = char_index(c)?;
        for n in (0..5).rev() {
            let bit = (idx >> n) & 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit == 1 {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit == 1 {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }

    Ok(Bounds {
        min_lat: lat_lo,
        max_lat: lat_hi,
        min_lon: lon_lo,
        max_lon: lon_hi,
    })
}

/// Centre of the cell named by `hash`.
pub fn decode(hash: &str) -> Result<Coord, GeohashError> {
    Ok(decode_bounds(hash)?.center())
}

/// Lowercase `hash` and check every character is in the alphabet.
pub fn normalize(hash: &str) -> Result<String, GeohashError> {
    let hash = hash.trim().to_ascii_lowercase();
    if hash.is_empty() {
        return Err(GeohashError::Empty);
    }
    for c in hash.chars() {
        char_index(c)?;
    }
    Ok(hash)
}

/// The adjacent cell of the same precision in `dir`.
pub fn neighbor(hash: &str, dir: Direction) -> Result<String, GeohashError> {
    let hash = normalize(hash)?;
    let (first, second) = match dir {
        Direction::North => (Cardinal::North, None),
        Direction::East => (Cardinal::East, None),
        Direction::South => (Cardinal::South, None),
        Direction::West => (Cardinal::West, None),
        Direction::NorthEast => (Cardinal::North, Some(Cardinal::East)),
        Direction::SouthEast => (Cardinal::South, Some(Cardinal::East)),
        Direction::SouthWest => (Cardinal::South, Some(Cardinal::West)),
        Direction::NorthWest => (Cardinal::North, Some(Cardinal::West)),
    };
    let step = adjacent(&hash, first);
    Ok(match second {
        Some(c) => adjacent(&step, c),
        None => step,
    })
}

/// The eight surrounding cells, clockwise from north.
pub fn neighbors(hash: &str) -> Result<[String; 8], GeohashError> {
    let hash = normalize(hash)?;
    let n = adjacent(&hash, Cardinal::North);
    let s = adjacent(&hash, Cardinal::South);
    Ok([
        n.clone(),
        adjacent(&n, Cardinal::East),
        adjacent(&hash, Cardinal::East),
        adjacent(&s, Cardinal::East),
        s.clone(),
        adjacent(&s, Cardinal::West),
        adjacent(&hash, Cardinal::West),
        adjacent(&n, Cardinal::West),
    ])
}

// ─── Lookup tables ─────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Cardinal {
    North,
    East,
    South,
    West,
}

/// Substitution strings indexed by `[even length, odd length]`.
fn neighbor_table(dir: Cardinal) -> [&'static str; 2] {
    match dir {
        Cardinal::North => ["p0r21436x8zb9dcf5h7kjnmqesgutwvy", "bc01fg45238967deuvhjyznpkmstqrwx"],
        Cardinal::South => ["14365h7k9dcfesgujnmqp0r2twvyx8zb", "238967debc01fg45kmstqrwxuvhjyznp"],
        Cardinal::East => ["bc01fg45238967deuvhjyznpkmstqrwx", "p0r21436x8zb9dcf5h7kjnmqesgutwvy"],
        Cardinal::West => ["238967debc01fg45kmstqrwxuvhjyznp", "14365h7k9dcfesgujnmqp0r2twvyx8zb"],
    }
}

/// Characters on the edge of their parent cell, same indexing.
fn border_table(dir: Cardinal) -> [&'static str; 2] {
    match dir {
        Cardinal::North => ["prxz", "bcfguvyz"],
        Cardinal::South => ["028b", "0145hjnp"],
        Cardinal::East => ["bcfguvyz", "prxz"],
        Cardinal::West => ["0145hjnp", "028b"],
    }
}

// `hash` must already be normalized and non-empty.
fn adjacent(hash: &str, dir: Cardinal) -> String {
    let Some(last) = hash.chars().last() else {
        return String::new();
    };
    let parity = hash.len() % 2;
    let mut parent = hash[..hash.len() - 1].to_string();

    if border_table(dir)[parity].contains(last) && !parent.is_empty() {
        parent = adjacent(&parent, dir);
    }

    let pos = neighbor_table(dir)[parity].find(last).unwrap_or(0);
    parent.push(BASE32[pos] as char);
    parent
}

fn char_index(c: char) -> Result<usize, GeohashError> {
    let lower = c.to_ascii_lowercase();
    BASE32
        .iter()
        .position(|&b| b as char == lower)
        .ok_or(GeohashError::InvalidChar(c))
}
