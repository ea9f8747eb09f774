//! Core data model: the [`Shop`] record and its [`Location`].
//!
//! A location is held either as a geohash or as an explicit coordinate pair.
//! Both forms describe a physical place and convert into each other within
//! the quantization error of the geohash precision. Online-only shops carry
//! [`Location::Online`], which is different from a geocode that is merely
//! missing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geohash;

/// Geohash precision used when a coordinate has to be persisted as a hash.
pub const STORED_GEOHASH_PRECISION: usize = 12;

/// WGS-84 latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub lat: f64,
    pub lon: f64,
}

impl Coord {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Where a shop is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// No geocode yet. Candidates for enrichment.
    #[default]
    Missing,
    /// The shop has no physical premises.
    Online,
    Geohash(String),
    Coord(Coord),
}

impl Location {
    /// Build from a stored geohash column, treating empty as missing.
    pub fn from_geohash(hash: Option<&str>) -> Self {
        match hash.map(str::trim) {
            Some(h) if !h.is_empty() => Location::Geohash(h.to_ascii_lowercase()),
            _ => Location::Missing,
        }
    }

    pub fn has_physical_location(&self) -> bool {
        match self {
            Location::Geohash(h) => !h.is_empty(),
            Location::Coord(_) => true,
            Location::Missing | Location::Online => false,
        }
    }

    /// Coordinate form. A geohash decodes to the centre of its cell.
    pub fn to_coord(&self) -> Option<Coord> {
        match self {
            Location::Coord(c) => Some(*c),
            Location::Geohash(h) => geohash::decode(h).ok(),
            Location::Missing | Location::Online => None,
        }
    }

    /// Geohash form at `precision` characters.
    ///
    /// A geohash shorter than `precision` is extended from the centre of its
    /// cell, so the result still starts with the original hash and prefix
    /// lookups at any shorter precision find it.
    pub fn to_geohash(&self, precision: usize) -> Option<String> {
        match self {
            Location::Coord(c) => geohash::encode(*c, precision).ok(),
            Location::Geohash(h) if h.len() >= precision => Some(h.chars().take(precision).collect()),
            Location::Geohash(h) if !h.is_empty() => Some(
                geohash::decode(h)
                    .and_then(|centre| geohash::encode(centre, precision))
                    .unwrap_or_else(|_| h.clone()),
            ),
            _ => None,
        }
    }
}

/// Open/closed flag. Closed shops are hidden from every search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShopStatus {
    #[default]
    Open,
    Closed,
}

impl ShopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShopStatus::Open => "open",
            ShopStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for ShopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "open" => Ok(ShopStatus::Open),
            "closed" => Ok(ShopStatus::Closed),
            other => Err(format!("unknown shop status: {other}")),
        }
    }
}

/// A point of interest in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    /// Backend-assigned id. Zero until persisted.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Normalized keywords, see [`crate::keyword::normalize_tags`].
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub status: ShopStatus,
    /// Metres from the query point. Only set by proximity queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

impl Shop {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, district: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            kind: kind.into(),
            district: district.into(),
            address: None,
            url: None,
            notes: None,
            tags: Vec::new(),
            location: Location::Missing,
            status: ShopStatus::Open,
            distance: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == ShopStatus::Closed
    }

    /// True when the shop has an address or a URL to show.
    pub fn is_listed(&self) -> bool {
        non_empty(&self.address) || non_empty(&self.url)
    }

    /// True for open shops whose location has not been geocoded yet.
    pub fn needs_geocode(&self) -> bool {
        self.location == Location::Missing && !self.is_closed()
    }

    pub fn coord(&self) -> Option<Coord> {
        self.location.to_coord()
    }

    /// Geohash at full stored precision, if the shop has a physical location.
    pub fn stored_geohash(&self) -> Option<String> {
        self.location.to_geohash(STORED_GEOHASH_PRECISION)
    }
}

fn non_empty(field: &Option<String>) -> bool {
    field.as_deref().is_some_and(|s| !s.trim().is_empty())
}
