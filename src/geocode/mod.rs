//! Geocoding providers.
//!
//! A [`Geocoder`] takes a shop without a location and returns it with a
//! coordinate (and, when the shop had none, an address) filled in:
//!
//! - **[`google::GoogleGeocoder`]**: Google Geocoding API. Falls back to
//!   `"<district> <name>"` when the shop has no address.
//! - **[`bing::BingGeocoder`]**: Bing Locations API. Needs an address;
//!   Hong Kong results are shifted from GCJ-02 back to WGS-84.
//! - **[`DisabledGeocoder`]**: fails every lookup.
//!
//! Use [`create_geocoder`] to build the provider named in the config.

pub mod bing;
pub mod gcj;
pub mod google;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use thiserror::Error;

use shopfinder_core::models::Shop;

use crate::config::GeocoderConfig;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no match: {0}")]
    NoMatch(String),

    /// The provider only matched part of the query; the result is ambiguous.
    #[error("partial match: {0}")]
    PartialMatch(String),

    #[error("geocoder request failed: {0}")]
    Request(String),

    #[error("geocoder timed out after {0:?}")]
    Timeout(Duration),
}

impl GeocodeError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            GeocodeError::Timeout(timeout)
        } else {
            GeocodeError::Request(err.to_string())
        }
    }
}

/// Fills in the location of a shop.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Provider name for logs, e.g. `"google"`.
    fn name(&self) -> &str;

    /// Return `shop` with its location set, or why it could not be found.
    async fn fill_geocode(&self, shop: Shop) -> Result<Shop, GeocodeError>;
}

/// Used when `geocoder.provider = "disabled"`.
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn fill_geocode(&self, _shop: Shop) -> Result<Shop, GeocodeError> {
        Err(GeocodeError::Request("geocoder is disabled".into()))
    }
}

/// Build the provider selected by `config.provider`.
///
/// # Errors
///
/// Unknown provider names, or a real provider without an API key.
pub fn create_geocoder(config: &GeocoderConfig) -> Result<Arc<dyn Geocoder>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGeocoder)),
        "google" | "bing" => {
            let Some(key) = config.resolve_api_key() else {
                bail!(
                    "geocoder.api_key (or {}) required for the {} geocoder",
                    crate::config::GEOCODER_KEY_ENV,
                    config.provider
                );
            };
            let base_url = config.base_url.as_deref();
            if config.provider == "google" {
                Ok(Arc::new(google::GoogleGeocoder::new(key, base_url, timeout)?))
            } else {
                Ok(Arc::new(bing::BingGeocoder::new(key, base_url, timeout)?))
            }
        }
        other => bail!("Unknown geocoder provider: {}", other),
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}
