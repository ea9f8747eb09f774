//! Google Geocoding API client.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use shopfinder_core::models::{Coord, Location, Shop};

use super::{http_client, GeocodeError, Geocoder};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com";

pub struct GoogleGeocoder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct Response {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    formatted_address: Option<String>,
    geometry: Geometry,
    #[serde(default)]
    partial_match: bool,
}

#[derive(Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

impl GoogleGeocoder {
    pub fn new(api_key: String, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            api_key,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            timeout,
        })
    }

    async fn lookup(&self, query: &str) -> Result<Response, GeocodeError> {
        let url = format!("{}/maps/api/geocode/json", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("address", query), ("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| GeocodeError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Request(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| GeocodeError::from_reqwest(e, self.timeout))
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn name(&self) -> &str {
        "google"
    }

    async fn fill_geocode(&self, mut shop: Shop) -> Result<Shop, GeocodeError> {
        let address = shop
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);
        let from_address = address.is_some();
        let query = address.unwrap_or_else(|| format!("{} {}", shop.district, shop.name));

        let response = self.lookup(&query).await?;
        match response.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Err(GeocodeError::NoMatch(query)),
            other => {
                let detail = response.error_message.unwrap_or_default();
                return Err(GeocodeError::Request(format!("{other} {detail}").trim().to_string()));
            }
        }

        if response.results.len() > 1 {
            warn!(shop_id = shop.id, query = %query, "multiple geocode results, using the first");
        }
        let Some(first) = response.results.into_iter().next() else {
            return Err(GeocodeError::NoMatch(query));
        };

        // A partial match on the shop's own address is trusted; on the
        // name-based fallback it is too ambiguous to keep.
        if first.partial_match {
            warn!(shop_id = shop.id, query = %query, "partial geocode match");
            if !from_address {
                return Err(GeocodeError::PartialMatch(query));
            }
        }

        let LatLng { lat, lng } = first.geometry.location;
        shop.location = Location::Coord(Coord::new(lat, lng));
        if !from_address {
            shop.address = first.formatted_address;
        }
        Ok(shop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn geocoder(server: &Server) -> GoogleGeocoder {
        let base = server.url_str("");
        GoogleGeocoder::new("test-key".into(), Some(&base), Duration::from_secs(2)).unwrap()
    }

    fn result(partial: bool) -> serde_json::Value {
        json!({
            "status": "OK",
            "results": [{
                "formatted_address": "1 Queen's Road Central, Hong Kong",
                "geometry": { "location": { "lat": 22.2819, "lng": 114.1582 } },
                "partial_match": partial
            }]
        })
    }

    #[tokio::test]
    async fn falls_back_to_district_and_name() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/maps/api/geocode/json"),
                request::query(url_decoded(contains(("address", "中環 Kiss Cafe")))),
                request::query(url_decoded(contains(("key", "test-key")))),
            ])
            .respond_with(json_encoded(result(false))),
        );

        let shop = geocoder(&server)
            .fill_geocode(Shop::new("Kiss Cafe", "咖啡", "中環"))
            .await
            .unwrap();
        assert_eq!(shop.location, Location::Coord(Coord::new(22.2819, 114.1582)));
        assert_eq!(
            shop.address.as_deref(),
            Some("1 Queen's Road Central, Hong Kong")
        );
    }

    #[tokio::test]
    async fn partial_match_on_fallback_is_rejected() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/maps/api/geocode/json"))
                .respond_with(json_encoded(result(true))),
        );
        let err = geocoder(&server)
            .fill_geocode(Shop::new("Kiss Cafe", "咖啡", "中環"))
            .await
            .unwrap_err();
        assert!(matches!(err, GeocodeError::PartialMatch(_)));
    }

    #[tokio::test]
    async fn partial_match_on_own_address_keeps_address() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/maps/api/geocode/json"))
                .respond_with(json_encoded(result(true))),
        );
        let mut shop = Shop::new("Kiss Cafe", "咖啡", "中環");
        shop.address = Some("Queen's Road".into());
        let shop = geocoder(&server).fill_geocode(shop).await.unwrap();
        assert_eq!(shop.address.as_deref(), Some("Queen's Road"));
        assert!(shop.location.has_physical_location());
    }

    #[tokio::test]
    async fn zero_results_and_http_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("address", "nowhere")))))
                .respond_with(json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] }))),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("address", "broken")))))
                .respond_with(status_code(500)),
        );
        let g = geocoder(&server);

        let mut shop = Shop::new("a", "b", "c");
        shop.address = Some("nowhere".into());
        assert!(matches!(
            g.fill_geocode(shop.clone()).await,
            Err(GeocodeError::NoMatch(_))
        ));

        shop.address = Some("broken".into());
        assert!(matches!(
            g.fill_geocode(shop).await,
            Err(GeocodeError::Request(_))
        ));
    }
}
