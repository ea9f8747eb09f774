//! Bing Maps Locations API client.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use shopfinder_core::models::{Coord, Location, Shop};

use super::gcj::gcj_to_wgs;
use super::{http_client, GeocodeError, Geocoder};

const DEFAULT_BASE_URL: &str = "https://dev.virtualearth.net";

pub struct BingGeocoder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    status_code: u16,
    #[serde(default)]
    status_description: String,
    #[serde(default)]
    resource_sets: Vec<ResourceSet>,
}

#[derive(Deserialize)]
struct ResourceSet {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Deserialize)]
struct Resource {
    point: Point,
    #[serde(default)]
    address: Address,
}

#[derive(Deserialize)]
struct Point {
    coordinates: Vec<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Address {
    #[serde(default)]
    country_region: String,
}

impl Address {
    fn is_hong_kong(&self) -> bool {
        self.country_region.contains("香港") || self.country_region.contains("Hong Kong")
    }
}

impl BingGeocoder {
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
}

#[async_trait]
impl Geocoder for BingGeocoder {
    fn name(&self) -> &str {
        "bing"
    }

    async fn fill_geocode(&self, mut shop: Shop) -> Result<Shop, GeocodeError> {
        let Some(address) = crate::db::non_blank(&shop.address).map(str::to_string) else {
            return Err(GeocodeError::NoMatch(format!("shop {} has no address", shop.id)));
        };

        let url = format!("{}/REST/v1/Locations", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("q", address.as_str()),
                ("o", "json"),
                ("culture", "zh-Hant"),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Request(format!("HTTP {status}")));
        }
        let body: Response = response
            .json()
            .await
            .map_err(|e| GeocodeError::from_reqwest(e, self.timeout))?;
        if body.status_code != 200 {
            return Err(GeocodeError::Request(format!(
                "{} {}",
                body.status_code, body.status_description
            )));
        }

        let Some(resource) = body
            .resource_sets
            .into_iter()
            .next()
            .and_then(|set| set.resources.into_iter().next())
        else {
            return Err(GeocodeError::NoMatch(address));
        };
        let &[lat, lon] = resource.point.coordinates.as_slice() else {
            return Err(GeocodeError::Request("malformed point".into()));
        };

        let mut coord = Coord::new(lat, lon);
        if resource.address.is_hong_kong() {
            coord = gcj_to_wgs(coord);
            debug!(shop_id = shop.id, "converted GCJ-02 result to WGS-84");
        }
        shop.location = Location::Coord(coord);
        Ok(shop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::json_encoded;
    use httptest::{Expectation, Server};
    use serde_json::json;

    fn geocoder(server: &Server) -> BingGeocoder {
        BingGeocoder::new("bing-key".into(), Some(&server.url_str("")), Duration::from_secs(2))
            .unwrap()
    }

    fn body(country: &str) -> serde_json::Value {
        json!({
            "statusCode": 200,
            "statusDescription": "OK",
            "resourceSets": [{
                "resources": [{
                    "point": { "coordinates": [22.2800, 114.1630] },
                    "address": { "countryRegion": country }
                }]
            }]
        })
    }

    fn with_address(address: &str) -> Shop {
        let mut shop = Shop::new("Kiss Cafe", "咖啡", "中環");
        shop.address = Some(address.into());
        shop
    }

    #[tokio::test]
    async fn hong_kong_results_are_converted() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/REST/v1/Locations"),
                request::query(url_decoded(contains(("q", "1 Queen's Road")))),
            ])
            .respond_with(json_encoded(body("香港特別行政區"))),
        );
        let shop = geocoder(&server)
            .fill_geocode(with_address("1 Queen's Road"))
            .await
            .unwrap();
        let coord = shop.coord().unwrap();
        assert_eq!(coord, gcj_to_wgs(Coord::new(22.2800, 114.1630)));
        assert_ne!(coord, Coord::new(22.2800, 114.1630));
    }

    #[tokio::test]
    async fn other_regions_are_kept_as_is() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/REST/v1/Locations"))
                .respond_with(json_encoded(body("Taiwan"))),
        );
        let shop = geocoder(&server)
            .fill_geocode(with_address("somewhere"))
            .await
            .unwrap();
        assert_eq!(shop.coord(), Some(Coord::new(22.2800, 114.1630)));
    }

    #[tokio::test]
    async fn requires_an_address() {
        let server = Server::run();
        let err = geocoder(&server)
            .fill_geocode(Shop::new("a", "b", "c"))
            .await
            .unwrap_err();
        assert!(matches!(err, GeocodeError::NoMatch(_)));
    }

    #[tokio::test]
    async fn empty_resource_set_is_no_match() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/REST/v1/Locations"))
                .respond_with(json_encoded(json!({
                    "statusCode": 200,
                    "resourceSets": [{ "resources": [] }]
                }))),
        );
        let err = geocoder(&server)
            .fill_geocode(with_address("nowhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, GeocodeError::NoMatch(_)));
    }
}
