use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const EARTH_RADIUS_MILES: f64 = 3_958.8;
/// Roads are rarely straight; inflate great-circle distance before estimating drive time.
const ROAD_FACTOR: f64 = 1.3;
const AVERAGE_SPEED_MPH: f64 = 30.0;
const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Great-circle distance in miles.
pub fn haversine_miles(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_MILES * h.sqrt().asin()
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<Coordinates>;

    /// Estimated drive time in whole minutes between two points.
    async fn drive_minutes(&self, from: Coordinates, to: Coordinates) -> Option<i64> {
        let miles = haversine_miles(from, to) * ROAD_FACTOR;
        Some((miles / AVERAGE_SPEED_MPH * 60.0).ceil() as i64)
    }
}

#[derive(Deserialize, Debug)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Deserialize, Debug)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Deserialize, Debug)]
struct Geometry {
    location: Location,
}

#[derive(Deserialize, Debug)]
struct Location {
    lat: f64,
    lng: f64,
}

/// Google Maps Geocoding API client.
pub struct GoogleGeocoder {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleGeocoder {
    pub fn new(http_client: reqwest::Client, api_key: String) -> Self {
        Self::with_base_url(
            http_client,
            api_key,
            "https://maps.googleapis.com".to_string(),
        )
    }

    pub fn with_base_url(http_client: reqwest::Client, api_key: String, base_url: String) -> Self {
        Self {
            http_client,
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> Option<Coordinates> {
        let url = format!("{}/maps/api/geocode/json", self.base_url);
        let resp = self
            .http_client
            .get(url)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .timeout(GEOCODE_TIMEOUT)
            .send()
            .await
            .map_err(|e| warn!(error=%e, "geocode request failed"))
            .ok()?;
        let body = resp
            .json::<GeocodeResponse>()
            .await
            .map_err(|e| warn!(error=%e, "failed to deserialize geocode response"))
            .ok()?;
        if body.status != "OK" {
            debug!(status=%body.status, address=%address, "geocoder returned no result");
            return None;
        }
        body.results.first().map(|r| Coordinates {
            lat: r.geometry.location.lat,
            lng: r.geometry.location.lng,
        })
    }
}

/// Geocode results memoized for the lifetime of one dispatch evaluation.
pub struct GeocodeCache<'a> {
    geocoder: &'a dyn Geocoder,
    resolved: HashMap<String, Option<Coordinates>>,
}

impl<'a> GeocodeCache<'a> {
    pub fn new(geocoder: &'a dyn Geocoder) -> Self {
        Self {
            geocoder,
            resolved: HashMap::new(),
        }
    }

    pub async fn geocode(&mut self, address: &str) -> Option<Coordinates> {
        let key = address.trim().to_lowercase();
        if let Some(hit) = self.resolved.get(&key) {
            return *hit;
        }
        let coords = self.geocoder.geocode(address).await;
        self.resolved.insert(key, coords);
        coords
    }

    pub async fn drive_minutes(&self, from: Coordinates, to: Coordinates) -> Option<i64> {
        self.geocoder.drive_minutes(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingGeocoder(AtomicUsize);

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, _address: &str) -> Option<Coordinates> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(Coordinates { lat: 1.0, lng: 2.0 })
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Roughly 1 degree of latitude.
        let a = Coordinates { lat: 40.0, lng: -75.0 };
        let b = Coordinates { lat: 41.0, lng: -75.0 };
        let miles = haversine_miles(a, b);
        assert!((miles - 69.09).abs() < 0.1, "got {miles}");
        assert_eq!(haversine_miles(a, a), 0.0);
    }

    #[tokio::test]
    async fn cache_geocodes_each_address_once() {
        let geocoder = CountingGeocoder(AtomicUsize::new(0));
        let mut cache = GeocodeCache::new(&geocoder);
        cache.geocode("12 Elm St").await;
        cache.geocode("12 elm st ").await;
        cache.geocode("9 Oak Ave").await;
        assert_eq!(geocoder.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn google_geocoder_parses_location() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/maps/api/geocode/json"))
            .and(query_param("address", "1 Main St"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "OK",
                "results": [{"geometry": {"location": {"lat": 39.95, "lng": -75.16}}}]
            })))
            .mount(&server)
            .await;

        let geocoder =
            GoogleGeocoder::with_base_url(reqwest::Client::new(), "k".into(), server.uri());
        let coords = geocoder.geocode("1 Main St").await.unwrap();
        assert_eq!(coords, Coordinates { lat: 39.95, lng: -75.16 });
    }

    #[tokio::test]
    async fn google_geocoder_zero_results_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "ZERO_RESULTS", "results": []})),
            )
            .mount(&server)
            .await;

        let geocoder =
            GoogleGeocoder::with_base_url(reqwest::Client::new(), "k".into(), server.uri());
        assert!(geocoder.geocode("nowhere").await.is_none());
    }
}
