//! Weather Underground REST client.
//!
//! Requests take the form
//! `{base}/{api_key}/{feature}[/{settings}]/q/{location}.json` and are sent
//! through a [`RateLimitedSession`], so every attempt that reaches the
//! network spends one token.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::ApiError;
use crate::model::{Almanac, AlmanacResponse, Conditions, ConditionsResponse};
use crate::query::{FeatureSettings, Query};
use crate::rate_limit::RateLimitedSession;

pub const DEFAULT_BASE_URL: &str = "http://api.wunderground.com/api";

/// Calls allowed per minute on the provider's free tier.
pub const DEFAULT_API_LIMIT: u32 = 10;

#[derive(Debug, Clone)]
pub struct WeatherClient {
    base_url: Url,
    api_key: String,
    session: Arc<RateLimitedSession>,
}

impl WeatherClient {
    pub fn new(
        session: Arc<RateLimitedSession>,
        api_key: impl Into<String>,
    ) -> Result<Self, ApiError> {
        Self::with_base_url(session, api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        session: Arc<RateLimitedSession>,
        api_key: impl Into<String>,
        base_url: &str,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Config(format!("invalid base URL {base_url:?}: {e}")))?;

        Ok(Self {
            base_url,
            api_key: api_key.into(),
            session,
        })
    }

    pub fn session(&self) -> &RateLimitedSession {
        &self.session
    }

    /// Page relative to the keyed base path: `{feature}[/{settings}]/q/{location}.json`.
    pub fn feature_page(
        feature: &str,
        query: &Query,
        settings: Option<&FeatureSettings>,
    ) -> Result<String, ApiError> {
        let mut page = feature.to_string();
        if let Some(settings) = settings.filter(|s| !s.is_empty()) {
            page.push('/');
            page.push_str(&settings.to_path());
        }

        let location = query.resolve()?;
        Ok(format!("{page}/q/{location}.json"))
    }

    /// Full request URL for a feature lookup. Pure; spends no token.
    pub fn request_url(
        &self,
        feature: &str,
        query: &Query,
        settings: Option<&FeatureSettings>,
    ) -> Result<Url, ApiError> {
        let page = Self::feature_page(feature, query, settings)?;
        let mut url = self.base_url.clone();
        let path = format!(
            "{}/{}/{}",
            self.base_url.path().trim_end_matches('/'),
            self.api_key,
            page.trim_start_matches('/'),
        );
        url.set_path(&path);
        Ok(url)
    }

    /// Fetch `feature` for `query`, returning the provider's JSON body untouched.
    #[instrument(skip(self, settings), level = "info")]
    pub async fn get(
        &self,
        feature: &str,
        query: &Query,
        settings: Option<&FeatureSettings>,
    ) -> Result<Value, ApiError> {
        // Resolving first means a bad query fails before any token is spent.
        let url = self.request_url(feature, query, settings)?;
        self.request(Method::GET, url).await
    }

    pub async fn conditions(&self, query: &Query) -> Result<Conditions, ApiError> {
        let body = self.get("conditions", query, None).await?;
        let parsed: ConditionsResponse = serde_json::from_value(body)?;
        Ok(parsed.current_observation)
    }

    pub async fn almanac(&self, query: &Query) -> Result<Almanac, ApiError> {
        let body = self.get("almanac", query, None).await?;
        let parsed: AlmanacResponse = serde_json::from_value(body)?;
        Ok(parsed.almanac.into())
    }

    async fn request(&self, method: Method, url: Url) -> Result<Value, ApiError> {
        let res = self.session.api_call(method, url, &[]).await?;

        let status = res.status();
        if status != StatusCode::OK {
            let reason = reason_phrase(&res, status);
            warn!(status = status.as_u16(), %reason, "provider returned non-200 status");
            return Err(ApiError::transport(status.as_u16(), reason));
        }

        let bytes = res.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes)?;

        if let Some(error) = body.get("response").and_then(|r| r.get("error")) {
            debug!(%error, "provider reported an application error");
            return Err(application_error(error));
        }

        Ok(body)
    }
}

/// Reason phrase as sent by the server. hyper only keeps it when it differs
/// from the canonical one, so fall back to that.
fn reason_phrase(res: &reqwest::Response, status: StatusCode) -> String {
    res.extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .or_else(|| status.canonical_reason())
        .unwrap_or("unknown status")
        .to_string()
}

fn application_error(error: &Value) -> ApiError {
    let text = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_string);
    let status = error.get("status").and_then(|s| match s {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });

    ApiError::application(text("type"), text("description"), status)
}

/// Source of the two weather lookups the notifier needs per location.
#[async_trait]
pub trait WeatherSource: Send + Sync + Debug {
    async fn conditions(&self, query: &Query) -> Result<Conditions, ApiError>;
    async fn almanac(&self, query: &Query) -> Result<Almanac, ApiError>;
}

#[async_trait]
impl WeatherSource for WeatherClient {
    async fn conditions(&self, query: &Query) -> Result<Conditions, ApiError> {
        WeatherClient::conditions(self, query).await
    }

    async fn almanac(&self, query: &Query) -> Result<Almanac, ApiError> {
        WeatherClient::almanac(self, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server_uri: &str, limit: u32) -> WeatherClient {
        let session = Arc::new(RateLimitedSession::new(limit).unwrap());
        WeatherClient::with_base_url(session, "KEY", server_uri).unwrap()
    }

    #[test]
    fn default_url_layout_with_settings() {
        let session = Arc::new(RateLimitedSession::new(1).unwrap());
        let client = WeatherClient::new(session, "KEY").unwrap();
        let settings = FeatureSettings::new().set("lang", "EN");

        let url = client
            .request_url("conditions", &Query::city_state("Boston", "MA"), Some(&settings))
            .unwrap();

        assert_eq!(
            url.as_str(),
            "http://api.wunderground.com/api/KEY/conditions/lang:EN/q/MA/Boston.json"
        );
    }

    #[test]
    fn page_without_settings_uses_zipcode_first() {
        let q = Query::city_state("Boston", "MA").with_zipcode("02110");
        let page = WeatherClient::feature_page("almanac", &q, None).unwrap();
        assert_eq!(page, "almanac/q/02110.json");
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let session = Arc::new(RateLimitedSession::new(1).unwrap());
        let client =
            WeatherClient::with_base_url(session, "KEY", "http://example.test/api/").unwrap();
        let url = client
            .request_url("conditions", &Query::airport("KBOS"), None)
            .unwrap();
        assert_eq!(url.path(), "/api/KEY/conditions/q/KBOS.json");
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let session = Arc::new(RateLimitedSession::new(1).unwrap());
        let err = WeatherClient::with_base_url(session, "KEY", "not a url").unwrap_err();
        assert!(matches!(err, ApiError::Config(_)));
    }

    #[tokio::test]
    async fn get_returns_body_unchanged() {
        let server = MockServer::start().await;
        let body = json!({
            "response": { "version": "0.1" },
            "current_observation": { "weather": "Clear", "feelslike_f": "70" }
        });

        Mock::given(method("GET"))
            .and(path("/KEY/conditions/lang:EN/q/MA/Boston.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 10);
        let settings = FeatureSettings::new().set("lang", "EN");
        let got = client
            .get("conditions", &Query::city_state("Boston", "MA"), Some(&settings))
            .await
            .unwrap();

        assert_eq!(got, body);
        assert_eq!(client.session().bucket().available().await, 9.0);
    }

    #[tokio::test]
    async fn non_200_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 10);
        let err = client
            .get("conditions", &Query::zipcode("02110"), None)
            .await
            .unwrap_err();

        assert_eq!(err.status(), 500);
        assert_eq!(err.description(), "Internal Server Error");
        assert_eq!(client.session().bucket().available().await, 9.0);
    }

    #[tokio::test]
    async fn non_200_keeps_server_reason_phrase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 500 Simulated Failure\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let client = client_for(&format!("http://{addr}"), 10);
        let err = client
            .get("conditions", &Query::zipcode("02110"), None)
            .await
            .unwrap_err();

        assert_eq!(err.status(), 500);
        assert_eq!(err.description(), "Simulated Failure");
    }

    #[tokio::test]
    async fn embedded_error_is_application_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {
                    "error": {
                        "type": "querynotfound",
                        "description": "No cities match your search query"
                    }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 10);
        let err = client
            .get("conditions", &Query::city_state("Nowhere", "ZZ"), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "querynotfound");
        assert_eq!(err.status(), 422);
        assert_eq!(err.description(), "No cities match your search query");
    }

    #[tokio::test]
    async fn parameter_error_spends_no_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 2);
        let err = client
            .get("conditions", &Query::default().with_city("Boston"), None)
            .await
            .unwrap_err();

        assert!(err.is_parameter());
        assert_eq!(err.status(), 406);
        assert_eq!(client.session().bucket().available().await, 2.0);
    }

    #[tokio::test]
    async fn non_json_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 10);
        let err = client
            .get("conditions", &Query::zipcode("02110"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Decode(_)));
        assert_eq!(err.status(), 422);
    }

    #[tokio::test]
    async fn typed_helpers_parse_sections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/KEY/conditions/q/MA/Boston.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {},
                "current_observation": { "weather": "Rain", "feelslike_f": "48.2", "temp_f": 50.1 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/KEY/almanac/q/MA/Boston.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": {},
                "almanac": {
                    "temp_high": { "normal": { "F": "60" } },
                    "temp_low": { "normal": { "F": "44" } }
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), 10);
        let query = Query::city_state("Boston", "MA");

        let conditions = client.conditions(&query).await.unwrap();
        let almanac = client.almanac(&query).await.unwrap();

        assert_eq!(conditions.weather, "Rain");
        assert_eq!(conditions.feelslike_f, 48.2);
        assert_eq!(almanac.average(), 52.0);
    }
}
