//! The upstream record source.

use std::future::Future;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use serde_json::Value;

use crate::config::IngestConfig;
use crate::error::{preview, IngestError};

/// Something that returns raw upstream records newer than a timestamp.
pub trait RecordSource: Send + Sync {
    /// Fetch everything after `since` (epoch seconds). An error abandons the
    /// current cycle.
    fn fetch(&self, since: i64) -> impl Future<Output = Result<Vec<Value>, IngestError>> + Send;
}

/// Polls a fixed HTTP endpoint with a `since_id` query parameter and an
/// optional header credential.
///
/// Connection failures, timeouts, 5xx and 429 responses are retried with
/// exponential backoff inside a single fetch. Each attempt is bounded by
/// `fetch_timeout`.
pub struct HttpSource {
    client: ClientWithMiddleware,
    url: String,
    auth_header: String,
    auth_value: Option<String>,
}

impl HttpSource {
    pub fn new(
        url: String,
        auth_header: String,
        auth_value: Option<String>,
        config: &IngestConfig,
    ) -> Result<Self, IngestError> {
        let inner = reqwest::Client::builder()
            .user_agent(concat!("ferry-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(config.fetch_timeout)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(config.fetch_backoff, config.fetch_backoff * 8)
            .build_with_max_retries(config.fetch_attempts.saturating_sub(1));
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            url,
            auth_header,
            auth_value,
        })
    }
}

impl RecordSource for HttpSource {
    async fn fetch(&self, since: i64) -> Result<Vec<Value>, IngestError> {
        let mut request = self.client.get(&self.url).query(&[("since_id", since)]);
        if let Some(value) = &self.auth_value {
            request = request.header(self.auth_header.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_batch(status, &body)
    }
}

/// Non-2xx statuses and anything other than a JSON array fail the cycle.
fn parse_batch(status: u16, body: &str) -> Result<Vec<Value>, IngestError> {
    if !(200..300).contains(&status) {
        return Err(IngestError::Status {
            status,
            preview: preview(body),
        });
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(IngestError::malformed("expected a JSON array", body)),
        Err(e) => Err(IngestError::malformed(e, body)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::{RawQuery, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::Router;

    use super::*;

    /// A local upstream that fails its first `failures` requests with
    /// `status`, then serves one record.
    struct Upstream {
        hits: AtomicUsize,
        failures: usize,
        status: StatusCode,
        stall: Option<Duration>,
        last_query: Mutex<Option<String>>,
        last_token: Mutex<Option<String>>,
    }

    impl Upstream {
        fn new(failures: usize, status: StatusCode, stall: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                failures,
                status,
                stall,
                last_query: Mutex::new(None),
                last_token: Mutex::new(None),
            })
        }

        fn failing(failures: usize, status: StatusCode) -> Arc<Self> {
            Self::new(failures, status, None)
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    async fn feed(
        State(upstream): State<Arc<Upstream>>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
    ) -> (StatusCode, String) {
        let hit = upstream.hits.fetch_add(1, Ordering::SeqCst);
        *upstream.last_query.lock().unwrap() = query;
        *upstream.last_token.lock().unwrap() = headers
            .get("x-relay-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(stall) = upstream.stall {
            tokio::time::sleep(stall).await;
        }
        if hit < upstream.failures {
            return (upstream.status, "upstream unavailable".into());
        }
        (StatusCode::OK, r#"[{"id": 1, "user_id": "a", "timestamp": 5}]"#.into())
    }

    async fn serve(upstream: Arc<Upstream>) -> String {
        let app = Router::new().route("/feed", get(feed)).with_state(upstream);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/feed")
    }

    fn config() -> IngestConfig {
        IngestConfig {
            fetch_timeout: Duration::from_millis(500),
            fetch_attempts: 3,
            fetch_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn source(url: String, config: &IngestConfig) -> HttpSource {
        HttpSource::new(url, "X-Relay-Token".into(), Some("secret".into()), config).unwrap()
    }

    #[tokio::test]
    async fn test_transient_statuses_are_retried() {
        let upstream = Upstream::failing(2, StatusCode::SERVICE_UNAVAILABLE);
        let url = serve(upstream.clone()).await;

        let items = source(url, &config()).fetch(42).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(upstream.hits(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_then_ok() {
        let upstream = Upstream::failing(1, StatusCode::TOO_MANY_REQUESTS);
        let url = serve(upstream.clone()).await;

        assert_eq!(source(url, &config()).fetch(0).await.unwrap().len(), 1);
        assert_eq!(upstream.hits(), 2);
    }

    #[tokio::test]
    async fn test_retries_stop_after_configured_attempts() {
        let upstream = Upstream::failing(10, StatusCode::BAD_GATEWAY);
        let url = serve(upstream.clone()).await;

        let err = source(url, &config()).fetch(0).await.unwrap_err();
        assert!(matches!(err, IngestError::Status { status: 502, .. }));
        assert_eq!(upstream.hits(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let upstream = Upstream::failing(10, StatusCode::UNAUTHORIZED);
        let url = serve(upstream.clone()).await;

        let err = source(url, &config()).fetch(0).await.unwrap_err();
        assert!(matches!(err, IngestError::Status { status: 401, .. }));
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn test_cursor_and_credential_are_sent() {
        let upstream = Upstream::failing(0, StatusCode::OK);
        let url = serve(upstream.clone()).await;

        source(url, &config()).fetch(-5).await.unwrap();
        assert_eq!(upstream.last_query.lock().unwrap().as_deref(), Some("since_id=-5"));
        assert_eq!(upstream.last_token.lock().unwrap().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_each_attempt_is_bounded_by_timeout() {
        let upstream = Upstream::new(0, StatusCode::OK, Some(Duration::from_secs(5)));
        let url = serve(upstream.clone()).await;
        let config = IngestConfig {
            fetch_timeout: Duration::from_millis(50),
            fetch_attempts: 2,
            ..config()
        };

        let err = source(url, &config).fetch(0).await.unwrap_err();
        assert!(matches!(err, IngestError::Request(_)));
        assert_eq!(upstream.hits(), 2);
    }

    #[test]
    fn test_parse_batch() {
        let items = parse_batch(200, r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(items.len(), 2);
        assert!(parse_batch(204, "[]").unwrap().is_empty());
    }

    #[test]
    fn test_non_success_status_fails() {
        match parse_batch(502, "bad gateway") {
            Err(IngestError::Status { status, preview }) => {
                assert_eq!(status, 502);
                assert_eq!(preview, "bad gateway");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_non_json_and_non_array_fail() {
        let html = format!("<html>{}</html>", "x".repeat(500));
        match parse_batch(200, &html) {
            Err(IngestError::Malformed { preview, .. }) => assert_eq!(preview.chars().count(), 200),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            parse_batch(200, r#"{"messages": []}"#),
            Err(IngestError::Malformed { .. })
        ));
    }
}
