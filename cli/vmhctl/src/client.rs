//! HTTP transport shared by the backend gateways.
//!
//! Retries are bounded by a [`RetryPolicy`]. Only failures that are safe to
//! repeat are retried:
//! - idempotent requests (GET, HEAD, PUT): connect errors, timeouts, 5xx
//! - everything else (POST, DELETE): connect errors only, since those
//!   requests never reached the backend

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiErrorBody};

/// Bounded retry for a single logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,

    /// Minimum delay between attempts.
    pub min_backoff: Duration,

    /// Cap for the exponential backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_backoff,
            max_backoff: Duration::from_secs(30).max(min_backoff),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.min_backoff.saturating_mul(1 << exponent);
        delay.min(self.max_backoff).max(self.min_backoff)
    }
}

fn is_idempotent(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::PUT, Method::OPTIONS].contains(method)
}

/// One failed attempt, before the retry decision.
struct AttemptFailure {
    retryable: bool,
    status: Option<u16>,
    message: String,
}

/// JSON-over-HTTP client for one backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    backend: &'static str,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Create a client for `base_url`. `backend` names it in logs.
    pub fn new(
        backend: &'static str,
        base_url: &str,
        retry: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Client {
                backend,
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            backend,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Build a URL for an endpoint.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Make a GET request.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send(Method::GET, path, query, None).await
    }

    /// Make a POST request with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Validation {
            field: None,
            message: format!("failed to serialize request body: {e}"),
        })?;
        self.send(Method::POST, path, query, Some(body)).await
    }

    /// Make a POST request without a body.
    pub async fn post_empty<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send(Method::POST, path, query, None).await
    }

    /// Make a DELETE request.
    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send(Method::DELETE, path, query, None).await
    }

    /// Send a request, applying the retry policy.
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        let idempotent = is_idempotent(&method);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(backend = self.backend, method = %method, path, attempt, "Sending request");

            let mut request = self.client.request(method.clone(), &url).query(query);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let failure = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return self.decode(path, response).await;
                    }
                    if !status.is_server_error() {
                        return Err(self.client_error(path, status, response).await);
                    }

                    let message = match response.text().await {
                        Ok(text) => server_error_message(status, &text),
                        Err(e) => unreadable_body_message(status, &e),
                    };
                    AttemptFailure {
                        retryable: idempotent,
                        status: Some(status.as_u16()),
                        message,
                    }
                }
                Err(e) => AttemptFailure {
                    retryable: e.is_connect() || (idempotent && e.is_timeout()),
                    status: None,
                    message: e.to_string(),
                },
            };

            if failure.retryable && attempt < self.retry.max_attempts {
                let delay = self.retry.delay(attempt);
                warn!(
                    backend = self.backend,
                    method = %method,
                    path,
                    attempt,
                    status = failure.status,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "Request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            warn!(
                backend = self.backend,
                method = %method,
                path,
                attempt,
                status = failure.status,
                error = %failure.message,
                "Request failed"
            );
            return Err(ApiError::Transport {
                method: method.to_string(),
                path: path.to_string(),
                status: failure.status,
                attempts: attempt,
                message: failure.message,
            });
        }
    }

    /// Decode a successful response.
    async fn decode<T: DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let bytes = response.bytes().await.map_err(|e| ApiError::Decode {
            path: path.to_string(),
            message: format!("failed to read body: {e}"),
        })?;

        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Map a 4xx response to a domain error.
    async fn client_error(
        &self,
        path: &str,
        status: StatusCode,
        response: reqwest::Response,
    ) -> ApiError {
        let body: ApiErrorBody = response.json().await.unwrap_or_default();
        debug!(
            backend = self.backend,
            path,
            status = status.as_u16(),
            code = body.code.as_deref().unwrap_or("-"),
            "Request rejected"
        );
        ApiError::from_status(status.as_u16(), body, path)
    }
}

fn server_error_message(status: StatusCode, text: &str) -> String {
    let detail = serde_json::from_str::<ApiErrorBody>(text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or_else(|| text.trim().to_string());

    if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    }
}

fn unreadable_body_message(status: StatusCode, err: &dyn std::fmt::Display) -> String {
    format!("{status} (failed to read body: {err})")
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde::Deserialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Pong {
        ok: bool,
    }

    fn client(base_url: &str, max_attempts: u32, min_backoff_ms: u64) -> ApiClient {
        ApiClient::new(
            "test",
            base_url,
            RetryPolicy::new(max_attempts, Duration::from_millis(min_backoff_ms)),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap_or_default().len()
    }

    #[test]
    fn test_url_building() {
        let api = client("http://10.99.99.18/", 1, 10);
        assert_eq!(api.url("/vms"), "http://10.99.99.18/vms");
    }

    #[test]
    fn test_server_error_messages() {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        assert_eq!(
            server_error_message(status, r#"{"code":"Busy","message":"try later"}"#),
            "503 Service Unavailable: try later"
        );
        assert_eq!(server_error_message(status, "  "), "503 Service Unavailable");
        assert_eq!(
            unreadable_body_message(status, &"connection reset"),
            "503 Service Unavailable (failed to read body: connection reset)"
        );
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_policy_never_below_min_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_get_retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 3, 10);
        let pong: Pong = api.get("/ping", &[]).await.unwrap();

        assert!(pong.ok);
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_get_gives_up_after_max_attempts_with_spacing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_json(
                serde_json::json!({"code": "InternalError", "message": "database down"}),
            ))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 3, 40);
        let started = Instant::now();
        let err = api.get::<Pong>("/ping", &[]).await.unwrap_err();

        // Two retries: 40ms then 80ms.
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert_eq!(request_count(&server).await, 3);
        match err {
            ApiError::Transport {
                status,
                attempts,
                message,
                ..
            } => {
                assert_eq!(status, Some(500));
                assert_eq!(attempts, 3);
                assert!(message.contains("database down"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_attempt_policy_does_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 1, 10);
        let err = api.get::<Pong>("/ping", &[]).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                serde_json::json!({"code": "ResourceNotFound", "message": "VM not found"}),
            ))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 5, 10);
        let err = api.get::<Pong>("/vms/unknown", &[]).await.unwrap_err();

        assert!(matches!(err, ApiError::NotFound(ref m) if m == "VM not found"));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_post_5xx_is_not_resent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/vms"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 5, 10);
        let err = api
            .post::<Pong, _>("/vms", &[], &serde_json::json!({"ram": 64}))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Transport { attempts: 1, .. }));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_delete_5xx_is_not_resent() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 4, 10);
        let err = api.delete::<Pong>("/vms/x", &[]).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_post_connect_error_is_retried() {
        // Grab a free port and close it so connections are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = client(&format!("http://{addr}"), 3, 10);
        let err = api.post_empty::<Pong>("/vms/x", &[]).await.unwrap_err();

        match err {
            ApiError::Transport {
                attempts, status, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 3, 10);
        let err = api.get::<Pong>("/ping", &[]).await.unwrap_err();

        assert!(matches!(err, ApiError::Decode { .. }));
        assert!(!err.is_transient());
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_query_parameters_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vms"))
            .and(wiremock::matchers::query_param("owner_uuid", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let api = client(&server.uri(), 1, 10);
        let pong: Pong = api
            .get("/vms", &[("owner_uuid", "abc".to_string())])
            .await
            .unwrap();
        assert!(pong.ok);
    }
}
