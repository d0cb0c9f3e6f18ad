//! Authenticated JSON client for the CLI sync API
//!
//! Every response goes through the same classification: status >= 400 is an
//! `ApiError` carrying the server's message, and a JSON `error` field fails
//! the call even on a 2xx. Only blob uploads are retried.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::blob_pool::BlobSink;
use crate::error::{ApiError, Result, SyncError};
use crate::protocol::{
    self, endpoints, BlobUploadRequest, BlobUploadResponse, CompleteRequest, CompleteResponse,
    Handshake, HandshakeRequest, HandshakeResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: protocol::retry::MAX_ATTEMPTS,
            base_delay: Duration::from_millis(protocol::retry::BASE_DELAY_MS),
            max_delay: Duration::from_millis(protocol::retry::MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(n-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Authorization scheme; `Bearer` when unset
    pub token_type: Option<String>,
    pub user_agent: String,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            token_type: None,
            user_agent: protocol::user_agent(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, token_type: Option<String>) -> Self {
        self.token = Some(token.into());
        self.token_type = token_type;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    authorization: Option<String>,
    retry: RetryPolicy,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SyncError::Config("base URL is not configured".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, reqwest::header::HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let authorization = config.token.filter(|t| !t.is_empty()).map(|token| {
            let scheme = config
                .token_type
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "Bearer".to_string());
            format!("{} {}", scheme.trim(), token)
        });

        Ok(Self {
            http,
            base_url,
            authorization,
            retry: config.retry,
        })
    }

    /// Absolute URLs pass through; anything else is joined to the base URL
    pub fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.http.request(method, self.resolve_url(url));
        match &self.authorization {
            Some(value) => req.header(AUTHORIZATION, value),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<RawResponse> {
        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.bytes().await?.to_vec();
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    pub async fn handshake(&self, request: &HandshakeRequest<'_>) -> Result<Handshake> {
        let raw = self
            .send(self.request(Method::POST, endpoints::HANDSHAKE).json(request))
            .await?;
        let resp: HandshakeResponse = raw
            .into_json()?
            .ok_or_else(|| SyncError::Protocol("empty handshake response".into()))?;
        let snapshot_id = resp
            .snapshot_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Protocol("handshake response has no snapshotId".into()))?;
        Ok(Handshake {
            snapshot_id,
            missing_blobs: resp.missing_blobs,
            upload: resp.upload,
        })
    }

    /// Register one blob, retrying transient failures
    pub async fn upload_blob(&self, url: &str, request: &BlobUploadRequest) -> Result<BlobUploadResponse> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.upload_blob_once(url, request).await {
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    if attempt >= self.retry.max_attempts.max(1) || !err.is_transient() {
                        return Err(err);
                    }
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.retry.backoff(attempt));
                    tracing::warn!(
                        blob = %request.sha256,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "blob upload failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn upload_blob_once(&self, url: &str, request: &BlobUploadRequest) -> Result<BlobUploadResponse> {
        let raw = self.send(self.request(Method::POST, url).json(request)).await?;
        Ok(raw.into_json()?.unwrap_or_default())
    }

    /// Finalize a snapshot; 409 means the server still lacks blobs
    pub async fn complete(&self, snapshot_id: &str) -> Result<CompleteResponse> {
        let raw = self
            .send(
                self.request(Method::POST, endpoints::COMPLETE)
                    .json(&CompleteRequest { snapshot_id }),
            )
            .await?;

        if raw.status == StatusCode::CONFLICT {
            let body: CompleteResponse = serde_json::from_slice(&raw.body).unwrap_or_default();
            return Err(SyncError::MissingBlobs {
                snapshot_id: snapshot_id.to_string(),
                missing: body.missing_blobs,
            });
        }

        let resp: CompleteResponse = raw.into_json()?.unwrap_or_default();
        if !resp.missing_blobs.is_empty() {
            return Err(SyncError::MissingBlobs {
                snapshot_id: snapshot_id.to_string(),
                missing: resp.missing_blobs,
            });
        }
        Ok(resp)
    }

    /// Authenticated GET; `None` for an empty 2xx body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<T>> {
        let raw = self
            .send(self.request(Method::GET, path).query(query))
            .await?;
        raw.into_json()
    }
}

#[async_trait]
impl BlobSink for SyncClient {
    async fn put_blob(&self, url: &str, request: BlobUploadRequest) -> Result<()> {
        self.upload_blob(url, &request).await.map(|_| ())
    }
}

struct RawResponse {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: Vec<u8>,
}

impl RawResponse {
    fn into_json<T: DeserializeOwned>(self) -> Result<Option<T>> {
        let status = self.status.as_u16();
        let value: Option<Value> = if self.body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            serde_json::from_slice(&self.body).ok()
        };

        if status >= 400 {
            let message = value
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| fallback_message(self.status, &self.body));
            return Err(ApiError {
                status,
                message,
                retry_after: self.retry_after,
            }
            .into());
        }

        match value {
            None if self.body.iter().all(u8::is_ascii_whitespace) => Ok(None),
            None => Err(SyncError::Protocol(format!(
                "HTTP {} response is not JSON: {}",
                status,
                String::from_utf8_lossy(&self.body).chars().take(200).collect::<String>()
            ))),
            Some(v) => {
                if let Some(msg) = v.get("error").and_then(message_of) {
                    return Err(ApiError::new(status, msg).into());
                }
                Ok(Some(serde_json::from_value(v)?))
            }
        }
    }
}

fn message_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(o) => o.get("message").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn error_message(v: &Value) -> Option<String> {
    v.get("error")
        .and_then(message_of)
        .or_else(|| v.get("message").and_then(message_of))
}

fn fallback_message(status: StatusCode, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        text.chars().take(500).collect()
    }
}

/// `Retry-After` as delta-seconds or an HTTP date, capped at
/// `retry::MAX_RETRY_AFTER_SECS`
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let wait = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
            (at.with_timezone(&chrono::Utc) - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        }
    };
    Some(wait.min(Duration::from_secs(protocol::retry::MAX_RETRY_AFTER_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SyncClient {
        let mut cfg = ClientConfig::new(server.uri()).with_token("tok", None);
        cfg.retry = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        SyncClient::new(cfg).unwrap()
    }

    fn blob() -> BlobUploadRequest {
        BlobUploadRequest {
            snapshot_id: "snap".into(),
            sha256: "h".into(),
            size_bytes: 1,
            content_base64: "YQ==".into(),
            content_type: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(300));
        assert_eq!(p.backoff(30), Duration::from_millis(300));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&h), Some(Duration::from_secs(3)));
        h.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&h), Some(Duration::ZERO));
        h.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&h), None);
        h.insert(RETRY_AFTER, HeaderValue::from_static("86400"));
        assert_eq!(
            parse_retry_after(&h),
            Some(Duration::from_secs(protocol::retry::MAX_RETRY_AFTER_SECS))
        );
    }

    #[test]
    fn test_resolve_url() {
        let c = SyncClient::new(ClientConfig::new("https://sync.example.com/")).unwrap();
        assert_eq!(c.resolve_url("/api/x"), "https://sync.example.com/api/x");
        assert_eq!(c.resolve_url("api/x"), "https://sync.example.com/api/x");
        assert_eq!(c.resolve_url("https://cdn.example.com/u"), "https://cdn.example.com/u");
    }

    #[tokio::test]
    async fn test_handshake_sends_auth_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(endpoints::HANDSHAKE))
            .and(header("authorization", "Bearer tok"))
            .and(header("user-agent", protocol::user_agent().as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "snapshotId": "snap-1",
                "missingBlobs": ["abc"],
                "upload": {"mode": "direct", "url": "/api/cli/upload/blob"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manifest = crate::manifest::Manifest::from_entries(vec![]).unwrap();
        let req = HandshakeRequest {
            project_id: Some("p"),
            project_slug: None,
            project_name: None,
            base_snapshot_id: None,
            idempotency_key: None,
            manifest: (&manifest).into(),
        };
        let hs = client(&server).handshake(&req).await.unwrap();
        assert_eq!(hs.snapshot_id, "snap-1");
        assert_eq!(hs.missing_blobs, vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn test_handshake_without_snapshot_id_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(endpoints::HANDSHAKE))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"missingBlobs": []})))
            .mount(&server)
            .await;
        let manifest = crate::manifest::Manifest::from_entries(vec![]).unwrap();
        let req = HandshakeRequest {
            project_id: Some("p"),
            project_slug: None,
            project_name: None,
            base_snapshot_id: None,
            idempotency_key: None,
            manifest: (&manifest).into(),
        };
        let err = client(&server).handshake(&req).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_blob_upload_error_field_fails_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"error": "quota"})))
            .expect(1)
            .mount(&server)
            .await;
        let err = client(&server).upload_blob("/blob", &blob()).await.unwrap_err();
        match err {
            SyncError::Api(e) => assert_eq!(e.message, "quota"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blob_upload_empty_body_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        client(&server).upload_blob("/blob", &blob()).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "expired"})))
            .expect(1)
            .mount(&server)
            .await;
        let err = client(&server).upload_blob("/blob", &blob()).await.unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("login"));
    }

    #[tokio::test]
    async fn test_retry_after_ignored_on_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "3"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let started = std::time::Instant::now();
        client(&server).upload_blob("/blob", &blob()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_returns_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/blob"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(4)
            .mount(&server)
            .await;
        let err = client(&server).upload_blob("/blob", &blob()).await.unwrap_err();
        match err {
            SyncError::Api(e) => {
                assert_eq!(e.status, 503);
                assert_eq!(e.message, "overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_conflict_surfaces_missing_blobs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(endpoints::COMPLETE))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "status": "incomplete",
                "missingBlobs": ["h1", "h2"]
            })))
            .mount(&server)
            .await;
        match client(&server).complete("snap").await.unwrap_err() {
            SyncError::MissingBlobs { snapshot_id, missing } => {
                assert_eq!(snapshot_id, "snap");
                assert_eq!(missing, vec!["h1".to_string(), "h2".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_other_status_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(endpoints::COMPLETE))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({"message": "bad snapshot"})))
            .mount(&server)
            .await;
        match client(&server).complete("snap").await.unwrap_err() {
            SyncError::Api(e) => {
                assert_eq!(e.status, 422);
                assert_eq!(e.message, "bad snapshot");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
