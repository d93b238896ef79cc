//! HTTP client for a running proxy's control surface.

use std::time::Duration;

use codescout_types::wire::{
    ErrorBody, ReadinessResponse, ReferenceSearchRequest, ReferenceSearchResponse,
    StatusResponse, SymbolSearchRequest, SymbolSearchResponse,
};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// Symbol fan-out may wait on server handshakes, so this stays generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_BODY_CHARS: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("proxy unreachable: {0}")]
    Transport(#[source] reqwest::Error),
    /// The proxy rejected the request (4xx).
    #[error("request rejected ({status}): {message}")]
    Client { status: StatusCode, message: String },
    /// The proxy failed to serve the request (5xx).
    #[error("proxy error ({status}): {message}")]
    Server { status: StatusCode, message: String },
    #[error("malformed proxy response: {0}")]
    Decode(#[source] reqwest::Error),
    #[error("invalid proxy url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ClientError {
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when no proxy answered at all.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    base: Url,
}

impl ProxyClient {
    /// Client for a proxy on loopback at `port`.
    pub fn new(port: u16) -> Result<Self, ClientError> {
        let base = Url::parse(&format!("http://127.0.0.1:{port}/"))?;
        Self::with_base_url(base)
    }

    pub fn with_base_url(base: Url) -> Result<Self, ClientError> {
        Self::with_timeout(base, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(mut base: Url, timeout: Duration) -> Result<Self, ClientError> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ClientError::Transport)?;
        Ok(Self { http, base })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub async fn health(&self) -> Result<ReadinessResponse, ClientError> {
        let url = self.base.join("health")?;
        self.send(self.http.get(url)).await
    }

    pub async fn symbols(
        &self,
        request: &SymbolSearchRequest,
    ) -> Result<SymbolSearchResponse, ClientError> {
        self.post("symbols", request).await
    }

    pub async fn references(
        &self,
        request: &ReferenceSearchRequest,
    ) -> Result<ReferenceSearchResponse, ClientError> {
        self.post("references", request).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let url = self.base.join("status")?;
        self.send(self.http.get(url)).await
    }

    /// Asks the proxy to stop. Returns once the proxy has accepted the request.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let url = self.base.join("shutdown")?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        check_status(response).await.map(drop)
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base.join(endpoint)?;
        self.send(self.http.post(url).json(body)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        let response = request.send().await.map_err(ClientError::Transport)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(ClientError::Decode)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = error_message(status, &text);
    tracing::debug!(%status, %message, "proxy returned an error");
    if status.is_client_error() {
        Err(ClientError::Client { status, message })
    } else {
        Err(ClientError::Server { status, message })
    }
}

/// Prefers the structured `{error: {message}}` body, else the raw text.
fn error_message(status: StatusCode, text: &str) -> String {
    if let Ok(body) = serde_json::from_str::<ErrorBody>(text) {
        return body.error.message;
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string();
    }
    trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    use codescout_types::{EcosystemId, Position, ResultSource, SessionState};
    use codescout_types::wire::{EcosystemOutcome, EcosystemStatus};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ProxyClient {
        ProxyClient::with_base_url(Url::parse(&server.uri()).unwrap()).unwrap()
    }

    #[test]
    fn new_targets_loopback() {
        let client = ProxyClient::new(7411).unwrap();
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:7411/");
    }

    #[test]
    fn base_path_gets_trailing_slash() {
        let client =
            ProxyClient::with_base_url(Url::parse("http://127.0.0.1:9/proxy").unwrap()).unwrap();
        assert_eq!(
            client.base_url().join("health").unwrap().as_str(),
            "http://127.0.0.1:9/proxy/health"
        );
    }

    #[tokio::test]
    async fn health_decodes_readiness() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ready": true,
                "workspace": "/w",
                "available": ["python", "rust"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let health = client_for(&server).await.health().await.unwrap();
        assert!(health.ready);
        assert_eq!(health.workspace, "/w");
        assert_eq!(health.available.len(), 2);
    }

    #[tokio::test]
    async fn symbols_posts_camel_case_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/symbols"))
            .and(body_json(json!({ "query": "Parser", "ecosystems": ["rust"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "query": "Parser",
                "ecosystems": [{
                    "ecosystem": "rust",
                    "status": "ok",
                    "source": { "kind": "semantic" },
                    "count": 0
                }],
                "total": 0,
                "symbols": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client_for(&server)
            .await
            .symbols(&SymbolSearchRequest {
                query: "Parser".to_string(),
                ecosystems: vec!["rust".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(
            response.ecosystems,
            vec![EcosystemOutcome::ok(
                EcosystemId::new("rust").unwrap(),
                ResultSource::Semantic,
                0
            )]
        );
    }

    #[tokio::test]
    async fn client_error_carries_structured_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/references"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": 400, "message": "no ecosystem handles notes.txt" }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .references(&ReferenceSearchRequest {
                document: "notes.txt".to_string(),
                position: Position::new(0, 0),
                include_declaration: false,
            })
            .await
            .unwrap_err();
        match err {
            ClientError::Client { status, message } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "no ecosystem handles notes.txt");
            }
            other => panic!("expected Client, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_falls_back_to_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(503).set_body_string("  overloaded \n"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.status().await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(matches!(err, ClientError::Server { ref message, .. } if message == "overloaded"));
    }

    #[tokio::test]
    async fn empty_error_body_uses_reason_phrase() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server).await.status().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Server { ref message, .. } if message == "Internal Server Error")
        );
    }

    #[tokio::test]
    async fn status_decodes_per_ecosystem_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "available": ["rust"],
                "perEcosystem": {
                    "rust": { "state": "degraded", "restarts": 2, "lastHealthCheck": null }
                }
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).await.status().await.unwrap();
        let rust = &status.per_ecosystem[&EcosystemId::new("rust").unwrap()];
        assert_eq!(
            rust,
            &EcosystemStatus {
                state: SessionState::Degraded,
                restarts: 2,
                consecutive_failures: 0,
                last_health_check: None,
            }
        );
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.health().await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[tokio::test]
    async fn shutdown_accepts_202() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shutdown"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).await.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ProxyClient::new(port).unwrap().health().await.unwrap_err();
        assert!(err.is_unreachable(), "{err:?}");
    }
}
