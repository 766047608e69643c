//! Credential Fetching
//!
//! Obtains a short-lived session credential from the token service. Each call
//! performs exactly one request; retries and caching are deliberately left to
//! the caller.

use crate::{error::SessionError, types::SessionCredential};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Anything that can produce a fresh `SessionCredential`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self) -> Result<SessionCredential, SessionError>;
}

/// Request body of the token endpoint.
#[derive(Serialize, Debug, Clone)]
pub struct TokenRequest {
    pub room_name: String,
    pub participant_name: String,
    pub metadata: Option<String>,
}

/// Successful response of the token endpoint.
#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub token: String,
    pub url: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub participant_name: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Fetches credentials from `POST {base_url}/api/generate-token`.
pub struct HttpCredentialFetcher {
    client: reqwest::Client,
    endpoint: String,
    request: TokenRequest,
}

impl HttpCredentialFetcher {
    /// Creates a fetcher for one participant identity in one room.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the token service, e.g. `http://localhost:8000`.
    /// * `room_name` - Room requested from the token service.
    /// * `participant_name` - Identity the credential is issued for.
    pub fn new(
        base_url: &str,
        room_name: impl Into<String>,
        participant_name: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/generate-token", base_url.trim_end_matches('/')),
            request: TokenRequest {
                room_name: room_name.into(),
                participant_name: participant_name.into(),
                metadata: None,
            },
        }
    }

    pub fn with_metadata(mut self, metadata: Option<String>) -> Self {
        self.request.metadata = metadata;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    #[instrument(name = "credential_fetch", skip_all, fields(room = %self.request.room_name))]
    async fn fetch(&self) -> Result<SessionCredential, SessionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request)
            .send()
            .await
            .map_err(|e| SessionError::Credential(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(ErrorBody {
                    detail: serde_json::Value::String(text),
                }) => text,
                Ok(ErrorBody { detail }) => detail.to_string(),
                Err(_) if body.trim().is_empty() => "no details".to_string(),
                Err(_) => body.trim().to_string(),
            };
            return Err(SessionError::Credential(format!(
                "token service returned {}: {}",
                status, detail
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Credential(format!("malformed token response: {}", e)))?;
        if payload.token.trim().is_empty() || payload.url.trim().is_empty() {
            return Err(SessionError::Credential(
                "malformed token response: empty token or url".to_string(),
            ));
        }

        debug!(
            issued_room = ?payload.room_name,
            identity = ?payload.participant_name,
            "Session credential issued"
        );
        Ok(SessionCredential::new(payload.token, payload.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use secrecy::ExposeSecret;
    use serde_json::{Value, json};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn issue_token(
        State(calls): State<Arc<AtomicUsize>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        let participant = body["participant_name"].as_str().unwrap_or_default();
        Json(json!({
            "token": format!("jwt-{}", n),
            "url": "ws://127.0.0.1:7880",
            "room_name": format!("room-{}", participant),
            "participant_name": participant,
        }))
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/generate-token", post(issue_token))
            .with_state(calls.clone());
        let base = serve(app).await;

        let fetcher = HttpCredentialFetcher::new(&format!("{}/", base), "voice-room", "user-1");
        assert_eq!(fetcher.endpoint(), format!("{}/api/generate-token", base));

        let credential = fetcher.fetch().await.expect("credential should be issued");
        assert_eq!(credential.token.expose_secret(), "jwt-0");
        assert_eq!(credential.transport_url, "ws://127.0.0.1:7880");
    }

    #[tokio::test]
    async fn test_fetch_never_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/api/generate-token", post(issue_token))
            .with_state(calls.clone());
        let base = serve(app).await;
        let fetcher = HttpCredentialFetcher::new(&base, "voice-room", "user-1");

        let first = fetcher.fetch().await.unwrap();
        let second = fetcher.fetch().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_ne!(first.token.expose_secret(), second.token.expose_secret());
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let app = Router::new().route(
            "/api/generate-token",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Token generation failed: keys not set" })),
                )
            }),
        );
        let base = serve(app).await;

        let err = HttpCredentialFetcher::new(&base, "voice-room", "user-1")
            .fetch()
            .await
            .unwrap_err();
        match err {
            SessionError::Credential(msg) => {
                assert!(msg.contains("500"));
                assert!(msg.contains("keys not set"));
            }
            other => panic!("Expected Credential error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_malformed_payload() {
        let app = Router::new().route(
            "/api/generate-token",
            post(|| async { Json(json!({ "token": "abc" })) }),
        );
        let base = serve(app).await;

        let err = HttpCredentialFetcher::new(&base, "voice-room", "user-1")
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Credential(ref m) if m.contains("malformed")));

        let app = Router::new().route(
            "/api/generate-token",
            post(|| async { Json(json!({ "token": " ", "url": "ws://x" })) }),
        );
        let base = serve(app).await;
        let err = HttpCredentialFetcher::new(&base, "voice-room", "user-1")
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Credential(_)));
    }

    #[tokio::test]
    async fn test_fetch_network_failure() {
        // Bind and immediately drop a listener to get a port nobody serves.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpCredentialFetcher::new(&format!("http://{}", addr), "voice-room", "user-1")
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Credential(ref m) if m.contains("token request failed")));
    }

    #[tokio::test]
    async fn test_request_body_shape() {
        let app = Router::new().route(
            "/api/generate-token",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["room_name"], "voice-room");
                assert_eq!(body["participant_name"], "user-7");
                assert_eq!(body["metadata"], "{\"role\":\"customer\"}");
                Json(json!({ "token": "t", "url": "ws://room" }))
            }),
        );
        let base = serve(app).await;

        let credential = HttpCredentialFetcher::new(&base, "voice-room", "user-7")
            .with_metadata(Some("{\"role\":\"customer\"}".to_string()))
            .fetch()
            .await
            .unwrap();
        assert_eq!(credential.transport_url, "ws://room");
    }
}
