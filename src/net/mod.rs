//! HTTP API client for the community backend
//!
//! Thin typed wrapper over reqwest:
//! - Bearer-token auth, settable at runtime
//! - Status codes mapped into a small error taxonomy with a retryability
//!   split (transport failures, 5xx and 429 are worth retrying; other 4xx
//!   are not)
//! - 409 responses carry the server's copy of the data for conflict review
//! - `execute` replays queued actions with arbitrary method and body

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::queue::HttpMethod;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: the server rejected the submission")]
    Conflict { body: serde_json::Value },

    #[error("Rate limited")]
    RateLimited,

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether retrying the same request later could succeed. Transport
    /// failures, rate limiting and server-side errors qualify; the other
    /// 4xx responses are deterministic rejections.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

// ============================================================================
// API Client
// ============================================================================

/// HTTP client bound to one backend base URL.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_token: Arc<RwLock<Option<String>>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        // Parse once for validation, then keep the normalized string form.
        let parsed = Url::parse(base_url).map_err(|e| ApiError::InvalidBaseUrl(e.to_string()))?;
        let base_url = parsed.as_str().trim_end_matches('/').to_string();

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            auth_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ========================================================================
    // Token Management
    // ========================================================================

    /// Set the bearer token attached to subsequent requests.
    pub async fn set_auth_token(&self, token: String) {
        *self.auth_token.write().await = Some(token);
        log::info!("API auth token set");
    }

    /// Drop the bearer token (logout).
    pub async fn clear_auth_token(&self) {
        *self.auth_token.write().await = None;
        log::info!("API auth token cleared");
    }

    pub async fn auth_token(&self) -> Option<String> {
        self.auth_token.read().await.clone()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// GET `path` and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(Method::GET, path).await.send().await?;
        Self::handle_response(response).await
    }

    /// GET `path` with query parameters and decode the JSON response.
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let response = self
            .request(Method::GET, path)
            .await
            .query(params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// POST `body` as JSON to `path` and decode the response.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::POST, path)
            .await
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// PUT `body` as JSON to `path` and decode the response.
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::PUT, path)
            .await
            .json(body)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// DELETE `path` and decode the response.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(Method::DELETE, path).await.send().await?;
        Self::handle_response(response).await
    }

    /// Issue a request with an arbitrary method and optional JSON body.
    /// This is the replay path for queued actions.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<serde_json::Value, ApiError> {
        let mut builder = self.request(method, path).await;
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        Self::handle_response(response).await
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, self.endpoint_url(path));
        if let Some(token) = self.auth_token.read().await.clone() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Paths keep their exact shape, trailing slash included; the backend
    /// treats `/members` and `/members/` as different routes.
    fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    // ========================================================================
    // Response Handling
    // ========================================================================

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_for(status, response).await);
        }

        let text = response.text().await?;
        if text.is_empty() {
            // 204 and friends: decode as JSON null.
            serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| ApiError::Decode(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
        }
    }

    async fn error_for(status: StatusCode, response: Response) -> ApiError {
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
            StatusCode::FORBIDDEN => ApiError::Forbidden,
            StatusCode::NOT_FOUND => {
                ApiError::NotFound(response.text().await.unwrap_or_default())
            }
            StatusCode::CONFLICT => {
                let body = response
                    .json::<serde_json::Value>()
                    .await
                    .unwrap_or(serde_json::Value::Null);
                ApiError::Conflict { body }
            }
            StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
            _ => ApiError::Status {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
