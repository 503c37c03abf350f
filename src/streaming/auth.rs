//! Credentials for the speech service
//!
//! Two providers:
//! - [`SubscriptionKeyAuthentication`] sends the key itself on every connection
//! - [`TokenAuthentication`] exchanges the key for a short-lived bearer token at
//!   the region's `issueToken` endpoint and caches it until it expires or the
//!   service reports it as rejected

use async_trait::async_trait;
use reqwest::Client;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::StreamingError;

pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Tokens are valid for 10 minutes; refresh a little earlier
const TOKEN_LIFETIME: Duration = Duration::from_secs(9 * 60);

/// Timeout for the token request
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTP client for token requests
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Auth: failed to build HTTP client ({}), using defaults", e);
                Client::new()
            })
    })
}

/// Header to attach to the connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub header_name: String,
    pub token: String,
}

impl AuthInfo {
    pub fn new(header_name: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            token: token.into(),
        }
    }
}

/// Source of connection credentials
#[async_trait]
pub trait Authentication: Send + Sync {
    /// Current credentials; `auth_fetch_event_id` correlates the fetch in logs
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError>;

    /// Credentials after the service rejected the previous ones
    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError>;
}

// ============================================================================
// Subscription key
// ============================================================================

pub struct SubscriptionKeyAuthentication {
    key: String,
}

impl SubscriptionKeyAuthentication {
    pub fn new(key: impl Into<String>) -> Result<Self, StreamingError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(StreamingError::MissingCredentials);
        }
        Ok(Self { key })
    }
}

#[async_trait]
impl Authentication for SubscriptionKeyAuthentication {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        Ok(AuthInfo::new(SUBSCRIPTION_KEY_HEADER, self.key.clone()))
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        // A key does not expire
        self.fetch(auth_fetch_event_id).await
    }
}

// ============================================================================
// Bearer token
// ============================================================================

struct CachedToken {
    token: String,
    fetched_at: Instant,
}

pub struct TokenAuthentication {
    key: String,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenAuthentication {
    pub fn new(key: impl Into<String>, region: &str) -> Result<Self, StreamingError> {
        Self::with_token_url(
            key,
            format!(
                "https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken",
                region
            ),
        )
    }

    pub fn with_token_url(key: impl Into<String>, token_url: String) -> Result<Self, StreamingError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(StreamingError::MissingCredentials);
        }
        Ok(Self {
            key,
            token_url,
            cached: Mutex::new(None),
        })
    }

    async fn request_token(&self, auth_fetch_event_id: &str) -> Result<String, StreamingError> {
        log::info!(
            "Auth: requesting token from {} (fetch {})",
            self.token_url,
            auth_fetch_event_id
        );

        let response = get_http_client()
            .post(&self.token_url)
            .header(SUBSCRIPTION_KEY_HEADER, &self.key)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(StreamingError::AuthenticationFailed(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        Ok(body)
    }

    async fn token(&self, auth_fetch_event_id: &str, force: bool) -> Result<AuthInfo, StreamingError> {
        let mut cached = self.cached.lock().await;

        if !force {
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed() < TOKEN_LIFETIME {
                    return Ok(bearer(&entry.token));
                }
            }
        }

        let token = self.request_token(auth_fetch_event_id).await?;
        let info = bearer(&token);
        *cached = Some(CachedToken {
            token,
            fetched_at: Instant::now(),
        });
        Ok(info)
    }
}

fn bearer(token: &str) -> AuthInfo {
    AuthInfo::new(AUTHORIZATION_HEADER, format!("Bearer {}", token))
}

#[async_trait]
impl Authentication for TokenAuthentication {
    async fn fetch(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        self.token(auth_fetch_event_id, false).await
    }

    async fn fetch_on_expiry(&self, auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        self.token(auth_fetch_event_id, true).await
    }
}
