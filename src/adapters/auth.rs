//! Bearer-token authentication.
//!
//! [`AuthClient`] owns the token pair, persists it to a JSON file and
//! refreshes it shortly before expiry. It implements [`CredentialProvider`]
//! so the upload queue never sees refresh tokens or expiry bookkeeping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::CredentialProvider;

/// Server path for credential login
pub const LOGIN_PATH: &str = "/api/v1/auth/login";

/// Server path for token refresh
pub const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Errors from login, refresh or token persistence
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Server rejected credentials ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed auth response: {0}")]
    Malformed(String),

    #[error("Token file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted token pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub access_token: String,

    pub refresh_token: String,

    /// Absolute expiry of the access token
    pub expires_at: DateTime<Utc>,
}

impl AuthTokens {
    /// True when the access token expires within `threshold` of `now`
    pub fn needs_refresh(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match (self.expires_at - now).to_std() {
            Ok(remaining) => remaining < threshold,
            Err(_) => true,
        }
    }
}

/// Authenticated account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
}

/// Login request body
#[derive(Debug, Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

/// Token grant returned by login and refresh
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,

    /// Lifetime of the access token in seconds
    pub expires_in: i64,

    #[serde(default)]
    pub user: Option<User>,
}

impl TokenGrant {
    fn into_tokens(self, now: DateTime<Utc>) -> Result<(AuthTokens, Option<User>), AuthError> {
        let expires_at = chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::Malformed(format!("expires_in out of range: {}", self.expires_in))
            })?;

        let tokens = AuthTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        };
        Ok((tokens, self.user))
    }
}

/// Token endpoints of the API
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, credentials: &LoginCredentials) -> Result<TokenGrant, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

/// [`AuthApi`] over HTTP
pub struct HttpAuthApi {
    /// API base URL
    base_url: String,
    /// HTTP client
    client: reqwest::Client,
}

impl HttpAuthApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post_for_grant<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<TokenGrant, AuthError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| "Login failed".to_string());
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &LoginCredentials) -> Result<TokenGrant, AuthError> {
        self.post_for_grant(LOGIN_PATH, credentials).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.post_for_grant(
            REFRESH_PATH,
            &serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }
}

/// JSON file holding the current token pair
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load tokens; `None` when no file exists
    pub async fn load(&self) -> Result<Option<AuthTokens>, AuthError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, tokens: &AuthTokens) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(tokens)?;
        tokio::fs::write(&self.path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        Ok(())
    }

    pub async fn clear(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Token owner and refresher.
///
/// The token slot is guarded by an async mutex that stays locked for the
/// whole refresh, so concurrent callers wait for the in-flight refresh and
/// then read its result instead of starting their own.
pub struct AuthClient {
    api: Arc<dyn AuthApi>,
    store: FileTokenStore,
    refresh_threshold: Duration,
    tokens: Mutex<Option<AuthTokens>>,
}

impl AuthClient {
    pub fn new(api: Arc<dyn AuthApi>, store: FileTokenStore, refresh_threshold: Duration) -> Self {
        Self {
            api,
            store,
            refresh_threshold,
            tokens: Mutex::new(None),
        }
    }

    /// Load persisted tokens. Returns whether a session was restored.
    ///
    /// An unreadable token file is treated as logged out.
    pub async fn initialize(&self) -> bool {
        let loaded = match self.store.load().await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(path = %self.store.path().display(), error = %e, "Ignoring unreadable token file");
                None
            }
        };

        let restored = loaded.is_some();
        *self.tokens.lock().await = loaded;
        restored
    }

    pub async fn login(&self, credentials: &LoginCredentials) -> Result<User, AuthError> {
        let grant = self.api.login(credentials).await?;
        let (tokens, user) = grant.into_tokens(Utc::now())?;
        let user = user.ok_or_else(|| AuthError::Malformed("missing user".to_string()))?;

        self.store.save(&tokens).await?;
        *self.tokens.lock().await = Some(tokens);

        info!(user_id = %user.id, "Logged in");
        Ok(user)
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        *self.tokens.lock().await = None;
        self.store.clear().await?;
        info!("Logged out");
        Ok(())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.lock().await.is_some()
    }

    /// Current token pair, if any
    pub async fn tokens(&self) -> Option<AuthTokens> {
        self.tokens.lock().await.clone()
    }
}

#[async_trait]
impl CredentialProvider for AuthClient {
    async fn access_token(&self) -> Option<String> {
        let mut slot = self.tokens.lock().await;
        let current = slot.as_ref()?;

        if !current.needs_refresh(self.refresh_threshold, Utc::now()) {
            return Some(current.access_token.clone());
        }

        debug!("Access token near expiry, refreshing");
        let refresh_token = current.refresh_token.clone();
        let refreshed = self
            .api
            .refresh(&refresh_token)
            .await
            .and_then(|grant| grant.into_tokens(Utc::now()));
        match refreshed {
            Ok((tokens, _)) => {
                if let Err(e) = self.store.save(&tokens).await {
                    warn!(error = %e, "Failed to persist refreshed tokens");
                }
                let access_token = tokens.access_token.clone();
                *slot = Some(tokens);
                Some(access_token)
            }
            Err(AuthError::Rejected { status, .. }) => {
                warn!(status, "Refresh rejected, logging out");
                *slot = None;
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "Failed to remove token file");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                None
            }
        }
    }
}
