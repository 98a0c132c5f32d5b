//! Token-based authentication.
//!
//! Credentials come from one of four places, in order of preference: a
//! programmatic [`AuthCallback`], an `auth_url` endpoint, a literal token, or
//! the raw API key. Callback and endpoint sources are renewable: when the
//! service rejects a token as expired, the connection requests a fresh one
//! and retries once before giving up.

use crate::error::{MillraceError, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Freshness margin subtracted from a token's expiry before reuse.
const TOKEN_EXPIRY_MARGIN_MS: i64 = 5_000;

/// A token issued for this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    /// Expiry time, epoch milliseconds
    #[serde(default)]
    pub expires: Option<i64>,
    /// Client id the token was issued for
    #[serde(default)]
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires: None,
            client_id: None,
        }
    }

    /// Whether the token is still usable, with a small safety margin.
    pub fn is_valid(&self) -> bool {
        match self.expires {
            Some(expires) => expires - TOKEN_EXPIRY_MARGIN_MS > Utc::now().timestamp_millis(),
            None => true,
        }
    }
}

/// Function type backing a programmatic token source
pub type AuthCallbackFn = Arc<dyn Fn() -> BoxFuture<'static, Result<TokenDetails>> + Send + Sync>;

/// Programmatic token source supplied by the application.
#[derive(Clone)]
pub struct AuthCallback(AuthCallbackFn);

impl AuthCallback {
    pub fn new(
        callback: impl Fn() -> BoxFuture<'static, Result<TokenDetails>> + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(callback))
    }

    pub async fn fetch(&self) -> Result<TokenDetails> {
        (self.0)().await
    }
}

impl std::fmt::Debug for AuthCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthCallback")
    }
}

/// Resolves and renews the credential presented on each connection attempt.
pub struct Auth {
    key: Option<String>,
    literal_token: Option<String>,
    auth_url: Option<String>,
    auth_headers: HashMap<String, String>,
    auth_callback: Option<AuthCallback>,
    /// Most recently fetched token
    current_token: RwLock<Option<TokenDetails>>,
}

impl Auth {
    pub fn new(config: &crate::options::Config) -> Self {
        Self {
            key: config.key.clone(),
            literal_token: config.token.clone(),
            auth_url: config.auth_url.clone(),
            auth_headers: config.auth_headers.clone(),
            auth_callback: config.auth_callback.clone(),
            current_token: RwLock::new(None),
        }
    }

    /// Whether a fresh token can be obtained after a rejection.
    pub fn renewable(&self) -> bool {
        self.auth_callback.is_some() || self.auth_url.is_some()
    }

    /// The query parameter carrying our credential on the connection URL.
    pub async fn connect_param(&self) -> Result<(&'static str, String)> {
        if self.auth_callback.is_some() || self.auth_url.is_some() {
            let cached = self.current_token.read().clone();
            let details = match cached {
                Some(details) if details.is_valid() => details,
                _ => self.request_token().await?,
            };
            return Ok(("accessToken", details.token));
        }

        if let Some(ref token) = self.literal_token {
            return Ok(("accessToken", token.clone()));
        }

        if let Some(ref key) = self.key {
            return Ok(("key", key.clone()));
        }

        Err(MillraceError::config(
            "No credentials: set key, token, auth_url or auth_callback",
        ))
    }

    /// Fetch a fresh token from the configured source and cache it.
    pub async fn request_token(&self) -> Result<TokenDetails> {
        let details = if let Some(ref callback) = self.auth_callback {
            callback.fetch().await?
        } else if let Some(ref url) = self.auth_url {
            self.fetch_from_url(url).await?
        } else {
            return Err(MillraceError::auth(
                "Token renewal requires auth_url or auth_callback",
            ));
        };

        *self.current_token.write() = Some(details.clone());
        Ok(details)
    }

    /// POST to the auth endpoint and parse a [`TokenDetails`] response.
    async fn fetch_from_url(&self, url: &str) -> Result<TokenDetails> {
        let client = reqwest::Client::new();
        let mut request = client.post(url);

        for (key, value) in &self.auth_headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(MillraceError::auth(format!(
                "Token request failed with status: {}",
                response.status()
            )));
        }

        let details: TokenDetails = response
            .json()
            .await
            .map_err(|e| MillraceError::auth(format!("Failed to parse token response: {}", e)))?;

        Ok(details)
    }

    /// The cached token, if one has been fetched.
    pub fn current_token(&self) -> Option<TokenDetails> {
        self.current_token.read().clone()
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("key", &self.key.is_some())
            .field("auth_url", &self.auth_url)
            .field("renewable", &self.renewable())
            .finish()
    }
}
