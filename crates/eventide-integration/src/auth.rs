//! OAuth2 client-credentials tokens with a caller-owned cache.
//!
//! [`TokenCache`] holds one token per client label until its TTL runs out.
//! The TTL is fixed rather than taken from `expires_in`, and the cache only
//! exists where a caller creates one.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use eventide_core::{Clock, Error, RealClock, Result};
use eventide_store::Config;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Lifetime of a cached token unless configured otherwise.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Credentials for one OAuth2 client.
#[derive(Clone)]
pub struct ClientCredentials {
    /// Cache key and log label, e.g. `"nrc"`.
    pub label: String,
    /// Token endpoint.
    pub token_url: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("label", &self.label)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

impl ClientCredentials {
    /// Creates credentials for the client `label`.
    pub fn new(
        label: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Reads the token URL, client id and secret from the named
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first variable that is unset
    /// or empty.
    pub fn from_env(
        label: impl Into<String>,
        token_url_var: &str,
        client_id_var: &str,
        client_secret_var: &str,
    ) -> Result<Self> {
        let read = |name: &str| match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::validation(format!("{name} environment variable is not set"))),
        };

        Ok(Self::new(label, read(token_url_var)?, read(client_id_var)?, read(client_secret_var)?))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Tokens by client label, each valid for a fixed TTL.
#[derive(Debug)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

impl TokenCache {
    /// Creates an empty cache using the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(RealClock::new()))
    }

    /// Creates an empty cache whose TTL comes from `TOKEN_CACHE_TTL_SECONDS`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.token_cache_ttl())
    }

    /// Creates an empty cache that reads time from `clock`.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, clock }
    }

    /// Lifetime given to stored tokens.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the token for `label` if present and unexpired.
    pub async fn get(&self, label: &str) -> Option<String> {
        let now = self.clock.now_utc();
        let entries = self.entries.lock().await;
        entries.get(label).filter(|entry| now < entry.expires_at).map(|entry| entry.token.clone())
    }

    /// Stores `token` for `label` and returns when it expires.
    pub async fn insert(&self, label: &str, token: impl Into<String>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at =
            self.clock.now_utc().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .lock()
            .await
            .insert(label.to_string(), CachedToken { token: token.into(), expires_at });
        expires_at
    }

    /// Forgets the token for `label`, e.g. after the API rejected it.
    pub async fn invalidate(&self, label: &str) {
        self.entries.lock().await.remove(label);
    }

    /// Forgets all tokens.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Fetches client-credentials tokens through a [`TokenCache`].
#[derive(Debug, Clone)]
pub struct TokenProvider {
    client: reqwest::Client,
    timeout: Duration,
}

impl TokenProvider {
    /// Creates a provider whose token requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::validation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }

    /// Returns a valid token for `credentials`, fetching a new one when the
    /// cache has none.
    ///
    /// # Errors
    ///
    /// - `Timeout` or `Transport` if the token request fails or returns a
    ///   non-2xx status
    /// - `MalformedResponse` if the response has no `access_token`
    pub async fn token(
        &self,
        cache: &TokenCache,
        credentials: &ClientCredentials,
    ) -> Result<String> {
        if let Some(token) = cache.get(&credentials.label).await {
            tracing::debug!(client = %credentials.label, "Using cached auth token");
            return Ok(token);
        }

        let span = info_span!(
            "token_request",
            client = %credentials.label,
            request_id = %Uuid::new_v4(),
            url = %credentials.token_url
        );
        async move {
            tracing::info!("Fetching new auth token using client credentials flow");

            let token = self.fetch(credentials).await?;
            let expires_at = cache.insert(&credentials.label, token.clone()).await;

            tracing::info!(%expires_at, "Obtained auth token");
            Ok(token)
        }
        .instrument(span)
        .await
    }

    async fn fetch(&self, credentials: &ClientCredentials) -> Result<String> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&credentials.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                response = %body,
                "Auth token request failed"
            );
            return Err(Error::http_status(
                status.as_u16(),
                format!(
                    "Auth token request for {} client failed with HTTP {}: {body}",
                    credentials.label,
                    status.as_u16()
                ),
            ));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::malformed(format!("invalid token response body: {e}")))?;

        body.access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::malformed("No access_token found in token response"))
    }

    fn request_error(&self, err: &reqwest::Error) -> Error {
        if err.is_timeout() {
            return Error::timeout(self.timeout.as_secs());
        }
        Error::transport(format!("Failed to get auth token: {err}"))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;
    use eventide_core::TestClock;

    use super::*;

    fn clock() -> Arc<TestClock> {
        Arc::new(TestClock::with_start_time(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()))
    }

    #[test]
    fn configured_ttl_is_used() {
        let config = Config { token_cache_ttl_seconds: 120, ..Config::default() };

        assert_eq!(TokenCache::from_config(&config).ttl(), Duration::from_secs(120));
        assert_eq!(TokenCache::from_config(&Config::default()).ttl(), DEFAULT_TOKEN_TTL);
    }

    #[tokio::test]
    async fn token_expires_after_ttl() {
        let clock = clock();
        let cache = TokenCache::with_clock(Duration::from_secs(60), clock.clone());

        let expires_at = cache.insert("nrc", "t-1").await;
        assert_eq!(expires_at, clock.now_utc() + chrono::Duration::seconds(60));

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("nrc").await.as_deref(), Some("t-1"));

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("nrc").await.is_none());
    }

    #[tokio::test]
    async fn labels_are_cached_separately() {
        let cache = TokenCache::with_clock(DEFAULT_TOKEN_TTL, clock());

        cache.insert("nrc", "a").await;
        cache.insert("kept", "b").await;
        cache.invalidate("nrc").await;

        assert!(cache.get("nrc").await.is_none());
        assert_eq!(cache.get("kept").await.as_deref(), Some("b"));

        cache.clear().await;
        assert!(cache.get("kept").await.is_none());
    }

    #[test]
    fn missing_env_var_is_named() {
        let err = ClientCredentials::from_env(
            "nrc",
            "EVENTIDE_TEST_UNSET_TOKEN_URL",
            "EVENTIDE_TEST_UNSET_CLIENT_ID",
            "EVENTIDE_TEST_UNSET_CLIENT_SECRET",
        )
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "validation failed: EVENTIDE_TEST_UNSET_TOKEN_URL environment variable is not set"
        );
    }

    #[test]
    fn debug_output_masks_secret() {
        let credentials = ClientCredentials::new("nrc", "http://auth", "id", "s3cret");
        assert!(!format!("{credentials:?}").contains("s3cret"));
    }
}
