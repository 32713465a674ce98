//! Authentication-manager capability boundary.
//!
//! Concrete action components call an external system and need credentials
//! for it. The engine passes them an [`AuthManager`]; the reference
//! implementation here covers api-key, bearer, and basic strategies directly
//! and OAuth2 client-credentials through an injected token fetcher with a
//! concurrency-safe cache (tokens are reused until near expiry).
//! Provider-specific signing is likewise delegated to an injected signer.
//!
//! The manager is shared and read-mostly; all interior state is DashMap-backed
//! so concurrent in-flight steps can use it safely.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while assembling auth headers.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No strategy is registered for the requested system.
    #[error("unknown system: '{0}'")]
    UnknownSystem(String),

    /// The OAuth2 token fetcher failed or is missing.
    #[error("token fetch failed: {0}")]
    TokenFetch(String),

    /// The strategy needs a collaborator this manager was not given.
    #[error("unsupported auth strategy: {0}")]
    Unsupported(String),
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// How to authenticate against a named external system.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// A static key sent in a named header.
    ApiKey { header: String, key: String },
    /// A static bearer token.
    Bearer { token: String },
    /// HTTP basic credentials.
    Basic { username: String, password: String },
    /// OAuth2 client-credentials grant, cached until near expiry.
    OAuth2ClientCredentials(OAuth2Config),
    /// Provider-specific request signing, handled by an injected signer.
    ProviderSigned { provider: String },
}

/// Client-credentials grant configuration.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
}

/// An issued OAuth2 access token.
#[derive(Debug, Clone)]
pub struct OAuth2Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Fetches a fresh token for a client-credentials config. The HTTP exchange
/// lives outside the engine.
pub type TokenFetcher =
    Arc<dyn Fn(OAuth2Config) -> BoxFuture<'static, Result<OAuth2Token, AuthError>> + Send + Sync>;

/// Produces signed headers for a provider-specific scheme.
pub type RequestSigner = Arc<
    dyn Fn(String) -> BoxFuture<'static, Result<HashMap<String, String>, AuthError>> + Send + Sync,
>;

// ---------------------------------------------------------------------------
// AuthManager trait
// ---------------------------------------------------------------------------

/// Capability boundary consumed by action components.
///
/// Returns a boxed future so the trait stays object-safe and the scheduler
/// can hold `Arc<dyn AuthManager>`.
pub trait AuthManager: Send + Sync {
    /// Headers to attach when calling the named external system.
    fn auth_headers<'a>(
        &'a self,
        system: &'a str,
    ) -> BoxFuture<'a, Result<HashMap<String, String>, AuthError>>;
}

// ---------------------------------------------------------------------------
// StaticAuthManager
// ---------------------------------------------------------------------------

/// Tokens are refreshed when within this margin of expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Reference [`AuthManager`] backed by a static strategy table.
pub struct StaticAuthManager {
    strategies: DashMap<String, AuthStrategy>,
    token_cache: DashMap<String, OAuth2Token>,
    fetcher: Option<TokenFetcher>,
    signer: Option<RequestSigner>,
}

impl StaticAuthManager {
    pub fn new() -> Self {
        Self {
            strategies: DashMap::new(),
            token_cache: DashMap::new(),
            fetcher: None,
            signer: None,
        }
    }

    /// Register (or replace) the strategy for a system.
    pub fn register(&self, system: impl Into<String>, strategy: AuthStrategy) {
        self.strategies.insert(system.into(), strategy);
    }

    /// Attach the OAuth2 token fetcher.
    pub fn with_token_fetcher(mut self, fetcher: TokenFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Attach the provider-specific request signer.
    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    async fn oauth2_headers(
        &self,
        system: &str,
        config: OAuth2Config,
    ) -> Result<HashMap<String, String>, AuthError> {
        if let Some(token) = self.token_cache.get(system) {
            let remaining = token.expires_at - Utc::now();
            if remaining > Duration::seconds(EXPIRY_MARGIN_SECS) {
                return Ok(bearer(&token.access_token));
            }
        }

        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            AuthError::Unsupported(format!(
                "system '{system}' uses OAuth2 but no token fetcher is configured"
            ))
        })?;

        let token = fetcher(config).await?;
        let headers = bearer(&token.access_token);
        self.token_cache.insert(system.to_string(), token);
        tracing::debug!(system, "refreshed OAuth2 token");
        Ok(headers)
    }
}

impl Default for StaticAuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthManager for StaticAuthManager {
    fn auth_headers<'a>(
        &'a self,
        system: &'a str,
    ) -> BoxFuture<'a, Result<HashMap<String, String>, AuthError>> {
        Box::pin(async move {
            let strategy = self
                .strategies
                .get(system)
                .map(|s| s.clone())
                .ok_or_else(|| AuthError::UnknownSystem(system.to_string()))?;

            match strategy {
                AuthStrategy::ApiKey { header, key } => Ok(HashMap::from([(header, key)])),
                AuthStrategy::Bearer { token } => Ok(bearer(&token)),
                AuthStrategy::Basic { username, password } => {
                    let encoded = BASE64.encode(format!("{username}:{password}"));
                    Ok(HashMap::from([(
                        "Authorization".to_string(),
                        format!("Basic {encoded}"),
                    )]))
                }
                AuthStrategy::OAuth2ClientCredentials(config) => {
                    self.oauth2_headers(system, config).await
                }
                AuthStrategy::ProviderSigned { provider } => {
                    let signer = self.signer.as_ref().ok_or_else(|| {
                        AuthError::Unsupported(format!(
                            "system '{system}' uses provider signing but no signer is configured"
                        ))
                    })?;
                    signer(provider).await
                }
            }
        })
    }
}

fn bearer(token: &str) -> HashMap<String, String> {
    HashMap::from([("Authorization".to_string(), format!("Bearer {token}"))])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
