// Per-provider OAuth client-credentials tokens, refreshed ahead of expiry
//
// All lifetimes and buffers are in seconds.

use crate::cache::{Cache, CacheKey};
use crate::error::SearchError;
use crate::transport::HttpTransport;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_SAFETY_BUFFER_SECONDS: u64 = 300;

// Longer declared lifetimes are clamped
const MAX_LIFETIME_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ClientCredentials {
    fn validate(&self, provider: &str) -> Result<(), SearchError> {
        let missing: Vec<&str> = [
            ("token_url", &self.token_url),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SearchError::Configuration(format!(
                "{} is missing {}",
                provider,
                missing.join(", ")
            )))
        }
    }
}

#[derive(Clone, PartialEq, Serialize)]
pub struct AccessToken {
    pub provider: String,
    #[serde(skip_serializing)]
    pub value: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("provider", &self.provider)
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    // A token is usable only while now + buffer < expiry
    pub fn is_valid_at(&self, now: DateTime<Utc>, safety_buffer: Duration) -> bool {
        match chrono::Duration::from_std(safety_buffer) {
            Ok(buffer) => now + buffer < self.expires_at,
            Err(_) => false,
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

// Body of a client-credentials token response. Only access_token and expires_in are required.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<serde_json::Value>,
    token_type: Option<String>,
    scope: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

pub struct AccessTokenCache {
    cache: Arc<Cache>,
    transport: HttpTransport,
    credentials: DashMap<String, ClientCredentials>,
    safety_buffer: Duration,
}

impl fmt::Debug for AccessTokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenCache")
            .field("providers", &self.credentials.len())
            .field("safety_buffer", &self.safety_buffer)
            .finish()
    }
}

impl AccessTokenCache {
    pub fn new(cache: Arc<Cache>, transport: HttpTransport, safety_buffer: Duration) -> Self {
        Self {
            cache,
            transport,
            credentials: DashMap::new(),
            safety_buffer,
        }
    }

    pub fn register(&self, provider: &str, credentials: ClientCredentials) -> Result<(), SearchError> {
        credentials.validate(provider)?;
        debug!(provider, token_url = %credentials.token_url, "registered client credentials");
        self.credentials.insert(provider.to_string(), credentials);
        Ok(())
    }

    // Drops the cached token so the next call performs a fresh exchange
    pub fn invalidate(&self, provider: &str) {
        if self.cache.remove(&CacheKey::AccessToken(provider.to_string())) {
            info!(provider, "access token invalidated");
        }
    }

    pub async fn get_access_token(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<AccessToken>, SearchError> {
        let credentials = self
            .credentials
            .get(provider)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SearchError::Configuration(format!("no client credentials registered for {}", provider))
            })?;

        let key = CacheKey::AccessToken(provider.to_string());
        if let Some(token) = self.cache.get::<AccessToken>(&key) {
            if token.is_valid_at(Utc::now(), self.safety_buffer) {
                return Ok(token);
            }
            // Wall clock moved past the buffer before the cache TTL did
            self.cache.remove(&key);
        }

        let transport = self.transport.clone();
        let provider_name = provider.to_string();
        let safety_buffer = self.safety_buffer;
        let refresh = self.cache.get_or_create_with(key, move || {
            exchange_token(transport, provider_name, credentials, safety_buffer)
        });

        // A cancelled caller stops waiting; the spawned exchange still fills the cache
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SearchError::Cancelled),
            token = refresh => token,
        }
    }
}

async fn exchange_token(
    transport: HttpTransport,
    provider: String,
    credentials: ClientCredentials,
    safety_buffer: Duration,
) -> Result<(AccessToken, Duration), SearchError> {
    info!(provider = %provider, "requesting access token");

    let form = [
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("grant_type", "client_credentials"),
    ];
    let issued_at = Utc::now();
    let response: TokenResponse = transport
        .post_form(&credentials.token_url, &form, &CancellationToken::new())
        .await
        .map_err(|e| SearchError::Credential(format!("token exchange for {} failed: {}", provider, e)))?;

    let token = parse_token(&provider, response, issued_at, safety_buffer)?;
    let lifetime = (token.expires_at - token.issued_at).to_std().unwrap_or_default();
    let ttl = lifetime.saturating_sub(safety_buffer);
    info!(provider = %provider, ttl_secs = ttl.as_secs(), "access token acquired");
    Ok((token, ttl))
}

fn parse_token(
    provider: &str,
    response: TokenResponse,
    issued_at: DateTime<Utc>,
    safety_buffer: Duration,
) -> Result<AccessToken, SearchError> {
    let value = response
        .access_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| SearchError::Credential(format!("{} returned no access_token", provider)))?;

    // Some gateways send expires_in as a string
    let expires_in = response
        .expires_in
        .as_ref()
        .and_then(|raw| match raw {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .filter(|seconds| *seconds > 0)
        .ok_or_else(|| {
            SearchError::Credential(format!("{} returned no usable expires_in", provider))
        })?;

    if expires_in <= safety_buffer.as_secs() {
        return Err(SearchError::Credential(format!(
            "{} issued a token living {}s, not longer than the {}s safety buffer",
            provider,
            expires_in,
            safety_buffer.as_secs()
        )));
    }

    let lifetime = chrono::Duration::seconds(expires_in.min(MAX_LIFETIME_SECONDS) as i64);
    Ok(AccessToken {
        provider: provider.to_string(),
        value,
        token_type: response.token_type,
        scope: response.scope,
        issued_at,
        expires_at: issued_at + lifetime,
        extra: response.extra,
    })
}
