// Vendor adapters
//
// Each adapter turns UnifiedSearchParameters into its vendor's request, runs it through
// the shared transport and maps the body back into the unified model.

pub mod comparison;
pub mod gds;
pub mod metasearch;

use crate::error::{ProviderError, SearchError};
use crate::model::{UnifiedFlightSearchResponse, UnifiedSearchParameters};
use crate::token::AccessTokenCache;
use crate::transport::HttpTransport;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// No single itinerary legitimately lasts longer than this
const MAX_DECLARED_DURATION_SECONDS: i64 = 7 * 24 * 60 * 60;

pub use comparison::{ComparisonConfig, ComparisonProvider};
pub use gds::{GdsConfig, GdsProvider};
pub use metasearch::{MetasearchConfig, MetasearchProvider};

#[async_trait]
pub trait FlightProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn search_flights(
        &self,
        params: &UnifiedSearchParameters,
        cancel: &CancellationToken,
    ) -> Result<UnifiedFlightSearchResponse, ProviderError>;
}

pub(crate) fn comma_joined(codes: &BTreeSet<String>) -> Option<String> {
    if codes.is_empty() {
        None
    } else {
        Some(codes.iter().cloned().collect::<Vec<_>>().join(","))
    }
}

// Vendors send local times with or without seconds, fractions or an offset
pub(crate) fn parse_vendor_timestamp(value: &str) -> Result<NaiveDateTime, SearchError> {
    let value = value.trim();
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.naive_local())
        .map_err(|_| SearchError::Normalization(format!("unparsable timestamp '{}'", value)))
}

// Amounts arrive as JSON numbers or strings depending on the vendor
pub(crate) fn parse_amount(value: &serde_json::Value, field: &str) -> Result<Decimal, SearchError> {
    let parsed = match value {
        serde_json::Value::Number(number) => Decimal::from_str(&number.to_string())
            .or_else(|_| Decimal::from_scientific(&number.to_string())),
        serde_json::Value::String(text) => Decimal::from_str(text.trim()),
        _ => {
            return Err(SearchError::Normalization(format!(
                "{} is not an amount: {}",
                field, value
            )))
        }
    };

    let amount = parsed
        .map_err(|e| SearchError::Normalization(format!("{} '{}' is not a decimal: {}", field, value, e)))?;
    if amount.is_sign_negative() {
        return Err(SearchError::Normalization(format!("{} is negative: {}", field, amount)));
    }
    Ok(amount)
}

// A vendor-declared duration of `amount` units, each `unit_seconds` long
pub(crate) fn declared_duration(
    amount: i64,
    unit_seconds: i64,
    field: &str,
) -> Result<chrono::Duration, SearchError> {
    amount
        .checked_mul(unit_seconds)
        .filter(|seconds| (0..=MAX_DECLARED_DURATION_SECONDS).contains(seconds))
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| SearchError::Normalization(format!("{} is out of range: {}", field, amount)))
}

pub(crate) fn api_key_headers(header_name: &str, api_key: &str) -> Result<HeaderMap, SearchError> {
    let name = HeaderName::from_bytes(header_name.as_bytes())
        .map_err(|e| SearchError::Configuration(format!("invalid API key header '{}': {}", header_name, e)))?;
    let mut value = HeaderValue::from_str(api_key)
        .map_err(|e| SearchError::Configuration(format!("invalid API key: {}", e)))?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(name, value);
    Ok(headers)
}

// Shared path of the OAuth vendors: bearer from the token cache, and a 401 drops
// the cached token so the next search re-authenticates.
pub(crate) async fn authorized_get<T, Q>(
    tokens: &AccessTokenCache,
    transport: &HttpTransport,
    provider: &str,
    url: &str,
    query: &Q,
    cancel: &CancellationToken,
) -> Result<T, SearchError>
where
    T: DeserializeOwned,
    Q: Serialize + ?Sized,
{
    let token = tokens.get_access_token(provider, cancel).await?;
    let mut value = HeaderValue::from_str(&token.authorization_header())
        .map_err(|e| SearchError::Credential(format!("token is not a valid header value: {}", e)))?;
    value.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);

    let result = transport.get_json(url, query, headers, cancel).await;
    if let Err(error) = &result {
        if error.is_unauthorized() {
            warn!(provider, "vendor rejected the access token");
            tokens.invalidate(provider);
        }
    }
    result
}
