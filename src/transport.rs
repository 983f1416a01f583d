// HTTP transport shared by the token cache and all provider adapters

use crate::error::SearchError;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Longest slice of an error body carried into ProviderApi details
const MAX_ERROR_DETAIL_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, SearchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SearchError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub async fn get_json<T, Q>(
        &self,
        url: &str,
        query: &Q,
        headers: HeaderMap,
        cancel: &CancellationToken,
    ) -> Result<T, SearchError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let request = self.client.get(url).query(query).headers(headers);
        self.execute(request, cancel).await
    }

    pub async fn post_form<T, B>(
        &self,
        url: &str,
        form: &B,
        cancel: &CancellationToken,
    ) -> Result<T, SearchError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.client.post(url).form(form);
        self.execute(request, cancel).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, SearchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SearchError::Cancelled),
            result = send_and_decode(request) => result,
        }
    }
}

async fn send_and_decode<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SearchError> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    debug!(status = status.as_u16(), url = %response.url(), "provider responded");

    let body = response.text().await.map_err(map_reqwest_error)?;
    if !status.is_success() {
        return Err(status_error(status, &body));
    }
    decode_body(status, &body)
}

// Invalid JSON is a vendor fault; valid JSON in the wrong shape is a normalization fault
fn decode_body<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, SearchError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| SearchError::ProviderApi {
            status: status.as_u16(),
            detail: format!("malformed response body: {}", e),
        })?;

    serde_json::from_value(value)
        .map_err(|e| SearchError::Normalization(format!("unexpected response shape: {}", e)))
}

fn status_error(status: StatusCode, body: &str) -> SearchError {
    let detail: String = body.chars().take(MAX_ERROR_DETAIL_CHARS).collect();
    SearchError::ProviderApi {
        status: status.as_u16(),
        detail: if detail.is_empty() {
            status.canonical_reason().unwrap_or("no detail").to_string()
        } else {
            detail
        },
    }
}

fn map_reqwest_error(error: reqwest::Error) -> SearchError {
    if error.is_timeout() {
        SearchError::timeout(format!("Request timed out: {}", error))
    } else if error.is_connect() {
        SearchError::transport(format!("Connection failed: {}", error))
    } else {
        SearchError::transport(format!("HTTP request failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Echo {
        value: u32,
    }

    const NO_QUERY: [(&str, &str); 0] = [];

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_json_sends_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/echo"))
            .and(query_param("value", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": 7})))
            .mount(&server)
            .await;

        let echo: Echo = transport()
            .get_json(
                &format!("{}/echo", server.uri()),
                &[("value", "7")],
                HeaderMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(echo, Echo { value: 7 });
    }

    #[tokio::test]
    async fn test_post_form_is_url_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/form"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": 1})))
            .mount(&server)
            .await;

        let echo: Echo = transport()
            .post_form(
                &format!("{}/form", server.uri()),
                &[("grant_type", "client_credentials")],
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(echo.value, 1);
    }

    #[tokio::test]
    async fn test_non_success_status_maps_to_provider_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance window"))
            .mount(&server)
            .await;

        let result: Result<Echo, _> = transport()
            .get_json(&server.uri(), &NO_QUERY, HeaderMap::new(), &CancellationToken::new())
            .await;

        assert_eq!(
            result,
            Err(SearchError::ProviderApi {
                status: 503,
                detail: "maintenance window".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_and_mismatched_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/shape"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"other": true})))
            .mount(&server)
            .await;

        let garbage: Result<Echo, _> = transport()
            .get_json(
                &format!("{}/garbage", server.uri()),
                &NO_QUERY,
                HeaderMap::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(garbage, Err(SearchError::ProviderApi { status: 200, .. })));

        let shape: Result<Echo, _> = transport()
            .get_json(
                &format!("{}/shape", server.uri()),
                &NO_QUERY,
                HeaderMap::new(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(shape, Err(SearchError::Normalization(_))));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"value": 1}))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<Echo, _> = transport()
            .get_json(&server.uri(), &NO_QUERY, HeaderMap::new(), &cancel)
            .await;

        assert_eq!(result, Err(SearchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let result: Result<Echo, _> = transport()
            .get_json(
                "http://127.0.0.1:9/unreachable",
                &NO_QUERY,
                HeaderMap::new(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(SearchError::Transport { .. })));
    }
}
