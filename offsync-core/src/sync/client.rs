//! HTTP client for the ingest endpoint
//!
//! One request shape: `POST {base}/ingest/locations` with a JSON array
//! body. Any 2xx accepts the whole batch; everything else is a failure the
//! caller retries later. There is no retry loop here, the scheduler's next
//! run is the retry.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::error::{Error, Result};

use super::signing::{SignedHeaders, INGEST_PATH};

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const DEVICE_TOKEN_HEADER: &str = "x-device-token";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Everything needed to send one batch.
#[derive(Debug)]
pub struct IngestRequest<'a> {
    pub base_url: &'a str,
    /// Exact body that was signed
    pub body: String,
    pub device_id: Option<&'a str>,
    /// Only sent when the client is configured to include it
    pub device_token: Option<&'a str>,
    pub signature: Option<&'a SignedHeaders>,
}

/// HTTP client for the ingest API
pub struct IngestClient {
    http_client: reqwest::Client,
    send_token_header: bool,
}

impl IngestClient {
    /// Create a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration, send_token_header: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            send_token_header,
        })
    }

    /// Post a batch. Returns the 2xx status code on acceptance.
    pub async fn send(&self, request: IngestRequest<'_>) -> Result<u16> {
        let url = format!("{}{}", request.base_url.trim_end_matches('/'), INGEST_PATH);

        let mut headers = HeaderMap::new();
        if let Some(device_id) = request.device_id {
            headers.insert(DEVICE_ID_HEADER, header_value(device_id, DEVICE_ID_HEADER)?);
        }
        if self.send_token_header {
            if let Some(token) = request.device_token {
                headers.insert(DEVICE_TOKEN_HEADER, header_value(token, DEVICE_TOKEN_HEADER)?);
            }
        }
        if let Some(signed) = request.signature {
            headers.insert(TIMESTAMP_HEADER, header_value(&signed.timestamp, TIMESTAMP_HEADER)?);
            headers.insert(SIGNATURE_HEADER, header_value(&signed.signature, SIGNATURE_HEADER)?);
        }

        let response = self
            .http_client
            .post(&url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn header_value(value: &str, name: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("invalid {} value: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request<'a>(base_url: &'a str, signature: Option<&'a SignedHeaders>) -> IngestRequest<'a> {
        IngestRequest {
            base_url,
            body: "[]".to_string(),
            device_id: Some("dev-1"),
            device_token: Some("tok-1"),
            signature,
        }
    }

    #[tokio::test]
    async fn test_send_posts_json_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest/locations"))
            .and(header("content-type", "application/json"))
            .and(header("x-device-id", "dev-1"))
            .and(header("x-timestamp", "1700000000000"))
            .and(header("x-signature", "abc123"))
            .and(body_string("[]"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = IngestClient::new(Duration::from_secs(5), false).unwrap();
        let signed = SignedHeaders {
            timestamp: "1700000000000".to_string(),
            signature: "abc123".to_string(),
        };
        let base = format!("{}/", server.uri());
        let status = client.send(request(&base, Some(&signed))).await.unwrap();
        assert_eq!(status, 201);

        let received = server.received_requests().await.unwrap();
        assert!(!received[0].headers.contains_key(DEVICE_TOKEN_HEADER));
    }

    #[tokio::test]
    async fn test_token_header_is_opt_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-device-token", "tok-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = IngestClient::new(Duration::from_secs(5), true).unwrap();
        let base = server.uri();
        client.send(request(&base, None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad signature"))
            .mount(&server)
            .await;

        let client = IngestClient::new(Duration::from_secs(5), false).unwrap();
        let base = server.uri();
        let err = client.send(request(&base, None)).await.unwrap_err();
        match err {
            Error::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad signature");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_http_error() {
        let client = IngestClient::new(Duration::from_secs(1), false).unwrap();
        let err = client
            .send(request("http://127.0.0.1:9", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert!(err.is_retryable());
    }
}
