use std::collections::HashMap;
use std::time::Duration;

use enrolld_assert::{decode_stream, encode_stream, Assertion, AssertionContent, MEDIA_TYPE};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::proxy::{ProxyInfo, ServiceEndpoint};
use crate::retry::{classify_transport, RetryPolicy};

/// Built-in device service, used when no `device-service.url` is configured.
pub const DEFAULT_SERVICE_URL: &str = "https://serial.device-enroll.net/v1/devices";

/// Capability header value telling the service we accept stream responses.
const ACCEPT_STREAM: &str = "serial-stream";

/// What the service said about our serial request.
#[derive(Debug, Clone, PartialEq)]
pub enum SerialOutcome {
    /// A single signed serial assertion.
    Signed(Assertion),
    /// Stream mode: ancillary assertions plus (expected) one serial.
    Stream(Vec<Assertion>),
    /// HTTP 202: come back after the short retry interval.
    Poll,
    /// Structured refusal from the service's error_list.
    Rejected(String),
}

/// HTTP client for the device service `request-id` and `serial` endpoints.
///
/// One client is created per registration attempt with a bounded per-call
/// deadline; retries inside an attempt follow [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct DeviceServiceClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl DeviceServiceClient {
    pub fn new(retry: RetryPolicy) -> Result<Self, ServiceError> {
        Self::with_timeout(retry, Duration::from_secs(30))
    }

    pub fn with_timeout(retry: RetryPolicy, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(DeviceServiceClient { client, retry })
    }

    /// GET `{base}/request-id`, returning the nonce for the next
    /// serial-request.
    pub async fn fetch_request_id(
        &self,
        endpoint: &ServiceEndpoint,
        extra_headers: &HashMap<String, String>,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/request-id", endpoint.base_url);
        let headers = merge_headers(endpoint, extra_headers);

        self.retry
            .run("request-id", || {
                let client = self.client.clone();
                let url = url.clone();
                let headers = headers.clone();
                async move {
                    let mut req = client.get(&url);
                    for (k, v) in &headers {
                        req = req.header(k.as_str(), v.as_str());
                    }
                    let resp = req.send().await.map_err(classify_transport)?;
                    let status = resp.status();
                    if status.as_u16() != 200 {
                        return Err(ServiceError::BadStatus {
                            code: status.as_u16(),
                        });
                    }
                    let body: Value = resp
                        .json()
                        .await
                        .map_err(|e| ServiceError::Unexpected(e.to_string()))?;
                    body["request-id"]
                        .as_str()
                        .map(|s| s.to_string())
                        .ok_or_else(|| {
                            ServiceError::Unexpected("response carries no request-id".into())
                        })
                }
            })
            .await
    }

    /// POST the signed serial-request (plus any ancillary assertions) to
    /// `{base}/serial`.
    pub async fn submit_serial_request(
        &self,
        endpoint: &ServiceEndpoint,
        request: &Assertion,
        extra_headers: &HashMap<String, String>,
        ancillary: &[Assertion],
    ) -> Result<SerialOutcome, ServiceError> {
        let url = format!("{}/serial", endpoint.base_url);
        let headers = merge_headers(endpoint, extra_headers);
        let body = if ancillary.is_empty() {
            request.encode()?
        } else {
            let mut all = vec![request.clone()];
            all.extend_from_slice(ancillary);
            encode_stream(&all)?
        };

        self.retry
            .run("serial", || {
                let client = self.client.clone();
                let url = url.clone();
                let headers = headers.clone();
                let body = body.clone();
                async move {
                    let mut req = client
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE)
                        .header(reqwest::header::ACCEPT, ACCEPT_STREAM)
                        .body(body);
                    for (k, v) in &headers {
                        req = req.header(k.as_str(), v.as_str());
                    }
                    let resp = req.send().await.map_err(classify_transport)?;
                    decode_serial_response(resp).await
                }
            })
            .await
    }

    /// HEAD the configured store proxy to learn its protocol version.
    pub async fn discover_proxy(&self, proxy_url: &str) -> Result<ProxyInfo, ServiceError> {
        let resp = self
            .client
            .head(proxy_url)
            .send()
            .await
            .map_err(classify_transport)?;
        let version = resp
            .headers()
            .get("Snap-Store-Version")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());
        debug!(proxy = proxy_url, ?version, "discovered store proxy version");
        Ok(ProxyInfo {
            url: proxy_url.trim_end_matches('/').to_string(),
            version,
        })
    }
}

async fn decode_serial_response(resp: reqwest::Response) -> Result<SerialOutcome, ServiceError> {
    let status = resp.status().as_u16();
    match status {
        200 => {
            if let Some(ct) = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                if !ct.starts_with(MEDIA_TYPE) {
                    return Err(ServiceError::MalformedStream(format!(
                        "unexpected media type {}",
                        ct
                    )));
                }
            }
            let text = resp
                .text()
                .await
                .map_err(|e| ServiceError::Unexpected(e.to_string()))?;
            let assertions =
                decode_stream(&text).map_err(|e| ServiceError::MalformedStream(e.to_string()))?;
            if assertions.len() == 1
                && matches!(assertions[0].content, AssertionContent::Serial(_))
            {
                let serial = assertions.into_iter().next().expect("one assertion");
                info!("device service returned a signed serial");
                Ok(SerialOutcome::Signed(serial))
            } else {
                info!(count = assertions.len(), "device service returned an assertion stream");
                Ok(SerialOutcome::Stream(assertions))
            }
        }
        202 => {
            debug!("device service asked us to poll");
            Ok(SerialOutcome::Poll)
        }
        code if (400..500).contains(&code) => {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            match extract_error_list(&body) {
                Some(msg) => Ok(SerialOutcome::Rejected(msg)),
                None => Err(ServiceError::BadStatus { code }),
            }
        }
        code => Err(ServiceError::BadStatus { code }),
    }
}

/// Join the messages of a `{"error_list": [{"message": …}, …]}` body.
fn extract_error_list(body: &Value) -> Option<String> {
    let list = body["error_list"].as_array()?;
    let msgs: Vec<&str> = list
        .iter()
        .filter_map(|e| e["message"].as_str())
        .collect();
    if msgs.is_empty() {
        None
    } else {
        Some(msgs.join("; "))
    }
}

fn merge_headers(
    endpoint: &ServiceEndpoint,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut headers = endpoint.headers.clone();
    headers.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    headers
}
