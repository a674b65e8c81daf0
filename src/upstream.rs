//! Verbatim JSON-RPC forwarding to the upstream node.
//!
//! Every inbound method the processor does not handle itself is posted to
//! the upstream endpoint unchanged, and the upstream's response body is
//! returned as-is. Augmented reads go through the same path and then patch
//! the `result` field.

use alloy_primitives::U256;
use serde_json::Value;
use url::Url;

/// Errors from talking to the upstream JSON-RPC endpoint.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The HTTP request failed or the body was not JSON.
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The response carried no `result` field (e.g. an error response).
    #[error("upstream response missing result")]
    MissingResult,
    /// The `result` field was not a hex-encoded integer.
    #[error("unexpected upstream result: {0}")]
    UnexpectedResult(String),
}

/// A thin JSON-RPC client that forwards request bodies verbatim.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    endpoint: Url,
    http: reqwest::Client,
}

impl UpstreamClient {
    /// Creates a client for the given upstream endpoint.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    /// Posts `request` to the upstream endpoint and returns the decoded
    /// response body.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Http`] on transport or decode failure.
    pub async fn forward(&self, request: &Value) -> Result<Value, UpstreamError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        Ok(response.json().await?)
    }
}

/// Extracts the `result` field of a JSON-RPC response as a uint256.
///
/// # Errors
///
/// Returns [`UpstreamError::MissingResult`] when the field is absent or not
/// a string, and [`UpstreamError::UnexpectedResult`] when it is not valid
/// hex.
pub fn uint_result(response: &Value) -> Result<U256, UpstreamError> {
    let result = response
        .get("result")
        .and_then(Value::as_str)
        .ok_or(UpstreamError::MissingResult)?;
    let digits = result.strip_prefix("0x").unwrap_or(result);
    U256::from_str_radix(digits, 16)
        .map_err(|_| UpstreamError::UnexpectedResult(result.to_owned()))
}
