//! JSON-RPC envelope helpers and `delegate_permit` parameter types.
//!
//! Requests are handled as raw [`serde_json::Value`]s so that unknown
//! methods can be forwarded byte-faithfully; this module provides the typed
//! pieces dispatch needs.

use alloy_primitives::U256;
use alloy_primitives::ruint::ParseError;
use serde::Deserialize;
use serde_json::{Value, json};

/// 4-byte selector of `ERC20.balanceOf(address)`.
pub const BALANCE_OF_SELECTOR: &str = "0x70a08231";

/// 4-byte selector of `ERC20Permit.nonces(address)`.
pub const NONCES_SELECTOR: &str = "0x7ecebe00";

/// JSON-RPC error code for processor-level failures.
pub const PROCESSOR_ERROR_CODE: i64 = -1;

/// Returns the request's `id`, defaulting to `1` when absent.
#[must_use]
pub fn request_id(request: &Value) -> Value {
    request.get("id").cloned().unwrap_or_else(|| json!(1))
}

/// Builds a successful JSON-RPC response body.
#[must_use]
pub fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Builds a JSON-RPC error response body.
#[must_use]
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Encodes a uint256 as `0x` followed by 64 lowercase hex characters.
#[must_use]
pub fn encode_uint256(value: U256) -> String {
    let hex = format!("{value:x}");
    format!("0x{}{hex}", "0".repeat(64 - hex.len()))
}

/// A numeric parameter that clients send either as a base-10 string or as a
/// JSON integer. Any other shape fails deserialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumericParam {
    Integer(u64),
    Text(String),
}

impl NumericParam {
    /// Parses the parameter into a 256-bit integer.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] when the text form is not a base-10 integer.
    pub fn to_u256(&self) -> Result<U256, ParseError> {
        match self {
            Self::Integer(value) => Ok(U256::from(*value)),
            Self::Text(text) => U256::from_str_radix(text, 10),
        }
    }
}

/// The object carried in `params[0]` of a `delegate_permit` request.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegatePermitParams {
    /// Authorization owner, hex address.
    pub owner: String,
    /// Transfer recipient, hex address.
    pub receiver: String,
    /// Transfer amount, base-10 string.
    pub value: String,
    /// Token-contract permit nonce.
    pub nonce: NumericParam,
    /// Authorization deadline, unix seconds.
    pub deadline: NumericParam,
    /// 65-byte `r || s || v` signature, hex.
    pub signature: String,
}
