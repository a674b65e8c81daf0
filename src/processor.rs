//! The JSON-RPC request processor.
//!
//! Dispatches inbound requests: token `balanceOf` / `nonces` reads are
//! augmented with pending-state projections from the store, the
//! `delegate_permit` method runs the full authorization pipeline, and every
//! other request is forwarded verbatim to the upstream node.
//!
//! Clients see projected state — on-chain balances and nonces adjusted by
//! the net effect of in-flight relayed transfers — so wallets observe
//! coherent values while transactions are still pending.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use alloy_primitives::utils::format_ether;
use alloy_primitives::{Address, U256, hex};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::chain::ChainClient;
use crate::config::Config;
use crate::permit::{Permit, PermitDomain, SignatureError, verify_signature};
use crate::rpc::{
    self, BALANCE_OF_SELECTOR, DelegatePermitParams, NONCES_SELECTOR, encode_uint256,
};
use crate::signer::{Signer, SignerError};
use crate::store::{StoreError, TxStore};
use crate::upstream::{UpstreamClient, UpstreamError, uint_result};

/// Errors surfaced to clients as JSON-RPC error responses.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// The request carries no usable `method`.
    #[error("invalid request format: method not found")]
    InvalidMethod,
    /// The request parameters are missing or have the wrong shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The recovered signer does not match the declared owner.
    #[error("recovered signer mismatch, signer: {recovered} owner: {owner}")]
    SignatureMismatch { recovered: Address, owner: Address },
    /// The permit nonce is not the owner's next projected nonce.
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: U256, got: U256 },
    /// The owner's projected balance does not cover the transfer.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// The permit expires too soon to be relayed.
    #[error("deadline must be at least {0} seconds in the future")]
    DeadlineTooSoon(u64),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Outcome of inspecting an `eth_call` addressed to the token contract.
enum TokenRead {
    Balance(Address),
    Nonces(Address),
    Forward,
}

/// The JSON-RPC interception layer.
pub struct RequestProcessor<S, C> {
    token_name: String,
    token_address: Address,
    chain_id: u64,
    deadline_minimum: u64,
    upstream: UpstreamClient,
    store: Arc<S>,
    signer: Arc<Signer<S, C>>,
    /// Makes nonce projection and pending-transaction creation atomic with
    /// respect to concurrent `delegate_permit` calls.
    mutex: Mutex<()>,
}

impl<S, C> RequestProcessor<S, C>
where
    S: TxStore,
    C: ChainClient,
{
    /// Creates a processor over the given upstream, store, and signer.
    pub fn new(
        config: &Config,
        upstream: UpstreamClient,
        store: Arc<S>,
        signer: Arc<Signer<S, C>>,
    ) -> Self {
        Self {
            token_name: config.erc20_permit_token_name.clone(),
            token_address: config.erc20_permit_token_address,
            chain_id: config.network_id,
            deadline_minimum: config.deadline_minimum,
            upstream,
            store,
            signer,
            mutex: Mutex::new(()),
        }
    }

    /// Handles one decoded JSON-RPC request and returns the full response
    /// body.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError`] for anything the caller should convert
    /// into a JSON-RPC error response.
    pub async fn process(&self, request: Value) -> Result<Value, ProcessorError> {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .ok_or(ProcessorError::InvalidMethod)?;

        match method {
            "eth_call" => self.process_eth_call(request).await,
            "delegate_permit" => self.process_delegate_permit(request).await,
            _ => Ok(self.upstream.forward(&request).await?),
        }
    }

    /// Dispatches an `eth_call`: token `balanceOf` / `nonces` reads are
    /// augmented, everything else is forwarded unchanged.
    async fn process_eth_call(&self, request: Value) -> Result<Value, ProcessorError> {
        let read = {
            let params = request
                .get("params")
                .and_then(Value::as_array)
                .filter(|params| !params.is_empty())
                .ok_or_else(|| ProcessorError::InvalidParams("invalid eth_call params".into()))?;
            let call = params[0]
                .as_object()
                .ok_or_else(|| ProcessorError::InvalidParams("invalid eth_call params".into()))?;
            let to = call
                .get("to")
                .and_then(Value::as_str)
                .ok_or_else(|| ProcessorError::InvalidParams("invalid eth_call params".into()))?;

            let targets_token = to
                .parse::<Address>()
                .is_ok_and(|to| to == self.token_address);
            if targets_token {
                match call.get("data") {
                    Some(Value::String(data)) => classify_token_read(&data.to_lowercase())?,
                    Some(_) => {
                        return Err(ProcessorError::InvalidParams(
                            "eth_call data must be a string".into(),
                        ));
                    }
                    None => TokenRead::Forward,
                }
            } else {
                TokenRead::Forward
            }
        };

        match read {
            TokenRead::Balance(account) => self.augmented_balance(request, account).await,
            TokenRead::Nonces(account) => self.augmented_nonce(request, account).await,
            TokenRead::Forward => Ok(self.upstream.forward(&request).await?),
        }
    }

    /// Forwards a `balanceOf` call and adds the account's pending balance
    /// to the result, floored at zero.
    async fn augmented_balance(
        &self,
        request: Value,
        account: Address,
    ) -> Result<Value, ProcessorError> {
        let start = Instant::now();
        let mut response = self.upstream.forward(&request).await?;
        let realized = uint_result(&response)?;

        let pending = self.store.get_pending_balance(account).await?;
        let projected = if pending.is_negative() {
            realized.saturating_sub(pending.unsigned_abs())
        } else {
            realized.saturating_add(pending.unsigned_abs())
        };

        tracing::debug!(
            account = %account,
            realized = %format_ether(realized),
            pending = %pending,
            projected = %format_ether(projected),
            elapsed = ?start.elapsed(),
            "augmented balanceOf"
        );

        response["result"] = Value::String(encode_uint256(projected));
        Ok(response)
    }

    /// Forwards a `nonces` call and adds the account's pending transaction
    /// count to the result.
    async fn augmented_nonce(
        &self,
        request: Value,
        account: Address,
    ) -> Result<Value, ProcessorError> {
        let start = Instant::now();
        let mut response = self.upstream.forward(&request).await?;
        let realized = uint_result(&response)?;

        let pending_txs = self.store.get_pending_txs(account).await?;
        let projected = realized.saturating_add(U256::from(pending_txs));

        tracing::debug!(
            account = %account,
            nonce = %projected,
            pending_txs,
            elapsed = ?start.elapsed(),
            "augmented nonces"
        );

        response["result"] = Value::String(encode_uint256(projected));
        Ok(response)
    }

    /// Runs the `delegate_permit` pipeline: signature recovery, projected
    /// nonce and balance checks, deadline floor, and hand-off to the
    /// signer. Returns the transaction hash as the result.
    async fn process_delegate_permit(&self, request: Value) -> Result<Value, ProcessorError> {
        let params = request
            .get("params")
            .and_then(Value::as_array)
            .filter(|params| !params.is_empty())
            .ok_or_else(|| ProcessorError::InvalidParams("invalid delegate_permit params".into()))?;
        let params: DelegatePermitParams = serde_json::from_value(params[0].clone())
            .map_err(|err| ProcessorError::InvalidParams(err.to_string()))?;
        let (permit, signature) = self.parse_permit(params)?;

        let domain = PermitDomain {
            name: self.token_name.clone(),
            chain_id: self.chain_id,
            verifying_contract: self.token_address,
        };
        let recovered = verify_signature(&domain, &permit, &signature)?;
        if recovered != permit.owner {
            return Err(ProcessorError::SignatureMismatch {
                recovered,
                owner: permit.owner,
            });
        }

        // Projection reads and the pending insert must be atomic with
        // respect to concurrent delegate_permit calls; otherwise two
        // requests could both observe the same projected nonce.
        let _guard = self.mutex.lock().await;

        let projected_nonce = self.projected_nonce(permit.owner).await?;
        if permit.nonce != projected_nonce {
            return Err(ProcessorError::InvalidNonce {
                expected: projected_nonce,
                got: permit.nonce,
            });
        }

        let balance = self.projected_balance(permit.owner).await?;
        if balance < permit.value {
            return Err(ProcessorError::InsufficientBalance);
        }

        let now = unix_now();
        if permit.deadline < U256::from(now + self.deadline_minimum) {
            return Err(ProcessorError::DeadlineTooSoon(self.deadline_minimum));
        }

        tracing::debug!(
            owner = %permit.owner,
            receiver = %permit.receiver,
            value = %permit.value,
            "incoming delegate_permit"
        );

        let tx_hash = self
            .signer
            .add_pending_transaction(&permit, &signature)
            .await?;

        Ok(rpc::result_response(
            rpc::request_id(&request),
            Value::String(format!("{tx_hash:#x}")),
        ))
    }

    fn parse_permit(
        &self,
        params: DelegatePermitParams,
    ) -> Result<(Permit, Vec<u8>), ProcessorError> {
        let invalid = |field: &str| ProcessorError::InvalidParams(format!("invalid {field}"));

        let owner = params.owner.parse().map_err(|_| invalid("owner"))?;
        let receiver = params.receiver.parse().map_err(|_| invalid("receiver"))?;
        let value = U256::from_str_radix(&params.value, 10).map_err(|_| invalid("value"))?;
        let nonce = params.nonce.to_u256().map_err(|_| invalid("nonce"))?;
        let deadline = params.deadline.to_u256().map_err(|_| invalid("deadline"))?;
        let signature = hex::decode(&params.signature).map_err(|_| invalid("signature"))?;

        Ok((
            Permit {
                owner,
                receiver,
                value,
                nonce,
                deadline,
            },
            signature,
        ))
    }

    /// Projected balance of `account`, read through the same augmentation
    /// path clients use.
    async fn projected_balance(&self, account: Address) -> Result<U256, ProcessorError> {
        let payload = self.token_call_payload(BALANCE_OF_SELECTOR, account);
        let response = self.augmented_balance(payload, account).await?;
        Ok(uint_result(&response)?)
    }

    /// Projected permit nonce of `account`.
    async fn projected_nonce(&self, account: Address) -> Result<U256, ProcessorError> {
        let payload = self.token_call_payload(NONCES_SELECTOR, account);
        let response = self.augmented_nonce(payload, account).await?;
        Ok(uint_result(&response)?)
    }

    fn token_call_payload(&self, selector: &str, account: Address) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [
                {
                    "data": format!("{selector}000000000000000000000000{account:x}"),
                    "to": format!("{:#x}", self.token_address),
                },
                "latest",
            ],
            "id": 1,
        })
    }
}

/// Classifies token calldata: `balanceOf(address)`, `nonces(address)`, or
/// anything else (forwarded unchanged).
fn classify_token_read(calldata: &str) -> Result<TokenRead, ProcessorError> {
    if calldata.len() != 74 || !calldata.is_ascii() {
        return Ok(TokenRead::Forward);
    }
    let selector = &calldata[..10];
    if selector != BALANCE_OF_SELECTOR && selector != NONCES_SELECTOR {
        return Ok(TokenRead::Forward);
    }

    // Selector, 12 zero-padding bytes, then the 20-byte address argument.
    let account: Address = format!("0x{}", &calldata[34..])
        .parse()
        .map_err(|_| ProcessorError::InvalidParams("invalid eth_call address argument".into()))?;

    Ok(if selector == BALANCE_OF_SELECTOR {
        TokenRead::Balance(account)
    } else {
        TokenRead::Nonces(account)
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
