//! Typed upstream node operations for the signer and keeper.
//!
//! [`ChainClient`] is the seam between the background loops and the node;
//! the production implementation wraps an alloy [`RootProvider`] over HTTP.
//! Loops and tests inject their own implementation.

use std::future::Future;

use alloy_consensus::Transaction;
use alloy_network_primitives::TransactionResponse;
use alloy_primitives::{Address, B256};
use alloy_provider::{Provider, RootProvider};
use alloy_transport::{RpcError, TransportError};
use url::Url;

/// Errors from typed upstream node calls.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The node returned a JSON-RPC error; the message is preserved
    /// verbatim so callers can match on it.
    #[error("{0}")]
    Rpc(String),
    /// The call never produced a response.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => Self::Rpc(payload.message.to_string()),
            other => Self::Transport(other),
        }
    }
}

impl ChainError {
    /// Whether the node rejected a submission because the transaction is
    /// already in its mempool.
    #[must_use]
    pub fn is_already_known(&self) -> bool {
        matches!(self, Self::Rpc(message) if message == "already known")
    }
}

/// A transaction observed in a scanned block.
#[derive(Debug, Clone)]
pub struct BlockTx {
    /// Transaction hash.
    pub hash: B256,
    /// Call target; `None` for contract creations.
    pub to: Option<Address>,
}

/// The node operations the signer and keeper consume.
pub trait ChainClient: Send + Sync {
    /// Next nonce for `address` including mempool transactions
    /// (`eth_getTransactionCount` at `pending`).
    fn pending_nonce(&self, address: Address)
    -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Submits a raw signed transaction and returns its hash.
    fn send_raw_transaction(
        &self,
        raw: &[u8],
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Latest block number.
    fn latest_block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Transactions of the given block, or `None` if the node does not have
    /// it.
    fn block_transactions(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<Vec<BlockTx>>, ChainError>> + Send;

    /// Receipt status of a transaction: `Some(true)` for success,
    /// `Some(false)` for revert, `None` when no receipt exists yet.
    fn receipt_status(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<bool>, ChainError>> + Send;
}

/// [`ChainClient`] backed by an alloy HTTP provider.
#[derive(Debug)]
pub struct HttpChainClient {
    provider: RootProvider,
}

impl HttpChainClient {
    /// Creates a client over a plain HTTP transport.
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            provider: RootProvider::new_http(endpoint),
        }
    }
}

impl ChainClient for HttpChainClient {
    async fn pending_nonce(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .provider
            .get_transaction_count(address)
            .pending()
            .await?)
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<B256, ChainError> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(*pending.tx_hash())
    }

    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_transactions(&self, number: u64) -> Result<Option<Vec<BlockTx>>, ChainError> {
        let block = self.provider.get_block_by_number(number.into()).full().await?;
        Ok(block.map(|block| {
            block
                .transactions
                .into_transactions()
                .map(|tx| BlockTx {
                    hash: tx.tx_hash(),
                    to: tx.to(),
                })
                .collect()
        }))
    }

    async fn receipt_status(&self, hash: B256) -> Result<Option<bool>, ChainError> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|receipt| receipt.status()))
    }
}
