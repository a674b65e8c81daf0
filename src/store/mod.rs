//! Durable relayer state.
//!
//! The store is the sole coordination point between the request processor,
//! the transaction sender, and the keeper. It tracks every relayed
//! transaction through its lifecycle (`tx_pending` → `tx_submitted` or
//! `tx_fail`), maintains the per-account pending-balance projection, and
//! holds the signer nonce and keeper block cursors.
//!
//! The projection is a cache, never a source of truth: every write that can
//! affect it recomputes the affected accounts from scratch before
//! returning.

use std::future::Future;

use alloy_primitives::{Address, B256, I256, U256};
use chrono::NaiveDateTime;

mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::PgStore;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A stored value could not be parsed back into its in-memory type.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// A relayed transaction awaiting on-chain confirmation.
#[derive(Debug, Clone)]
pub struct PendingTx {
    /// Hash of the signed chain transaction.
    pub tx_hash: B256,
    /// Authorization owner.
    pub payer: Address,
    /// Transfer recipient.
    pub receiver: Address,
    /// Transfer amount.
    pub amount: U256,
    /// Token-contract nonce consumed by the authorization.
    pub permit_nonce: U256,
    /// The fully signed chain transaction, EIP-2718 encoded.
    pub tx_signed: Vec<u8>,
    /// Relayer-account nonce carried by the transaction.
    pub tx_nonce: u64,
    /// Insertion time.
    pub timestamp: NaiveDateTime,
}

/// Fields of a new `tx_pending` row; the store assigns the timestamp.
#[derive(Debug, Clone)]
pub struct NewPendingTx {
    pub tx_hash: B256,
    pub payer: Address,
    pub receiver: Address,
    pub amount: U256,
    pub permit_nonce: U256,
    pub tx_signed: Vec<u8>,
    pub tx_nonce: u64,
}

/// Store operations shared by the processor, signer, and keeper.
///
/// Every method is atomic with respect to concurrent callers, and every
/// write that touches `tx_pending` recomputes the balance projections of
/// the affected accounts before returning.
pub trait TxStore: Send + Sync {
    /// Inserts a new pending transaction. Fails on a duplicate hash.
    fn add_tx_pending(
        &self,
        tx: NewPendingTx,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Looks up a pending transaction by hash.
    fn get_tx_pending(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<PendingTx>, StoreError>> + Send;

    /// Pending transactions ordered by `tx_nonce` ascending, at most
    /// `limit` rows.
    fn get_all_tx_pending(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<PendingTx>, StoreError>> + Send;

    /// Failed transactions ordered by `(payer, permit_nonce)`, at most
    /// `limit` rows. Feed for an out-of-band retry pump.
    fn get_all_tx_fail(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<PendingTx>, StoreError>> + Send;

    /// Moves a pending transaction to `tx_submitted`, stamping
    /// `timestamp_submitted`. Returns the moved row, or `None` if no
    /// pending row exists (making reprocessing idempotent).
    fn update_tx_pending_to_submitted(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<PendingTx>, StoreError>> + Send;

    /// Moves a pending transaction to `tx_fail`, stamping `timestamp_fail`.
    /// Returns the moved row, or `None` if no pending row exists.
    fn update_tx_pending_to_fail(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<PendingTx>, StoreError>> + Send;

    /// Net pending balance of `account`:
    /// Σ amount(receiver = account) − Σ amount(payer = account) over
    /// `tx_pending`. Materializes the projection row if absent.
    fn get_pending_balance(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<I256, StoreError>> + Send;

    /// Number of pending transactions with `account` as payer.
    /// Materializes the projection row if absent.
    fn get_pending_txs(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Registers the signer cursor row with nonce 0 if absent.
    fn prepare_signer_config(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Next outbound nonce recorded for the relayer account.
    fn get_signer_tx_nonce(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Monotone cursor update: stores `tx_nonce` only if it exceeds the
    /// current value.
    fn update_signer_tx_nonce(
        &self,
        account: Address,
        tx_nonce: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Registers the keeper cursor row with block 0 if absent, then
    /// monotone-updates it to `block_number`.
    fn prepare_keeper_config(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Last fully reconciled block for the keeper instance.
    fn get_keeper_block_number(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Monotone cursor update: stores `block_number` only if it exceeds the
    /// current value.
    fn update_keeper_block_number(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Lowercased hex rendering used for all address and hash columns.
pub(crate) fn hex_key(value: impl std::fmt::LowerHex) -> String {
    format!("{value:#x}")
}
