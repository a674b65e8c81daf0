//! The transaction sender.
//!
//! Owns the relayer key. `delegate_permit` hands verified authorizations to
//! [`Signer::add_pending_transaction`], which wraps them in signed legacy
//! transactions and stores them in `tx_pending`; the sender loop
//! periodically drains that table to the upstream node. Rows only leave
//! `tx_pending` through the keeper's receipt reconciliation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::{Decodable2718, Encodable2718};
use alloy_network::TxSignerSync;
use alloy_primitives::{Address, B256, TxKind, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, sol};
use tokio::sync::Mutex;

use crate::chain::{ChainClient, ChainError};
use crate::config::Config;
use crate::permit::{Permit, SignatureError};
use crate::store::{NewPendingTx, StoreError, TxStore};

sol! {
    /// Token entry point that consumes a permit signature and moves the
    /// funds in one call.
    function transferWithPermit(
        address owner,
        address receiver,
        uint256 value,
        uint256 deadline,
        uint8 v,
        bytes32 r,
        bytes32 s
    );
}

/// How long the sender loop waits before its first batch, and between
/// batches when the previous fetch returned nothing.
const STARTUP_DELAY: Duration = Duration::from_secs(3);

/// Errors from building, storing, or dispatching relayer transactions.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The signer is disabled in the configuration.
    #[error("transaction sender is disabled")]
    Disabled,
    /// A pending transaction with the same hash already exists.
    #[error("transaction already exists")]
    TransactionAlreadyExists(B256),
    /// The keystore could not be decrypted with the configured password.
    #[error("failed to unlock keystore: {0}")]
    KeystoreUnlock(#[source] alloy_signer_local::LocalSignerError),
    /// Signing the chain transaction failed.
    #[error(transparent)]
    Signing(#[from] alloy_signer::Error),
    /// A stored `tx_signed` blob did not decode back into a transaction.
    #[error("stored transaction is corrupt: {0}")]
    Decode(#[from] alloy_eips::eip2718::Eip2718Error),
    /// The permit signature blob is malformed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The batched, nonce-disciplined outbound transaction pipeline.
pub struct Signer<S, C> {
    chain_id: u64,
    token_address: Address,
    gas_price: u128,
    gas_limit: u64,
    sender_interval: Duration,
    sender_bulk_size: i64,
    wallet: Option<PrivateKeySigner>,
    store: Arc<S>,
    chain: Arc<C>,
    /// Serializes `add_pending_transaction` with sender-loop batches.
    mutex: Mutex<()>,
    closed: AtomicBool,
}

impl<S, C> Signer<S, C>
where
    S: TxStore,
    C: ChainClient,
{
    /// Creates a signer. `wallet` is `None` when the sender is disabled, in
    /// which case `delegate_permit` is rejected.
    pub fn new(
        chain_id: u64,
        token_address: Address,
        gas_price: u128,
        gas_limit: u64,
        sender_interval: Duration,
        sender_bulk_size: i64,
        wallet: Option<PrivateKeySigner>,
        store: Arc<S>,
        chain: Arc<C>,
    ) -> Self {
        Self {
            chain_id,
            token_address,
            gas_price,
            gas_limit,
            sender_interval,
            sender_bulk_size,
            wallet,
            store,
            chain,
            mutex: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds a signer from the configuration, decrypting the keystore when
    /// the sender is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::KeystoreUnlock`] on decryption failure; fatal
    /// at startup.
    pub fn from_config(config: &Config, store: Arc<S>, chain: Arc<C>) -> Result<Self, SignerError> {
        let wallet = if config.signer.enable {
            let wallet = PrivateKeySigner::decrypt_keystore(
                &config.signer.keystore_file_path,
                &config.signer.password,
            )
            .map_err(SignerError::KeystoreUnlock)?;
            tracing::info!(address = %wallet.address(), "unlocked relayer account");
            Some(wallet)
        } else {
            None
        };

        Ok(Self::new(
            config.network_id,
            config.erc20_permit_token_address,
            config.signer.gas_price,
            config.signer.gas_limit,
            Duration::from_millis(config.signer.sender_interval),
            config.signer.sender_bulk_size,
            wallet,
            store,
            chain,
        ))
    }

    /// The relayer account address, when the sender is enabled.
    #[must_use]
    pub fn address(&self) -> Option<Address> {
        self.wallet.as_ref().map(PrivateKeySigner::address)
    }

    /// Registers the signer nonce cursor row for the relayer account.
    ///
    /// # Errors
    ///
    /// Propagates store failures; fatal at startup when the sender is
    /// enabled.
    pub async fn prepare(&self) -> Result<(), SignerError> {
        if let Some(wallet) = &self.wallet {
            self.store.prepare_signer_config(wallet.address()).await?;
        }
        Ok(())
    }

    /// Signals the sender loop to exit at its next iteration boundary.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Packages a verified permit into a signed chain transaction and
    /// stores it in `tx_pending`, returning the transaction hash.
    ///
    /// The outbound nonce is `max(upstream pending nonce, stored cursor)`,
    /// so a nonce is never reused even when the node's mempool view lags
    /// the store. The cursor is advanced monotonically afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SignerError::TransactionAlreadyExists`] when a pending row
    /// with the same hash exists; nothing is written in that case.
    pub async fn add_pending_transaction(
        &self,
        permit: &Permit,
        signature: &[u8],
    ) -> Result<B256, SignerError> {
        let wallet = self.wallet.as_ref().ok_or(SignerError::Disabled)?;
        let _guard = self.mutex.lock().await;

        let upstream_nonce = self.chain.pending_nonce(wallet.address()).await?;
        let stored_nonce = self.store.get_signer_tx_nonce(wallet.address()).await?;
        let tx_nonce = upstream_nonce.max(stored_nonce);

        let envelope = self.build_signed_transaction(wallet, permit, signature, tx_nonce)?;
        let tx_hash = *envelope.tx_hash();
        let tx_signed = envelope.encoded_2718();

        if self.store.get_tx_pending(tx_hash).await?.is_some() {
            return Err(SignerError::TransactionAlreadyExists(tx_hash));
        }

        self.store
            .add_tx_pending(NewPendingTx {
                tx_hash,
                payer: permit.owner,
                receiver: permit.receiver,
                amount: permit.value,
                permit_nonce: permit.nonce,
                tx_signed,
                tx_nonce,
            })
            .await?;
        self.store
            .update_signer_tx_nonce(wallet.address(), tx_nonce + 1)
            .await?;

        Ok(tx_hash)
    }

    /// Builds the signed legacy `transferWithPermit` transaction for a
    /// permit, EIP-155 bound to the configured chain id.
    pub(crate) fn build_signed_transaction(
        &self,
        wallet: &PrivateKeySigner,
        permit: &Permit,
        signature: &[u8],
        tx_nonce: u64,
    ) -> Result<TxEnvelope, SignerError> {
        if signature.len() != 65 {
            return Err(SignatureError::InvalidLength(signature.len()).into());
        }
        let call = transferWithPermitCall {
            owner: permit.owner,
            receiver: permit.receiver,
            value: permit.value,
            deadline: permit.deadline,
            v: signature[64],
            r: B256::from_slice(&signature[..32]),
            s: B256::from_slice(&signature[32..64]),
        };

        let mut tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: tx_nonce,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            to: TxKind::Call(self.token_address),
            value: U256::ZERO,
            input: call.abi_encode().into(),
        };
        let tx_signature = wallet.sign_transaction_sync(&mut tx)?;
        Ok(TxEnvelope::Legacy(tx.into_signed(tx_signature)))
    }

    /// Runs the sender loop until [`Signer::close`] is called.
    pub async fn run(self: Arc<Self>) {
        // Let the proxy and upstream connection settle first.
        tokio::time::sleep(STARTUP_DELAY).await;

        while !self.closed.load(Ordering::Relaxed) {
            let fetched = match self.send_batch().await {
                Ok(fetched) => fetched,
                Err(err) => {
                    tracing::error!(error = %err, "failed to send transactions");
                    0
                }
            };

            if fetched == 0 {
                tokio::time::sleep(STARTUP_DELAY).await;
            } else {
                tokio::time::sleep(self.sender_interval).await;
            }
        }
    }

    /// Dispatches one batch of pending transactions, oldest nonce first.
    ///
    /// An upstream rejection whose message is exactly `"already known"`
    /// means the transaction is still in the mempool; it is skipped. Any
    /// other error aborts the batch and leaves the remaining rows for the
    /// next tick. Returns the number of rows fetched.
    pub async fn send_batch(&self) -> Result<usize, SignerError> {
        let _guard = self.mutex.lock().await;
        let start = Instant::now();

        let txs = self.store.get_all_tx_pending(self.sender_bulk_size).await?;

        let mut sent = 0usize;
        for tx in &txs {
            let mut raw = tx.tx_signed.as_slice();
            let envelope = TxEnvelope::decode_2718(&mut raw)?;
            let tx_hash = *envelope.tx_hash();

            match self.chain.send_raw_transaction(&tx.tx_signed).await {
                Ok(_) => {
                    tracing::info!(hash = %tx_hash, "submitted transaction");
                    sent += 1;
                }
                Err(err) if err.is_already_known() => {
                    tracing::info!(hash = %tx_hash, "transaction already in mempool, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if sent > 1 {
            tracing::info!(count = sent, elapsed = ?start.elapsed(), "sent transaction batch");
        }

        Ok(txs.len())
    }
}
