//! The chain scanner.
//!
//! Walks blocks from a persisted cursor, matches transactions addressed to
//! the token contract against chain receipts, and advances `tx_pending`
//! rows to `tx_submitted` or `tx_fail`. The store moves are no-ops when
//! the row is already gone, so reprocessing a block any number of times is
//! safe; the loop leans on that by rewinding one block at boot and by
//! leaving the cursor untouched whenever an iteration aborts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use alloy_primitives::Address;
use chrono::Utc;

use crate::chain::ChainClient;
use crate::config::Config;
use crate::store::TxStore;

/// Cursor persistence period, in loop iterations.
const PERSIST_EVERY: u64 = 10;

/// The block-scanning reconciler.
pub struct Keeper<S, C> {
    token_address: Address,
    instance_id: String,
    initial_sync_block_number: u64,
    block_batch_limit: u64,
    syncing_interval: Duration,
    latest_interval: Duration,
    store: Arc<S>,
    chain: Arc<C>,
    closed: AtomicBool,
}

impl<S, C> Keeper<S, C>
where
    S: TxStore,
    C: ChainClient,
{
    /// Builds a keeper from the configuration.
    pub fn from_config(config: &Config, store: Arc<S>, chain: Arc<C>) -> Self {
        Self {
            token_address: config.erc20_permit_token_address,
            instance_id: config.keeper.instance_id.clone(),
            initial_sync_block_number: config.keeper.initial_sync_block_number,
            block_batch_limit: config.keeper.block_batch_limit,
            syncing_interval: Duration::from_millis(config.keeper.syncing_interval),
            latest_interval: Duration::from_millis(config.keeper.latest_interval),
            store,
            chain,
            closed: AtomicBool::new(false),
        }
    }

    /// Signals the sync loop to exit at its next iteration boundary.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Runs the sync loop until [`Keeper::close`] is called.
    pub async fn run(self: Arc<Self>) {
        if let Err(err) = self
            .store
            .prepare_keeper_config(&self.instance_id, self.initial_sync_block_number)
            .await
        {
            tracing::error!(error = %err, "failed to prepare keeper config");
            return;
        }
        let sync_block_number = match self.store.get_keeper_block_number(&self.instance_id).await {
            Ok(number) => number,
            Err(err) => {
                tracing::error!(error = %err, "failed to read keeper block number");
                return;
            }
        };
        tracing::info!(
            instance = %self.instance_id,
            block = sync_block_number,
            "starting block sync"
        );

        // Rewind one block so the boundary block is reprocessed.
        let mut cursor = sync_block_number.saturating_sub(1);

        let mut iteration: u64 = 0;
        while !self.closed.load(Ordering::Relaxed) {
            iteration += 1;
            let (is_syncing, next) = self.process_blocks(cursor).await;
            cursor = next;

            if iteration % PERSIST_EVERY == 0
                && let Err(err) = self
                    .store
                    .update_keeper_block_number(&self.instance_id, cursor)
                    .await
            {
                tracing::error!(error = %err, "failed to persist keeper block number");
            }

            let interval = if is_syncing {
                self.syncing_interval
            } else {
                self.latest_interval
            };
            tokio::time::sleep(interval).await;
        }
    }

    /// Processes up to `block_batch_limit` blocks past `cursor`.
    ///
    /// Returns whether the keeper is still catching up and the new cursor.
    /// On any upstream or store failure the cursor is returned unchanged so
    /// the same blocks are retried next tick.
    pub async fn process_blocks(&self, cursor: u64) -> (bool, u64) {
        let start = Instant::now();

        let latest = match self.chain.latest_block_number().await {
            Ok(number) => number,
            Err(err) => {
                tracing::error!(error = %err, "failed to retrieve latest block number");
                return (true, cursor);
            }
        };

        let gap = latest.saturating_sub(cursor);
        let is_syncing = gap > self.block_batch_limit;
        let count = gap.min(self.block_batch_limit);
        if count < 1 {
            return (false, cursor);
        }

        let mut scanned = 0usize;
        for offset in 1..=count {
            let number = cursor + offset;
            let txs = match self.chain.block_transactions(number).await {
                Ok(Some(txs)) => txs,
                Ok(None) => {
                    tracing::error!(block = number, "block not available");
                    return (true, cursor);
                }
                Err(err) => {
                    tracing::error!(block = number, error = %err, "failed to retrieve block");
                    return (true, cursor);
                }
            };
            scanned += txs.len();

            for tx in txs.iter().filter(|tx| tx.to == Some(self.token_address)) {
                let status = match self.chain.receipt_status(tx.hash).await {
                    Ok(Some(status)) => status,
                    Ok(None) => {
                        tracing::error!(hash = %tx.hash, block = number, "transaction receipt missing");
                        return (false, cursor);
                    }
                    Err(err) => {
                        tracing::error!(hash = %tx.hash, block = number, error = %err, "failed to retrieve receipt");
                        return (false, cursor);
                    }
                };

                if status {
                    match self.store.update_tx_pending_to_submitted(tx.hash).await {
                        Ok(Some(row)) => {
                            let finalized = Utc::now().naive_utc() - row.timestamp;
                            tracing::info!(
                                hash = %tx.hash,
                                finalized_secs = finalized.num_seconds(),
                                "finalized transaction"
                            );
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(hash = %tx.hash, error = %err, "failed to move transaction to submitted");
                            return (false, cursor);
                        }
                    }
                } else {
                    match self.store.update_tx_pending_to_fail(tx.hash).await {
                        Ok(moved) => {
                            if moved.is_some() {
                                tracing::warn!(
                                    hash = %tx.hash,
                                    "transaction reverted, available for retry"
                                );
                            }
                        }
                        Err(err) => {
                            tracing::error!(hash = %tx.hash, error = %err, "failed to move transaction to fail");
                            return (false, cursor);
                        }
                    }
                }
            }
        }

        let processed = cursor + count;
        if is_syncing {
            tracing::info!(
                block = processed,
                latest,
                blocks = count,
                txs = scanned,
                elapsed = ?start.elapsed(),
                "syncing transactions"
            );
        } else {
            tracing::info!(
                block = processed,
                blocks = count,
                txs = scanned,
                elapsed = ?start.elapsed(),
                "processed transactions"
            );
        }

        (is_syncing, processed)
    }
}
