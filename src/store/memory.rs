//! In-memory [`TxStore`] used to exercise the processor, signer, and
//! keeper without a database. Mirrors the Postgres store's semantics,
//! including full projection recomputation on every affecting write.

use std::collections::HashMap;
use std::sync::Mutex;

use alloy_primitives::{Address, B256, I256, U256};
use chrono::Utc;

use super::{NewPendingTx, PendingTx, StoreError, TxStore, hex_key};

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<String, PendingTx>,
    submitted: HashMap<String, PendingTx>,
    failed: HashMap<String, PendingTx>,
    /// account → (pending_balance, pending_txs)
    projections: HashMap<String, (I256, u64)>,
    signer_nonces: HashMap<String, u64>,
    keeper_blocks: HashMap<String, u64>,
}

impl Inner {
    fn recompute_projection(&mut self, account: &str) {
        let mut balance = I256::ZERO;
        let mut count = 0u64;
        for tx in self.pending.values() {
            let amount = I256::try_from(tx.amount).expect("test amounts fit in I256");
            if hex_key(tx.receiver) == account {
                balance += amount;
            }
            if hex_key(tx.payer) == account {
                balance -= amount;
                count += 1;
            }
        }
        self.projections.insert(account.to_owned(), (balance, count));
    }

    fn move_pending(
        &mut self,
        tx_hash: B256,
        to_failed: bool,
    ) -> Result<Option<PendingTx>, StoreError> {
        let key = hex_key(tx_hash);
        let Some(tx) = self.pending.remove(&key) else {
            return Ok(None);
        };
        if to_failed {
            self.failed.insert(key, tx.clone());
        } else {
            self.submitted.insert(key, tx.clone());
        }
        self.recompute_projection(&hex_key(tx.payer));
        self.recompute_projection(&hex_key(tx.receiver));
        Ok(Some(tx))
    }

    fn projection(&mut self, account: Address) -> (I256, u64) {
        let key = hex_key(account);
        if !self.projections.contains_key(&key) {
            self.recompute_projection(&key);
        }
        self.projections[&key]
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently in `tx_submitted`.
    pub fn submitted(&self) -> Vec<PendingTx> {
        self.inner.lock().unwrap().submitted.values().cloned().collect()
    }

    /// Rows currently in `tx_fail`, unordered.
    pub fn failed(&self) -> Vec<PendingTx> {
        self.inner.lock().unwrap().failed.values().cloned().collect()
    }
}

impl TxStore for MemoryStore {
    async fn add_tx_pending(&self, tx: NewPendingTx) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = hex_key(tx.tx_hash);
        if inner.pending.contains_key(&key) {
            return Err(StoreError::Corrupt(format!("duplicate tx_hash: {key}")));
        }
        let row = PendingTx {
            tx_hash: tx.tx_hash,
            payer: tx.payer,
            receiver: tx.receiver,
            amount: tx.amount,
            permit_nonce: tx.permit_nonce,
            tx_signed: tx.tx_signed,
            tx_nonce: tx.tx_nonce,
            timestamp: Utc::now().naive_utc(),
        };
        let payer = hex_key(row.payer);
        let receiver = hex_key(row.receiver);
        inner.pending.insert(key, row);
        inner.recompute_projection(&payer);
        inner.recompute_projection(&receiver);
        Ok(())
    }

    async fn get_tx_pending(&self, tx_hash: B256) -> Result<Option<PendingTx>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pending.get(&hex_key(tx_hash)).cloned())
    }

    async fn get_all_tx_pending(&self, limit: i64) -> Result<Vec<PendingTx>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut txs: Vec<_> = inner.pending.values().cloned().collect();
        txs.sort_by_key(|tx| tx.tx_nonce);
        txs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(txs)
    }

    async fn get_all_tx_fail(&self, limit: i64) -> Result<Vec<PendingTx>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut txs: Vec<_> = inner.failed.values().cloned().collect();
        txs.sort_by_key(|tx| (hex_key(tx.payer), tx.permit_nonce));
        txs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(txs)
    }

    async fn update_tx_pending_to_submitted(
        &self,
        tx_hash: B256,
    ) -> Result<Option<PendingTx>, StoreError> {
        self.inner.lock().unwrap().move_pending(tx_hash, false)
    }

    async fn update_tx_pending_to_fail(
        &self,
        tx_hash: B256,
    ) -> Result<Option<PendingTx>, StoreError> {
        self.inner.lock().unwrap().move_pending(tx_hash, true)
    }

    async fn get_pending_balance(&self, account: Address) -> Result<I256, StoreError> {
        Ok(self.inner.lock().unwrap().projection(account).0)
    }

    async fn get_pending_txs(&self, account: Address) -> Result<u64, StoreError> {
        Ok(self.inner.lock().unwrap().projection(account).1)
    }

    async fn prepare_signer_config(&self, account: Address) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.signer_nonces.entry(hex_key(account)).or_insert(0);
        Ok(())
    }

    async fn get_signer_tx_nonce(&self, account: Address) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .signer_nonces
            .get(&hex_key(account))
            .copied()
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    async fn update_signer_tx_nonce(&self, account: Address, tx_nonce: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner.signer_nonces.get_mut(&hex_key(account))
            && *stored < tx_nonce
        {
            *stored = tx_nonce;
        }
        Ok(())
    }

    async fn prepare_keeper_config(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .keeper_blocks
            .entry(instance_id.to_owned())
            .or_insert(0);
        self.update_keeper_block_number(instance_id, block_number)
            .await
    }

    async fn get_keeper_block_number(&self, instance_id: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .keeper_blocks
            .get(instance_id)
            .copied()
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    async fn update_keeper_block_number(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(stored) = inner.keeper_blocks.get_mut(instance_id)
            && *stored < block_number
        {
            *stored = block_number;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;

    use super::*;

    fn pending(hash: u8, payer: Address, receiver: Address, amount: u64, tx_nonce: u64) -> NewPendingTx {
        NewPendingTx {
            tx_hash: B256::repeat_byte(hash),
            payer,
            receiver,
            amount: U256::from(amount),
            permit_nonce: U256::from(tx_nonce),
            tx_signed: vec![hash],
            tx_nonce,
        }
    }

    const PAYER: Address = address!("0xddDDd3bf0B0d7df20B0376b51b8c9e8F5968Ae4B");
    const RECEIVER: Address = address!("0x0987654321098765432109876543210987654321");

    #[tokio::test]
    async fn projection_tracks_pending_rows() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(1, PAYER, RECEIVER, 30, 0)).await.unwrap();
        store.add_tx_pending(pending(2, PAYER, RECEIVER, 12, 1)).await.unwrap();

        assert_eq!(
            store.get_pending_balance(PAYER).await.unwrap(),
            I256::try_from(-42i64).unwrap()
        );
        assert_eq!(
            store.get_pending_balance(RECEIVER).await.unwrap(),
            I256::try_from(42i64).unwrap()
        );
        assert_eq!(store.get_pending_txs(PAYER).await.unwrap(), 2);
        assert_eq!(store.get_pending_txs(RECEIVER).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn projection_is_recomputed_after_moves() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(1, PAYER, RECEIVER, 30, 0)).await.unwrap();
        store.add_tx_pending(pending(2, PAYER, RECEIVER, 12, 1)).await.unwrap();

        let moved = store
            .update_tx_pending_to_submitted(B256::repeat_byte(1))
            .await
            .unwrap();
        assert_eq!(moved.unwrap().amount, U256::from(30));

        assert_eq!(
            store.get_pending_balance(PAYER).await.unwrap(),
            I256::try_from(-12i64).unwrap()
        );
        assert_eq!(store.get_pending_txs(PAYER).await.unwrap(), 1);
        assert_eq!(store.submitted().len(), 1);
    }

    #[tokio::test]
    async fn moves_are_idempotent() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(1, PAYER, RECEIVER, 30, 0)).await.unwrap();

        let hash = B256::repeat_byte(1);
        assert!(store.update_tx_pending_to_fail(hash).await.unwrap().is_some());
        assert!(store.update_tx_pending_to_fail(hash).await.unwrap().is_none());
        assert!(store.update_tx_pending_to_submitted(hash).await.unwrap().is_none());
        assert_eq!(store.failed().len(), 1);
        assert!(store.submitted().is_empty());
    }

    #[tokio::test]
    async fn pending_rows_are_ordered_by_tx_nonce() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(3, PAYER, RECEIVER, 1, 9)).await.unwrap();
        store.add_tx_pending(pending(1, PAYER, RECEIVER, 1, 4)).await.unwrap();
        store.add_tx_pending(pending(2, PAYER, RECEIVER, 1, 7)).await.unwrap();

        let nonces: Vec<u64> = store
            .get_all_tx_pending(10)
            .await
            .unwrap()
            .iter()
            .map(|tx| tx.tx_nonce)
            .collect();
        assert_eq!(nonces, vec![4, 7, 9]);

        let limited = store.get_all_tx_pending(2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected_without_clobbering() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(1, PAYER, RECEIVER, 30, 0)).await.unwrap();
        assert!(store.add_tx_pending(pending(1, PAYER, RECEIVER, 99, 5)).await.is_err());

        let row = store.get_tx_pending(B256::repeat_byte(1)).await.unwrap().unwrap();
        assert_eq!(row.amount, U256::from(30));
    }

    #[tokio::test]
    async fn failed_rows_are_ordered_by_payer_and_permit_nonce() {
        let store = MemoryStore::new();
        store.add_tx_pending(pending(1, RECEIVER, PAYER, 1, 8)).await.unwrap();
        store.add_tx_pending(pending(2, PAYER, RECEIVER, 1, 3)).await.unwrap();
        store.add_tx_pending(pending(3, PAYER, RECEIVER, 1, 1)).await.unwrap();
        for hash in 1..=3 {
            store
                .update_tx_pending_to_fail(B256::repeat_byte(hash))
                .await
                .unwrap();
        }

        let failed = store.get_all_tx_fail(10).await.unwrap();
        let order: Vec<(Address, u64)> = failed
            .iter()
            .map(|tx| (tx.payer, tx.permit_nonce.to::<u64>()))
            .collect();
        assert_eq!(order, vec![(RECEIVER, 8), (PAYER, 1), (PAYER, 3)]);
    }

    #[tokio::test]
    async fn cursors_are_monotone() {
        let store = MemoryStore::new();
        let account = PAYER;

        store.prepare_signer_config(account).await.unwrap();
        store.update_signer_tx_nonce(account, 5).await.unwrap();
        store.update_signer_tx_nonce(account, 3).await.unwrap();
        assert_eq!(store.get_signer_tx_nonce(account).await.unwrap(), 5);

        store.prepare_keeper_config("dev", 100).await.unwrap();
        store.update_keeper_block_number("dev", 90).await.unwrap();
        assert_eq!(store.get_keeper_block_number("dev").await.unwrap(), 100);
        store.update_keeper_block_number("dev", 110).await.unwrap();
        assert_eq!(store.get_keeper_block_number("dev").await.unwrap(), 110);
    }
}
