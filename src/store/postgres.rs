//! Postgres-backed [`TxStore`].
//!
//! Schema is created on connect. Amounts, nonces, and cursors live in
//! NUMERIC columns and cross the wire as decimal text so 256-bit values
//! never lose precision; addresses and hashes are lowercased hex text.
//!
//! An internal mutex is held for the duration of every method that touches
//! the pending tables or the projection, serializing the multi-statement
//! "mutate then recompute projection" sequences so callers observe them as
//! atomic. Each sequence also runs inside a database transaction.

use alloy_primitives::{Address, B256, I256, U256};
use chrono::NaiveDateTime;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tokio::sync::Mutex;

use super::{NewPendingTx, PendingTx, StoreError, TxStore, hex_key};
use crate::config::DbConfig;

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS tx_pending (
        tx_hash VARCHAR PRIMARY KEY,
        payer VARCHAR,
        receiver VARCHAR,
        amount NUMERIC,
        permit_nonce NUMERIC,
        tx_signed BYTEA,
        tx_nonce NUMERIC,
        timestamp TIMESTAMP DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS tx_submitted (
        tx_hash VARCHAR PRIMARY KEY,
        payer VARCHAR,
        receiver VARCHAR,
        amount NUMERIC,
        permit_nonce NUMERIC,
        tx_signed BYTEA,
        tx_nonce NUMERIC,
        timestamp TIMESTAMP,
        timestamp_submitted TIMESTAMP DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS tx_fail (
        tx_hash VARCHAR PRIMARY KEY,
        payer VARCHAR,
        receiver VARCHAR,
        amount NUMERIC,
        permit_nonce NUMERIC,
        tx_signed BYTEA,
        tx_nonce NUMERIC,
        timestamp TIMESTAMP,
        timestamp_fail TIMESTAMP DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS account_balance (
        account VARCHAR PRIMARY KEY,
        pending_balance NUMERIC,
        pending_txs NUMERIC
    )",
    r"CREATE TABLE IF NOT EXISTS signer_config (
        account VARCHAR PRIMARY KEY,
        tx_nonce NUMERIC,
        timestamp TIMESTAMP DEFAULT NOW()
    )",
    r"CREATE TABLE IF NOT EXISTS keeper_config (
        instance_id VARCHAR PRIMARY KEY,
        block_number NUMERIC,
        timestamp TIMESTAMP DEFAULT NOW()
    )",
];

const TX_COLUMNS: &str = "tx_hash, payer, receiver, amount::TEXT AS amount, \
     permit_nonce::TEXT AS permit_nonce, tx_signed, tx_nonce::TEXT AS tx_nonce, timestamp";

/// Postgres-backed store.
#[derive(Debug)]
pub struct PgStore {
    pool: PgPool,
    mutex: Mutex<()>,
}

impl PgStore {
    /// Connects to the database and creates the schema if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on connection or DDL failure; fatal at
    /// startup.
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            mutex: Mutex::new(()),
        })
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Deletes and re-inserts the projection row for `account`, recomputed
    /// over the current contents of `tx_pending`.
    async fn recompute_projection(
        conn: &mut PgConnection,
        account: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM account_balance WHERE account = $1")
            .bind(account)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r"INSERT INTO account_balance (account, pending_balance, pending_txs)
            SELECT $1,
                (SELECT COALESCE(SUM(amount), 0) FROM tx_pending WHERE receiver = $1) -
                (SELECT COALESCE(SUM(amount), 0) FROM tx_pending WHERE payer = $1),
                (SELECT COUNT(*) FROM tx_pending WHERE payer = $1)",
        )
        .bind(account)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn fetch_pending(
        conn: &mut PgConnection,
        tx_hash: &str,
    ) -> Result<Option<PendingTx>, StoreError> {
        let query = format!("SELECT {TX_COLUMNS} FROM tx_pending WHERE tx_hash = $1");
        let row = sqlx::query(&query)
            .bind(tx_hash)
            .fetch_optional(conn)
            .await?;
        row.map(|row| decode_tx(&row)).transpose()
    }

    /// Moves a pending row into `target` in one statement, then recomputes
    /// both affected projections. `None` when no pending row exists.
    async fn move_pending(
        &self,
        tx_hash: B256,
        target: &str,
        stamp_column: &str,
    ) -> Result<Option<PendingTx>, StoreError> {
        let _guard = self.mutex.lock().await;
        let key = hex_key(tx_hash);

        let mut txn = self.pool.begin().await?;
        let Some(pending) = Self::fetch_pending(&mut txn, &key).await? else {
            return Ok(None);
        };

        let query = format!(
            r"WITH moved_records AS (
                INSERT INTO {target}
                    (tx_hash, payer, receiver, amount, permit_nonce, tx_signed, tx_nonce,
                     timestamp, {stamp_column})
                SELECT tx_hash, payer, receiver, amount, permit_nonce, tx_signed, tx_nonce,
                       timestamp, NOW()
                FROM tx_pending
                WHERE tx_hash = $1
                RETURNING tx_hash
            )
            DELETE FROM tx_pending
            WHERE tx_hash IN (SELECT tx_hash FROM moved_records)"
        );
        sqlx::query(&query).bind(&key).execute(&mut *txn).await?;

        Self::recompute_projection(&mut txn, &hex_key(pending.payer)).await?;
        Self::recompute_projection(&mut txn, &hex_key(pending.receiver)).await?;
        txn.commit().await?;

        Ok(Some(pending))
    }

    async fn fetch_projection_column(
        &self,
        account: Address,
        column: &str,
    ) -> Result<String, StoreError> {
        let key = hex_key(account);
        let query =
            format!("SELECT {column}::TEXT AS value FROM account_balance WHERE account = $1");

        let row = sqlx::query(&query)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            Some(row) => row,
            None => {
                // Materialize the projection on demand, then re-read.
                let mut txn = self.pool.begin().await?;
                Self::recompute_projection(&mut txn, &key).await?;
                txn.commit().await?;
                sqlx::query(&query).bind(&key).fetch_one(&self.pool).await?
            }
        };
        Ok(row.try_get("value")?)
    }
}

impl TxStore for PgStore {
    async fn add_tx_pending(&self, tx: NewPendingTx) -> Result<(), StoreError> {
        let _guard = self.mutex.lock().await;
        let payer = hex_key(tx.payer);
        let receiver = hex_key(tx.receiver);

        let mut txn = self.pool.begin().await?;
        sqlx::query(
            r"INSERT INTO tx_pending
                (tx_hash, payer, receiver, amount, permit_nonce, tx_signed, tx_nonce, timestamp)
            VALUES ($1, $2, $3, $4::NUMERIC, $5::NUMERIC, $6, $7::NUMERIC, NOW())",
        )
        .bind(hex_key(tx.tx_hash))
        .bind(&payer)
        .bind(&receiver)
        .bind(tx.amount.to_string())
        .bind(tx.permit_nonce.to_string())
        .bind(&tx.tx_signed)
        .bind(tx.tx_nonce.to_string())
        .execute(&mut *txn)
        .await?;

        Self::recompute_projection(&mut txn, &payer).await?;
        Self::recompute_projection(&mut txn, &receiver).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn get_tx_pending(&self, tx_hash: B256) -> Result<Option<PendingTx>, StoreError> {
        let _guard = self.mutex.lock().await;
        let mut conn = self.pool.acquire().await?;
        Self::fetch_pending(&mut conn, &hex_key(tx_hash)).await
    }

    async fn get_all_tx_pending(&self, limit: i64) -> Result<Vec<PendingTx>, StoreError> {
        let _guard = self.mutex.lock().await;
        let query = format!("SELECT {TX_COLUMNS} FROM tx_pending ORDER BY tx_nonce LIMIT $1");
        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(decode_tx).collect()
    }

    async fn get_all_tx_fail(&self, limit: i64) -> Result<Vec<PendingTx>, StoreError> {
        let _guard = self.mutex.lock().await;
        let query =
            format!("SELECT {TX_COLUMNS} FROM tx_fail ORDER BY payer, permit_nonce LIMIT $1");
        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(decode_tx).collect()
    }

    async fn update_tx_pending_to_submitted(
        &self,
        tx_hash: B256,
    ) -> Result<Option<PendingTx>, StoreError> {
        self.move_pending(tx_hash, "tx_submitted", "timestamp_submitted")
            .await
    }

    async fn update_tx_pending_to_fail(
        &self,
        tx_hash: B256,
    ) -> Result<Option<PendingTx>, StoreError> {
        self.move_pending(tx_hash, "tx_fail", "timestamp_fail").await
    }

    async fn get_pending_balance(&self, account: Address) -> Result<I256, StoreError> {
        let _guard = self.mutex.lock().await;
        let value = self
            .fetch_projection_column(account, "pending_balance")
            .await?;
        I256::from_dec_str(&value)
            .map_err(|_| StoreError::Corrupt(format!("pending_balance: {value}")))
    }

    async fn get_pending_txs(&self, account: Address) -> Result<u64, StoreError> {
        let _guard = self.mutex.lock().await;
        let value = self.fetch_projection_column(account, "pending_txs").await?;
        value
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("pending_txs: {value}")))
    }

    async fn prepare_signer_config(&self, account: Address) -> Result<(), StoreError> {
        let _guard = self.mutex.lock().await;
        sqlx::query(
            r"INSERT INTO signer_config (account, tx_nonce, timestamp)
            VALUES ($1, '0', NOW())
            ON CONFLICT (account) DO NOTHING",
        )
        .bind(hex_key(account))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_signer_tx_nonce(&self, account: Address) -> Result<u64, StoreError> {
        let _guard = self.mutex.lock().await;
        let row = sqlx::query("SELECT tx_nonce::TEXT AS tx_nonce FROM signer_config WHERE account = $1")
            .bind(hex_key(account))
            .fetch_one(&self.pool)
            .await?;
        let value: String = row.try_get("tx_nonce")?;
        value
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("tx_nonce: {value}")))
    }

    async fn update_signer_tx_nonce(&self, account: Address, tx_nonce: u64) -> Result<(), StoreError> {
        let _guard = self.mutex.lock().await;
        sqlx::query(
            r"UPDATE signer_config SET tx_nonce = $2::NUMERIC, timestamp = NOW()
            WHERE account = $1 AND tx_nonce < $2::NUMERIC",
        )
        .bind(hex_key(account))
        .bind(tx_nonce.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prepare_keeper_config(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO keeper_config (instance_id, block_number, timestamp)
            VALUES ($1, '0', NOW())
            ON CONFLICT (instance_id) DO NOTHING",
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        self.update_keeper_block_number(instance_id, block_number)
            .await
    }

    async fn get_keeper_block_number(&self, instance_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT block_number::TEXT AS block_number FROM keeper_config WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        let value: String = row.try_get("block_number")?;
        value
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("block_number: {value}")))
    }

    async fn update_keeper_block_number(
        &self,
        instance_id: &str,
        block_number: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"UPDATE keeper_config SET block_number = $2::NUMERIC, timestamp = NOW()
            WHERE instance_id = $1 AND block_number < $2::NUMERIC",
        )
        .bind(instance_id)
        .bind(block_number.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_tx(row: &PgRow) -> Result<PendingTx, StoreError> {
    let tx_hash: String = row.try_get("tx_hash")?;
    let payer: String = row.try_get("payer")?;
    let receiver: String = row.try_get("receiver")?;
    let amount: String = row.try_get("amount")?;
    let permit_nonce: String = row.try_get("permit_nonce")?;
    let tx_signed: Vec<u8> = row.try_get("tx_signed")?;
    let tx_nonce: String = row.try_get("tx_nonce")?;
    let timestamp: NaiveDateTime = row.try_get("timestamp")?;

    Ok(PendingTx {
        tx_hash: tx_hash
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("tx_hash: {tx_hash}")))?,
        payer: payer
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("payer: {payer}")))?,
        receiver: receiver
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("receiver: {receiver}")))?,
        amount: U256::from_str_radix(&amount, 10)
            .map_err(|_| StoreError::Corrupt(format!("amount: {amount}")))?,
        permit_nonce: U256::from_str_radix(&permit_nonce, 10)
            .map_err(|_| StoreError::Corrupt(format!("permit_nonce: {permit_nonce}")))?,
        tx_signed,
        tx_nonce: tx_nonce
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("tx_nonce: {tx_nonce}")))?,
        timestamp,
    })
}
