//! Relayer configuration.
//!
//! Loaded from a TOML file named by the `--config` flag. All intervals are
//! plain millisecond counts; `deadline_minimum` is in seconds.
//!
//! # Example Configuration
//!
//! ```toml
//! network_id = 11155111
//! rpc_endpoint = "https://ethereum-sepolia.example.org"
//! proxy_port = 8545
//! erc20_permit_token_name = "Digital10kToken"
//! erc20_permit_token_address = "0xFF2F0676e588bdCA786eBF25d55362d4488Fad64"
//! deadline_minimum = 7776000
//!
//! [signer]
//! enable = true
//! keystore_file_path = "./.keystore"
//! password = "unlock_password"
//! gas_price = 5000000000
//! gas_limit = 3000000
//! sender_interval = 60000
//! sender_bulk_size = 50
//!
//! [keeper]
//! enable = true
//! instance_id = "dev"
//! initial_sync_block_number = 4353360
//! block_batch_limit = 20
//! syncing_interval = 100
//! latest_interval = 1500
//!
//! [db]
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! password = "password"
//! database = "relayer_db"
//! ```

use std::path::{Path, PathBuf};

use alloy_primitives::Address;
use serde::Deserialize;

/// Top-level relayer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Chain id used for EIP-155 signing and the EIP-712 domain.
    pub network_id: u64,

    /// Upstream Ethereum JSON-RPC endpoint. An archive node is required
    /// when the keeper is enabled.
    pub rpc_endpoint: String,

    /// Inbound proxy listen port.
    pub proxy_port: u16,

    /// EIP-712 domain name of the permit token.
    pub erc20_permit_token_name: String,

    /// Address of the permit token contract.
    pub erc20_permit_token_address: Address,

    /// Minimum remaining permit lifetime, in seconds.
    pub deadline_minimum: u64,

    pub signer: SignerConfig,
    pub keeper: KeeperConfig,
    pub db: DbConfig,

    /// Lowers the default log filter to `debug` when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_debug: bool,
}

/// Transaction sender configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Whether the sender loop runs and `delegate_permit` is accepted.
    pub enable: bool,

    /// Path to the relayer account's encrypted keystore file.
    pub keystore_file_path: PathBuf,

    /// Keystore unlock password.
    pub password: String,

    /// Gas price in wei for outbound legacy transactions.
    pub gas_price: u128,

    /// Gas limit for outbound transactions.
    pub gas_limit: u64,

    /// Sleep between sender batches, in milliseconds.
    pub sender_interval: u64,

    /// Maximum pending transactions dispatched per batch (default: 50).
    #[serde(default = "default_sender_bulk_size")]
    pub sender_bulk_size: i64,
}

/// Chain scanner configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KeeperConfig {
    /// Whether the sync loop runs.
    pub enable: bool,

    /// Unique id for this keeper's block cursor row.
    pub instance_id: String,

    /// Block the cursor is forced up to on startup.
    pub initial_sync_block_number: u64,

    /// Maximum blocks processed per iteration while catching up.
    pub block_batch_limit: u64,

    /// Sleep between iterations while behind the chain head, in milliseconds.
    pub syncing_interval: u64,

    /// Sleep between iterations once caught up, in milliseconds.
    pub latest_interval: u64,
}

/// Postgres connection parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

fn default_sender_bulk_size() -> i64 {
    50
}

/// Errors from loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML or is missing required keys.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Config {
    /// Loads and parses the configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed; the
    /// caller is expected to treat this as fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
impl Config {
    /// A fully populated configuration for unit tests.
    pub(crate) fn for_tests() -> Self {
        use alloy_primitives::address;

        Self {
            network_id: 1,
            rpc_endpoint: "http://localhost:8545".to_owned(),
            proxy_port: 8545,
            erc20_permit_token_name: "Test".to_owned(),
            erc20_permit_token_address: address!("0xFF2F0676e588bdCA786eBF25d55362d4488Fad64"),
            deadline_minimum: 90 * 24 * 60 * 60,
            signer: SignerConfig {
                enable: true,
                keystore_file_path: PathBuf::from("./.keystore"),
                password: "unlock_password".to_owned(),
                gas_price: 5_000_000_000,
                gas_limit: 3_000_000,
                sender_interval: 60_000,
                sender_bulk_size: 50,
            },
            keeper: KeeperConfig {
                enable: true,
                instance_id: "test".to_owned(),
                initial_sync_block_number: 0,
                block_batch_limit: 20,
                syncing_interval: 100,
                latest_interval: 1500,
            },
            db: DbConfig {
                host: "localhost".to_owned(),
                port: 5432,
                user: "postgres".to_owned(),
                password: "password".to_owned(),
                database: "relayer_db".to_owned(),
            },
            log_debug: false,
        }
    }
}
