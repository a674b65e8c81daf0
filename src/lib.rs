//! JSON-RPC meta-transaction relayer for an EIP-2612 permit token.
//!
//! End users sign EIP-712 `Permit` authorizations off-chain; the relayer
//! validates them, wraps them in `transferWithPermit` transactions paid for
//! by a relayer-controlled account, batches them out to the chain, and
//! reconciles their on-chain outcomes against a Postgres-backed store.
//!
//! The inbound JSON-RPC surface is a transparent superset of the standard
//! Ethereum surface: token `balanceOf` / `nonces` reads are augmented with
//! pending-state projections, `delegate_permit` accepts new authorizations,
//! and everything else is forwarded verbatim to the upstream node.
//!
//! # Modules
//!
//! - [`config`] — TOML configuration and loading
//! - [`permit`] — EIP-712 `Permit` typed data and signature recovery
//! - [`rpc`] — JSON-RPC envelope helpers and parameter types
//! - [`upstream`] — verbatim JSON-RPC forwarding client
//! - [`chain`] — typed upstream node operations
//! - [`store`] — durable transaction state and balance projections
//! - [`processor`] — JSON-RPC dispatch and the `delegate_permit` pipeline
//! - [`signer`] — transaction building, signing, and the sender loop
//! - [`keeper`] — block-scanning reconciliation loop
//! - [`server`] — Axum router for the inbound proxy

pub mod chain;
pub mod config;
pub mod keeper;
pub mod permit;
pub mod processor;
pub mod rpc;
pub mod server;
pub mod signer;
pub mod store;
pub mod upstream;
