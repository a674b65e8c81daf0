//! Axum router for the inbound JSON-RPC proxy.
//!
//! The whole surface is `POST /`; processor failures become JSON-RPC error
//! bodies with code `-1` and HTTP status 200, matching what wallet clients
//! expect from a node. A `GET /health` endpoint reports liveness.

use std::sync::Arc;

use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};

use crate::chain::ChainClient;
use crate::processor::RequestProcessor;
use crate::rpc;
use crate::store::TxStore;

/// `POST /` — the intercepted JSON-RPC surface.
async fn handle_rpc<S, C>(
    State(processor): State<Arc<RequestProcessor<S, C>>>,
    Json(request): Json<Value>,
) -> Json<Value>
where
    S: TxStore + 'static,
    C: ChainClient + 'static,
{
    let id = rpc::request_id(&request);
    match processor.process(request).await {
        Ok(response) => Json(response),
        Err(err) => {
            tracing::error!(error = %err, "failed to process request");
            Json(rpc::error_response(
                id,
                rpc::PROCESSOR_ERROR_CODE,
                &err.to_string(),
            ))
        }
    }
}

/// `GET /health` — liveness probe.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Builds the proxy router with a permissive CORS layer so browser wallets
/// can talk to the relayer directly.
pub fn router<S, C>(processor: Arc<RequestProcessor<S, C>>) -> Router
where
    S: TxStore + 'static,
    C: ChainClient + 'static,
{
    Router::new()
        .route("/", post(handle_rpc::<S, C>))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(processor)
}
