//! Append-only, hash-chained ledger recording the outcome of email-voted
//! requests, with a small HTTP front end for opening and closing them.
//!
//! ```text
//! POST /request ──► RequestBlock ─┐
//!                                 ├─► Chain ──► local_chain.json
//! POST /bundle  ──► BundleBlock ──┘
//! ```

pub mod config;
pub mod crypto;
pub mod message;
pub mod model;
pub mod routes;
pub mod storage;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};

use storage::LocalChain;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Mutex<LocalChain>>,
    /// Held for the duration of a snapshot write.
    pub save_lock: Arc<tokio::sync::Mutex<()>>,
    pub save_timeout: Duration,
}

impl AppState {
    pub fn new(local: LocalChain, save_timeout: Duration) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(local)),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
            save_timeout,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/request", post(routes::open_request))
        .route("/bundle", post(routes::close_request))
        .route("/bundle/email", post(routes::close_request_from_email))
        .route("/bundle/:request_id", get(routes::get_bundle))
        .route("/blocks", get(routes::list_blocks))
        .route("/block/:hash", get(routes::get_block))
        .route("/validate", get(routes::validate_chain))
        .route("/health", get(routes::health))
        .route("/version", get(routes::version))
        .with_state(state)
}
