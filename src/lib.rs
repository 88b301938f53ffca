//! Song store: a metadata-indexed object store for audio files.
//!
//! Uploaded payloads are kept in SQLite as ordered fixed-size chunks,
//! published atomically, indexed by song metadata and streamed back to
//! clients through a bounded relay.

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

use axum::Router;
use state::AppState;

/// Router with every route mounted and `state` attached.
pub fn app(state: AppState) -> Router {
    routes::routes::routes(state.max_upload_bytes).with_state(state)
}
