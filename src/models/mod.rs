//! Core data models for the song store.
//!
//! These entities map to SQLite rows via `sqlx::FromRow` and serialize as
//! JSON via `serde` at the HTTP boundary.

pub mod song;
pub mod stored_object;
pub mod user;
