//! Core data models for the credential broker.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as JSON via `serde`.

pub mod bucket;
pub mod credentials;
pub mod fetch_request;
pub mod object;
