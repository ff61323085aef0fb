//! ClovisGate library — S3-compatible gateway in front of a
//! Motr/Clovis-style backing store.
//!
//! This crate provides the core components for running the gateway:
//! request handling, authentication, the action pipeline that drives
//! the PutPart operation, the unified backing-store client, and the
//! minimal supporting S3 surface needed to exercise it end to end.

use std::sync::Arc;

pub mod action;
pub mod actions;
pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod records;
pub mod request;
pub mod server;
pub mod store;
pub mod xml;

use crate::config::Config;
use crate::store::ObjectStoreClient;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Unified backing-store client (KV indexes + object containers).
    pub store: Arc<dyn ObjectStoreClient>,
    /// SigV4 credential and signing-key cache.
    pub auth_cache: auth::AuthCache,
}
