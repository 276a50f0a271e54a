//! Fanout relay server library.
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod relay;
pub mod state;
pub mod ws;

use anyhow::Result;

/// Create and configure the relay application. Must be called inside a
/// Tokio runtime: the relay spawns its background tasks on creation.
pub fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(config)?;
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
