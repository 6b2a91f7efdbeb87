//! Server module
//!
//! The single WebSocket endpoint plus a liveness route, sharing one
//! `AppState`.

pub mod health;
pub mod limits;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;

use crate::auth::TokenValidator;
use crate::broker::Manager;
use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub validator: TokenValidator,
    pub limits: limits::ConnectionTracker,
    pub started: Instant,
}

impl AppState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            manager: Arc::new(Manager::new()),
            validator: TokenValidator::new(&settings.jwt_secret),
            limits: limits::ConnectionTracker::new(),
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
