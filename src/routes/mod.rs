//! Route gateway: merges one sub-router per resource and attaches the shared
//! state. `main.rs` only ever calls [`router`].

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::cancel::Cancel;
use crate::error::Error;
use crate::join::TreeJoin;
use crate::registry::Registry;
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::Config;

mod health;
mod readings;
mod sensors;
mod trees;

// ---

/// Services shared by every handler. Each one holds its own handle on the
/// store; none of them holds a transaction between calls.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub telemetry: Telemetry,
    pub trees: TreeJoin,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        // ---
        AppState {
            registry: Registry::new(store.clone()),
            telemetry: Telemetry::new(store.clone()),
            trees: TreeJoin::new(store),
            request_timeout: config.request_timeout,
        }
    }

    /// Fresh cancellation token for one request.
    pub fn cancel(&self) -> Cancel {
        Cancel::with_timeout(self.request_timeout)
    }
}

pub fn router(store: Arc<dyn Store>, config: &Config) -> Router {
    // ---
    Router::new()
        .merge(sensors::router())
        .merge(readings::router())
        .merge(trees::router())
        .merge(health::router())
        .with_state(AppState::new(store, config))
}

/// Map an extractor rejection (bad JSON, bad query, bad path) to the error
/// envelope.
fn rejected(rejection: impl std::fmt::Display) -> Error {
    Error::BadRequest(rejection.to_string())
}
