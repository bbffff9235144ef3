//! HTTP routes

pub mod billing;
pub mod webhooks;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_internal_token, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Called by trusted services only
    let internal = Router::new()
        .route("/billing/users/{user_id}/sync", post(billing::force_sync))
        .route(
            "/billing/users/{user_id}/subscription",
            get(billing::get_subscription),
        )
        .route("/billing/events/{event_id}", get(billing::get_event))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_internal_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(internal)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
