//! Billing state endpoints for internal callers

use axum::{
    extract::{Path, State},
    Json,
};
use billsync_billing::{ProcessedEvent, SyncResult};
use billsync_shared::CanonicalSnapshot;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Reconcile the user now. Always 200; failures come back as `success: false`.
pub async fn force_sync(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<SyncResult> {
    let result = state.billing.sync.force_sync(&user_id).await;
    if !result.success {
        tracing::warn!(
            user_id = %user_id,
            error = ?result.error,
            "Forced sync degraded to cached data"
        );
    }
    Json(result)
}

/// Stored snapshot, no provider access
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<CanonicalSnapshot>> {
    let snapshot = state
        .billing
        .sync
        .cached(&user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(snapshot))
}

/// Audit row for a processed event
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ProcessedEvent>> {
    let event = state
        .billing
        .ledger
        .get(&event_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(event))
}
