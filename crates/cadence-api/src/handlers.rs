//! Route handler functions for all API endpoints.
//!
//! Handlers resolve the account's worker handle from the path and forward the
//! command to it. Schedule bodies use the same shape as the WebSocket
//! commands, so both transports go through `AccountHandle::execute`.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use cadence_core::events::{AccountSettings, ClientCommand, EngagementKind, ScheduleRequest};
use cadence_core::types::{
    AutomationOverview, AutomationStatus, Priority, QueueItem, QuotaSnapshot, SafetyAlert,
    SafetyStatus,
};
use cadence_scheduler::{ResumeOutcome, Subscription};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Request / response types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ScheduleConnectionBody {
    #[serde(flatten)]
    pub request: ScheduleRequest,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEngagementBody {
    pub engagement: EngagementKind,
    #[serde(flatten)]
    pub request: ScheduleRequest,
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EmergencyStopBody {
    pub reason: Option<String>,
    pub compliance_violation: bool,
}

#[derive(Debug, Deserialize)]
pub struct AdminClearBody {
    pub operator: String,
}

#[derive(Debug, Deserialize)]
pub struct PriorityBody {
    pub priority: Priority,
}

#[derive(Debug, Deserialize)]
pub struct ReorderBody {
    pub item_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReorderResponse {
    pub order: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearQueueResponse {
    pub cancelled: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_accounts: usize,
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_accounts: state.registry.active_accounts().len(),
    })
}

// =============================================================================
// Queue
// =============================================================================

/// GET /automation/{account_id}/overview - counts, safety summary and automation flags.
pub async fn overview(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AutomationOverview>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.overview().await?))
}

/// GET /automation/{account_id}/queue - items in dispatch order.
pub async fn list_queue(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.list().await?))
}

/// DELETE /automation/{account_id}/queue - cancel every non-terminal item.
pub async fn clear_queue(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<ClearQueueResponse>, ApiError> {
    let handle = state.account(&account_id)?;
    let cancelled = handle.clear_queue().await?;
    Ok(Json(ClearQueueResponse { cancelled }))
}

/// POST /automation/{account_id}/connections/schedule
pub async fn schedule_connection(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Result<Json<ScheduleConnectionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let handle = state.account(&account_id)?;
    let created = handle
        .execute(ClientCommand::ScheduleConnection {
            request: body.request,
            note: body.note,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /automation/{account_id}/engagement/schedule
pub async fn schedule_engagement(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Result<Json<ScheduleEngagementBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body?;
    let handle = state.account(&account_id)?;
    let created = handle
        .execute(ClientCommand::ScheduleEngagement {
            engagement: body.engagement,
            request: body.request,
            comment: body.comment,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /automation/{account_id}/queue/reorder
pub async fn reorder_queue(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Result<Json<ReorderBody>, JsonRejection>,
) -> Result<Json<ReorderResponse>, ApiError> {
    let Json(body) = body?;
    let handle = state.account(&account_id)?;
    let order = handle.reorder(body.item_ids).await?;
    Ok(Json(ReorderResponse { order }))
}

/// POST /automation/{account_id}/queue/{item_id}/cancel
pub async fn cancel_item(
    State(state): State<AppState>,
    Path((account_id, item_id)): Path<(String, Uuid)>,
) -> Result<Json<QueueItem>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.cancel(item_id).await?))
}

/// POST /automation/{account_id}/queue/{item_id}/retry
pub async fn retry_item(
    State(state): State<AppState>,
    Path((account_id, item_id)): Path<(String, Uuid)>,
) -> Result<Json<QueueItem>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.retry(item_id).await?))
}

/// PUT /automation/{account_id}/queue/{item_id}/priority
pub async fn update_priority(
    State(state): State<AppState>,
    Path((account_id, item_id)): Path<(String, Uuid)>,
    body: Result<Json<PriorityBody>, JsonRejection>,
) -> Result<Json<QueueItem>, ApiError> {
    let Json(body) = body?;
    let handle = state.account(&account_id)?;
    Ok(Json(handle.update_priority(item_id, body.priority).await?))
}

// =============================================================================
// Emergency stop
// =============================================================================

/// POST /automation/{account_id}/emergency-stop - the body is optional.
pub async fn emergency_stop(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Bytes,
) -> Result<Json<AutomationStatus>, ApiError> {
    let body: EmergencyStopBody = if body.is_empty() {
        EmergencyStopBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid emergency stop body: {}", e)))?
    };
    let handle = state.account(&account_id)?;
    let status = handle
        .emergency_stop(body.reason, body.compliance_violation)
        .await?;
    Ok(Json(status))
}

/// POST /automation/{account_id}/resume
///
/// Fails with `manual_clearance_required` (423) after a compliance stop and
/// `not_eligible` (409) while a score stop is still recovering.
pub async fn resume(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<ResumeOutcome>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.resume().await?))
}

/// POST /automation/{account_id}/admin/clear - administrative clearance of a stop.
pub async fn admin_clear(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Result<Json<AdminClearBody>, JsonRejection>,
) -> Result<Json<ResumeOutcome>, ApiError> {
    let Json(body) = body?;
    if body.operator.trim().is_empty() {
        return Err(ApiError::Validation(
            "operator must not be empty".to_string(),
        ));
    }
    let handle = state.account(&account_id)?;
    tracing::warn!(account_id = %account_id, operator = %body.operator, "Administrative clearance requested");
    Ok(Json(handle.admin_resume(body.operator).await?))
}

// =============================================================================
// Safety and quota
// =============================================================================

/// GET /automation/{account_id}/safety/status
pub async fn safety_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<SafetyStatus>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.safety_status().as_ref().clone()))
}

/// GET /automation/{account_id}/safety/alerts - full history, newest first.
pub async fn safety_alerts(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Vec<SafetyAlert>>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.alerts()))
}

/// POST /automation/{account_id}/safety/alerts/{alert_id}/acknowledge
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path((account_id, alert_id)): Path<(String, Uuid)>,
) -> Result<Json<SafetyStatus>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.acknowledge_alert(alert_id).await?))
}

/// GET /automation/{account_id}/quota
pub async fn quota(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<QuotaSnapshot>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.quota()))
}

/// GET /automation/{account_id}/settings
pub async fn get_settings(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountSettings>, ApiError> {
    let handle = state.account(&account_id)?;
    Ok(Json(handle.settings().await?))
}

/// PUT /automation/{account_id}/settings - limits above the hard ceiling are rejected.
pub async fn update_settings(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    body: Result<Json<AccountSettings>, JsonRejection>,
) -> Result<Json<AccountSettings>, ApiError> {
    let Json(settings) = body?;
    let handle = state.account(&account_id)?;
    Ok(Json(handle.update_settings(settings).await?))
}

// =============================================================================
// Observer stream
// =============================================================================

/// GET /automation/{account_id}/stream - SSE observer stream.
///
/// Read-only counterpart of the WebSocket channel: a snapshot followed by
/// sequenced deltas. Consuming envelopes counts as liveness.
pub async fn stream(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let handle = state.account(&account_id)?;
    let Subscription {
        receiver, liveness, ..
    } = handle.subscribe().await?;

    let stream = ReceiverStream::new(receiver).map(move |envelope| {
        liveness.touch();
        Ok(Event::default()
            .event(envelope.message.event_name())
            .id(envelope.seq.to_string())
            .data(envelope.to_json()))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
