//! ==============================================================================
//! api.rs - operator control api
//! ==============================================================================
//!
//! purpose:
//!     thin json layer over the session manager. every handler maps one
//!     operator action onto one manager call; errors render through
//!     `Error::into_response`.
//!
//! routes:
//!     GET  /api/devices                       registry + session status
//!     POST /api/devices/connect               body: {mac?, ip?}
//!     POST /api/devices/disconnect            body: {mac?, ip?}
//!     POST /api/devices/interval              body: {mac?, ip?, interval}
//!     GET  /api/devices/:id/readings          ?from=&to= (epoch seconds)
//!     POST /api/discover                      ?include_known=
//!     GET  /api/notifications                 recent history
//!
//! ==============================================================================

use crate::domain::{DeviceId, DeviceIdentity, Reading};
use crate::error::Result;
use crate::manager::{DeviceView, SessionManager};
use crate::notify::{Notification, NotificationHub};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<SessionManager>,
    pub hub: Arc<NotificationHub>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/connect", post(connect))
        .route("/api/devices/disconnect", post(disconnect))
        .route("/api/devices/interval", post(change_interval))
        .route("/api/devices/:id/readings", get(readings))
        .route("/api/discover", post(discover))
        .route("/api/notifications", get(notifications))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==============================================================================
// request / response bodies
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    #[serde(flatten)]
    pub device: DeviceIdentity,
    pub interval: u32,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    #[serde(default)]
    pub include_known: bool,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

// ==============================================================================
// handlers
// ==============================================================================

/// GET /api/devices
async fn list_devices(State(state): State<ApiState>) -> Json<Vec<DeviceView>> {
    Json(state.manager.snapshot().await)
}

/// POST /api/devices/connect
async fn connect(
    State(state): State<ApiState>,
    Json(identity): Json<DeviceIdentity>,
) -> Result<Json<ActionResponse>> {
    let id = state.manager.connect_manual(&identity).await?;
    Ok(Json(ActionResponse {
        ok: true,
        device_id: Some(id),
    }))
}

/// POST /api/devices/disconnect
async fn disconnect(
    State(state): State<ApiState>,
    Json(identity): Json<DeviceIdentity>,
) -> Result<Json<ActionResponse>> {
    state.manager.disconnect_manual(&identity).await?;
    Ok(Json(ActionResponse {
        ok: true,
        device_id: None,
    }))
}

/// POST /api/devices/interval
async fn change_interval(
    State(state): State<ApiState>,
    Json(request): Json<IntervalRequest>,
) -> Result<Json<ActionResponse>> {
    state
        .manager
        .change_interval(&request.device, request.interval)
        .await?;
    Ok(Json(ActionResponse {
        ok: true,
        device_id: None,
    }))
}

/// GET /api/devices/:id/readings
///
/// Defaults to the last 24 hours.
async fn readings(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Query(query): Query<ReadingsQuery>,
) -> Result<Json<Vec<Reading>>> {
    let to = query.to.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let from = query.from.unwrap_or(to.saturating_sub(24 * 60 * 60));
    let found = state.manager.query_readings(DeviceId(id), from, to).await?;
    Ok(Json(found))
}

/// POST /api/discover
async fn discover(
    State(state): State<ApiState>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Vec<DeviceIdentity>>> {
    let found = state.manager.discover(query.include_known).await?;
    Ok(Json(found))
}

/// GET /api/notifications
async fn notifications(State(state): State<ApiState>) -> Json<Vec<Notification>> {
    Json(state.hub.recent())
}
