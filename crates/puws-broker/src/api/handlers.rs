//! API request handlers.

use axum::{
    Form, Json,
    extract::{Query, State, rejection::FormRejection},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::inventory::SessionContainer;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Connection details returned to the gateway.
///
/// The port is a string on the wire.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub port_number: String,
    pub password: String,
}

/// Parameters for [`connect_or_start_session`], from the query or a form body.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub username: Option<String>,
}

/// Find the user's desktop or start one, and return how to connect to it.
///
/// `username` is read from the query string, falling back to a
/// form-encoded body. Bodies of any other type are ignored.
#[instrument(skip_all)]
pub async fn connect_or_start_session(
    State(state): State<AppState>,
    Query(query): Query<ConnectParams>,
    form: Result<Form<ConnectParams>, FormRejection>,
) -> ApiResult<Json<SessionResponse>> {
    let form = form.map(|Form(params)| params).unwrap_or_default();
    let username = pick_username(query, form)
        .ok_or_else(|| ApiError::bad_request("username is required"))?;

    let session = state.broker.connect_or_start(&username).await?;
    info!(
        username = %session.username,
        port = session.port,
        created = session.created,
        "Session ready"
    );

    Ok(Json(SessionResponse {
        port_number: session.port.to_string(),
        password: session.password.into_string(),
    }))
}

/// List running sessions, without credentials.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionContainer>>> {
    let sessions = state.broker.list_sessions().await?;
    info!(count = sessions.len(), "Listed sessions");
    Ok(Json(sessions))
}

/// Trimmed, non-empty `username`, preferring the query over the body.
fn pick_username(query: ConnectParams, form: ConnectParams) -> Option<String> {
    [query.username, form.username]
        .into_iter()
        .flatten()
        .map(|u| u.trim().to_string())
        .find(|u| !u.is_empty())
}
