use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    providers: Vec<String>,
    running: bool,
}

impl HealthReport {
    fn new(status: &'static str, state: &AppState) -> Self {
        Self {
            status,
            detail: None,
            providers: state
                .driver()
                .provider_names()
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            running: state.driver().is_running(),
        }
    }
}

/// データベースに到達できれば ready。
pub(crate) async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, (StatusCode, Json<HealthReport>)> {
    state.telemetry().record_ready_probe();

    if let Err(error) = state.dao().ping().await {
        error!(%error, "database readiness check failed");
        let mut report = HealthReport::new("degraded", &state);
        report.detail = Some(format!("database: {error:#}"));
        return Err((StatusCode::SERVICE_UNAVAILABLE, Json(report)));
    }

    Ok(Json(HealthReport::new("ready", &state)))
}

pub(crate) async fn live(State(state): State<AppState>) -> Json<HealthReport> {
    state.telemetry().record_live_probe();
    Json(HealthReport::new("live", &state))
}
