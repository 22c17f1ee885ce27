//! 運用者向けの操作。実行・中断・リセット・集計・キャッシュ破棄。

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use crate::{
    app::AppState,
    domain::{Domain, ResetScope},
    pipeline::{PipelineError, RunRequest},
    store::models::StatusSummary,
};

#[derive(Debug, Deserialize)]
pub(crate) struct ResetRequest {
    domain: Domain,
    scope: ResetScope,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    domain: Domain,
    scope: ResetScope,
    reset: u64,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    running: bool,
    domains: StatusSummary,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// パイプラインのエラーを HTTP 応答に写す。
fn pipeline_error_response(error: PipelineError) -> Response {
    match error {
        PipelineError::Busy => {
            error_body(StatusCode::CONFLICT, PipelineError::Busy.to_string())
        }
        PipelineError::Configuration(message) => error_body(StatusCode::BAD_REQUEST, message),
        PipelineError::ProvidersExhausted { summary } => {
            warn!(
                run_id = %summary.run_id,
                providers = ?summary.exhausted_providers,
                "enrichment run stopped: providers exhausted"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "all inference providers exhausted",
                    "summary": summary,
                })),
            )
                .into_response()
        }
        PipelineError::Store(source) => {
            error!(error = %format!("{source:#}"), "enrichment store operation failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{source:#}"))
        }
    }
}

pub(crate) async fn run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Response {
    match state.driver().run(request).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(error) => pipeline_error_response(error),
    }
}

pub(crate) async fn abort(State(state): State<AppState>) -> Response {
    let aborted = state.driver().abort();
    let status = if aborted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "aborted": aborted }))).into_response()
}

pub(crate) async fn reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Response {
    match state.driver().reset(request.domain, request.scope).await {
        Ok(reset) => Json(ResetResponse {
            domain: request.domain,
            scope: request.scope,
            reset,
        })
        .into_response(),
        Err(error) => pipeline_error_response(error),
    }
}

pub(crate) async fn stats(State(state): State<AppState>) -> Response {
    match state.driver().stats().await {
        Ok(domains) => Json(StatsResponse {
            running: state.driver().is_running(),
            domains,
        })
        .into_response(),
        Err(error) => pipeline_error_response(error),
    }
}

pub(crate) async fn clear_mappings(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Response {
    let domain: Domain = match domain.parse() {
        Ok(domain) => domain,
        Err(error) => return error_body(StatusCode::BAD_REQUEST, format!("{error}")),
    };
    match state.driver().clear_mappings(domain).await {
        Ok(cleared) => Json(json!({ "domain": domain, "cleared": cleared })).into_response(),
        Err(error) => pipeline_error_response(error),
    }
}
