use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{app::AppState, store::models::NewCatalogRecord};

/// 上流インポーターからの投入。同じ ID の再投入は無視される。
#[derive(Debug, Deserialize)]
pub(crate) struct ImportRequest {
    records: Vec<NewCatalogRecord>,
}

pub(crate) async fn import(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> Response {
    if let Some(record) = request.records.iter().find(|r| r.title.trim().is_empty()) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": format!("record {} has a blank title", record.id) })),
        )
            .into_response();
    }

    match state.dao().import_records(&request.records).await {
        Ok(outcome) => {
            state
                .telemetry()
                .metrics()
                .records_imported
                .inc_by(outcome.inserted);
            info!(
                inserted = outcome.inserted,
                skipped = outcome.skipped,
                "catalog records imported"
            );
            (StatusCode::ACCEPTED, Json(outcome)).into_response()
        }
        Err(error) => {
            error!(error = %format!("{error:#}"), "failed to import catalog records");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{error:#}") })),
            )
                .into_response()
        }
    }
}

pub(crate) async fn fetch(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.dao().get_record(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("record {id} not found") })),
        )
            .into_response(),
        Err(error) => {
            error!(record_id = id, error = %format!("{error:#}"), "failed to load record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{error:#}") })),
            )
                .into_response()
        }
    }
}
