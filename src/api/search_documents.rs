//! インデクサ向けの検索テキスト配信。再配信は冪等に扱われる前提。

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::app::AppState;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FeedQuery {
    #[serde(default)]
    after_id: i64,
    limit: Option<usize>,
    #[serde(default)]
    unindexed_only: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AckRequest {
    record_ids: Vec<i64>,
}

fn internal_error(context: &str, error: &anyhow::Error) -> Response {
    error!(error = %format!("{error:#}"), "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{error:#}") })),
    )
        .into_response()
}

pub(crate) async fn feed(State(state): State<AppState>, Query(query): Query<FeedQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    match state
        .dao()
        .search_documents(query.after_id, limit, query.unindexed_only)
        .await
    {
        Ok(documents) => {
            let next_after_id = documents.last().map(|document| document.record_id);
            Json(json!({
                "documents": documents,
                "next_after_id": next_after_id,
            }))
            .into_response()
        }
        Err(error) => internal_error("failed to load search documents", &error),
    }
}

pub(crate) async fn ack(State(state): State<AppState>, Json(request): Json<AckRequest>) -> Response {
    match state.dao().mark_indexed(&request.record_ids).await {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(error) => internal_error("failed to acknowledge indexed documents", &error),
    }
}
