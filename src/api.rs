pub(crate) mod admin;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod records;
pub(crate) mod search_documents;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/metrics", get(metrics::exporter))
        .route("/v1/records", post(records::import))
        .route("/v1/records/{id}", get(records::fetch))
        .route("/v1/search-documents", get(search_documents::feed))
        .route("/v1/search-documents/ack", post(search_documents::ack))
        .route("/admin/enrichment/run", post(admin::run))
        .route("/admin/enrichment/abort", post(admin::abort))
        .route("/admin/enrichment/reset", post(admin::reset))
        .route("/admin/enrichment/stats", get(admin::stats))
        .route("/admin/mappings/{domain}", delete(admin::clear_mappings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
