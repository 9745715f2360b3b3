use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

use crate::store::KeyValueStore;

/// GET /health_check
///
/// 200 while the shared store answers, 503 otherwise.
pub async fn health_check(store: web::Data<Arc<dyn KeyValueStore>>) -> HttpResponse {
    tracing::debug!("Health check endpoint called");

    match store.exists("health_check").await {
        Ok(_) => HttpResponse::Ok().json(json!({ "status": "ok" })),
        Err(e) => {
            tracing::error!(error = %e, "Health check: store unavailable");
            HttpResponse::ServiceUnavailable().json(json!({ "status": "store_unavailable" }))
        }
    }
}
