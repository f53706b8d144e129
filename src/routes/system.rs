use std::sync::Arc;

use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, catch, get};

use crate::db::Store;
use crate::models::StatsResponse;

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "roomdex",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[get("/api/v1/stats")]
pub fn stats(
    store: &State<Arc<Store>>,
) -> Result<Json<StatsResponse>, (Status, Json<serde_json::Value>)> {
    store.stats().map(Json).map_err(|e| {
        (
            Status::InternalServerError,
            Json(serde_json::json!({"error": e.to_string()})),
        )
    })
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "Not found"}))
}
