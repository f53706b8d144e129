pub mod address;
pub mod analyser;
pub mod avatar;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod interaction;
pub mod mirror;
pub mod models;
pub mod observer;
pub mod routes;
pub mod scanner;
pub mod search;
pub mod supervisor;
pub mod watcher;
pub mod worker_pool;

use std::env;
use std::sync::Arc;

use rocket_cors::CorsOptions;

use db::{Store, TextLimits};
use search::SearchService;

/// Read-only JSON surface over an existing store. The crawler side shares
/// the same `Arc<Store>` via [`supervisor::run`].
pub fn rocket_with_store(store: Arc<Store>) -> rocket::Rocket<rocket::Build> {
    let search = SearchService::new(Arc::clone(&store));

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    rocket::build()
        .manage(store)
        .manage(search)
        .attach(cors)
        .register("/", rocket::catchers![routes::not_found])
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::list_rooms,
                routes::get_room,
                routes::room_avatar,
                routes::search_rooms,
            ],
        )
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(Store::new(db_path, TextLimits::default()));
    rocket_with_store(store)
}

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/roomdex.db".to_string());
    rocket_with_db(&db_path)
}
