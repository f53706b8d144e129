use std::sync::Arc;

use rocket::http::{ContentType, Status};
use rocket::serde::json::Json;
use rocket::{State, get};

use crate::address::Address;
use crate::db::{PublicRoomQuery, SearchOrder, Store};
use crate::models::RoomDetail;

fn bad_request(message: &str) -> (Status, Json<serde_json::Value>) {
    (
        Status::BadRequest,
        Json(serde_json::json!({"error": message})),
    )
}

/// Keyed-pagination listing of the public catalogue. `order` is `nusers`
/// (default) or `address`; `after` carries the key of the previous page's
/// last row.
#[get("/api/v1/rooms?<order>&<after>&<max>&<min_users>")]
pub fn list_rooms(
    store: &State<Arc<Store>>,
    order: Option<&str>,
    after: Option<&str>,
    max: Option<usize>,
    min_users: Option<i64>,
) -> Result<Json<serde_json::Value>, (Status, Json<serde_json::Value>)> {
    let order = match order.unwrap_or("nusers") {
        "nusers" => SearchOrder::NUsers,
        "address" => SearchOrder::Address,
        other => return Err(bad_request(&format!("Invalid order {other:?}"))),
    };
    let max = max.unwrap_or(50).clamp(1, 100);

    let (after_nusers, after_address) = match (order, after) {
        (_, None) => (None, None),
        (SearchOrder::NUsers, Some(raw)) => match raw.parse::<f64>() {
            Ok(v) => (Some(v), None),
            Err(_) => return Err(bad_request("Invalid page key")),
        },
        (SearchOrder::Address, Some(raw)) => match raw.parse::<Address>() {
            Ok(a) => (None, Some(a.to_string())),
            Err(_) => return Err(bad_request("Invalid page key")),
        },
    };

    let query = PublicRoomQuery {
        order,
        after_nusers,
        after_address,
        min_users: min_users.filter(|m| *m > 0).map(|m| m as f64),
        limit: Some(max + 1),
        ..PublicRoomQuery::default()
    };

    let mut rows = store.query_public_rooms(&query).map_err(|e| {
        (
            Status::InternalServerError,
            Json(serde_json::json!({"error": e.to_string()})),
        )
    })?;

    let more = rows.len() > max;
    rows.truncate(max);
    let last = rows.last().map(|row| match order {
        SearchOrder::NUsers => row.nusers_moving_average.unwrap_or(0.0).to_string(),
        SearchOrder::Address => row.address.to_string(),
    });

    Ok(Json(serde_json::json!({
        "items": rows,
        "more": more,
        "last": last,
    })))
}

#[get("/api/v1/rooms/<address>")]
pub fn get_room(
    store: &State<Arc<Store>>,
    address: &str,
) -> Result<Json<RoomDetail>, (Status, Json<serde_json::Value>)> {
    let address: Address = address
        .parse()
        .map_err(|_| bad_request("Invalid room address"))?;
    match store.get_room_detail(&address) {
        Ok(Some(detail)) => Ok(Json(detail)),
        Ok(None) => Err((
            Status::NotFound,
            Json(serde_json::json!({"error": "No such public room"})),
        )),
        Err(e) => Err((
            Status::InternalServerError,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}

#[get("/api/v1/rooms/<address>/avatar")]
pub fn room_avatar(
    store: &State<Arc<Store>>,
    address: &str,
) -> Result<(ContentType, Vec<u8>), (Status, Json<serde_json::Value>)> {
    let address: Address = address
        .parse()
        .map_err(|_| bad_request("Invalid room address"))?;
    match store.get_avatar(&address) {
        Ok(Some((mime_type, data))) => {
            let content_type =
                ContentType::parse_flexible(&mime_type).unwrap_or(ContentType::Binary);
            Ok((content_type, data))
        }
        Ok(None) => Err((
            Status::NotFound,
            Json(serde_json::json!({"error": "No avatar stored"})),
        )),
        Err(e) => Err((
            Status::InternalServerError,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}
