use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get};

use crate::search::{SearchError, SearchForm, SearchPaging, SearchReply, SearchRequest, SearchService};

fn status_for(error: &SearchError) -> Status {
    match error {
        SearchError::BadRequest(_) | SearchError::PolicyViolation(_) => Status::BadRequest,
        SearchError::NotImplemented(_) => Status::NotImplemented,
        SearchError::NotReady => Status::ServiceUnavailable,
        SearchError::Internal => Status::InternalServerError,
    }
}

/// JSON mapping of the search protocol. Without any parameters the reply
/// is the empty form template, mirroring the chat-protocol endpoint.
#[get("/api/v1/search?<q>&<sinname>&<sindescription>&<sinaddr>&<min_users>&<key>&<after>&<max>")]
#[allow(clippy::too_many_arguments)]
pub fn search_rooms(
    search: &State<SearchService>,
    q: Option<String>,
    sinname: Option<bool>,
    sindescription: Option<bool>,
    sinaddr: Option<bool>,
    min_users: Option<i64>,
    key: Option<String>,
    after: Option<String>,
    max: Option<usize>,
) -> Result<Json<SearchReply>, (Status, Json<serde_json::Value>)> {
    let any_form = q.is_some()
        || sinname.is_some()
        || sindescription.is_some()
        || sinaddr.is_some()
        || min_users.is_some()
        || key.is_some();
    let any_paging = after.is_some() || max.is_some();

    let defaults = SearchForm::default();
    let request = SearchRequest {
        form: any_form.then(|| SearchForm {
            query: q,
            search_name: sinname.unwrap_or(defaults.search_name),
            search_description: sindescription.unwrap_or(defaults.search_description),
            search_address: sinaddr.unwrap_or(defaults.search_address),
            min_users: min_users.unwrap_or(defaults.min_users),
            order_by: key.unwrap_or(defaults.order_by),
        }),
        paging: any_paging.then(|| SearchPaging {
            after,
            max,
            ..SearchPaging::default()
        }),
    };

    search
        .handle(&request)
        .map(Json)
        .map_err(|e| (status_for(&e), Json(serde_json::json!({"error": e.to_string()}))))
}
