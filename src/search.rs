//! Keyed-pagination search over the public room catalogue.
//!
//! Requests arrive from a chat-protocol endpoint (the wire codec is
//! opaque) or from the JSON API; both funnel into [`SearchService::handle`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::db::{PublicRoomQuery, SearchOrder, Store};

pub const SEARCH_NAMESPACE: &str = "https://xmlns.zombofant.net/muclumbus/search/1.0";
pub const SEARCH_FORM_TYPE: &str = "https://xmlns.zombofant.net/muclumbus/search/1.0#params";

const MAX_PAGE_SIZE: usize = 100;
const MAX_QUERY_LENGTH: usize = 1024;
const MAX_KEYWORDS: usize = 5;
const MIN_KEYWORD_LENGTH: usize = 3;

fn default_true() -> bool {
    true
}

fn default_min_users() -> i64 {
    1
}

fn default_order() -> String {
    "nusers".to_string()
}

/// The submitted search form (`FORM_TYPE = …/search/1.0#params`).
#[derive(Debug, Clone, Deserialize)]
pub struct SearchForm {
    #[serde(rename = "q", default)]
    pub query: Option<String>,
    #[serde(rename = "sinname", default = "default_true")]
    pub search_name: bool,
    #[serde(rename = "sindescription", default = "default_true")]
    pub search_description: bool,
    #[serde(rename = "sinaddr", default = "default_true")]
    pub search_address: bool,
    #[serde(default = "default_min_users")]
    pub min_users: i64,
    #[serde(rename = "key", default = "default_order")]
    pub order_by: String,
}

impl Default for SearchForm {
    fn default() -> Self {
        SearchForm {
            query: None,
            search_name: true,
            search_description: true,
            search_address: true,
            min_users: default_min_users(),
            order_by: default_order(),
        }
    }
}

/// Result-set paging metadata of the request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPaging {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub max: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub form: Option<SearchForm>,
    pub paging: Option<SearchPaging>,
}

/// Error contract of the search endpoint: `BadRequest`/`PolicyViolation`
/// map to modify errors with a textual reason, `NotImplemented` to a
/// not-implemented modify error, `NotReady` to a wait error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PolicyViolation(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error("search service not initialised yet")]
    NotReady,
    #[error("internal storage error")]
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub address: Address,
    #[serde(rename = "is-open")]
    pub is_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nusers: Option<i64>,
}

/// Paging metadata of a reply; `first` and `last` both carry the key of
/// the final row (keyed pagination needs no first-key).
#[derive(Debug, Clone, Serialize)]
pub struct ResultPaging {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub items: Vec<SearchResultItem>,
    pub more: bool,
    pub paging: ResultPaging,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormFieldSpec {
    pub var: &'static str,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub label: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchFormTemplate {
    pub form_type: &'static str,
    pub fields: Vec<FormFieldSpec>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SearchReply {
    FormTemplate(SearchFormTemplate),
    Results(SearchResults),
}

/// Shell-like tokenisation: whitespace-separated, quotes group words,
/// backslash escapes the next character. Unbalanced quoting is an error.
pub fn shell_split(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' && q == '"' {
                    match chars.next() {
                        Some(next) => current.push(next),
                        None => return Err("dangling escape".to_string()),
                    }
                } else {
                    current.push(c);
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c == '\\' {
                    match chars.next() {
                        Some(next) => {
                            current.push(next);
                            in_token = true;
                        }
                        None => return Err("dangling escape".to_string()),
                    }
                } else if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else {
                    current.push(c);
                    in_token = true;
                }
            }
        }
    }
    if quote.is_some() {
        return Err("unbalanced quote".to_string());
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Tokenise a query and drop keywords shorter than the minimum length.
/// Duplicates collapse.
pub fn prepare_keywords(query: &str, min_length: usize) -> Result<Vec<String>, String> {
    let tokens = shell_split(query)?;
    let keywords: BTreeSet<String> = tokens
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| t.chars().count() >= min_length)
        .collect();
    Ok(keywords.into_iter().collect())
}

pub struct SearchService {
    store: Arc<Store>,
    pub max_page_size: usize,
    pub max_query_length: usize,
    pub max_keywords: usize,
    pub min_keyword_length: usize,
}

impl SearchService {
    pub fn new(store: Arc<Store>) -> Self {
        SearchService {
            store,
            max_page_size: MAX_PAGE_SIZE,
            max_query_length: MAX_QUERY_LENGTH,
            max_keywords: MAX_KEYWORDS,
            min_keyword_length: MIN_KEYWORD_LENGTH,
        }
    }

    pub fn handle(&self, request: &SearchRequest) -> Result<SearchReply, SearchError> {
        if request.form.is_none() && request.paging.is_none() {
            return Ok(SearchReply::FormTemplate(self.form_template()));
        }

        let mut max_ = self.max_page_size;
        let mut after: Option<String> = None;
        if let Some(paging) = &request.paging {
            if paging.before.is_some()
                || paging.index.is_some()
                || paging.first.is_some()
                || paging.last.is_some()
            {
                return Err(SearchError::NotImplemented(
                    "Attempt to use unsupported paging features".to_string(),
                ));
            }
            after = paging.after.clone();
            if let Some(m) = paging.max {
                if m > 0 {
                    max_ = m.clamp(1, self.max_page_size);
                }
            }
        }

        let Some(form) = &request.form else {
            return Err(SearchError::BadRequest(
                "Form missing or invalid FORM_TYPE".to_string(),
            ));
        };

        let order = match form.order_by.as_str() {
            "nusers" => SearchOrder::NUsers,
            "address" => SearchOrder::Address,
            other => {
                return Err(SearchError::BadRequest(format!("Invalid key value {other:?}")));
            }
        };

        let query_str = form.query.clone().unwrap_or_default();
        if query_str.chars().count() > self.max_query_length {
            return Err(SearchError::PolicyViolation("Query too long".to_string()));
        }

        let keywords = if query_str.is_empty() {
            Vec::new()
        } else {
            if !form.search_address && !form.search_description && !form.search_name {
                return Err(SearchError::BadRequest("Search scope is empty".to_string()));
            }
            let keywords = prepare_keywords(&query_str, self.min_keyword_length)
                .map_err(|e| SearchError::BadRequest(format!("Failed to parse query ({e})")))?;
            if keywords.is_empty() {
                return Err(SearchError::BadRequest("No valid search terms".to_string()));
            }
            if keywords.len() > self.max_keywords {
                return Err(SearchError::PolicyViolation(
                    "Too many search terms".to_string(),
                ));
            }
            keywords
        };

        let (after_nusers, after_address) = match (order, after) {
            (_, None) => (None, None),
            (SearchOrder::NUsers, Some(raw)) => {
                let value = raw.parse::<f64>().map_err(|_| {
                    SearchError::BadRequest(format!("Invalid page key {raw:?}"))
                })?;
                (Some(value), None)
            }
            (SearchOrder::Address, Some(raw)) => {
                let address = raw.parse::<Address>().map_err(|_| {
                    SearchError::BadRequest(format!("Invalid page key {raw:?}"))
                })?;
                (None, Some(address.to_string()))
            }
        };

        let query = PublicRoomQuery {
            order,
            after_nusers,
            after_address,
            min_users: (form.min_users > 0).then_some(form.min_users as f64),
            keywords,
            search_address: form.search_address,
            search_name: form.search_name,
            search_description: form.search_description,
            include_closed: false,
            limit: Some(max_ + 1),
        };

        let mut rows = self.store.query_public_rooms(&query).map_err(|e| {
            eprintln!("⚠️ search: query failed: {e}");
            SearchError::Internal
        })?;

        let more = rows.len() > max_;
        rows.truncate(max_);

        let last_key = rows.last().map(|row| match order {
            SearchOrder::NUsers => row.nusers_moving_average.unwrap_or(0.0).to_string(),
            SearchOrder::Address => row.address.to_string(),
        });

        let items = rows
            .into_iter()
            .map(|row| SearchResultItem {
                address: row.address,
                is_open: row.is_open,
                name: row.name,
                description: row.description,
                language: row.language,
                nusers: row.nusers_moving_average.map(|n| n.round() as i64),
            })
            .collect();

        Ok(SearchReply::Results(SearchResults {
            items,
            more,
            paging: ResultPaging {
                first: last_key.clone(),
                last: last_key,
                max: max_,
            },
        }))
    }

    fn form_template(&self) -> SearchFormTemplate {
        SearchFormTemplate {
            form_type: SEARCH_FORM_TYPE,
            fields: vec![
                FormFieldSpec {
                    var: "q",
                    type_: "text-single",
                    label: "Search for",
                    default: None,
                },
                FormFieldSpec {
                    var: "sinname",
                    type_: "boolean",
                    label: "Search in name",
                    default: Some("true"),
                },
                FormFieldSpec {
                    var: "sindescription",
                    type_: "boolean",
                    label: "Search in description",
                    default: Some("true"),
                },
                FormFieldSpec {
                    var: "sinaddr",
                    type_: "boolean",
                    label: "Search in address",
                    default: Some("true"),
                },
                FormFieldSpec {
                    var: "min_users",
                    type_: "text-single",
                    label: "Minimum number of users",
                    default: Some("1"),
                },
                FormFieldSpec {
                    var: "key",
                    type_: "list-single",
                    label: "Sort results by",
                    default: Some("nusers"),
                },
            ],
        }
    }
}
