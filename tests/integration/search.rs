use std::collections::HashSet;
use std::sync::Arc;

use roomdex::db::RoomUpdate;
use roomdex::search::{
    SearchError, SearchForm, SearchPaging, SearchReply, SearchRequest, SearchService, prepare_keywords,
    shell_split,
};

use crate::common::{TestStore, addr};

fn seed_room(ts: &TestStore, jid: &str, name: &str, description: &str, nusers: i64) {
    ts.store
        .update_muc_metadata(
            &addr(jid),
            RoomUpdate {
                is_open: Some(true),
                is_public: Some(true),
                nusers: Some(nusers),
                name: Some(Some(name.to_string())),
                description: Some(Some(description.to_string())),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
}

fn service(ts: &TestStore) -> SearchService {
    SearchService::new(Arc::clone(&ts.store))
}

fn query_request(q: &str, max: Option<usize>, after: Option<&str>) -> SearchRequest {
    SearchRequest {
        form: Some(SearchForm {
            query: Some(q.to_string()),
            ..SearchForm::default()
        }),
        paging: Some(SearchPaging {
            after: after.map(String::from),
            max,
            ..SearchPaging::default()
        }),
    }
}

fn results(reply: SearchReply) -> roomdex::search::SearchResults {
    match reply {
        SearchReply::Results(results) => results,
        SearchReply::FormTemplate(_) => panic!("expected results, got the form template"),
    }
}

// --- Tokenisation ---

#[test]
fn test_shell_split_handles_quotes() {
    assert_eq!(
        shell_split(r#"alpha "beta gamma" delta"#).unwrap(),
        vec!["alpha", "beta gamma", "delta"]
    );
    assert!(shell_split(r#"unbalanced "quote"#).is_err());
}

#[test]
fn test_prepare_keywords_drops_short_tokens_and_duplicates() {
    let keywords = prepare_keywords("rust ru rust linux", 3).unwrap();
    assert_eq!(keywords, vec!["linux", "rust"]);
}

// --- Validation ---

#[test]
fn test_empty_request_yields_the_form_template() {
    let ts = TestStore::new();
    let reply = service(&ts).handle(&SearchRequest::default()).unwrap();
    match reply {
        SearchReply::FormTemplate(template) => {
            assert!(template.form_type.ends_with("#params"));
            assert!(template.fields.iter().any(|f| f.var == "q"));
        }
        SearchReply::Results(_) => panic!("expected the form template"),
    }
}

#[test]
fn test_overlong_query_is_a_policy_violation() {
    let ts = TestStore::new();
    let err = service(&ts)
        .handle(&query_request(&"x".repeat(2000), None, None))
        .unwrap_err();
    assert!(matches!(err, SearchError::PolicyViolation(_)));
}

#[test]
fn test_too_many_keywords_is_a_policy_violation() {
    let ts = TestStore::new();
    let err = service(&ts)
        .handle(&query_request(
            "alpha beta gamma delta epsilon zeta",
            None,
            None,
        ))
        .unwrap_err();
    assert!(matches!(err, SearchError::PolicyViolation(_)));
}

#[test]
fn test_only_short_tokens_is_a_bad_request() {
    let ts = TestStore::new();
    let err = service(&ts).handle(&query_request("ab cd", None, None)).unwrap_err();
    assert!(matches!(err, SearchError::BadRequest(_)));
}

#[test]
fn test_empty_scope_is_a_bad_request() {
    let ts = TestStore::new();
    let request = SearchRequest {
        form: Some(SearchForm {
            query: Some("rust".to_string()),
            search_name: false,
            search_description: false,
            search_address: false,
            ..SearchForm::default()
        }),
        paging: None,
    };
    let err = service(&ts).handle(&request).unwrap_err();
    assert!(matches!(err, SearchError::BadRequest(_)));
}

#[test]
fn test_unsupported_paging_features_are_not_implemented() {
    let ts = TestStore::new();
    let request = SearchRequest {
        form: Some(SearchForm {
            query: Some("rust".to_string()),
            ..SearchForm::default()
        }),
        paging: Some(SearchPaging {
            before: Some("10".to_string()),
            ..SearchPaging::default()
        }),
    };
    let err = service(&ts).handle(&request).unwrap_err();
    assert!(matches!(err, SearchError::NotImplemented(_)));
}

#[test]
fn test_invalid_order_key_is_a_bad_request() {
    let ts = TestStore::new();
    let request = SearchRequest {
        form: Some(SearchForm {
            order_by: "sideways".to_string(),
            ..SearchForm::default()
        }),
        paging: None,
    };
    let err = service(&ts).handle(&request).unwrap_err();
    assert!(matches!(err, SearchError::BadRequest(_)));
}

// --- Execution ---

#[test]
fn test_keyed_pagination_by_user_count() {
    let ts = TestStore::new();
    seed_room(&ts, "big@rooms.example", "foo", "foo bar talk", 30);
    seed_room(&ts, "mid@rooms.example", "foo bar", "foo bar talk", 20);
    seed_room(&ts, "low@rooms.example", "bar", "foo bar talk", 10);

    let svc = service(&ts);
    let page1 = results(svc.handle(&query_request("foo bar", Some(2), None)).unwrap());
    assert_eq!(page1.items.len(), 2);
    assert_eq!(page1.items[0].nusers, Some(30));
    assert_eq!(page1.items[1].nusers, Some(20));
    assert!(page1.more);
    assert_eq!(page1.paging.last.as_deref(), Some("20"));
    assert_eq!(page1.paging.first.as_deref(), Some("20"));

    let page2 = results(
        svc.handle(&query_request("foo bar", Some(2), page1.paging.last.as_deref()))
            .unwrap(),
    );
    assert_eq!(page2.items.len(), 1);
    assert_eq!(page2.items[0].nusers, Some(10));
    assert!(!page2.more);
}

#[test]
fn test_tied_user_counts_break_ties_by_address() {
    let ts = TestStore::new();
    seed_room(&ts, "c@rooms.example", "Gamma", "chatter", 7);
    seed_room(&ts, "a@rooms.example", "Alpha", "chatter", 7);
    seed_room(&ts, "b@rooms.example", "Beta", "chatter", 7);

    let request = SearchRequest {
        form: Some(SearchForm::default()),
        paging: None,
    };
    let page = results(service(&ts).handle(&request).unwrap());
    let addresses: Vec<String> = page.items.iter().map(|i| i.address.to_string()).collect();
    assert_eq!(
        addresses,
        vec![
            "a@rooms.example".to_string(),
            "b@rooms.example".to_string(),
            "c@rooms.example".to_string(),
        ]
    );
}

#[test]
fn test_pagination_by_address_visits_every_row_once() {
    let ts = TestStore::new();
    for i in 0..7 {
        seed_room(
            &ts,
            &format!("room{i}@rooms.example"),
            &format!("Room {i}"),
            "chatter",
            3 + i,
        );
    }

    let svc = service(&ts);
    let mut seen: HashSet<String> = HashSet::new();
    let mut after: Option<String> = None;
    loop {
        let request = SearchRequest {
            form: Some(SearchForm {
                order_by: "address".to_string(),
                ..SearchForm::default()
            }),
            paging: Some(SearchPaging {
                after: after.clone(),
                max: Some(2),
                ..SearchPaging::default()
            }),
        };
        let page = results(svc.handle(&request).unwrap());
        for item in &page.items {
            assert!(
                seen.insert(item.address.to_string()),
                "{} visited twice",
                item.address
            );
        }
        if !page.more {
            break;
        }
        after = page.paging.last.clone();
    }
    assert_eq!(seen.len(), 7);
}

#[test]
fn test_scopes_limit_where_keywords_match() {
    let ts = TestStore::new();
    seed_room(&ts, "kitchen@rooms.example", "Cooking", "all about pasta", 5);
    seed_room(&ts, "pasta@rooms.example", "Generic", "nothing here", 5);

    let svc = service(&ts);
    // name+description only: the address match must not fire
    let request = SearchRequest {
        form: Some(SearchForm {
            query: Some("pasta".to_string()),
            search_address: false,
            ..SearchForm::default()
        }),
        paging: None,
    };
    let page = results(svc.handle(&request).unwrap());
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].address, addr("kitchen@rooms.example"));
}

#[test]
fn test_matching_is_case_insensitive() {
    let ts = TestStore::new();
    seed_room(&ts, "loud@rooms.example", "RUST Hackers", "Systems Talk", 5);

    let svc = service(&ts);
    let page = results(service(&ts).handle(&query_request("rust", None, None)).unwrap());
    assert_eq!(page.items.len(), 1);
    let page = results(svc.handle(&query_request("SYSTEMS", None, None)).unwrap());
    assert_eq!(page.items.len(), 1);
}

#[test]
fn test_min_users_filters_on_the_moving_average() {
    let ts = TestStore::new();
    seed_room(&ts, "busy@rooms.example", "Busy", "chatter", 40);
    seed_room(&ts, "calm@rooms.example", "Calm", "chatter", 2);

    let request = SearchRequest {
        form: Some(SearchForm {
            min_users: 10,
            ..SearchForm::default()
        }),
        paging: None,
    };
    let page = results(service(&ts).handle(&request).unwrap());
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].address, addr("busy@rooms.example"));
}

#[test]
fn test_closed_and_hidden_rooms_are_excluded() {
    let ts = TestStore::new();
    seed_room(&ts, "open@rooms.example", "Open", "chatter", 5);
    seed_room(&ts, "shut@rooms.example", "Shut", "chatter", 5);
    ts.store
        .update_muc_metadata(
            &addr("shut@rooms.example"),
            RoomUpdate {
                is_open: Some(false),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    seed_room(&ts, "veiled@rooms.example", "Veiled", "chatter", 5);
    ts.store.set_room_hidden(&addr("veiled@rooms.example"), true).unwrap();

    let request = SearchRequest {
        form: Some(SearchForm::default()),
        paging: None,
    };
    let page = results(service(&ts).handle(&request).unwrap());
    let addresses: Vec<String> = page.items.iter().map(|i| i.address.to_string()).collect();
    assert_eq!(addresses, vec!["open@rooms.example".to_string()]);
}

#[test]
fn test_quoted_phrase_matches_as_one_token() {
    let ts = TestStore::new();
    seed_room(&ts, "a@rooms.example", "alpha beta", "words", 5);
    seed_room(&ts, "b@rooms.example", "beta alpha", "words", 5);

    let page = results(
        service(&ts)
            .handle(&query_request(r#""alpha beta""#, None, None))
            .unwrap(),
    );
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].address, addr("a@rooms.example"));
}

#[test]
fn test_max_is_clamped() {
    let ts = TestStore::new();
    seed_room(&ts, "a@rooms.example", "alpha", "words", 5);
    let page = results(
        service(&ts)
            .handle(&query_request("alpha", Some(100_000), None))
            .unwrap(),
    );
    assert_eq!(page.paging.max, 100);
}
