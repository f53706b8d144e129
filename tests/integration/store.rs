use std::time::Duration;

use chrono::Utc;
use rusqlite::params;

use roomdex::db::{
    CACHE_TTL_BANNED, DomainUpdate, RoomUpdate, moving_average_step,
};
use roomdex::models::{AddressMetadata, AnonymityMode, SoftwareInfo};

use crate::common::{TestStore, addr};

fn set(value: &str) -> Option<Option<String>> {
    Some(Some(value.to_string()))
}

// --- Room creation (scenario: first observation) ---

#[test]
fn test_first_observation_creates_domain_room_and_public_row() {
    let ts = TestStore::new();
    let room = addr("room@a.example");

    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                name: set("  Hello   World  "),
                description: set("d"),
                nusers: Some(10),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    let domain = ts.store.get_domain("a.example").unwrap().expect("domain row");
    let last_seen = domain.last_seen.expect("domain last_seen set");
    assert!((Utc::now() - last_seen).num_seconds().abs() < 5);

    let row = ts.store.get_room(&room).unwrap().expect("room row");
    assert_eq!(row.nusers, Some(10));
    assert_eq!(row.nusers_moving_average, Some(10.0));
    assert!(!row.was_kicked);

    let detail = ts.store.get_room_detail(&room).unwrap();
    // closed rooms are not part of the open base view, but the detail view
    // still resolves public rows
    assert!(detail.is_some());
    assert_eq!(detail.unwrap().name.as_deref(), Some("Hello World"));
}

#[test]
fn test_unseen_room_has_null_moving_average() {
    let ts = TestStore::new();
    let room = addr("quiet@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let row = ts.store.get_room(&room).unwrap().unwrap();
    assert_eq!(row.nusers, None);
    assert_eq!(row.nusers_moving_average, None);
}

// --- Moving average ---

#[test]
fn test_moving_average_law_converges_to_one_percent() {
    // starting at n0, 24 spaced updates towards n_avg leave at most 1%
    let n0 = 10.0;
    let n_avg = 20.0;
    let mut ma = n0;
    for _ in 0..24 {
        ma = moving_average_step(ma, n_avg);
    }
    assert!((ma - n_avg).abs() <= 0.01 * (n0 - n_avg).abs());
}

#[test]
fn test_moving_average_updates_only_after_interval() {
    let ts = TestStore::new();
    let room = addr("busy@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                nusers: Some(10),
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    // a second observation right away must not move the average
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                nusers: Some(20),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let row = ts.store.get_room(&room).unwrap().unwrap();
    assert_eq!(row.nusers, Some(20));
    assert_eq!(row.nusers_moving_average, Some(10.0));
}

#[test]
fn test_moving_average_hourly_updates_converge() {
    let ts = TestStore::new();
    let room = addr("steady@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                nusers: Some(10),
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    let raw = ts.raw();
    for _ in 0..24 {
        // pretend the last average update happened over an hour ago
        let backdated = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        raw.execute(
            "UPDATE muc SET moving_average_last_update = ?1 WHERE address = ?2",
            params![backdated, room.to_string()],
        )
        .unwrap();
        ts.store
            .update_muc_metadata(
                &room,
                RoomUpdate {
                    nusers: Some(20),
                    ..RoomUpdate::default()
                },
            )
            .unwrap();
    }

    let ma = ts
        .store
        .get_room(&room)
        .unwrap()
        .unwrap()
        .nusers_moving_average
        .unwrap();
    assert!((ma - 20.0).abs() < 0.1, "moving average {ma} not converged");
}

// --- Sentinel semantics of the change set ---

#[test]
fn test_absent_fields_do_not_overwrite() {
    let ts = TestStore::new();
    let room = addr("keep@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                is_open: Some(true),
                name: set("Keep Me"),
                description: set("original"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                nusers: Some(3),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    let detail = ts.store.get_room_detail(&room).unwrap().unwrap();
    assert_eq!(detail.name.as_deref(), Some("Keep Me"));
    assert_eq!(detail.description.as_deref(), Some("original"));
}

#[test]
fn test_explicit_clear_erases_a_text_field() {
    let ts = TestStore::new();
    let room = addr("clear@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                name: set("Named"),
                subject: set("old subject"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                subject: Some(None),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let detail = ts.store.get_room_detail(&room).unwrap().unwrap();
    assert_eq!(detail.subject, None);
    assert_eq!(detail.name.as_deref(), Some("Named"));
}

#[test]
fn test_is_saveable_false_deletes_everything() {
    let ts = TestStore::new();
    let room = addr("gone@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                name: set("Doomed"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_saveable: Some(false),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    assert!(ts.store.get_room(&room).unwrap().is_none());
}

#[test]
fn test_is_public_false_removes_public_row_only() {
    let ts = TestStore::new();
    let room = addr("private@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                is_open: Some(true),
                name: set("Was Public"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(false),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    assert!(ts.store.get_room(&room).unwrap().is_some());
    assert!(ts.store.get_room_detail(&room).unwrap().is_none());
}

// --- Kick monotonicity ---

#[test]
fn test_was_kicked_is_monotone() {
    let ts = TestStore::new();
    let room = addr("kicked@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                was_kicked: Some(true),
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    assert!(ts.store.get_room(&room).unwrap().unwrap().was_kicked);

    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                was_kicked: Some(false),
                nusers: Some(5),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    assert!(ts.store.get_room(&room).unwrap().unwrap().was_kicked);
}

// --- Address metadata ---

#[test]
fn test_db_row_synthesises_metadata() {
    let ts = TestStore::new();
    let room = addr("indexed@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                is_open: Some(true),
                name: set("Indexed"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    let meta = ts.store.get_address_metadata(&room).unwrap().unwrap();
    assert!(meta.is_reachable);
    assert!(meta.is_chat_service);
    assert!(meta.is_joinable);
    assert!(meta.is_indexable);
    assert!(!meta.is_banned);
}

#[test]
fn test_cache_entry_expires() {
    let ts = TestStore::new();
    let address = addr("flaky@b.example");
    ts.store
        .cache_address_metadata(
            &address,
            AddressMetadata::UNREACHABLE,
            Duration::from_millis(20),
        )
        .unwrap();
    assert!(ts.store.get_address_metadata(&address).unwrap().is_some());

    std::thread::sleep(Duration::from_millis(40));
    assert!(ts.store.get_address_metadata(&address).unwrap().is_none());
}

#[test]
fn test_db_takes_precedence_over_cache() {
    let ts = TestStore::new();
    let room = addr("both@a.example");
    ts.store
        .cache_address_metadata(&room, AddressMetadata::BANNED, CACHE_TTL_BANNED)
        .unwrap();
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    let meta = ts.store.get_address_metadata(&room).unwrap().unwrap();
    assert!(!meta.is_banned, "room row must shadow the cached ban");
    assert!(meta.is_joinable);
}

#[test]
fn test_useful_metadata_is_routed_into_the_database() {
    let ts = TestStore::new();
    let room = addr("useful@a.example");
    ts.store
        .cache_address_metadata(
            &room,
            AddressMetadata {
                is_reachable: true,
                is_chat_service: true,
                is_joinable: true,
                is_indexable: true,
                is_banned: false,
            },
            Duration::from_secs(3600),
        )
        .unwrap();
    let row = ts.store.get_room(&room).unwrap().expect("room row created");
    assert!(row.is_open);
    assert!(ts.store.get_room_detail(&room).unwrap().is_some());
}

#[test]
fn test_reachable_non_service_clears_stale_data() {
    let ts = TestStore::new();
    let address = addr("was-a-room@a.example");
    ts.store
        .update_muc_metadata(
            &address,
            RoomUpdate {
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store
        .cache_address_metadata(
            &address,
            AddressMetadata {
                is_reachable: true,
                is_chat_service: false,
                is_joinable: false,
                is_indexable: false,
                is_banned: false,
            },
            Duration::from_secs(3600),
        )
        .unwrap();
    assert!(ts.store.get_room(&address).unwrap().is_none());
    let meta = ts.store.get_address_metadata(&address).unwrap().unwrap();
    assert!(!meta.is_chat_service);
}

// --- Domains ---

#[test]
fn test_require_domain_without_seen_only_inserts() {
    let ts = TestStore::new();
    ts.store.require_domain("Seed.Example", None).unwrap();
    let row = ts.store.get_domain("seed.example").unwrap().unwrap();
    assert_eq!(row.last_seen, None);
    assert!(!row.delisted);

    // a later sighting stamps it
    ts.store
        .require_domain("seed.example", Some(chrono::Duration::zero()))
        .unwrap();
    assert!(ts.store.get_domain("seed.example").unwrap().unwrap().last_seen.is_some());
}

#[test]
fn test_update_domain_reconciles_identity_set() {
    let ts = TestStore::new();
    let pairs = |v: &[(&str, &str)]| -> Vec<(String, String)> {
        v.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    };

    ts.store
        .update_domain(
            "chat.example",
            DomainUpdate {
                identities: Some(pairs(&[("server", "im"), ("conference", "text")])),
                software: Some(SoftwareInfo {
                    name: Some("ejabberd".to_string()),
                    version: Some("23.10".to_string()),
                    os: None,
                }),
                ..DomainUpdate::default()
            },
        )
        .unwrap();

    let mut identities = ts.store.get_domain_identities("chat.example").unwrap();
    identities.sort();
    assert_eq!(
        identities,
        pairs(&[("conference", "text"), ("server", "im")])
    );

    // second scan drops one identity and adds another
    ts.store
        .update_domain(
            "chat.example",
            DomainUpdate {
                identities: Some(pairs(&[("conference", "text"), ("pubsub", "service")])),
                ..DomainUpdate::default()
            },
        )
        .unwrap();
    let mut identities = ts.store.get_domain_identities("chat.example").unwrap();
    identities.sort();
    assert_eq!(
        identities,
        pairs(&[("conference", "text"), ("pubsub", "service")])
    );

    let row = ts.store.get_domain("chat.example").unwrap().unwrap();
    assert_eq!(row.software_name.as_deref(), Some("ejabberd"));
}

#[test]
fn test_scannable_domains_reports_chat_service_flag() {
    let ts = TestStore::new();
    ts.store
        .update_domain(
            "muc.example",
            DomainUpdate {
                identities: Some(vec![("conference".to_string(), "text".to_string())]),
                ..DomainUpdate::default()
            },
        )
        .unwrap();
    ts.store.require_domain("web.example", None).unwrap();
    ts.store.require_domain("hidden.example", None).unwrap();
    ts.store.set_domain_delisted("hidden.example", true).unwrap();

    let mut scannable = ts.store.get_scannable_domains().unwrap();
    scannable.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(scannable.len(), 2);
    assert_eq!(scannable[0].0, "muc.example");
    assert!(scannable[0].2);
    assert_eq!(scannable[1].0, "web.example");
    assert!(!scannable[1].2);
}

#[test]
fn test_expire_domains_spares_delisted_rows() {
    let ts = TestStore::new();
    let stale = chrono::Duration::days(-30);
    ts.store.require_domain("old.example", Some(stale)).unwrap();
    ts.store.require_domain("pinned.example", Some(stale)).unwrap();
    ts.store.set_domain_delisted("pinned.example", true).unwrap();

    let deleted = ts.store.expire_domains(Utc::now() - chrono::Duration::days(7)).unwrap();
    assert_eq!(deleted, 1);
    assert!(ts.store.get_domain("old.example").unwrap().is_none());
    assert!(ts.store.get_domain("pinned.example").unwrap().is_some());
}

#[test]
fn test_expire_mucs_deletes_stale_rooms() {
    let ts = TestStore::new();
    let stale = addr("stale@a.example");
    let fresh = addr("fresh@a.example");
    for address in [&stale, &fresh] {
        ts.store
            .update_muc_metadata(
                address,
                RoomUpdate {
                    is_open: Some(true),
                    ..RoomUpdate::default()
                },
            )
            .unwrap();
    }
    let raw = ts.raw();
    raw.execute(
        "UPDATE muc SET last_seen = ?1 WHERE address = ?2",
        params![
            (Utc::now() - chrono::Duration::days(3)).to_rfc3339(),
            stale.to_string()
        ],
    )
    .unwrap();

    let deleted = ts
        .store
        .expire_mucs(Utc::now() - chrono::Duration::days(2))
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(ts.store.get_room(&stale).unwrap().is_none());
    assert!(ts.store.get_room(&fresh).unwrap().is_some());
}

// --- Cascades and referrals ---

#[test]
fn test_delete_cascades_to_dependents() {
    let ts = TestStore::new();
    let from = addr("source@a.example");
    let to = addr("target@a.example");
    for (address, name) in [(&from, "Source"), (&to, "Target")] {
        ts.store
            .update_muc_metadata(
                address,
                RoomUpdate {
                    is_public: Some(true),
                    is_open: Some(true),
                    name: set(name),
                    tags: Some(vec!["community".to_string()]),
                    ..RoomUpdate::default()
                },
            )
            .unwrap();
    }
    ts.store.store_referral(&from, &to, None).unwrap();
    assert_eq!(ts.store.get_referral_count(&from, &to).unwrap(), 1);

    ts.store.delete_all_muc_data(&to).unwrap();
    assert_eq!(ts.store.get_referral_count(&from, &to).unwrap(), 0);

    let raw = ts.raw();
    let tags: i64 = raw
        .query_row(
            "SELECT COUNT(*) FROM public_muc_tags WHERE public_muc = ?1",
            params![to.to_string()],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(tags, 0);
}

#[test]
fn test_referral_requires_public_endpoints() {
    let ts = TestStore::new();
    let from = addr("public@a.example");
    let to = addr("secret@a.example");
    ts.store
        .update_muc_metadata(
            &from,
            RoomUpdate {
                is_public: Some(true),
                name: set("Public"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store
        .update_muc_metadata(
            &to,
            RoomUpdate {
                is_open: Some(true),
                ..RoomUpdate::default()
            },
        )
        .unwrap();

    ts.store.store_referral(&from, &to, None).unwrap();
    assert_eq!(ts.store.get_referral_count(&from, &to).unwrap(), 0);
}

#[test]
fn test_referral_counts_accumulate() {
    let ts = TestStore::new();
    let from = addr("one@a.example");
    let to = addr("two@a.example");
    for (address, name) in [(&from, "One"), (&to, "Two")] {
        ts.store
            .update_muc_metadata(
                address,
                RoomUpdate {
                    is_public: Some(true),
                    name: set(name),
                    ..RoomUpdate::default()
                },
            )
            .unwrap();
    }
    ts.store.store_referral(&from, &to, None).unwrap();
    ts.store.store_referral(&from, &to, None).unwrap();
    assert_eq!(ts.store.get_referral_count(&from, &to).unwrap(), 2);
}

// --- Hidden rooms and joinable listing ---

#[test]
fn test_hidden_rooms_never_appear_in_listings() {
    let ts = TestStore::new();
    let room = addr("shadow@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                is_open: Some(true),
                name: set("Shadow"),
                nusers: Some(50),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    ts.store.set_room_hidden(&room, true).unwrap();

    assert!(ts.store.get_room_detail(&room).unwrap().is_none());
    assert!(ts.store.get_public_room_view(&room).unwrap().is_none());
    let listed = ts
        .store
        .query_public_rooms(&roomdex::db::PublicRoomQuery::default())
        .unwrap();
    assert!(listed.iter().all(|r| r.address != room));
}

#[test]
fn test_joinable_rooms_filter_on_user_count_and_openness() {
    let ts = TestStore::new();
    for (name, nusers, open) in [("big", 10, true), ("small", 1, true), ("closed", 30, false)] {
        ts.store
            .update_muc_metadata(
                &addr(&format!("{name}@a.example")),
                RoomUpdate {
                    is_open: Some(open),
                    nusers: Some(nusers),
                    ..RoomUpdate::default()
                },
            )
            .unwrap();
    }
    let joinable = ts.store.get_joinable_rooms_with_user_count(2).unwrap();
    assert_eq!(joinable.len(), 1);
    assert_eq!(joinable[0].0, addr("big@a.example"));
    assert_eq!(joinable[0].1, 10);
}

#[test]
fn test_anonymity_mode_round_trips() {
    let ts = TestStore::new();
    let room = addr("anon@a.example");
    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_open: Some(true),
                anonymity_mode: Some(Some(AnonymityMode::Semi)),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let row = ts.store.get_room(&room).unwrap().unwrap();
    assert_eq!(row.anonymity_mode, Some(AnonymityMode::Semi));
}

#[test]
fn test_name_borrows_description_budget_when_description_absent() {
    let ts = TestStore::new();
    let room = addr("longname@a.example");
    let long_name = "n".repeat(250);

    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                is_public: Some(true),
                name: Some(Some(long_name.clone())),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let detail = ts.store.get_room_detail(&room).unwrap().unwrap();
    // description budget (400) applies, so the 250-char name survives
    assert_eq!(detail.name.as_deref(), Some(long_name.as_str()));

    ts.store
        .update_muc_metadata(
            &room,
            RoomUpdate {
                name: Some(Some(long_name.clone())),
                description: set("now present"),
                ..RoomUpdate::default()
            },
        )
        .unwrap();
    let detail = ts.store.get_room_detail(&room).unwrap().unwrap();
    // with a description in the same update, the name budget (100) applies
    assert_eq!(detail.name.unwrap().chars().count(), 100);
}
