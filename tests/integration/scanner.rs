use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use roomdex::analyser::Analyser;
use roomdex::client::{DiscoItem, Identity, InfoForm, FORM_TYPE_SERVERINFO};
use roomdex::db::DomainUpdate;
use roomdex::models::SoftwareInfo;
use roomdex::scanner::Scanner;
use roomdex::watcher::Watcher;

use crate::common::{MockClient, TestStore, addr, chat_service_info, client_pc_info, open_room_info};

fn item(jid: &str) -> DiscoItem {
    DiscoItem {
        jid: addr(jid),
        node: None,
        name: None,
    }
}

async fn settle(ts: &TestStore, room: &str, attempts: usize) -> bool {
    let address = addr(room);
    for _ in 0..attempts {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if ts.store.get_room(&address).unwrap().is_some() {
            return true;
        }
    }
    false
}

fn scanner_under_test(
    ts: &TestStore,
    client: &Arc<MockClient>,
) -> Scanner<MockClient> {
    let watcher = Watcher::new(Arc::clone(&ts.store), Arc::clone(client), vec![]);
    let analyser = Analyser::new(
        Arc::clone(&ts.store),
        Arc::clone(client),
        Some(watcher.handle()),
    );
    let (analysis, _pool) = analyser.spawn_pool();
    Scanner::new(Arc::clone(&ts.store), Arc::clone(client), analysis)
}

#[tokio::test(start_paused = true)]
async fn test_scan_reconciles_identities_software_and_rooms() {
    let ts = TestStore::new();
    let client = MockClient::new();
    let domain = addr("chat.example");

    ts.store.require_domain("chat.example", None).unwrap();
    client.set_info(&domain, chat_service_info());
    client.set_version(
        &domain,
        SoftwareInfo {
            name: Some("prosody".to_string()),
            version: Some("0.12".to_string()),
            os: Some("linux".to_string()),
        },
    );
    client.set_items(&domain, vec![item("lobby@chat.example")]);
    client.set_info(&addr("lobby@chat.example"), open_room_info("Lobby", 4, None));

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();

    let row = ts.store.get_domain("chat.example").unwrap().unwrap();
    assert_eq!(row.software_name.as_deref(), Some("prosody"));
    assert_eq!(row.software_version.as_deref(), Some("0.12"));
    let identities = ts.store.get_domain_identities("chat.example").unwrap();
    assert!(identities.contains(&("conference".to_string(), "text".to_string())));

    // the discovered room flows analyser -> watcher -> store
    assert!(settle(&ts, "lobby@chat.example", 100).await);
}

#[tokio::test(start_paused = true)]
async fn test_drive_by_domains_are_recorded_not_analysed() {
    let ts = TestStore::new();
    let client = MockClient::new();
    let domain = addr("chat.example");

    ts.store.require_domain("chat.example", None).unwrap();
    client.set_info(&domain, chat_service_info());
    client.set_items(
        &domain,
        vec![item("other.example"), item("lobby@chat.example")],
    );
    client.set_info(&addr("lobby@chat.example"), open_room_info("Lobby", 4, None));

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();
    assert!(settle(&ts, "lobby@chat.example", 100).await);

    let other = ts.store.get_domain("other.example").unwrap().unwrap();
    assert!(other.last_seen.is_some());
    // the drive-by domain itself was never probed as a room
    assert_eq!(client.info_query_count(&addr("other.example")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_chat_domain_items_collect_bare_domains_backdated() {
    let ts = TestStore::new();
    let client = MockClient::new();
    let domain = addr("web.example");

    ts.store.require_domain("web.example", None).unwrap();
    client.set_info(&domain, client_pc_info());
    client.set_items(
        &domain,
        vec![item("peer.example"), item("user@web.example")],
    );

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();

    let peer = ts.store.get_domain("peer.example").unwrap().unwrap();
    let last_seen = peer.last_seen.expect("backdated last_seen");
    assert!(Utc::now() - last_seen > chrono::Duration::hours(5));
    // items with a localpart are ignored for domain discovery
    assert_eq!(client.info_query_count(&addr("user@web.example")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recently_seen_non_chat_domains_are_skipped() {
    let ts = TestStore::new();
    let client = MockClient::new();

    ts.store
        .require_domain("quiet.example", Some(chrono::Duration::zero()))
        .unwrap();
    client.set_info(&addr("quiet.example"), client_pc_info());

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();
    // seen moments ago and not a chat service: not probed again
    assert_eq!(client.info_query_count(&addr("quiet.example")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_domains_are_swept_after_the_pass() {
    let ts = TestStore::new();
    let client = MockClient::new();

    ts.store
        .require_domain("dead.example", Some(chrono::Duration::days(-30)))
        .unwrap();
    ts.store
        .require_domain("pinned.example", Some(chrono::Duration::days(-30)))
        .unwrap();
    ts.store.set_domain_delisted("pinned.example", true).unwrap();

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();

    assert!(ts.store.get_domain("dead.example").unwrap().is_none());
    assert!(ts.store.get_domain("pinned.example").unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_items_are_paged_until_a_short_page() {
    let ts = TestStore::new();
    let client = MockClient::new();
    let domain = addr("big.example");

    ts.store.require_domain("big.example", None).unwrap();
    client.set_info(&domain, chat_service_info());

    // 150 rooms: one full page of 100 and a short page of 50
    let mut items = Vec::new();
    for i in 0..150 {
        let jid = format!("room{i}@big.example");
        items.push(item(&jid));
        client.set_info(&addr(&jid), open_room_info(&format!("Room {i}"), 3, None));
    }
    client.set_items(&domain, items);

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();

    assert!(settle(&ts, "room0@big.example", 400).await);
    assert!(settle(&ts, "room149@big.example", 400).await);
}

#[tokio::test(start_paused = true)]
async fn test_contacts_are_reconciled_from_server_info() {
    let ts = TestStore::new();
    let client = MockClient::new();
    let domain = addr("contact.example");

    ts.store.require_domain("contact.example", None).unwrap();
    let mut info = chat_service_info();
    info.exts.push(
        InfoForm::new(FORM_TYPE_SERVERINFO)
            .with_field("abuse-addresses", "mailto:abuse@contact.example"),
    );
    info.identities.push(Identity {
        category: "server".to_string(),
        type_: "im".to_string(),
        name: None,
    });
    client.set_info(&domain, info);

    let scanner = scanner_under_test(&ts, &client);
    scanner.run_pass().await.unwrap();

    let raw = ts.raw();
    let (role, address): (String, String) = raw
        .query_row(
            "SELECT role, address FROM domain_contact dc
             JOIN domain d ON d.id = dc.domain_id WHERE d.domain = 'contact.example'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(role, "abuse");
    assert_eq!(address, "mailto:abuse@contact.example");

    // a later scan without the contact extension drops the row
    client.set_info(&domain, chat_service_info());
    ts.store
        .update_domain(
            "contact.example",
            DomainUpdate {
                contacts: Some(vec![]),
                ..DomainUpdate::default()
            },
        )
        .unwrap();
    let count: i64 = raw
        .query_row(
            "SELECT COUNT(*) FROM domain_contact dc
             JOIN domain d ON d.id = dc.domain_id WHERE d.domain = 'contact.example'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(count, 0);
}
