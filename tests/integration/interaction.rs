use std::sync::Arc;
use std::time::Duration;

use roomdex::analyser::Analyser;
use roomdex::client::{ChatClient, InboundMessage, Invite, MessageKind};
use roomdex::interaction::InteractionHandler;

use crate::common::{MockClient, TestStore, addr};

struct Fixture {
    ts: TestStore,
    client: Arc<MockClient>,
    _handler_task: tokio::task::JoinHandle<()>,
}

fn fixture(privileged: Vec<&str>) -> Fixture {
    let ts = TestStore::new();
    let client = MockClient::new();
    let analyser = Analyser::new(Arc::clone(&ts.store), Arc::clone(&client), None);
    let (analysis, _pool) = analyser.spawn_pool();
    let handler = Arc::new(InteractionHandler::new(
        Arc::clone(&client),
        analysis,
        privileged.into_iter().map(addr).collect(),
    ));
    let messages = client.take_inbound_messages().expect("inbound stream");
    let handler_task = tokio::spawn(async move { handler.run(messages).await });
    Fixture {
        ts,
        client,
        _handler_task: handler_task,
    }
}

fn chat(from: &str, body: &str) -> InboundMessage {
    InboundMessage {
        from: addr(from),
        kind: MessageKind::Chat,
        body: Some(body.to_string()),
        invite: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_direct_invite_is_acknowledged_and_analysed() {
    let f = fixture(vec![]);
    f.client
        .inbound_tx
        .send(InboundMessage {
            from: addr("alice@people.example/tablet"),
            kind: MessageKind::Normal,
            body: None,
            invite: Some(Invite::Direct {
                room: addr("den@rooms.example"),
            }),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let sent = f.client.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "alice@people.example/tablet");
    assert!(sent[0].1.contains("thank you for your invite"));

    // the suggestion reached the analysis pool and got probed
    assert!(f.client.info_query_count(&addr("den@rooms.example")) >= 1);
    // probing an unknown address leaves a negative cache entry
    let meta = f
        .ts
        .store
        .get_address_metadata(&addr("den@rooms.example"))
        .unwrap()
        .unwrap();
    assert!(!meta.is_reachable);
}

#[tokio::test(start_paused = true)]
async fn test_mediated_invite_suggests_without_reply() {
    let f = fixture(vec![]);
    f.client
        .inbound_tx
        .send(InboundMessage {
            from: addr("den@rooms.example"),
            kind: MessageKind::Normal,
            body: None,
            invite: Some(Invite::Mediated {
                room: addr("den@rooms.example"),
            }),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(f.client.sent.lock().unwrap().is_empty());
    assert!(f.client.info_query_count(&addr("den@rooms.example")) >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_direct_chat_gets_one_info_reply() {
    let f = fixture(vec![]);
    f.client.inbound_tx.send(chat("bob@people.example", "hi")).await.unwrap();
    f.client.inbound_tx.send(chat("bob@people.example", "hello?")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let sent = f.client.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1, "repeat chats must not be re-answered");
    assert!(sent[0].1.contains("crawler"));
}

#[tokio::test(start_paused = true)]
async fn test_error_and_groupchat_messages_pass_through() {
    let f = fixture(vec![]);
    for kind in [MessageKind::Error, MessageKind::Groupchat] {
        f.client
            .inbound_tx
            .send(InboundMessage {
                from: addr("noisy@people.example"),
                kind,
                body: Some("ignored".to_string()),
                invite: None,
            })
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(f.client.sent.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_privileged_sender_invite_is_accepted() {
    let f = fixture(vec!["admin@people.example"]);
    f.client
        .inbound_tx
        .send(InboundMessage {
            from: addr("admin@people.example/home"),
            kind: MessageKind::Normal,
            body: None,
            invite: Some(Invite::Direct {
                room: addr("vip@rooms.example"),
            }),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(f.client.info_query_count(&addr("vip@rooms.example")) >= 1);
    assert_eq!(f.client.sent.lock().unwrap().len(), 1);
}
