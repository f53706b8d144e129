//! Catalogue replication over a pub/sub node.
//!
//! The server side republishes the public-room base view as one item per
//! address and repairs divergence with a reconciliation pass on startup;
//! the client side mirrors such a node into a local store it owns
//! exclusively.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::address::Address;
use crate::client::{ChatClient, MIRROR_NODE, NodeConfig, PubSubUpdate, RoomSyncItem};
use crate::db::{PublicRoomQuery, RoomUpdate, Store};
use crate::error::CrawlError;
use crate::events::StoreEvent;
use crate::models::PublicRoomView;
use crate::worker_pool::{PoolConfig, WaitCounter, WorkerPool};

const PUBLISH_WORKERS: usize = 4;
const PUBLISH_QUEUE: usize = PUBLISH_WORKERS * 128;
const PUBLISH_DELAY: Duration = Duration::from_millis(40);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(15);

const TRANSFER_WORKERS: usize = 32;
const TRANSFER_QUEUE: usize = 64;

#[derive(Debug)]
enum MirrorOp {
    Publish(RoomSyncItem),
    Retract(Address),
}

fn compose_item(view: &PublicRoomView) -> RoomSyncItem {
    RoomSyncItem {
        address: view.address.clone(),
        is_open: view.is_open,
        anonymity_mode: view.anonymity_mode,
        nusers: view.nusers_moving_average,
        name: view.name.clone(),
        language: view.language.clone(),
        description: view.description.clone(),
    }
}

pub struct MirrorServer<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    target: Address,
    pool: Arc<WorkerPool<MirrorOp>>,
}

impl<C: ChatClient> MirrorServer<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, target: Address) -> Self {
        let pool = {
            let client = Arc::clone(&client);
            let target = target.clone();
            WorkerPool::new(
                PoolConfig::new("mirror-server", PUBLISH_WORKERS)
                    .max_queue(PUBLISH_QUEUE)
                    .per_task_timeout(Some(PUBLISH_TIMEOUT))
                    .inter_task_delay(PUBLISH_DELAY),
                move |op: MirrorOp| {
                    let client = Arc::clone(&client);
                    let target = target.clone();
                    async move {
                        match op {
                            MirrorOp::Publish(item) => {
                                let id = item.address.to_string();
                                client
                                    .pubsub_publish(&target, MIRROR_NODE, &id, &item)
                                    .await?;
                            }
                            MirrorOp::Retract(address) => {
                                let id = address.to_string();
                                if let Err(e) = client
                                    .pubsub_retract(&target, MIRROR_NODE, &id, true)
                                    .await
                                {
                                    // retracting something already gone is fine
                                    if !e.is_permanent_absence() {
                                        return Err(e.into());
                                    }
                                }
                            }
                        }
                        Ok(())
                    }
                },
            )
        };
        MirrorServer {
            store,
            client,
            target,
            pool,
        }
    }

    pub fn close(&self) {
        self.pool.close(false);
    }

    /// Establish the node, reconcile it against the local catalogue, then
    /// follow store signals until the event bus closes.
    pub async fn run(&self) -> Result<(), CrawlError> {
        self.establish().await;

        let mut events = self.store.subscribe();
        loop {
            match events.recv().await {
                Ok(StoreEvent::RoomChanged(address)) => self.on_room_changed(&address),
                Ok(StoreEvent::RoomDeleted(address)) => {
                    self.enqueue(MirrorOp::Retract(address));
                }
                Ok(StoreEvent::DomainChanged(_)) | Ok(StoreEvent::DomainDeleted(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("⚠️ mirror-server: lagged, missed {n} store events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    /// Create and configure the node, then reconcile it: publish local rows
    /// the remote lacks, retract remote items gone locally.
    pub async fn establish(&self) {
        let client = &self.client;
        match client.pubsub_create_node(&self.target, MIRROR_NODE).await {
            Ok(()) => println!("🪞 mirror-server: node created"),
            Err(e) if e.is_conflict() => println!("🪞 mirror-server: node exists already"),
            Err(e) => {
                eprintln!("⚠️ mirror-server: failed to create node: {e}");
                return;
            }
        }

        if let Err(e) = client
            .pubsub_configure_node(&self.target, MIRROR_NODE, &NodeConfig::default())
            .await
        {
            eprintln!("⚠️ mirror-server: failed to configure node: {e}");
        }

        // Initial reconciliation repairs lost deletes and missed creations.
        let ids = match client.pubsub_list_item_ids(&self.target, MIRROR_NODE).await {
            Ok(ids) => ids,
            Err(e) => {
                eprintln!("⚠️ mirror-server: init-sync: failed to query existing items: {e}");
                return;
            }
        };
        let mut remote: HashSet<String> = ids.into_iter().collect();

        let locals = match self.store.query_public_rooms(&PublicRoomQuery::default()) {
            Ok(locals) => locals,
            Err(e) => {
                eprintln!("⚠️ mirror-server: init-sync: failed to read local catalogue: {e}");
                return;
            }
        };

        let mut ncreated = 0usize;
        let mut nok = 0usize;
        for view in &locals {
            if remote.remove(&view.address.to_string()) {
                nok += 1;
            } else {
                self.pool.enqueue(MirrorOp::Publish(compose_item(view))).await;
                ncreated += 1;
            }
        }
        let ndeleted = remote.len();
        for id in remote {
            if let Ok(address) = id.parse::<Address>() {
                self.pool.enqueue(MirrorOp::Retract(address)).await;
            }
        }

        println!(
            "🪞 mirror-server: init-sync: {ncreated} creates, {ndeleted} deletes; {nok} items in sync"
        );
    }

    fn on_room_changed(&self, address: &Address) {
        match self.store.get_public_room_view(address) {
            Ok(Some(view)) => self.enqueue(MirrorOp::Publish(compose_item(&view))),
            // no longer in the public base view: turn the update into a delete
            Ok(None) => self.enqueue(MirrorOp::Retract(address.clone())),
            Err(e) => {
                eprintln!("⚠️ mirror-server: lost update for {address}: {e}");
            }
        }
    }

    fn enqueue(&self, op: MirrorOp) {
        if self.pool.enqueue_nowait(op).is_err() {
            eprintln!("⚠️ mirror-server: lost update due to overloaded publish worker");
        }
    }
}

pub struct MirrorClient<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    source: Address,
}

impl<C: ChatClient> MirrorClient<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, source: Address) -> Self {
        MirrorClient {
            store,
            client,
            source,
        }
    }

    /// Subscribe, perform the initial transfer, then follow pushes until
    /// the update stream closes.
    pub async fn run(&self) -> Result<(), CrawlError> {
        match self.client.pubsub_subscribe(&self.source, MIRROR_NODE).await {
            Ok(()) => println!("🪞 mirror-client: subscribed to {}", self.source),
            Err(e) if e.is_conflict() => {
                println!("🪞 mirror-client: already subscribed to {}", self.source);
            }
            Err(e) => return Err(e.into()),
        }

        self.initial_transfer().await;

        let Some(mut updates) = self.client.take_pubsub_updates() else {
            eprintln!("⚠️ mirror-client: pubsub update stream unavailable");
            return Ok(());
        };
        while let Some(update) = updates.recv().await {
            match update {
                PubSubUpdate::Published { id, payload } => {
                    println!("🪞 mirror-client: received update for {id}");
                    if let Err(e) = self.apply(payload) {
                        eprintln!("⚠️ mirror-client: failed to apply update for {id}: {e}");
                    }
                }
                PubSubUpdate::Retracted { id } => {
                    println!("🪞 mirror-client: received delete for {id}");
                    match id.parse::<Address>() {
                        Ok(address) => {
                            if let Err(e) = self.store.delete_all_muc_data(&address) {
                                eprintln!("⚠️ mirror-client: failed to delete {id}: {e}");
                            }
                        }
                        Err(e) => eprintln!("⚠️ mirror-client: undecodable item id {id:?}: {e}"),
                    }
                }
            }
        }
        Ok(())
    }

    /// Download the full remote item set, apply it, then delete any local
    /// public room the remote no longer lists.
    pub async fn initial_transfer(&self) {
        let ids = match self
            .client
            .pubsub_list_item_ids(&self.source, MIRROR_NODE)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                eprintln!("⚠️ mirror-client: init-sync: failed to query items: {e}");
                return;
            }
        };
        println!(
            "🪞 mirror-client: init-sync: remote knows {} entries, downloading",
            ids.len()
        );

        let vanished: Arc<std::sync::Mutex<HashSet<String>>> = Arc::default();
        let ctr = Arc::new(WaitCounter::new(ids.len()));

        let pool = {
            let store = Arc::clone(&self.store);
            let client = Arc::clone(&self.client);
            let source = self.source.clone();
            let vanished = Arc::clone(&vanished);
            WorkerPool::new(
                PoolConfig::new("mirror-transfer", TRANSFER_WORKERS)
                    .max_queue(TRANSFER_QUEUE)
                    .per_task_timeout(Some(Duration::from_secs(15)))
                    .inter_task_delay(Duration::ZERO),
                move |(id, ctr): (String, Arc<WaitCounter>)| {
                    let store = Arc::clone(&store);
                    let client = Arc::clone(&client);
                    let source = source.clone();
                    let vanished = Arc::clone(&vanished);
                    async move {
                        let _guard = crate::worker_pool::CounterGuard(ctr);
                        match client.pubsub_get_item(&source, MIRROR_NODE, &id).await {
                            Ok(item) => apply_item(&store, item),
                            Err(e) if e.is_permanent_absence() => {
                                // vanished mid-transfer; delete in the final sweep
                                let mut vanished =
                                    vanished.lock().unwrap_or_else(|p| p.into_inner());
                                vanished.insert(id);
                                Ok(())
                            }
                            Err(e) => Err(e.into()),
                        }
                    }
                },
            )
        };

        for id in ids.iter().cloned() {
            pool.enqueue((id, Arc::clone(&ctr))).await;
        }
        ctr.wait().await;
        pool.close(false);
        println!("🪞 mirror-client: init-sync: state download complete");

        let vanished = vanished.lock().unwrap_or_else(|p| p.into_inner());
        let remote: HashSet<String> = ids
            .into_iter()
            .filter(|id| !vanished.contains(id))
            .collect();
        match self.store.list_all_public_addresses() {
            Ok(locals) => {
                for address in locals {
                    if !remote.contains(&address.to_string()) {
                        println!("🪞 mirror-client: init-sync: {address} not in remote, deleting");
                        if let Err(e) = self.store.delete_all_muc_data(&address) {
                            eprintln!("⚠️ mirror-client: failed to delete {address}: {e}");
                        }
                    }
                }
            }
            Err(e) => eprintln!("⚠️ mirror-client: init-sync: failed to list local rooms: {e}"),
        }
        println!("🪞 mirror-client: init-sync: state transfer complete");
    }

    fn apply(&self, item: RoomSyncItem) -> Result<(), CrawlError> {
        apply_item(&self.store, item)
    }
}

fn apply_item(store: &Store, item: RoomSyncItem) -> Result<(), CrawlError> {
    let address = item.address.clone();
    store.update_muc_metadata(
        &address,
        RoomUpdate {
            nusers: item.nusers.map(|n| n.round() as i64),
            is_open: Some(item.is_open),
            name: Some(item.name),
            description: Some(item.description),
            language: Some(item.language),
            anonymity_mode: Some(item.anonymity_mode),
            is_saveable: Some(true),
            ..RoomUpdate::default()
        },
    )
}
