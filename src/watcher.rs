//! Watcher: periodically refreshes metadata of known rooms that are not
//! currently observed from the inside, and expires rooms that vanished.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::seq::SliceRandom;

use crate::address::Address;
use crate::client::{ChatClient, DiscoInfo, FEATURE_MUC_PERSISTENT, FORM_TYPE_ROOMINFO, InfoForm};
use crate::db::{RoomUpdate, Store};
use crate::error::CrawlError;
use crate::worker_pool::{CounterGuard, PoolConfig, WaitCounter, WorkerPool};

pub const MIN_INTERVAL: Duration = Duration::from_secs(3600);
const WORKERS: usize = 8;
const INTER_TASK_DELAY: Duration = Duration::from_millis(400);
const EXPIRE_AFTER_DAYS: i64 = 2;

type WatchItem = (Address, Option<Arc<WaitCounter>>);

/// Producer handle: the analyser pushes freshly classified addresses here.
#[derive(Clone)]
pub struct WatcherHandle {
    pool: Arc<WorkerPool<WatchItem>>,
}

impl WatcherHandle {
    pub async fn queue_request(&self, address: Address) {
        self.pool.enqueue((address, None)).await;
    }
}

struct WatcherCore<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    avatar_whitelist: Vec<Address>,
}

pub struct Watcher<C: ChatClient> {
    core: Arc<WatcherCore<C>>,
    pool: Arc<WorkerPool<WatchItem>>,
}

impl<C: ChatClient> Watcher<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, avatar_whitelist: Vec<Address>) -> Self {
        let core = Arc::new(WatcherCore {
            store,
            client,
            avatar_whitelist,
        });
        let pool = {
            let core = Arc::clone(&core);
            WorkerPool::new(
                PoolConfig::new("watcher", WORKERS).inter_task_delay(INTER_TASK_DELAY),
                move |item: WatchItem| {
                    let core = Arc::clone(&core);
                    async move {
                        let (address, ctr) = item;
                        let _guard = ctr.map(CounterGuard);
                        core.process(&address).await
                    }
                },
            )
        };
        Watcher { core, pool }
    }

    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            pool: Arc::clone(&self.pool),
        }
    }

    pub fn close(&self) {
        self.pool.close(false);
    }

    /// Periodic driver: one full pass over the inactive rooms, an expiry
    /// sweep, then sleep out the remainder of the interval.
    pub async fn run(&self) -> Result<(), CrawlError> {
        loop {
            let started = tokio::time::Instant::now();
            self.run_pass().await?;
            let elapsed = started.elapsed();
            if elapsed < MIN_INTERVAL {
                tokio::time::sleep(MIN_INTERVAL - elapsed).await;
            }
        }
    }

    /// One refresh pass over the inactive rooms, then the expiry sweep.
    pub async fn run_pass(&self) -> Result<(), CrawlError> {
        let mut items = self.core.store.get_all_known_inactive_rooms()?;
        items.shuffle(&mut rand::thread_rng());
        println!("👀 watcher: refreshing {} inactive rooms", items.len());

        let ctr = Arc::new(WaitCounter::new(items.len()));
        for address in items {
            self.pool.enqueue((address, Some(Arc::clone(&ctr)))).await;
        }
        ctr.wait().await;

        let threshold = chrono::Utc::now() - chrono::Duration::days(EXPIRE_AFTER_DAYS);
        let expired = self.core.store.expire_mucs(threshold)?;
        if expired > 0 {
            println!("🧹 watcher: expired {expired} stale rooms");
        }
        Ok(())
    }
}

impl<C: ChatClient> WatcherCore<C> {
    async fn process(&self, address: &Address) -> Result<(), CrawlError> {
        let info = match self.client.disco_info(address, true).await {
            Ok(info) => info,
            Err(e) if e.is_permanent_absence() => {
                println!("🗑️ watcher: {address} does not exist anymore, erasing");
                self.store.delete_all_muc_data(address)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let update = room_update_from_info(&info);
        let is_public = update.is_public == Some(true);

        let avatar = if is_public && self.is_avatar_whitelisted(address) {
            match self.client.fetch_avatar(address).await {
                Ok(avatar) => avatar,
                Err(e) => {
                    println!("ℹ️ watcher: failed to fetch avatar of {address}: {e}");
                    None
                }
            }
        } else {
            None
        };

        self.store.update_muc_metadata(address, update)?;

        let decoded = avatar.and_then(|a| {
            match BASE64.decode(a.data_base64.as_bytes()) {
                Ok(data) => Some((a.mime_type, data)),
                Err(e) => {
                    println!("ℹ️ watcher: {address}: undecodable avatar payload: {e}");
                    None
                }
            }
        });
        self.store.update_muc_avatar(address, decoded).await?;
        Ok(())
    }

    fn is_avatar_whitelisted(&self, address: &Address) -> bool {
        self.avatar_whitelist.contains(address)
            || self.avatar_whitelist.contains(&address.domain_address())
    }
}

fn form_text(form: &InfoForm, var: &str) -> Option<Option<String>> {
    form.fields
        .get(var)
        .map(|vs| vs.first().filter(|s| !s.is_empty()).cloned())
}

/// Translate a service-info response into a room change set.
pub fn room_update_from_info(info: &DiscoInfo) -> RoomUpdate {
    let meta = info.classify();
    let room_form = info.ext(FORM_TYPE_ROOMINFO);

    let mut update = RoomUpdate {
        is_saveable: Some(info.has_feature(FEATURE_MUC_PERSISTENT)),
        is_open: Some(meta.is_joinable),
        is_public: Some(meta.is_indexable),
        nusers: room_form
            .and_then(|f| f.value("muc#roominfo_occupants"))
            .and_then(|v| v.parse::<i64>().ok()),
        anonymity_mode: info.anonymity_mode().map(Some),
        ..RoomUpdate::default()
    };

    if meta.is_indexable {
        update.name = Some(
            info.identities
                .first()
                .and_then(|i| i.name.clone())
                .filter(|n| !n.is_empty()),
        );
        if let Some(form) = room_form {
            if let Some(subject) = form_text(form, "muc#roominfo_subject") {
                update.subject = Some(subject);
            }
            if let Some(description) = form_text(form, "muc#roominfo_description") {
                update.description = Some(description);
            } else if let Some(description) = form_text(form, "muc#roomconfig_roomdesc") {
                update.description = Some(description);
            }
            if let Some(language) = form_text(form, "muc#roominfo_lang") {
                update.language = Some(language);
            }
            if let Some(logs) = form_text(form, "muc#roominfo_logs") {
                update.http_logs_url = Some(logs);
            }
            if let Some(webchat) = form_text(form, "muc#roominfo_webchat") {
                update.web_chat_url = Some(webchat);
            }
        }
    }

    update
}
