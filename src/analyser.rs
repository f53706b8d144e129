//! The shared analysis pool: every newly discovered address funnels through
//! here for a deduplicating freshness check before it enters the catalogue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::address::Address;
use crate::client::{ChatClient, FORM_TYPE_ROOMINFO};
use crate::db::{
    CACHE_TTL_BANNED, CACHE_TTL_CLOSED, CACHE_TTL_NON_SERVICE, CACHE_TTL_UNREACHABLE, Store,
};
use crate::error::CrawlError;
use crate::models::AddressMetadata;
use crate::watcher::WatcherHandle;
use crate::worker_pool::{PoolConfig, WorkerPool};

pub const ANALYSIS_WORKERS: usize = 16;
pub const ANALYSIS_QUEUE: usize = 128;
pub const ANALYSIS_DELAY: Duration = Duration::from_millis(500);
pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(15);

/// Unprivileged suggestions for rooms reporting fewer occupants than this
/// are not forwarded for indexing. Privileged submissions skip the gate.
pub const MIN_SUGGESTION_USERS: i64 = 1;

/// One unit of analysis work. Referral tasks record where the address was
/// mentioned once the destination turns out to be indexable.
#[derive(Debug, Clone)]
pub enum AnalysisTask {
    Plain {
        address: Address,
        privileged: bool,
    },
    Referral {
        address: Address,
        source: Address,
        timestamp: DateTime<Utc>,
    },
}

impl AnalysisTask {
    pub fn address(&self) -> &Address {
        match self {
            AnalysisTask::Plain { address, .. } => address,
            AnalysisTask::Referral { address, .. } => address,
        }
    }
}

/// Cloneable producer handle onto the analysis pool.
#[derive(Clone)]
pub struct AnalysisSink {
    pool: Arc<WorkerPool<AnalysisTask>>,
}

impl AnalysisSink {
    /// Suggest an address, suspending while the queue is full.
    pub async fn suggest(&self, address: Address, privileged: bool) {
        self.pool
            .enqueue(AnalysisTask::Plain {
                address,
                privileged,
            })
            .await;
    }

    /// Suggest without blocking; overflow is logged and dropped.
    pub fn suggest_nowait(&self, task: AnalysisTask) {
        let address = task.address().clone();
        if self.pool.enqueue_nowait(task).is_err() {
            eprintln!("⚠️ analysis: dropping suggested address due to queue overrun: {address}");
        }
    }
}

pub struct Analyser<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    watcher: Option<WatcherHandle>,
}

impl<C: ChatClient> Analyser<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, watcher: Option<WatcherHandle>) -> Arc<Self> {
        Arc::new(Analyser {
            store,
            client,
            watcher,
        })
    }

    /// Mount the analyser on its worker pool and hand back the producer
    /// side used by every other component.
    pub fn spawn_pool(self: &Arc<Self>) -> (AnalysisSink, Arc<WorkerPool<AnalysisTask>>) {
        let analyser = Arc::clone(self);
        let pool = WorkerPool::new(
            PoolConfig::new("analysis", ANALYSIS_WORKERS)
                .max_queue(ANALYSIS_QUEUE)
                .per_task_timeout(Some(ANALYSIS_TIMEOUT))
                .inter_task_delay(ANALYSIS_DELAY),
            move |task| {
                let analyser = Arc::clone(&analyser);
                async move { analyser.process(task).await }
            },
        );
        (AnalysisSink { pool: Arc::clone(&pool) }, pool)
    }

    pub async fn process(&self, task: AnalysisTask) -> Result<(), CrawlError> {
        let address = task.address().clone();
        let privileged = matches!(task, AnalysisTask::Plain { privileged: true, .. });

        if let Some(known) = self.store.get_address_metadata(&address)? {
            if known.is_banned {
                println!("🚫 analysis: {address}: banned there, not checking now");
                return Ok(());
            }
            if !known.is_joinable {
                println!("ℹ️ analysis: {address}: known not to be a joinable room");
                return Ok(());
            }
        }

        let info = match self.client.disco_info(&address, true).await {
            Ok(info) => Some(info),
            Err(e) => {
                println!("ℹ️ analysis: {address}: failed to discover information: {e}");
                None
            }
        };
        let metadata = info
            .as_ref()
            .map(|i| i.classify())
            .unwrap_or(AddressMetadata::UNREACHABLE);

        println!(
            "🔎 analysis: {address}: reachable={} service={} joinable={} indexable={} (privileged={privileged})",
            metadata.is_reachable,
            metadata.is_chat_service,
            metadata.is_joinable,
            metadata.is_indexable,
        );

        if metadata.is_banned {
            self.store
                .cache_address_metadata(&address, metadata, CACHE_TTL_BANNED)?;
        } else if !metadata.is_reachable {
            self.store
                .cache_address_metadata(&address, metadata, CACHE_TTL_UNREACHABLE)?;
        } else if !metadata.is_chat_service {
            self.store
                .cache_address_metadata(&address, metadata, CACHE_TTL_NON_SERVICE)?;
        } else if !metadata.is_joinable && !metadata.is_indexable {
            // closed or password-protected: remember not to re-probe for a while
            self.store
                .cache_address_metadata(&address, metadata, CACHE_TTL_CLOSED)?;
        }

        if let AnalysisTask::Referral {
            source, timestamp, ..
        } = &task
        {
            if metadata.is_indexable {
                self.store
                    .store_referral(source, &address, Some(*timestamp))?;
            }
        }

        if metadata.is_joinable || metadata.is_indexable {
            let occupants = info
                .as_ref()
                .and_then(|i| i.ext(FORM_TYPE_ROOMINFO))
                .and_then(|f| f.value("muc#roominfo_occupants"))
                .and_then(|v| v.parse::<i64>().ok());
            if !privileged && occupants.is_some_and(|n| n < MIN_SUGGESTION_USERS) {
                println!("ℹ️ analysis: {address}: reports no users, not indexing");
                return Ok(());
            }
            if let Some(watcher) = &self.watcher {
                watcher.queue_request(address).await;
            }
        }

        Ok(())
    }
}
