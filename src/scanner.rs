//! Scanner: periodically enumerates peer domains, reconciles their identity
//! and software records, and feeds discovered rooms into the analysis pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use crate::address::Address;
use crate::analyser::AnalysisSink;
use crate::client::{
    ChatClient, DiscoInfo, FEATURE_MUC, FEATURE_RSM, FORM_TYPE_SERVERINFO, ItemsPage,
};
use crate::db::{DomainUpdate, Store};
use crate::error::CrawlError;
use crate::worker_pool::{CounterGuard, PoolConfig, WaitCounter, WorkerPool};

pub const MIN_INTERVAL: Duration = Duration::from_secs(3600);
const WORKERS: usize = 8;
const INTER_TASK_DELAY: Duration = Duration::from_millis(3200);
/// Domains without the chat feature are left alone for this long.
const NON_CHAT_RESCAN_DELAY_HOURS: i64 = 6;
const EXPIRE_AFTER_DAYS: i64 = 7;
const PAGE_SIZE: usize = 100;
/// Defensive cap on result-set pages requested from a single domain.
const MAX_PAGES: usize = 64;

type ScanItem = (String, Option<DateTime<Utc>>, bool, Arc<WaitCounter>);

struct ScannerCore<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    analysis: AnalysisSink,
}

pub struct Scanner<C: ChatClient> {
    core: Arc<ScannerCore<C>>,
    pool: Arc<WorkerPool<ScanItem>>,
}

impl<C: ChatClient> Scanner<C> {
    pub fn new(store: Arc<Store>, client: Arc<C>, analysis: AnalysisSink) -> Self {
        let core = Arc::new(ScannerCore {
            store,
            client,
            analysis,
        });
        let pool = {
            let core = Arc::clone(&core);
            WorkerPool::new(
                PoolConfig::new("scanner", WORKERS).inter_task_delay(INTER_TASK_DELAY),
                move |item: ScanItem| {
                    let core = Arc::clone(&core);
                    async move {
                        let (domain, last_seen, is_chat_service, ctr) = item;
                        let _guard = CounterGuard(ctr);
                        core.scan_domain(&domain, last_seen, is_chat_service).await
                    }
                },
            )
        };
        Scanner { core, pool }
    }

    pub fn close(&self) {
        self.pool.close(false);
    }

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

    /// One full scan over the known domains followed by the expiry sweep.
    pub async fn run_pass(&self) -> Result<(), CrawlError> {
        let mut domains = self.core.store.get_scannable_domains()?;
        domains.shuffle(&mut rand::thread_rng());
        println!("🌐 scanner: scanning {} domains", domains.len());

        let ctr = Arc::new(WaitCounter::new(domains.len()));
        for (domain, last_seen, is_chat_service) in domains {
            self.pool
                .enqueue((domain, last_seen, is_chat_service, Arc::clone(&ctr)))
                .await;
        }
        ctr.wait().await;

        let threshold = Utc::now() - chrono::Duration::days(EXPIRE_AFTER_DAYS);
        let expired = self.core.store.expire_domains(threshold)?;
        if expired > 0 {
            println!("🧹 scanner: expired {expired} stale domains");
        }
        Ok(())
    }
}

/// Pull `(role, address)` contact pairs out of the server-info extension.
fn extract_contacts(info: &DiscoInfo) -> Vec<(String, String)> {
    let mut contacts = Vec::new();
    if let Some(form) = info.ext(FORM_TYPE_SERVERINFO) {
        for (var, values) in &form.fields {
            let Some(role) = var.strip_suffix("-addresses") else {
                continue;
            };
            for value in values {
                if !value.is_empty() {
                    contacts.push((role.to_string(), value.clone()));
                }
            }
        }
    }
    contacts
}

impl<C: ChatClient> ScannerCore<C> {
    async fn scan_domain(
        &self,
        domain: &str,
        last_seen: Option<DateTime<Utc>>,
        was_chat_service: bool,
    ) -> Result<(), CrawlError> {
        let address = match Address::from_domain(domain) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("⚠️ scanner: skipping malformed domain {domain:?}: {e}");
                return Ok(());
            }
        };

        if !was_chat_service {
            if let Some(seen) = last_seen {
                if Utc::now() - seen < chrono::Duration::hours(NON_CHAT_RESCAN_DELAY_HOURS) {
                    return Ok(());
                }
            }
        }

        let info = match self.client.disco_info(&address, false).await {
            Ok(info) => info,
            Err(e) => {
                println!("ℹ️ scanner: {domain}: service info failed ({:?})", e.condition);
                return Ok(());
            }
        };

        let software = self.client.software_version(&address).await.ok();
        let identities = info
            .identities
            .iter()
            .map(|i| (i.category.clone(), i.type_.clone()))
            .collect::<Vec<_>>();
        self.store.update_domain(
            domain,
            DomainUpdate {
                identities: Some(identities),
                contacts: Some(extract_contacts(&info)),
                software,
            },
        )?;

        if info.has_feature(FEATURE_MUC) {
            self.enumerate_chat_domain(&address, info.has_feature(FEATURE_RSM))
                .await
        } else {
            self.enumerate_other_domain(&address).await
        }
    }

    /// Walk the rooms of a chat service, paging where supported, and push
    /// anything that looks like a room into the analysis pool.
    async fn enumerate_chat_domain(
        &self,
        address: &Address,
        supports_paging: bool,
    ) -> Result<(), CrawlError> {
        let mut after: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = supports_paging.then(|| ItemsPage {
                after: after.clone(),
                max: PAGE_SIZE,
            });
            let response = self
                .client
                .disco_items(address, None, page.as_ref())
                .await?;

            for item in &response.items {
                if item.jid.is_bare_domain() {
                    // drive-by domain find, not a room on this service
                    self.store
                        .require_domain(item.jid.domain(), Some(chrono::Duration::zero()))?;
                    continue;
                }
                if self.store.get_address_metadata(&item.jid)?.is_none() {
                    self.analysis.suggest(item.jid.bare(), true).await;
                }
            }

            pages += 1;
            let short_page = response.items.len() < PAGE_SIZE;
            if !supports_paging || short_page || pages >= MAX_PAGES {
                break;
            }
            after = response.last;
            if after.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Non-chat domains still get their items walked once: bare-domain
    /// items are drive-by discoveries, backdated so the next pass does not
    /// re-probe them immediately.
    async fn enumerate_other_domain(&self, address: &Address) -> Result<(), CrawlError> {
        let response = self.client.disco_items(address, None, None).await?;
        for item in &response.items {
            if !item.jid.is_bare_domain() {
                continue;
            }
            self.store.require_domain(
                item.jid.domain(),
                Some(-chrono::Duration::hours(NON_CHAT_RESCAN_DELAY_HOURS)),
            )?;
        }
        Ok(())
    }
}
