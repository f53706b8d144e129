//! The relational store: schema, transactional mutators, change signals and
//! the in-memory address-metadata cache.
//!
//! Every public operation opens a fresh transaction on the single shared
//! connection, performs all of its work synchronously, and commits before
//! returning; change signals fire after commit. The connection never
//! crosses an await point.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru_cache::LruCache;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::address::Address;
use crate::avatar;
use crate::error::CrawlError;
use crate::events::{EventBus, StoreEvent};
use crate::models::{
    AddressMetadata, AnonymityMode, PublicRoomView, RoomDetail, SoftwareInfo, StatsResponse,
};

pub const CACHE_TTL_UNREACHABLE: Duration = Duration::from_secs(300);
pub const CACHE_TTL_CLOSED: Duration = Duration::from_secs(3600);
pub const CACHE_TTL_NON_SERVICE: Duration = Duration::from_secs(3600);
pub const CACHE_TTL_BANNED: Duration = Duration::from_secs(86400);

const METADATA_CACHE_SIZE: usize = 512;

/// After 24 spaced updates only ~1% of the original value remains.
pub const NUSERS_MOVING_AVERAGE_FACTOR: f64 = 0.82;
/// Minimum spacing between moving-average updates.
pub const NUSERS_MOVING_AVERAGE_INTERVAL_SECS: i64 = 57 * 60;

/// One exponential-moving-average step.
pub fn moving_average_step(ma: f64, n: f64) -> f64 {
    ma * NUSERS_MOVING_AVERAGE_FACTOR + n * (1.0 - NUSERS_MOVING_AVERAGE_FACTOR)
}

/// Normalise free-form text: truncate to the hard limit, collapse internal
/// whitespace, then truncate to the soft limit with a trailing ellipsis.
/// Idempotent.
pub fn process_text(text: &str, soft_limit: usize, hard_limit: Option<usize>) -> String {
    let hard_limit = hard_limit.unwrap_or(soft_limit * 2);
    let text: String = text.chars().take(hard_limit).collect();
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() > soft_limit {
        let mut out: String = text.chars().take(soft_limit.saturating_sub(1)).collect();
        out.push('…');
        out
    } else {
        text
    }
}

#[derive(Debug, Clone)]
pub struct TextLimits {
    pub max_name_length: usize,
    pub max_description_length: usize,
    pub max_subject_length: usize,
    pub max_language_length: usize,
}

impl Default for TextLimits {
    fn default() -> Self {
        TextLimits {
            max_name_length: 100,
            max_description_length: 400,
            max_subject_length: 200,
            max_language_length: 32,
        }
    }
}

/// Change set for a room row. A `None` field leaves the stored value alone;
/// the nested options on text fields distinguish "set" from "clear".
#[derive(Debug, Clone, Default)]
pub struct RoomUpdate {
    pub nusers: Option<i64>,
    pub is_open: Option<bool>,
    pub is_public: Option<bool>,
    pub is_saveable: Option<bool>,
    pub was_kicked: Option<bool>,
    pub anonymity_mode: Option<Option<AnonymityMode>>,
    pub subject: Option<Option<String>>,
    pub name: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub language: Option<Option<String>>,
    pub http_logs_url: Option<Option<String>>,
    pub web_chat_url: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

/// Change set for a domain row.
#[derive(Debug, Clone, Default)]
pub struct DomainUpdate {
    pub identities: Option<Vec<(String, String)>>,
    /// `(role, address)` pairs from the contact-info extension.
    pub contacts: Option<Vec<(String, String)>>,
    pub software: Option<SoftwareInfo>,
}

#[derive(Debug, Clone)]
pub struct DomainRow {
    pub id: i64,
    pub domain: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub software_os: Option<String>,
    pub delisted: bool,
}

#[derive(Debug, Clone)]
pub struct RoomRow {
    pub address: Address,
    pub nusers: Option<i64>,
    pub nusers_moving_average: Option<f64>,
    pub moving_average_last_update: Option<DateTime<Utc>>,
    pub is_open: bool,
    pub is_hidden: bool,
    pub was_kicked: bool,
    pub anonymity_mode: Option<AnonymityMode>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrder {
    NUsers,
    Address,
}

/// Parameters of a public-room catalogue query (search, mirror, HTTP list).
#[derive(Debug, Clone)]
pub struct PublicRoomQuery {
    pub order: SearchOrder,
    pub after_nusers: Option<f64>,
    pub after_address: Option<String>,
    pub min_users: Option<f64>,
    /// Lowercased keywords, each matched as a substring.
    pub keywords: Vec<String>,
    pub search_address: bool,
    pub search_name: bool,
    pub search_description: bool,
    pub include_closed: bool,
    pub limit: Option<usize>,
}

impl Default for PublicRoomQuery {
    fn default() -> Self {
        PublicRoomQuery {
            order: SearchOrder::NUsers,
            after_nusers: None,
            after_address: None,
            min_users: None,
            keywords: Vec::new(),
            search_address: true,
            search_name: true,
            search_description: true,
            include_closed: false,
            limit: None,
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
    events: EventBus,
    cache: Mutex<LruCache<Address, (Instant, AddressMetadata)>>,
    active: Mutex<HashSet<Address>>,
    limits: TextLimits,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

struct MucCore {
    nusers: Option<i64>,
    ma: Option<f64>,
    ma_last: Option<String>,
    is_open: bool,
    was_kicked: bool,
    anonymity: Option<String>,
}

impl Store {
    pub fn new(path: &str, limits: TextLimits) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let store = Store {
            conn: Mutex::new(conn),
            events: EventBus::new(),
            cache: Mutex::new(LruCache::new(METADATA_CACHE_SIZE)),
            active: Mutex::new(HashSet::new()),
            limits,
        };
        store.migrate();
        store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_lock(&self) -> MutexGuard<'_, LruCache<Address, (Instant, AddressMetadata)>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) {
        let conn = self.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS domain (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                last_seen TEXT,
                software_name TEXT,
                software_version TEXT,
                software_os TEXT,
                delisted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS domain_identity (
                domain_id INTEGER NOT NULL REFERENCES domain(id) ON DELETE CASCADE,
                category TEXT NOT NULL,
                type TEXT NOT NULL,
                PRIMARY KEY (domain_id, category, type)
            );
            CREATE INDEX IF NOT EXISTS idx_domain_identity_domain ON domain_identity(domain_id);
            CREATE INDEX IF NOT EXISTS idx_domain_identity_kind ON domain_identity(category, type);

            CREATE TABLE IF NOT EXISTS domain_contact (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain_id INTEGER NOT NULL REFERENCES domain(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                address TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_domain_contact_domain ON domain_contact(domain_id);

            CREATE TABLE IF NOT EXISTS muc (
                address TEXT PRIMARY KEY,
                domain_id INTEGER NOT NULL REFERENCES domain(id) ON DELETE CASCADE,
                nusers INTEGER,
                nusers_moving_average REAL,
                moving_average_last_update TEXT,
                is_open INTEGER NOT NULL,
                is_hidden INTEGER NOT NULL DEFAULT 0,
                was_kicked INTEGER NOT NULL,
                anonymity_mode TEXT,
                last_seen TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_muc_domain ON muc(domain_id);
            CREATE INDEX IF NOT EXISTS idx_muc_open ON muc(is_open);
            CREATE INDEX IF NOT EXISTS idx_muc_nusers_ma ON muc(nusers_moving_average);

            CREATE TABLE IF NOT EXISTS public_muc (
                address TEXT PRIMARY KEY
                    REFERENCES muc(address) ON DELETE CASCADE ON UPDATE CASCADE,
                subject TEXT,
                name TEXT,
                description TEXT,
                language TEXT,
                http_logs_url TEXT,
                web_chat_url TEXT
            );

            CREATE TABLE IF NOT EXISTS avatar (
                address TEXT PRIMARY KEY
                    REFERENCES public_muc(address) ON DELETE CASCADE,
                last_updated TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                hash TEXT NOT NULL,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tag (key TEXT PRIMARY KEY);

            CREATE TABLE IF NOT EXISTS public_muc_tags (
                tag TEXT NOT NULL REFERENCES tag(key) ON DELETE CASCADE,
                public_muc TEXT NOT NULL REFERENCES public_muc(address) ON DELETE CASCADE,
                PRIMARY KEY (tag, public_muc)
            );

            CREATE TABLE IF NOT EXISTS muc_referral (
                from_address TEXT NOT NULL REFERENCES public_muc(address) ON DELETE CASCADE,
                to_address TEXT NOT NULL REFERENCES public_muc(address) ON DELETE CASCADE,
                count INTEGER NOT NULL DEFAULT 0,
                last_referral_ts TEXT,
                PRIMARY KEY (from_address, to_address)
            );",
        )
        .expect("Failed to run migrations");
    }

    // --- Active-room tracking (rooms currently observed from the inside) ---

    pub fn is_active(&self, address: &Address) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.contains(address)
    }

    pub fn mark_active(&self, address: &Address) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.insert(address.clone());
    }

    pub fn mark_inactive(&self, address: &Address) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(address);
    }

    // --- Domains ---

    /// Idempotent upsert. `seen = None` only inserts (leaving `last_seen`
    /// NULL or untouched); `seen = Some(offset)` sets `last_seen = now +
    /// offset` (a negative offset backdates the row).
    pub fn require_domain(
        &self,
        domain: &str,
        seen: Option<chrono::Duration>,
    ) -> Result<i64, CrawlError> {
        let domain = domain.to_lowercase();
        let (id, inserted) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let (id, inserted) = Self::require_domain_tx(&tx, &domain)?;
            if let Some(offset) = seen {
                let ts = fmt_ts(Utc::now() + offset);
                tx.execute(
                    "UPDATE domain SET last_seen = ?1 WHERE id = ?2",
                    params![ts, id],
                )?;
            }
            tx.commit()?;
            (id, inserted)
        };
        if inserted {
            self.events.publish(StoreEvent::DomainChanged(domain));
        }
        Ok(id)
    }

    fn require_domain_tx(
        tx: &rusqlite::Transaction<'_>,
        domain: &str,
    ) -> Result<(i64, bool), CrawlError> {
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM domain WHERE domain = ?1",
                params![domain],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => Ok((id, false)),
            None => {
                tx.execute(
                    "INSERT INTO domain (domain, delisted) VALUES (?1, 0)",
                    params![domain],
                )?;
                Ok((tx.last_insert_rowid(), true))
            }
        }
    }

    /// Upsert a domain and reconcile its identity and contact sets.
    pub fn update_domain(&self, domain: &str, update: DomainUpdate) -> Result<(), CrawlError> {
        let domain = domain.to_lowercase();
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let (id, _) = Self::require_domain_tx(&tx, &domain)?;
            tx.execute(
                "UPDATE domain SET last_seen = ?1 WHERE id = ?2",
                params![now_str(), id],
            )?;

            if let Some(identities) = &update.identities {
                let mut to_add: HashSet<(String, String)> = identities.iter().cloned().collect();
                let existing: Vec<(String, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT category, type FROM domain_identity WHERE domain_id = ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                for pair in existing {
                    if !to_add.remove(&pair) {
                        tx.execute(
                            "DELETE FROM domain_identity
                             WHERE domain_id = ?1 AND category = ?2 AND type = ?3",
                            params![id, pair.0, pair.1],
                        )?;
                    }
                }
                for (category, type_) in to_add {
                    tx.execute(
                        "INSERT INTO domain_identity (domain_id, category, type)
                         VALUES (?1, ?2, ?3)",
                        params![id, category, type_],
                    )?;
                }
            }

            if let Some(contacts) = &update.contacts {
                let mut to_add: HashSet<(String, String)> = contacts.iter().cloned().collect();
                let existing: Vec<(i64, String, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, role, address FROM domain_contact WHERE domain_id = ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                for (row_id, role, address) in existing {
                    if !to_add.remove(&(role, address)) {
                        tx.execute("DELETE FROM domain_contact WHERE id = ?1", params![row_id])?;
                    }
                }
                for (role, address) in to_add {
                    tx.execute(
                        "INSERT INTO domain_contact (domain_id, role, address)
                         VALUES (?1, ?2, ?3)",
                        params![id, role, address],
                    )?;
                }
            }

            if let Some(software) = &update.software {
                tx.execute(
                    "UPDATE domain
                     SET software_name = ?1, software_version = ?2, software_os = ?3
                     WHERE id = ?4",
                    params![software.name, software.version, software.os, id],
                )?;
            }

            tx.commit()?;
        }
        self.events.publish(StoreEvent::DomainChanged(domain));
        Ok(())
    }

    pub fn get_domain(&self, domain: &str) -> Result<Option<DomainRow>, CrawlError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, domain, last_seen, software_name, software_version,
                        software_os, delisted
                 FROM domain WHERE domain = ?1",
                params![domain.to_lowercase()],
                |r| {
                    Ok(DomainRow {
                        id: r.get(0)?,
                        domain: r.get(1)?,
                        last_seen: r.get::<_, Option<String>>(2)?.as_deref().and_then(parse_ts),
                        software_name: r.get(3)?,
                        software_version: r.get(4)?,
                        software_os: r.get(5)?,
                        delisted: r.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_domain_identities(&self, domain: &str) -> Result<Vec<(String, String)>, CrawlError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT di.category, di.type FROM domain_identity di
             JOIN domain d ON d.id = di.domain_id WHERE d.domain = ?1",
        )?;
        let rows = stmt
            .query_map(params![domain.to_lowercase()], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Administrative toggle: delisted domains are excluded from scanning
    /// and never expired.
    pub fn set_domain_delisted(&self, domain: &str, delisted: bool) -> Result<(), CrawlError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE domain SET delisted = ?1 WHERE domain = ?2",
            params![delisted, domain.to_lowercase()],
        )?;
        Ok(())
    }

    /// All non-delisted domains with their chat-service classification
    /// (a recorded `conference`/`text` identity).
    pub fn get_scannable_domains(
        &self,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>, bool)>, CrawlError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT d.domain, d.last_seen,
                    EXISTS(SELECT 1 FROM domain_identity di
                           WHERE di.domain_id = d.id
                             AND di.category = 'conference' AND di.type = 'text')
             FROM domain d WHERE d.delisted = 0",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, bool>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(d, ls, svc)| (d, ls.as_deref().and_then(parse_ts), svc))
            .collect())
    }

    /// Delete stale domains, sparing delisted rows. Rooms hosted on an
    /// expired domain are deleted along with it.
    pub fn expire_domains(&self, threshold: DateTime<Utc>) -> Result<usize, CrawlError> {
        let threshold_s = fmt_ts(threshold);
        let (domains, rooms) = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let domains: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT domain FROM domain WHERE last_seen <= ?1 AND delisted = 0",
                )?;
                let rows = stmt
                    .query_map(params![threshold_s], |r| r.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            let rooms: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT m.address FROM muc m JOIN domain d ON d.id = m.domain_id
                     WHERE d.last_seen <= ?1 AND d.delisted = 0",
                )?;
                let rows = stmt
                    .query_map(params![threshold_s], |r| r.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute(
                "DELETE FROM domain WHERE last_seen <= ?1 AND delisted = 0",
                params![threshold_s],
            )?;
            tx.commit()?;
            (domains, rooms)
        };
        for address in &rooms {
            if let Ok(addr) = address.parse::<Address>() {
                self.events.publish(StoreEvent::RoomDeleted(addr));
            }
        }
        for domain in &domains {
            self.events.publish(StoreEvent::DomainDeleted(domain.clone()));
        }
        Ok(domains.len())
    }

    // --- Rooms ---

    /// Apply a change set to a room, creating the row (and its domain) on
    /// first sight. Emits `RoomChanged` only when a field actually changed;
    /// the `last_seen` refresh alone does not count.
    pub fn update_muc_metadata(
        &self,
        address: &Address,
        update: RoomUpdate,
    ) -> Result<(), CrawlError> {
        {
            let mut cache = self.cache_lock();
            cache.remove(address);
        }

        if update.is_saveable == Some(false) {
            return self.delete_all_muc_data(address);
        }

        let now = Utc::now();
        let now_s = fmt_ts(now);
        let addr_s = address.to_string();

        let description =
            Self::prepare_text_update(update.description, self.limits.max_description_length);
        // The name may spill into the description budget when this update
        // carries no description; the UI shows it in that slot then.
        let name_budget = match &description {
            Some(Some(_)) => self.limits.max_name_length,
            _ => self.limits.max_description_length,
        };
        let name = Self::prepare_text_update(update.name, name_budget);
        let subject = Self::prepare_text_update(update.subject, self.limits.max_subject_length);
        let language = update.language.map(|l| {
            l.and_then(|s| {
                let s: String = s.chars().take(self.limits.max_language_length).collect();
                if s.is_empty() { None } else { Some(s) }
            })
        });

        let mut changed = false;
        let created;

        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    "SELECT nusers, nusers_moving_average, moving_average_last_update,
                            is_open, was_kicked, anonymity_mode
                     FROM muc WHERE address = ?1",
                    params![addr_s],
                    |r| {
                        Ok(MucCore {
                            nusers: r.get(0)?,
                            ma: r.get(1)?,
                            ma_last: r.get(2)?,
                            is_open: r.get(3)?,
                            was_kicked: r.get(4)?,
                            anonymity: r.get(5)?,
                        })
                    },
                )
                .optional()?;

            created = existing.is_none();
            let old = existing.unwrap_or(MucCore {
                nusers: None,
                ma: None,
                ma_last: None,
                is_open: false,
                was_kicked: false,
                anonymity: None,
            });

            let new_is_open = update.is_open.unwrap_or(old.is_open);
            let new_was_kicked = old.was_kicked || update.was_kicked.unwrap_or(false);
            let new_anonymity: Option<String> = match update.anonymity_mode {
                Some(mode) => mode.map(|m| m.as_str().to_string()),
                None => old.anonymity.clone(),
            };
            let new_nusers = update.nusers.or(old.nusers);

            let mut new_ma = old.ma;
            let mut new_ma_last = old.ma_last.clone();
            if new_ma.is_none() {
                if let Some(n) = new_nusers {
                    new_ma = Some(n as f64);
                    new_ma_last = Some(now_s.clone());
                }
            } else if let (Some(ma), Some(n)) = (new_ma, update.nusers) {
                let due = new_ma_last
                    .as_deref()
                    .and_then(parse_ts)
                    .map(|t| {
                        t + chrono::Duration::seconds(NUSERS_MOVING_AVERAGE_INTERVAL_SECS) < now
                    })
                    .unwrap_or(true);
                if due {
                    new_ma = Some(moving_average_step(ma, n as f64));
                    new_ma_last = Some(now_s.clone());
                }
            }

            changed |= new_is_open != old.is_open;
            changed |= new_was_kicked != old.was_kicked;
            changed |= new_anonymity != old.anonymity;
            changed |= new_nusers != old.nusers;
            changed |= new_ma != old.ma;

            if created {
                let (domain_id, _) = Self::require_domain_tx(&tx, address.domain())?;
                tx.execute(
                    "UPDATE domain SET last_seen = ?1 WHERE id = ?2",
                    params![now_s, domain_id],
                )?;
                tx.execute(
                    "INSERT INTO muc (address, domain_id, nusers, nusers_moving_average,
                                      moving_average_last_update, is_open, is_hidden,
                                      was_kicked, anonymity_mode, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)",
                    params![
                        addr_s,
                        domain_id,
                        new_nusers,
                        new_ma,
                        new_ma_last,
                        new_is_open,
                        new_was_kicked,
                        new_anonymity,
                        now_s
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE muc SET nusers = ?2, nusers_moving_average = ?3,
                                    moving_average_last_update = ?4, is_open = ?5,
                                    was_kicked = ?6, anonymity_mode = ?7, last_seen = ?8
                     WHERE address = ?1",
                    params![
                        addr_s,
                        new_nusers,
                        new_ma,
                        new_ma_last,
                        new_is_open,
                        new_was_kicked,
                        new_anonymity,
                        now_s
                    ],
                )?;
            }

            let any_text_set = matches!(subject, Some(Some(_)))
                || matches!(name, Some(Some(_)))
                || matches!(description, Some(Some(_)))
                || update.tags.is_some();

            if update.is_public == Some(true) || (update.is_public.is_none() && any_text_set) {
                let existing_public = tx
                    .query_row(
                        "SELECT subject, name, description, language,
                                http_logs_url, web_chat_url
                         FROM public_muc WHERE address = ?1",
                        params![addr_s],
                        |r| {
                            Ok((
                                r.get::<_, Option<String>>(0)?,
                                r.get::<_, Option<String>>(1)?,
                                r.get::<_, Option<String>>(2)?,
                                r.get::<_, Option<String>>(3)?,
                                r.get::<_, Option<String>>(4)?,
                                r.get::<_, Option<String>>(5)?,
                            ))
                        },
                    )
                    .optional()?;

                let (old_subject, old_name, old_description, old_language, old_logs, old_chat) =
                    match existing_public {
                        Some(t) => t,
                        None => {
                            tx.execute(
                                "INSERT INTO public_muc (address) VALUES (?1)",
                                params![addr_s],
                            )?;
                            changed = true;
                            (None, None, None, None, None, None)
                        }
                    };

                let new_subject = subject.unwrap_or(old_subject.clone());
                let new_name = name.unwrap_or(old_name.clone());
                let new_description = description.unwrap_or(old_description.clone());
                let new_language = language.unwrap_or(old_language.clone());
                let new_logs = update.http_logs_url.unwrap_or(old_logs.clone());
                let new_chat = update.web_chat_url.unwrap_or(old_chat.clone());

                changed |= new_subject != old_subject
                    || new_name != old_name
                    || new_description != old_description
                    || new_language != old_language
                    || new_logs != old_logs
                    || new_chat != old_chat;

                tx.execute(
                    "UPDATE public_muc
                     SET subject = ?2, name = ?3, description = ?4, language = ?5,
                         http_logs_url = ?6, web_chat_url = ?7
                     WHERE address = ?1",
                    params![
                        addr_s,
                        new_subject,
                        new_name,
                        new_description,
                        new_language,
                        new_logs,
                        new_chat
                    ],
                )?;

                if let Some(tags) = &update.tags {
                    let mut to_add: HashSet<String> = tags.iter().cloned().collect();
                    let existing_tags: Vec<String> = {
                        let mut stmt = tx.prepare(
                            "SELECT tag FROM public_muc_tags WHERE public_muc = ?1",
                        )?;
                        let rows = stmt
                            .query_map(params![addr_s], |r| r.get(0))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    };
                    for tag in existing_tags {
                        if !to_add.remove(&tag) {
                            tx.execute(
                                "DELETE FROM public_muc_tags
                                 WHERE public_muc = ?1 AND tag = ?2",
                                params![addr_s, tag],
                            )?;
                            changed = true;
                        }
                    }
                    for tag in to_add {
                        tx.execute("INSERT OR IGNORE INTO tag (key) VALUES (?1)", params![tag])?;
                        tx.execute(
                            "INSERT INTO public_muc_tags (tag, public_muc) VALUES (?1, ?2)",
                            params![tag, addr_s],
                        )?;
                        changed = true;
                    }
                }
            } else if update.is_public == Some(false) {
                let n = tx.execute("DELETE FROM public_muc WHERE address = ?1", params![addr_s])?;
                if n > 0 {
                    changed = true;
                }
            }

            tx.commit()?;
        }

        if created || changed {
            self.events.publish(StoreEvent::RoomChanged(address.clone()));
        }
        Ok(())
    }

    fn prepare_text_update(
        value: Option<Option<String>>,
        soft_limit: usize,
    ) -> Option<Option<String>> {
        value.map(|v| {
            v.and_then(|s| {
                let s = process_text(&s, soft_limit, None);
                if s.is_empty() { None } else { Some(s) }
            })
        })
    }

    /// Store or refresh a room avatar. `None` clears a stored avatar.
    /// Silently does nothing when the room is not publicly listed, and
    /// skips the write when the payload hash is unchanged.
    pub async fn update_muc_avatar(
        &self,
        address: &Address,
        payload: Option<(String, Vec<u8>)>,
    ) -> Result<(), CrawlError> {
        let addr_s = address.to_string();

        let Some((mime_type, data)) = payload else {
            let conn = self.lock();
            conn.execute("DELETE FROM avatar WHERE address = ?1", params![addr_s])?;
            return Ok(());
        };

        let Some(prepared) = avatar::prepare_avatar(&mime_type, data).await else {
            return Ok(());
        };

        let hash = hex::encode(Sha256::digest(&prepared.data));

        let conn = self.lock();
        let is_public: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM public_muc WHERE address = ?1)",
            params![addr_s],
            |r| r.get(0),
        )?;
        if !is_public {
            return Ok(());
        }

        let stored_hash: Option<String> = conn
            .query_row(
                "SELECT hash FROM avatar WHERE address = ?1",
                params![addr_s],
                |r| r.get(0),
            )
            .optional()?;
        if stored_hash.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }

        conn.execute(
            "INSERT INTO avatar (address, last_updated, mime_type, hash, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address) DO UPDATE
             SET last_updated = ?2, mime_type = ?3, hash = ?4, data = ?5",
            params![addr_s, now_str(), prepared.mime_type, hash, prepared.data],
        )?;
        Ok(())
    }

    pub fn get_avatar(&self, address: &Address) -> Result<Option<(String, Vec<u8>)>, CrawlError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT mime_type, data FROM avatar WHERE address = ?1",
                params![address.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Record that one public room mentioned another. Both endpoints must
    /// be publicly listed at insertion time, otherwise this is a no-op.
    pub fn store_referral(
        &self,
        from: &Address,
        to: &Address,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), CrawlError> {
        let ts = fmt_ts(timestamp.unwrap_or_else(Utc::now));
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let both_public: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM public_muc WHERE address = ?1)
                AND EXISTS(SELECT 1 FROM public_muc WHERE address = ?2)",
            params![from.to_string(), to.to_string()],
            |r| r.get(0),
        )?;
        if !both_public {
            return Ok(());
        }
        tx.execute(
            "INSERT INTO muc_referral (from_address, to_address, count, last_referral_ts)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(from_address, to_address)
             DO UPDATE SET count = count + 1, last_referral_ts = ?3",
            params![from.to_string(), to.to_string(), ts],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_referral_count(&self, from: &Address, to: &Address) -> Result<i64, CrawlError> {
        let conn = self.lock();
        let count: Option<i64> = conn
            .query_row(
                "SELECT count FROM muc_referral WHERE from_address = ?1 AND to_address = ?2",
                params![from.to_string(), to.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Drop a room and everything hanging off it. Emits `RoomDeleted` only
    /// when a row existed.
    pub fn delete_all_muc_data(&self, address: &Address) -> Result<(), CrawlError> {
        let deleted = {
            let conn = self.lock();
            conn.execute(
                "DELETE FROM muc WHERE address = ?1",
                params![address.to_string()],
            )?
        };
        if deleted > 0 {
            self.events.publish(StoreEvent::RoomDeleted(address.clone()));
        }
        Ok(())
    }

    pub fn expire_mucs(&self, threshold: DateTime<Utc>) -> Result<usize, CrawlError> {
        let threshold_s = fmt_ts(threshold);
        let addresses: Vec<String> = {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            let addresses: Vec<String> = {
                let mut stmt = tx.prepare("SELECT address FROM muc WHERE last_seen <= ?1")?;
                let rows = stmt
                    .query_map(params![threshold_s], |r| r.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute("DELETE FROM muc WHERE last_seen <= ?1", params![threshold_s])?;
            tx.commit()?;
            addresses
        };
        for address in &addresses {
            if let Ok(addr) = address.parse::<Address>() {
                self.events.publish(StoreEvent::RoomDeleted(addr));
            }
        }
        Ok(addresses.len())
    }

    /// Administrative toggle: hidden rooms never appear in public listings.
    pub fn set_room_hidden(&self, address: &Address, hidden: bool) -> Result<(), CrawlError> {
        let updated = {
            let conn = self.lock();
            conn.execute(
                "UPDATE muc SET is_hidden = ?1 WHERE address = ?2",
                params![hidden, address.to_string()],
            )?
        };
        if updated > 0 {
            self.events.publish(StoreEvent::RoomChanged(address.clone()));
        }
        Ok(())
    }

    pub fn get_room(&self, address: &Address) -> Result<Option<RoomRow>, CrawlError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT address, nusers, nusers_moving_average, moving_average_last_update,
                        is_open, is_hidden, was_kicked, anonymity_mode, last_seen
                 FROM muc WHERE address = ?1",
                params![address.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, bool>(4)?,
                        r.get::<_, bool>(5)?,
                        r.get::<_, bool>(6)?,
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(
            |(addr, nusers, ma, ma_last, is_open, is_hidden, was_kicked, anon, last_seen)| {
                let address = addr.parse::<Address>().ok()?;
                Some(RoomRow {
                    address,
                    nusers,
                    nusers_moving_average: ma,
                    moving_average_last_update: ma_last.as_deref().and_then(parse_ts),
                    is_open,
                    is_hidden,
                    was_kicked,
                    anonymity_mode: anon.as_deref().and_then(AnonymityMode::parse),
                    last_seen: last_seen.as_deref().and_then(parse_ts),
                })
            },
        ))
    }

    /// Every known room address not currently under inside observation.
    pub fn get_all_known_inactive_rooms(&self) -> Result<Vec<Address>, CrawlError> {
        let addresses: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT address FROM muc")?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        Ok(addresses
            .into_iter()
            .filter_map(|a| a.parse::<Address>().ok())
            .filter(|a| !self.is_active(a))
            .collect())
    }

    /// Open rooms with at least `min_users` occupants whose metadata does
    /// not mark them unreachable, non-service, closed or banned.
    pub fn get_joinable_rooms_with_user_count(
        &self,
        min_users: i64,
    ) -> Result<Vec<(Address, i64)>, CrawlError> {
        let rows: Vec<(String, i64)> = {
            let conn = self.lock();
            let mut stmt =
                conn.prepare("SELECT address, nusers FROM muc WHERE is_open = 1 AND nusers >= ?1")?;
            let rows = stmt
                .query_map(params![min_users], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut result = Vec::with_capacity(rows.len());
        for (addr_s, nusers) in rows {
            let Ok(address) = addr_s.parse::<Address>() else {
                continue;
            };
            let ok = match self.get_address_metadata(&address)? {
                None => true,
                Some(meta) => {
                    meta.is_reachable && meta.is_chat_service && meta.is_joinable && !meta.is_banned
                }
            };
            if ok {
                result.push((address, nusers));
            }
        }
        Ok(result)
    }

    // --- Address metadata cache ---

    /// The database is authoritative positive evidence; the in-memory cache
    /// is authoritative negative evidence and is only consulted when no
    /// room row exists.
    pub fn get_address_metadata(
        &self,
        address: &Address,
    ) -> Result<Option<AddressMetadata>, CrawlError> {
        let db_row: Option<(bool, bool)> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT m.is_open,
                        EXISTS(SELECT 1 FROM public_muc p WHERE p.address = m.address)
                 FROM muc m WHERE m.address = ?1",
                params![address.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
        };

        if let Some((is_open, is_public)) = db_row {
            return Ok(Some(AddressMetadata {
                is_reachable: true,
                is_chat_service: true,
                is_joinable: is_open,
                is_indexable: is_public,
                is_banned: false,
            }));
        }

        let mut cache = self.cache_lock();
        match cache.get_mut(address) {
            Some(&mut (expires_at, meta)) => {
                if Instant::now() >= expires_at {
                    cache.remove(address);
                    Ok(None)
                } else {
                    Ok(Some(meta))
                }
            }
            None => Ok(None),
        }
    }

    /// Route a classification to its resting place: useful rooms go into
    /// the database, confirmed non-rooms clear stale data, everything else
    /// lands in the TTL-bounded negative cache.
    pub fn cache_address_metadata(
        &self,
        address: &Address,
        meta: AddressMetadata,
        ttl: Duration,
    ) -> Result<(), CrawlError> {
        if meta.is_joinable || meta.is_indexable {
            return self.update_muc_metadata(
                address,
                RoomUpdate {
                    is_open: Some(meta.is_joinable),
                    is_public: Some(meta.is_indexable),
                    ..RoomUpdate::default()
                },
            );
        }

        if meta.is_reachable && !meta.is_chat_service {
            // reachable and definitely not a room: drop stale data
            self.delete_all_muc_data(address)?;
        }

        let mut cache = self.cache_lock();
        if cache.len() == cache.capacity() && !cache.contains_key(address) {
            let now = Instant::now();
            let expired: Vec<Address> = cache
                .iter()
                .filter(|(_, (expires_at, _))| *expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                cache.remove(&key);
            }
        }
        cache.insert(address.clone(), (Instant::now() + ttl, meta));
        Ok(())
    }

    // --- Public catalogue queries ---

    pub fn query_public_rooms(
        &self,
        query: &PublicRoomQuery,
    ) -> Result<Vec<PublicRoomView>, CrawlError> {
        let mut sql = String::from(
            "SELECT m.address, m.is_open, m.nusers, m.nusers_moving_average,
                    m.anonymity_mode, p.name, p.description, p.language
             FROM muc m JOIN public_muc p ON p.address = m.address
             WHERE m.is_hidden = 0",
        );
        let mut param_values: Vec<String> = vec![];
        let mut idx = 1;

        if !query.include_closed {
            sql.push_str(" AND m.is_open = 1");
        }
        if let Some(after) = query.after_nusers {
            sql.push_str(&format!(" AND m.nusers_moving_average < ?{idx}"));
            param_values.push(after.to_string());
            idx += 1;
        }
        if let Some(ref after) = query.after_address {
            sql.push_str(&format!(" AND m.address > ?{idx}"));
            param_values.push(after.clone());
            idx += 1;
        }
        if let Some(min_users) = query.min_users {
            sql.push_str(&format!(" AND m.nusers_moving_average >= ?{idx}"));
            param_values.push(min_users.to_string());
            idx += 1;
        }

        for keyword in &query.keywords {
            let pattern = format!("%{}%", escape_like(&keyword.to_lowercase()));
            let mut scopes: Vec<String> = vec![];
            if query.search_address {
                scopes.push(format!("LOWER(m.address) LIKE ?{idx} ESCAPE '\\'"));
                param_values.push(pattern.clone());
                idx += 1;
            }
            if query.search_name {
                scopes.push(format!("LOWER(p.name) LIKE ?{idx} ESCAPE '\\'"));
                param_values.push(pattern.clone());
                idx += 1;
            }
            if query.search_description {
                scopes.push(format!("LOWER(p.description) LIKE ?{idx} ESCAPE '\\'"));
                param_values.push(pattern.clone());
                idx += 1;
            }
            if !scopes.is_empty() {
                sql.push_str(&format!(" AND ({})", scopes.join(" OR ")));
            }
        }

        match query.order {
            // ties on the average break by address so paging stays stable
            SearchOrder::NUsers => {
                sql.push_str(" ORDER BY m.nusers_moving_average DESC, m.address ASC")
            }
            SearchOrder::Address => sql.push_str(" ORDER BY m.address ASC"),
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT ?{idx}"));
            param_values.push(limit.to_string());
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::types::ToSql> = param_values
            .iter()
            .map(|v| v as &dyn rusqlite::types::ToSql)
            .collect();

        let rows = stmt
            .query_map(params_refs.as_slice(), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, bool>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, Option<f64>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(
                |(addr, is_open, nusers, ma, anon, name, description, language)| {
                    let address = addr.parse::<Address>().ok()?;
                    Some(PublicRoomView {
                        address,
                        is_open,
                        nusers,
                        nusers_moving_average: ma,
                        anonymity_mode: anon.as_deref().and_then(AnonymityMode::parse),
                        name,
                        description,
                        language,
                    })
                },
            )
            .collect())
    }

    /// The mirror view of a single room: present only while the room is
    /// public, open and not hidden.
    pub fn get_public_room_view(
        &self,
        address: &Address,
    ) -> Result<Option<PublicRoomView>, CrawlError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT m.is_open, m.nusers, m.nusers_moving_average, m.anonymity_mode,
                        p.name, p.description, p.language
                 FROM muc m JOIN public_muc p ON p.address = m.address
                 WHERE m.address = ?1 AND m.is_hidden = 0 AND m.is_open = 1",
                params![address.to_string()],
                |r| {
                    Ok((
                        r.get::<_, bool>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(
            |(is_open, nusers, ma, anon, name, description, language)| PublicRoomView {
                address: address.clone(),
                is_open,
                nusers,
                nusers_moving_average: ma,
                anonymity_mode: anon.as_deref().and_then(AnonymityMode::parse),
                name,
                description,
                language,
            },
        ))
    }

    /// All publicly listed addresses, regardless of open/hidden state.
    pub fn list_all_public_addresses(&self) -> Result<Vec<Address>, CrawlError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT address FROM public_muc")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|a| a.parse::<Address>().ok())
            .collect())
    }

    pub fn get_room_detail(&self, address: &Address) -> Result<Option<RoomDetail>, CrawlError> {
        let addr_s = address.to_string();
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT m.is_open, m.nusers, m.nusers_moving_average, m.anonymity_mode,
                        m.last_seen, p.name, p.description, p.subject, p.language,
                        p.http_logs_url, p.web_chat_url
                 FROM muc m JOIN public_muc p ON p.address = m.address
                 WHERE m.address = ?1 AND m.is_hidden = 0",
                params![addr_s],
                |r| {
                    Ok((
                        r.get::<_, bool>(0)?,
                        r.get::<_, Option<i64>>(1)?,
                        r.get::<_, Option<f64>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, Option<String>>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, Option<String>>(8)?,
                        r.get::<_, Option<String>>(9)?,
                        r.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((is_open, nusers, ma, anon, last_seen, name, description, subject, language, logs, chat)) =
            row
        else {
            return Ok(None);
        };

        let tags: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT tag FROM public_muc_tags WHERE public_muc = ?1 ORDER BY tag")?;
            let rows = stmt
                .query_map(params![addr_s], |r| r.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        Ok(Some(RoomDetail {
            address: address.clone(),
            is_open,
            nusers,
            nusers_moving_average: ma,
            anonymity_mode: anon.as_deref().and_then(AnonymityMode::parse),
            name,
            description,
            subject,
            language,
            http_logs_url: logs,
            web_chat_url: chat,
            tags,
            last_seen,
        }))
    }

    pub fn stats(&self) -> Result<StatsResponse, CrawlError> {
        let conn = self.lock();
        let domains: i64 = conn.query_row("SELECT COUNT(*) FROM domain", [], |r| r.get(0))?;
        let rooms: i64 = conn.query_row("SELECT COUNT(*) FROM muc", [], |r| r.get(0))?;
        let public_rooms: i64 =
            conn.query_row("SELECT COUNT(*) FROM public_muc", [], |r| r.get(0))?;
        let open_rooms: i64 =
            conn.query_row("SELECT COUNT(*) FROM muc WHERE is_open = 1", [], |r| r.get(0))?;
        Ok(StatsResponse {
            domains,
            rooms,
            public_rooms,
            open_rooms,
        })
    }
}
