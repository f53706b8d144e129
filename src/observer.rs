//! Inside observer: maintains membership in a rotating subset of joinable
//! rooms to watch live occupancy, topics and room mentions from within.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::seq::SliceRandom;
use regex::Regex;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::analyser::{AnalysisSink, AnalysisTask};
use crate::client::{ChatClient, ClientError, JoinedRoom, LeaveMode, RoomEvent};
use crate::db::{CACHE_TTL_BANNED, CACHE_TTL_UNREACHABLE, RoomUpdate, Store};
use crate::error::CrawlError;
use crate::models::AddressMetadata;

pub const DEFAULT_NROOMS: usize = 500;
pub const SHUFFLE_INTERVAL: Duration = Duration::from_secs(3 * 3600);
/// Debounce window for batched per-room updates.
const UPDATE_DELAY: Duration = Duration::from_secs(30);
/// Collective bound on leave operations; stragglers finish in background.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(120);
const FIXED_SHARE: f64 = 0.4;
const MIN_USERS: i64 = 2;

struct ObserverCore<C: ChatClient> {
    store: Arc<Store>,
    client: Arc<C>,
    analysis: AnalysisSink,
    nickname: String,
}

pub struct InsideObserver<C: ChatClient> {
    core: Arc<ObserverCore<C>>,
    nrooms: usize,
    joined: tokio::sync::Mutex<HashMap<Address, JoinHandle<()>>>,
}

impl<C: ChatClient> InsideObserver<C> {
    pub fn new(
        store: Arc<Store>,
        client: Arc<C>,
        analysis: AnalysisSink,
        nickname: String,
        nrooms: usize,
    ) -> Self {
        InsideObserver {
            core: Arc::new(ObserverCore {
                store,
                client,
                analysis,
                nickname,
            }),
            nrooms,
            joined: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self) -> Result<(), CrawlError> {
        loop {
            self.shuffle().await?;
            tokio::time::sleep(SHUFFLE_INTERVAL).await;
        }
    }

    /// Pick the next room set: the top fixed share by user count plus a
    /// uniformly random remainder, then reconcile joins and leaves.
    pub async fn shuffle(&self) -> Result<(), CrawlError> {
        println!("🔀 observer: re-shuffling joined rooms");
        let mut rooms = self.core.store.get_joinable_rooms_with_user_count(MIN_USERS)?;
        rooms.sort_by(|a, b| b.1.cmp(&a.1));

        let nfixed = std::cmp::min(
            (FIXED_SHARE * self.nrooms as f64).round() as usize,
            rooms.len(),
        );
        let fixed: Vec<Address> = rooms
            .iter()
            .take(nfixed)
            .filter(|(_, nusers)| *nusers > 2)
            .map(|(address, _)| address.clone())
            .collect();
        let mut rest: Vec<(Address, i64)> = rooms.split_off(nfixed);

        // recalculate the random share if there were not enough busy rooms
        let nrandom = self.nrooms.saturating_sub(fixed.len());
        rest.shuffle(&mut rand::thread_rng());

        let next: HashSet<Address> = fixed
            .into_iter()
            .chain(rest.into_iter().take(nrandom).map(|(address, _)| address))
            .collect();

        let mut joined = self.joined.lock().await;
        joined.retain(|_, handle| !handle.is_finished());
        let current: HashSet<Address> = joined.keys().cloned().collect();

        let to_join: Vec<Address> = next.difference(&current).cloned().collect();
        let to_leave: Vec<Address> = current.difference(&next).cloned().collect();
        println!(
            "🔀 observer: leaving {} rooms, joining {} rooms",
            to_leave.len(),
            to_join.len()
        );

        for address in to_join {
            match self.core.client.muc_join(&address, &self.core.nickname, 0).await {
                Ok(room) => {
                    self.core.store.mark_active(&address);
                    let core = Arc::clone(&self.core);
                    joined.insert(address, tokio::spawn(run_room_handler(core, room)));
                }
                Err(e) => {
                    println!("ℹ️ observer: failed to join {address}: {e}");
                    self.core.handle_failure(&address, &e);
                }
            }
        }

        let mut leave_handles = Vec::new();
        for address in to_leave {
            joined.remove(&address);
            let client = Arc::clone(&self.core.client);
            leave_handles.push(tokio::spawn(async move {
                let _ = client.muc_leave(&address).await;
            }));
        }
        drop(joined);

        let deadline = tokio::time::Instant::now() + LEAVE_TIMEOUT;
        for handle in leave_handles {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                println!("ℹ️ observer: not all leave operations finished in time, continuing in background");
                break;
            }
        }

        Ok(())
    }
}

impl<C: ChatClient> ObserverCore<C> {
    /// A failed join or stream failure: auth errors mean banned, anything
    /// else is a short-lived unreachability.
    fn handle_failure(&self, address: &Address, error: &ClientError) {
        if error.is_auth() {
            self.ban_cleanup(address);
        } else {
            let _ = self.store.cache_address_metadata(
                address,
                AddressMetadata::UNREACHABLE,
                CACHE_TTL_UNREACHABLE,
            );
        }
    }

    fn ban_cleanup(&self, address: &Address) {
        eprintln!("🚫 observer: got banned from {address}, deleting all data");
        if let Err(e) =
            self.store
                .cache_address_metadata(address, AddressMetadata::BANNED, CACHE_TTL_BANNED)
        {
            eprintln!("⚠️ observer: failed to cache ban for {address}: {e}");
        }
        if let Err(e) = self.store.delete_all_muc_data(address) {
            eprintln!("⚠️ observer: failed to erase {address}: {e}");
        }
    }
}

enum StopCause {
    Exit(LeaveMode),
    Failure(ClientError),
}

/// Per-room event loop: debounces field updates into one store write per
/// window and scans message bodies for room mentions.
async fn run_room_handler<C: ChatClient>(core: Arc<ObserverCore<C>>, mut room: JoinedRoom) {
    let address = room.address.clone();
    let mut pending = RoomUpdate::default();
    let mut dirty = false;
    let mut flush_deadline: Option<tokio::time::Instant> = None;
    let mut last_message_hour: Option<DateTime<Utc>> = None;
    let mut stop: Option<StopCause> = None;

    loop {
        tokio::select! {
            event = room.events.recv() => {
                let Some(event) = event else { break };
                match event {
                    RoomEvent::Message { body } => {
                        let now = Utc::now();
                        let hour = now.with_minute(0).and_then(|t| t.with_second(0))
                            .and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
                        if last_message_hour != Some(hour) {
                            // an (empty) update still refreshes last_seen
                            last_message_hour = Some(hour);
                            dirty = true;
                        }
                        for (_score, dest) in extract_addresses(&body) {
                            core.analysis.suggest_nowait(AnalysisTask::Referral {
                                address: dest,
                                source: address.clone(),
                                timestamp: now,
                            });
                        }
                    }
                    RoomEvent::Join { occupants } => {
                        pending.nusers = Some(occupants.saturating_sub(1) as i64);
                        dirty = true;
                    }
                    RoomEvent::Leave { occupants } => {
                        pending.nusers = Some(occupants.saturating_sub(1) as i64);
                        dirty = true;
                    }
                    RoomEvent::TopicChanged { subject } => {
                        pending.subject = Some(subject);
                        dirty = true;
                    }
                    RoomEvent::Exit { mode } => {
                        stop = Some(StopCause::Exit(mode));
                        break;
                    }
                    RoomEvent::Failure { error } => {
                        stop = Some(StopCause::Failure(error));
                        break;
                    }
                }
                if dirty && flush_deadline.is_none() {
                    flush_deadline = Some(tokio::time::Instant::now() + UPDATE_DELAY);
                }
            }
            _ = async move {
                match flush_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                let update = std::mem::take(&mut pending);
                dirty = false;
                flush_deadline = None;
                if let Err(e) = core.store.update_muc_metadata(&address, update) {
                    eprintln!("⚠️ observer: failed to update {address}: {e}");
                }
            }
        }
    }

    let mut banned = false;
    match stop {
        Some(StopCause::Failure(e)) if e.is_auth() => {
            core.ban_cleanup(&address);
            banned = true;
        }
        Some(StopCause::Exit(LeaveMode::Banned)) => {
            core.ban_cleanup(&address);
            banned = true;
        }
        Some(StopCause::Exit(LeaveMode::Kicked)) => {
            pending.was_kicked = Some(true);
            dirty = true;
        }
        Some(StopCause::Failure(_)) | Some(StopCause::Exit(LeaveMode::Error)) => {
            let _ = core.store.cache_address_metadata(
                &address,
                AddressMetadata::UNREACHABLE,
                CACHE_TTL_UNREACHABLE,
            );
        }
        Some(StopCause::Exit(LeaveMode::Normal)) | None => {}
    }

    if dirty && !banned {
        if let Err(e) = core.store.update_muc_metadata(&address, pending) {
            eprintln!("⚠️ observer: failed to flush final update for {address}: {e}");
        }
    }

    core.store.mark_inactive(&address);
}

fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:(?P<scheme>xmpp:))?(?P<addr>[^?\s]+)(?P<query>\?join)?")
            .expect("valid address pattern")
    })
}

/// Score candidate addresses found in a message body: an explicit scheme,
/// a `?join` query and a localpart each add confidence; zero-score matches
/// are discarded.
pub fn extract_addresses(text: &str) -> Vec<(u32, Address)> {
    let mut found = Vec::new();
    for captures in address_pattern().captures_iter(text) {
        let mut score = 0;
        if captures.name("scheme").is_some() {
            score += 1;
        }
        if captures.name("query").is_some() {
            score += 1;
        }
        let Some(raw) = captures.name("addr") else {
            continue;
        };
        let decoded = match urlencoding::decode(raw.as_str()) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let Ok(address) = decoded.parse::<Address>() else {
            continue;
        };
        if address.localpart().is_some() {
            score += 1;
        }
        if score == 0 {
            continue;
        }
        found.push((score, address.bare()));
    }
    found
}
