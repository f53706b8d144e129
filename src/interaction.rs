//! Interaction handler: user-initiated suggestions arriving as invites or
//! direct chat messages.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru_cache::LruCache;

use crate::address::Address;
use crate::analyser::{AnalysisSink, AnalysisTask};
use crate::client::{ChatClient, InboundMessage, Invite, MessageKind};

/// How long a sender is remembered before they get another canned reply.
const HELLO_EXPIRE: Duration = Duration::from_secs(3600);
const SPOKEN_TO_SIZE: usize = 1000;

const INFO_BODY: &str = "Hi! I am the crawler feeding this room search index. \
    Send me an invite to a room to suggest it for the public list.";

const ACK_BODY: &str = "Hi, and thank you for your invite. I will consider it. \
    It may take a while (approximately two hours) until your suggestion is \
    added to the public list. I will not actually join the room, though.";

pub struct InteractionHandler<C: ChatClient> {
    client: Arc<C>,
    analysis: AnalysisSink,
    privileged_entities: Vec<Address>,
    spoken_to: Mutex<LruCache<Address, Instant>>,
}

impl<C: ChatClient> InteractionHandler<C> {
    pub fn new(client: Arc<C>, analysis: AnalysisSink, privileged_entities: Vec<Address>) -> Self {
        InteractionHandler {
            client,
            analysis,
            privileged_entities,
            spoken_to: Mutex::new(LruCache::new(SPOKEN_TO_SIZE)),
        }
    }

    /// Consume the inbound message stream until it closes.
    pub async fn run(&self, mut messages: tokio::sync::mpsc::Receiver<InboundMessage>) {
        while let Some(message) = messages.recv().await {
            self.handle(message).await;
        }
        println!("💬 interaction: inbound stream closed");
    }

    async fn handle(&self, message: InboundMessage) {
        // errors and room traffic pass through unhandled
        if matches!(message.kind, MessageKind::Error | MessageKind::Groupchat) {
            return;
        }

        match message.invite {
            Some(Invite::Direct { room }) => {
                let privileged = self.privileged_entities.contains(&message.from.bare());
                println!(
                    "💬 interaction: direct invite to {room} from {} (privileged={privileged})",
                    message.from
                );
                self.analysis.suggest_nowait(AnalysisTask::Plain {
                    address: room,
                    privileged,
                });
                if self.first_contact(&message.from) {
                    self.reply(&message.from, ACK_BODY).await;
                }
            }
            Some(Invite::Mediated { room }) => {
                println!("💬 interaction: mediated invite via {room}");
                self.analysis.suggest_nowait(AnalysisTask::Plain {
                    address: room,
                    privileged: false,
                });
            }
            None => {
                if message.body.is_some() && self.first_contact(&message.from) {
                    self.reply(&message.from, INFO_BODY).await;
                }
            }
        }
    }

    /// True at most once per sender per expiry window.
    fn first_contact(&self, from: &Address) -> bool {
        let mut spoken_to = self.spoken_to.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ts) = spoken_to.get_mut(from) {
            if ts.elapsed() < HELLO_EXPIRE {
                return false;
            }
        }
        spoken_to.insert(from.clone(), Instant::now());
        true
    }

    async fn reply(&self, to: &Address, body: &str) {
        if let Err(e) = self.client.send_message(to, body).await {
            eprintln!("⚠️ interaction: failed to reply to {to}: {e}");
        }
    }
}
