//! The chat-protocol client surface consumed by the crawler.
//!
//! The wire codec itself is out of scope; components talk to an opaque
//! [`ChatClient`] implementation through typed requests and event streams.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::address::Address;
use crate::models::{AddressMetadata, AnonymityMode, SoftwareInfo};

pub const FEATURE_MUC: &str = "http://jabber.org/protocol/muc";
pub const FEATURE_RSM: &str = "http://jabber.org/protocol/rsm";
pub const FEATURE_MUC_PUBLIC: &str = "muc_public";
pub const FEATURE_MUC_PERSISTENT: &str = "muc_persistent";
pub const FEATURE_MUC_OPEN: &str = "muc_open";
pub const FEATURE_MUC_PASSWORD: &str = "muc_passwordprotected";
pub const FEATURE_MUC_NONANONYMOUS: &str = "muc_nonanonymous";
pub const FEATURE_MUC_SEMIANONYMOUS: &str = "muc_semianonymous";

pub const FORM_TYPE_ROOMINFO: &str = "http://jabber.org/protocol/muc#roominfo";
pub const FORM_TYPE_SERVERINFO: &str = "http://jabber.org/protocol/serverinfo";

/// Node the mirror catalogue is published on.
pub const MIRROR_NODE: &str = "https://xmlns.zombofant.net/muclumbus/state-transfer/1.0#mucs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    ItemNotFound,
    Gone,
    Conflict,
    NotAuthorized,
    Forbidden,
    ServiceUnavailable,
    RemoteTimeout,
    FeatureNotImplemented,
    InternalError,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{condition:?}: {text}")]
pub struct ClientError {
    pub condition: ErrorCondition,
    pub text: String,
}

impl ClientError {
    pub fn new(condition: ErrorCondition, text: impl Into<String>) -> Self {
        ClientError {
            condition,
            text: text.into(),
        }
    }

    /// `item-not-found` and `gone`: the entity does not exist anymore.
    pub fn is_permanent_absence(&self) -> bool {
        matches!(
            self.condition,
            ErrorCondition::ItemNotFound | ErrorCondition::Gone
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self.condition,
            ErrorCondition::NotAuthorized | ErrorCondition::Forbidden
        )
    }

    pub fn is_conflict(&self) -> bool {
        self.condition == ErrorCondition::Conflict
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub type_: String,
    pub name: Option<String>,
}

/// A data-form extension attached to a service-info response.
#[derive(Debug, Clone, Default)]
pub struct InfoForm {
    pub form_type: String,
    pub fields: HashMap<String, Vec<String>>,
}

impl InfoForm {
    pub fn new(form_type: &str) -> Self {
        InfoForm {
            form_type: form_type.to_string(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, var: &str, value: &str) -> Self {
        self.fields
            .entry(var.to_string())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn value(&self, var: &str) -> Option<&str> {
        self.fields
            .get(var)
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    pub fn values(&self, var: &str) -> &[String] {
        self.fields.get(var).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
    pub exts: Vec<InfoForm>,
}

impl DiscoInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn ext(&self, form_type: &str) -> Option<&InfoForm> {
        self.exts.iter().find(|e| e.form_type == form_type)
    }

    /// Derive the address classification from identities and features.
    pub fn classify(&self) -> AddressMetadata {
        let is_conference_text = self
            .identities
            .iter()
            .any(|i| i.category == "conference" && i.type_ == "text");
        if !is_conference_text || !self.has_feature(FEATURE_MUC) {
            return AddressMetadata {
                is_reachable: true,
                is_chat_service: false,
                is_joinable: false,
                is_indexable: false,
                is_banned: false,
            };
        }

        let is_indexable =
            self.has_feature(FEATURE_MUC_PUBLIC) && self.has_feature(FEATURE_MUC_PERSISTENT);
        let is_joinable = self.has_feature(FEATURE_MUC_OPEN)
            && self.has_feature(FEATURE_MUC_PERSISTENT)
            && !self.has_feature(FEATURE_MUC_PASSWORD);

        AddressMetadata {
            is_reachable: true,
            is_chat_service: true,
            is_joinable,
            is_indexable,
            is_banned: false,
        }
    }

    pub fn anonymity_mode(&self) -> Option<AnonymityMode> {
        if self.has_feature(FEATURE_MUC_NONANONYMOUS) {
            Some(AnonymityMode::None)
        } else if self.has_feature(FEATURE_MUC_SEMIANONYMOUS) {
            Some(AnonymityMode::Semi)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoItem {
    pub jid: Address,
    pub node: Option<String>,
    pub name: Option<String>,
}

/// One page of a disco-items response. `last` carries the paging token of
/// the final item when the responder supports result-set paging.
#[derive(Debug, Clone, Default)]
pub struct DiscoItems {
    pub items: Vec<DiscoItem>,
    pub last: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ItemsPage {
    pub after: Option<String>,
    pub max: usize,
}

/// Base64 photo payload as carried by the profile/vCard mechanism.
#[derive(Debug, Clone)]
pub struct AvatarData {
    pub mime_type: String,
    pub data_base64: String,
}

/// How an occupant left a room, as reported by the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveMode {
    Normal,
    Kicked,
    Banned,
    Error,
}

/// Events delivered for a joined room. Occupant counts include the
/// observing client itself and reflect the state after the event.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Message { body: String },
    Join { occupants: usize },
    Leave { occupants: usize },
    TopicChanged { subject: Option<String> },
    Exit { mode: LeaveMode },
    Failure { error: ClientError },
}

/// Handle for a room the client has joined; events end when the stream
/// closes or an `Exit`/`Failure` event is delivered.
#[derive(Debug)]
pub struct JoinedRoom {
    pub address: Address,
    pub events: mpsc::Receiver<RoomEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Chat,
    Normal,
    Groupchat,
    Error,
}

#[derive(Debug, Clone)]
pub enum Invite {
    /// Sent directly by a user; carries the suggested room.
    Direct { room: Address },
    /// Relayed through a room; the origin room is the suggestion.
    Mediated { room: Address },
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: Address,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub invite: Option<Invite>,
}

/// Pub/sub node configuration applied by the mirror server.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub access_model: String,
    pub persist_items: bool,
    pub max_items: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            access_model: "open".to_string(),
            persist_items: true,
            max_items: 16_777_216,
        }
    }
}

/// Payload of one mirror item (`sync-muc` element). The item id is the
/// room address in canonical string form; `is_open` is carried as 0/1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSyncItem {
    pub address: Address,
    #[serde(with = "bool01")]
    pub is_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymity_mode: Option<AnonymityMode>,
    #[serde(default)]
    pub nusers: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

mod bool01 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(if *v { 1 } else { 0 })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(d)? != 0)
    }
}

/// Push notifications delivered to a pub/sub subscriber.
#[derive(Debug, Clone)]
pub enum PubSubUpdate {
    Published { id: String, payload: RoomSyncItem },
    Retracted { id: String },
}

/// The chat client consumed by every crawler component.
///
/// Implementations own the connection; all methods are cancel-safe.
/// Event-stream accessors hand out the receiver once and return `None`
/// afterwards.
pub trait ChatClient: Send + Sync + 'static {
    fn disco_info(
        &self,
        addr: &Address,
        require_fresh: bool,
    ) -> impl Future<Output = Result<DiscoInfo, ClientError>> + Send;

    fn disco_items(
        &self,
        addr: &Address,
        node: Option<&str>,
        page: Option<&ItemsPage>,
    ) -> impl Future<Output = Result<DiscoItems, ClientError>> + Send;

    fn software_version(
        &self,
        addr: &Address,
    ) -> impl Future<Output = Result<SoftwareInfo, ClientError>> + Send;

    fn fetch_avatar(
        &self,
        addr: &Address,
    ) -> impl Future<Output = Result<Option<AvatarData>, ClientError>> + Send;

    fn muc_join(
        &self,
        addr: &Address,
        nick: &str,
        history_max: usize,
    ) -> impl Future<Output = Result<JoinedRoom, ClientError>> + Send;

    fn muc_leave(&self, addr: &Address) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn send_message(
        &self,
        to: &Address,
        body: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Inbound direct traffic (chats and invites); `None` once taken.
    fn take_inbound_messages(&self) -> Option<mpsc::Receiver<InboundMessage>>;

    fn pubsub_create_node(
        &self,
        service: &Address,
        node: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn pubsub_configure_node(
        &self,
        service: &Address,
        node: &str,
        config: &NodeConfig,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn pubsub_subscribe(
        &self,
        service: &Address,
        node: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn pubsub_list_item_ids(
        &self,
        service: &Address,
        node: &str,
    ) -> impl Future<Output = Result<Vec<String>, ClientError>> + Send;

    fn pubsub_get_item(
        &self,
        service: &Address,
        node: &str,
        id: &str,
    ) -> impl Future<Output = Result<RoomSyncItem, ClientError>> + Send;

    fn pubsub_publish(
        &self,
        service: &Address,
        node: &str,
        id: &str,
        payload: &RoomSyncItem,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn pubsub_retract(
        &self,
        service: &Address,
        node: &str,
        id: &str,
        notify: bool,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Push stream of the subscribed node; `None` once taken.
    fn take_pubsub_updates(&self) -> Option<mpsc::Receiver<PubSubUpdate>>;

    /// Resolves when the underlying connection terminates.
    fn wait_closed(&self) -> impl Future<Output = ()> + Send;
}
