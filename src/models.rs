use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Whether occupants' real addresses are visible inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityMode {
    Full,
    Semi,
    None,
}

impl AnonymityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityMode::Full => "full",
            AnonymityMode::Semi => "semi",
            AnonymityMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<AnonymityMode> {
        match s {
            "full" => Some(AnonymityMode::Full),
            "semi" => Some(AnonymityMode::Semi),
            "none" => Some(AnonymityMode::None),
            _ => None,
        }
    }
}

/// Classification of an address as determined by a service-info lookup.
///
/// Positive classifications live in the room table; this value is cached
/// in memory only for negative outcomes (see the store's metadata cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMetadata {
    pub is_reachable: bool,
    pub is_chat_service: bool,
    pub is_joinable: bool,
    pub is_indexable: bool,
    pub is_banned: bool,
}

impl AddressMetadata {
    pub const UNREACHABLE: AddressMetadata = AddressMetadata {
        is_reachable: false,
        is_chat_service: false,
        is_joinable: false,
        is_indexable: false,
        is_banned: false,
    };

    pub const BANNED: AddressMetadata = AddressMetadata {
        is_reachable: true,
        is_chat_service: true,
        is_joinable: false,
        is_indexable: false,
        is_banned: true,
    };
}

/// Software version triple reported by a peer domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub os: Option<String>,
}

/// Row of the public-room base view (public, open, non-hidden), as consumed
/// by the search engine, the mirror and the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct PublicRoomView {
    pub address: Address,
    pub is_open: bool,
    pub nusers: Option<i64>,
    pub nusers_moving_average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymity_mode: Option<AnonymityMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Full detail of a public room for the JSON API.
#[derive(Debug, Clone, Serialize)]
pub struct RoomDetail {
    pub address: Address,
    pub is_open: bool,
    pub nusers: Option<i64>,
    pub nusers_moving_average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymity_mode: Option<AnonymityMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_logs_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_chat_url: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub domains: i64,
    pub rooms: i64,
    pub public_rooms: i64,
    pub open_rooms: i64,
}
