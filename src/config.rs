//! Configuration: a TOML file (path in `ROOMDEX_CONFIG`) with env-var
//! overrides for the simple knobs.

use std::env;

use serde::Deserialize;

use crate::address::Address;
use crate::db::TextLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Watcher,
    Scanner,
    Insideman,
    Interaction,
    Spokesman,
    MirrorServer,
    MirrorClient,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_name_length: Option<usize>,
    pub max_description_length: Option<usize>,
    pub max_subject_length: Option<usize>,
    pub max_language_length: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorEndpointConfig {
    pub pubsub_service: Option<Address>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorSection {
    pub server: MirrorEndpointConfig,
    pub client: MirrorEndpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub components: Vec<Component>,
    /// Domains inserted with `last_seen = NULL` on startup.
    pub seed: Vec<String>,
    /// Addresses whose invites bypass the user-count heuristics.
    pub privileged_entities: Vec<Address>,
    pub nickname: String,
    pub database_path: String,
    /// Upper bound on rooms observed from the inside.
    pub nrooms: usize,
    pub limits: LimitsConfig,
    pub mirror: MirrorSection,
    /// Room or domain addresses whose avatars are stored.
    pub avatar_whitelist: Vec<Address>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            components: Vec::new(),
            seed: Vec::new(),
            privileged_entities: Vec::new(),
            nickname: "roomdex".to_string(),
            database_path: "data/roomdex.db".to_string(),
            nrooms: crate::observer::DEFAULT_NROOMS,
            limits: LimitsConfig::default(),
            mirror: MirrorSection::default(),
            avatar_whitelist: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(input: &str) -> Result<AppConfig, toml::de::Error> {
        toml::from_str(input)
    }

    /// Load the config file named by `ROOMDEX_CONFIG` (defaults apply when
    /// unset or unreadable), then apply env-var overrides.
    pub fn load() -> AppConfig {
        let mut config = match env::var("ROOMDEX_CONFIG") {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(raw) => match AppConfig::from_toml(&raw) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("⚠️ config: failed to parse {path}: {e}");
                        AppConfig::default()
                    }
                },
                Err(e) => {
                    eprintln!("⚠️ config: failed to read {path}: {e}");
                    AppConfig::default()
                }
            },
            Err(_) => AppConfig::default(),
        };

        if let Ok(path) = env::var("DATABASE_PATH") {
            config.database_path = path;
        }
        if let Ok(nickname) = env::var("ROOMDEX_NICKNAME") {
            config.nickname = nickname;
        }
        config
    }

    pub fn has(&self, component: Component) -> bool {
        self.components.contains(&component)
    }

    pub fn text_limits(&self) -> TextLimits {
        let defaults = TextLimits::default();
        TextLimits {
            max_name_length: self.limits.max_name_length.unwrap_or(defaults.max_name_length),
            max_description_length: self
                .limits
                .max_description_length
                .unwrap_or(defaults.max_description_length),
            max_subject_length: self
                .limits
                .max_subject_length
                .unwrap_or(defaults.max_subject_length),
            max_language_length: self
                .limits
                .max_language_length
                .unwrap_or(defaults.max_language_length),
        }
    }
}
