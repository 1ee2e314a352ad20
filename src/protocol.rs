//! Message shapes exchanged with the mod bridge.
//!
//! Outbound events are what the champion-select overlay asks the backend for:
//! mod listings per skin and the global map/font/announcer/other packs, plus
//! selections (a `None` id deselects). Inbound events are the backend's
//! replies; anything else that parses as JSON is passed through untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::services::ConnectionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutboundEvent {
    RequestSkinMods {
        champion_id: u32,
        skin_id: u32,
    },
    SelectSkinMod {
        champion_id: u32,
        skin_id: u32,
        mod_id: Option<String>,
        mod_data: Option<Value>,
    },
    RequestMaps,
    SelectMap {
        map_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        map_data: Option<Value>,
    },
    RequestFonts,
    SelectFont {
        font_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        font_data: Option<Value>,
    },
    RequestAnnouncers,
    SelectAnnouncer {
        announcer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        announcer_data: Option<Value>,
    },
    RequestOthers,
    SelectOther {
        other_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_data: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InboundEvent {
    SkinModsResponse {
        #[serde(default)]
        champion_id: Option<u32>,
        #[serde(default)]
        skin_id: Option<u32>,
        #[serde(default)]
        mods: Vec<Value>,
        #[serde(default)]
        historic_mod: Option<Value>,
    },
    MapsResponse {
        #[serde(default)]
        maps: Vec<Value>,
        #[serde(default)]
        historic_mod: Option<Value>,
    },
    FontsResponse {
        #[serde(default)]
        fonts: Vec<Value>,
        #[serde(default)]
        historic_mod: Option<Value>,
    },
    AnnouncersResponse {
        #[serde(default)]
        announcers: Vec<Value>,
        #[serde(default)]
        historic_mod: Option<Value>,
    },
    OthersResponse {
        #[serde(default)]
        others: Vec<Value>,
        #[serde(default)]
        historic_mod: Option<Value>,
    },
    ChampionLocked {
        #[serde(default)]
        locked: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(InboundEvent),
    Unrecognized(Value),
}

impl Inbound {
    /// `None` when the frame is not JSON at all.
    pub fn from_text(text: &str) -> Option<Self> {
        let value = serde_json::from_str::<Value>(text).ok()?;
        Some(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<InboundEvent>(value.clone()) {
            Ok(event) => Self::Event(event),
            Err(_) => Self::Unrecognized(value),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Event(event) => serde_json::to_value(event).unwrap_or(Value::Null),
            Self::Unrecognized(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionNotice {
    pub status: ConnectionState,
    pub at: DateTime<Utc>,
}

impl ConnectionNotice {
    pub fn now(status: ConnectionState) -> Self {
        Self {
            status,
            at: Utc::now(),
        }
    }
}
