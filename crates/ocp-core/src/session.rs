//! Session keys and the gateway's session descriptors.
//!
//! Agent conversations are addressed as `agent:{agentId}:{thread}`. The
//! control pane always dispatches to the `main` thread of an agent.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const AGENT_KEY_PREFIX: &str = "agent:";
pub const DEFAULT_AGENT_ID: &str = "main";
pub const MAIN_THREAD: &str = "main";
pub const DEFAULT_SOURCE: &str = "gateway";
pub const MANUAL_SOURCE: &str = "manual";

/// Canonical dispatch key for an agent: `agent:{lowercased-agent-id}:main`.
pub fn canonical_session_key(agent_id: &str) -> String {
    format!(
        "{AGENT_KEY_PREFIX}{}:{MAIN_THREAD}",
        agent_id.trim().to_lowercase()
    )
}

pub fn is_agent_session(session_key: &str) -> bool {
    session_key.starts_with(AGENT_KEY_PREFIX)
}

/// Second segment of the key, or `main` when the key carries none.
pub fn agent_from_session_key(session_key: &str) -> String {
    session_key
        .split(':')
        .nth(1)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .unwrap_or(DEFAULT_AGENT_ID)
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    WhatsApp,
    Telegram,
    Discord,
    Slack,
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::WhatsApp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Discord => "discord",
            Channel::Slack => "slack",
            Channel::Web => "web",
        }
    }

    /// Substring match against the known channel names.
    pub fn detect(hint: &str) -> Option<Self> {
        let hint = hint.to_lowercase();
        if hint.contains("whatsapp") {
            Some(Channel::WhatsApp)
        } else if hint.contains("telegram") {
            Some(Channel::Telegram)
        } else if hint.contains("discord") {
            Some(Channel::Discord)
        } else if hint.contains("slack") {
            Some(Channel::Slack)
        } else if hint.contains("web") || hint.contains("browser") {
            Some(Channel::Web)
        } else {
            None
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel from the explicit channel field, falling back to the key itself.
pub fn infer_channel(channel_hint: Option<&str>, session_key: &str) -> Option<Channel> {
    channel_hint
        .and_then(Channel::detect)
        .or_else(|| Channel::detect(session_key))
}

/// Task source label for a discovered session.
pub fn infer_source(channel_hint: Option<&str>, session_key: &str) -> String {
    infer_channel(channel_hint, session_key)
        .map(|channel| channel.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_SOURCE.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub key: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub derived_title: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub spawned_by: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
}

impl SessionDescriptor {
    /// Lenient parse of one `sessions.list` entry. Entries without a key are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let key = string_field(value, &["key", "sessionKey"])?;
        let updated_at = ["updatedAt", "lastActivityAt"]
            .iter()
            .find_map(|field| value.get(*field).and_then(epoch_millis));
        let channel = string_field(value, &["lastChannel", "channel", "groupChannel"]).or_else(|| {
            value
                .get("entry")
                .and_then(|entry| string_field(entry, &["lastChannel", "channel"]))
        });
        Some(Self {
            key,
            active: value
                .get("active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            updated_at,
            derived_title: string_field(value, &["derivedTitle", "title"]),
            channel,
            spawned_by: string_field(value, &["spawnedBy"]),
            last_message: string_field(value, &["lastMessage", "lastMessagePreview"]),
        })
    }

    /// Accepts `{sessions: [...]}` or a bare array.
    pub fn list_from_value(value: &Value) -> Vec<Self> {
        let entries = match value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("sessions") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            },
            _ => &[],
        };
        entries.iter().filter_map(Self::from_value).collect()
    }

    pub fn agent_id(&self) -> String {
        agent_from_session_key(&self.key)
    }

    pub fn is_recent(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.updated_at
            .map(|updated_at| now.signed_duration_since(updated_at) <= window)
            .unwrap_or(false)
    }
}

fn string_field(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        value
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

fn epoch_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64))?,
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            text.trim().parse::<i64>().ok()?
        }
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}
