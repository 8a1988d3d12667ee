use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Literals agents emit when they consider a task finished. Matched case-insensitively.
pub const COMPLETION_MARKERS: [&str; 5] = ["[DONE]", "[COMPLETE]", "[FINISHED]", "[TASK COMPLETE]", "✅"];

pub fn has_completion_marker(text: &str) -> bool {
    let upper = text.to_uppercase();
    COMPLETION_MARKERS
        .iter()
        .any(|marker| upper.contains(&marker.to_uppercase()))
}

/// Truncates to `max_chars` characters without splitting a code point.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
    #[default]
    #[serde(other)]
    Other,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
            ChatRole::Tool => "tool",
            ChatRole::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Other(Value),
}

impl ContentBlock {
    fn from_value(value: Value) -> Self {
        let is_text = value.get("type").and_then(Value::as_str) == Some("text");
        match value.get("text").and_then(Value::as_str) {
            Some(text) if is_text => ContentBlock::Text(text.to_string()),
            _ => ContentBlock::Other(value),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text(text) => serde_json::json!({ "type": "text", "text": text }),
            ContentBlock::Other(value) => value.clone(),
        }
    }
}

/// Message content as the gateway sends it: a plain string, a list of typed
/// blocks, or anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    PlainText(String),
    Blocks(Vec<ContentBlock>),
    Unknown(Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Unknown(Value::Null)
    }
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            MessageContent::PlainText(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Unknown(Value::Null) => String::new(),
            MessageContent::Unknown(value) => value.to_string(),
        }
    }
}

impl From<Value> for MessageContent {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => MessageContent::PlainText(text),
            Value::Array(items) => {
                MessageContent::Blocks(items.into_iter().map(ContentBlock::from_value).collect())
            }
            other => MessageContent::Unknown(other),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::PlainText(text.to_string())
    }
}

impl Serialize for MessageContent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MessageContent::PlainText(text) => serializer.serialize_str(text),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(ContentBlock::to_value)
                .collect::<Vec<_>>()
                .serialize(serializer),
            MessageContent::Unknown(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessageContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Value::deserialize(deserializer)?.into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: ChatRole,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_title: Option<String>,
}

impl ChatHistory {
    /// Accepts `{messages: [...]}` or a bare message array.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(_) => Self {
                messages: serde_json::from_value(value).unwrap_or_default(),
                ..Self::default()
            },
            other => serde_json::from_value(other).unwrap_or_default(),
        }
    }

    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == ChatRole::Assistant)
    }

    pub fn first_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|message| message.role == ChatRole::User)
            .map(ChatMessage::text)
            .filter(|text| !text.trim().is_empty())
    }
}

/// Role/text pair handed to operators when tailing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedMessage {
    pub role: ChatRole,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl From<&ChatMessage> for NormalizedMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            text: message.text(),
            timestamp: message.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_normalizes_each_content_shape() {
        let plain: MessageContent = json!("hello").into();
        assert_eq!(plain.text(), "hello");

        let blocks: MessageContent = json!([
            {"type": "text", "text": "first"},
            {"type": "tool_use", "name": "grep"},
            {"type": "text", "text": ""},
            {"type": "text", "text": "second"}
        ])
        .into();
        assert_eq!(blocks.text(), "first\nsecond");

        let unknown: MessageContent = json!({"weird": true}).into();
        assert_eq!(unknown.text(), r#"{"weird":true}"#);

        assert_eq!(MessageContent::default().text(), "");
    }

    #[test]
    fn completion_markers_match_case_insensitively() {
        assert!(has_completion_marker("All set. [done]"));
        assert!(has_completion_marker("[Task Complete] shipped"));
        assert!(has_completion_marker("✅"));
        assert!(!has_completion_marker("still working on it"));
    }

    #[test]
    fn unknown_roles_deserialize_as_other() {
        let message: ChatMessage =
            serde_json::from_value(json!({"role": "toolResult", "content": "x"})).expect("message");
        assert_eq!(message.role, ChatRole::Other);
        let message: ChatMessage = serde_json::from_value(json!({"content": "x"})).expect("message");
        assert_eq!(message.role, ChatRole::Other);
    }

    #[test]
    fn history_accepts_wrapped_or_bare_lists() {
        let wrapped = ChatHistory::from_value(json!({
            "messages": [
                {"role": "user", "content": "Write the changelog"},
                {"role": "assistant", "content": [{"type": "text", "text": "Done! [DONE]"}]}
            ],
            "derivedTitle": "Changelog"
        }));
        assert_eq!(wrapped.messages.len(), 2);
        assert_eq!(wrapped.derived_title.as_deref(), Some("Changelog"));
        assert_eq!(wrapped.first_user_text().as_deref(), Some("Write the changelog"));
        assert_eq!(
            wrapped.last_assistant().map(ChatMessage::text).as_deref(),
            Some("Done! [DONE]")
        );

        let bare = ChatHistory::from_value(json!([{"role": "assistant", "content": "hi"}]));
        assert_eq!(bare.messages.len(), 1);
        assert!(ChatHistory::from_value(json!(null)).messages.is_empty());
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("✅✅✅", 2), "✅✅");
        assert_eq!(excerpt("short", 500), "short");
    }
}
