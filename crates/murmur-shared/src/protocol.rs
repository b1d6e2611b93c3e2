//! Chat record bodies as they travel over the broker.
//!
//! Bodies are UTF-8 JSON. Each record type has a private `Wire*` shape that
//! mirrors the JSON field names, and a typed public form that the rest of
//! the gateway works with. Unknown JSON fields are ignored; missing
//! optional fields fall back to the defaults documented per field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::Topic;

/// A text or file message on the broadcast or direct topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub sender: String,
    /// Set for direct messages only
    pub recipient: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    File(FileFragment),
}

/// File content, either a whole file or one fragment of a chunked transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFragment {
    /// Shared by all fragments of one transfer
    pub transfer_id: Option<String>,
    pub sequence_index: u32,
    pub total_fragments: u32,
    pub mime_type: String,
    pub filename: String,
    /// Raw bytes; base64 on the wire
    pub data: Vec<u8>,
    pub chunked: bool,
}

/// Body of a join or leave announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub username: String,
    pub consumer_id: String,
}

/// A fully classified inbound record, as handed to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Chat(ChatMessage),
    Joined(PresenceNotice),
    Left(PresenceNotice),
    /// A body that matched no known shape for its topic
    Unrecognized(Value),
}

// ---------------------------------------------------------------------------
// Constructors and helpers
// ---------------------------------------------------------------------------

impl ChatMessage {
    pub fn text(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: None,
            timestamp: Utc::now(),
            body: MessageBody::Text(text.into()),
        }
    }

    pub fn file(
        sender: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: None,
            timestamp: Utc::now(),
            body: MessageBody::File(FileFragment::whole(filename, mime_type, data)),
        }
    }

    /// Address this message to a single participant.
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Whether `name` sent this message or is its recipient.
    pub fn involves(&self, name: &str) -> bool {
        self.sender == name || self.recipient.as_deref() == Some(name)
    }

    pub fn file_fragment(&self) -> Option<&FileFragment> {
        match &self.body {
            MessageBody::File(fragment) => Some(fragment),
            MessageBody::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl FileFragment {
    /// A complete, unchunked file.
    pub fn whole(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            transfer_id: None,
            sequence_index: 0,
            total_fragments: 1,
            mime_type: mime_type.into(),
            filename: filename.into(),
            data,
            chunked: false,
        }
    }
}

impl PresenceNotice {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl InboundMessage {
    /// Classify a parsed record body according to the topic it arrived on.
    pub fn parse(topic: Topic, value: &Value) -> Result<Self, ProtocolError> {
        match topic {
            Topic::Broadcast | Topic::Direct => Ok(Self::Chat(ChatMessage::deserialize(value)?)),
            Topic::Joined => Ok(Self::Joined(PresenceNotice::deserialize(value)?)),
            Topic::Left => Ok(Self::Left(PresenceNotice::deserialize(value)?)),
        }
    }
}

/// Whether a raw body claims to be one fragment of a chunked transfer.
///
/// Used to drop malformed fragments instead of surfacing them.
pub fn is_chunk_shaped(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("file")
        && value
            .get("content")
            .and_then(|c| c.get("isChunked"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Wire mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireChat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    #[serde(default)]
    filename: String,
    data: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_chunks: Option<u32>,
    #[serde(default)]
    is_chunked: bool,
}

impl From<&FileFragment> for WireFile {
    fn from(f: &FileFragment) -> Self {
        Self {
            filename: f.filename.clone(),
            data: BASE64.encode(&f.data),
            mime_type: f.mime_type.clone(),
            file_id: f.transfer_id.clone(),
            chunk_index: f.chunked.then_some(f.sequence_index),
            total_chunks: f.chunked.then_some(f.total_fragments),
            is_chunked: f.chunked,
        }
    }
}

impl TryFrom<WireFile> for FileFragment {
    type Error = ProtocolError;

    fn try_from(wire: WireFile) -> Result<Self, Self::Error> {
        let data = BASE64.decode(wire.data.as_bytes())?;
        let sequence_index = wire.chunk_index.unwrap_or(0);
        let total_fragments = wire.total_chunks.unwrap_or(1);

        if wire.is_chunked {
            if wire.file_id.as_deref().map_or(true, str::is_empty) {
                return Err(ProtocolError::MissingField("fileId"));
            }
            if total_fragments == 0 {
                return Err(ProtocolError::InvalidFragment(
                    "totalChunks must be at least 1".into(),
                ));
            }
            if sequence_index >= total_fragments {
                return Err(ProtocolError::InvalidFragment(format!(
                    "chunkIndex {sequence_index} out of range for {total_fragments} chunks"
                )));
            }
        }

        Ok(Self {
            transfer_id: wire.file_id,
            sequence_index,
            total_fragments,
            mime_type: wire.mime_type,
            filename: wire.filename,
            data,
            chunked: wire.is_chunked,
        })
    }
}

impl Serialize for FileFragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireFile::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileFragment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireFile::deserialize(deserializer)?;
        FileFragment::try_from(wire).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ChatMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (kind, content) = match &self.body {
            MessageBody::Text(text) => ("text", Value::String(text.clone())),
            MessageBody::File(fragment) => (
                "file",
                serde_json::to_value(fragment).map_err(serde::ser::Error::custom)?,
            ),
        };

        // Direct messages name the sender `from`, broadcast ones `username`.
        let (username, from) = match self.recipient {
            Some(_) => (None, Some(self.sender.clone())),
            None => (Some(self.sender.clone()), None),
        };

        WireChat {
            username,
            from,
            to: self.recipient.clone(),
            kind: Some(kind.to_string()),
            content,
            timestamp: Some(self.timestamp.timestamp_millis()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChatMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireChat::deserialize(deserializer)?;
        ChatMessage::try_from(wire).map_err(serde::de::Error::custom)
    }
}

impl TryFrom<WireChat> for ChatMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireChat) -> Result<Self, Self::Error> {
        let sender = wire
            .from
            .or(wire.username)
            .ok_or(ProtocolError::MissingField("username"))?;

        let body = match wire.kind.as_deref().unwrap_or("text") {
            "text" => match wire.content {
                Value::String(text) => MessageBody::Text(text),
                Value::Null => MessageBody::Text(String::new()),
                _ => {
                    return Err(ProtocolError::InvalidContent(
                        "text message with non-string content".into(),
                    ))
                }
            },
            "file" => {
                if wire.content.is_null() {
                    return Err(ProtocolError::MissingField("content"));
                }
                MessageBody::File(serde_json::from_value(wire.content)?)
            }
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };

        let timestamp = wire
            .timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Self {
            sender,
            recipient: wire.to,
            timestamp,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_text_wire_shape() {
        let msg = ChatMessage::text("alice", "hello");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["username"], "alice");
        assert_eq!(value["type"], "text");
        assert_eq!(value["content"], "hello");
        assert!(value.get("from").is_none());
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_direct_message_uses_from_and_to() {
        let msg = ChatMessage::text("alice", "psst").to("bob");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert!(value.get("username").is_none());

        let parsed = ChatMessage::deserialize(&value).unwrap();
        assert_eq!(parsed.sender, "alice");
        assert_eq!(parsed.recipient.as_deref(), Some("bob"));
        assert!(parsed.involves("bob"));
        assert!(!parsed.involves("carol"));
    }

    #[test]
    fn test_missing_type_defaults_to_text_and_extra_fields_ignored() {
        let value = json!({
            "username": "bob",
            "content": "hi",
            "timestamp": 1_700_000_000_000_i64,
            "dmList": [],
        });
        let parsed = ChatMessage::deserialize(&value).unwrap();
        assert_eq!(parsed.body, MessageBody::Text("hi".into()));
        assert_eq!(parsed.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_chunked_fragment_parses() {
        let value = json!({
            "username": "alice",
            "type": "file",
            "timestamp": 1,
            "content": {
                "filename": "cat.png",
                "data": BASE64.encode(b"meow"),
                "mimeType": "image/png",
                "fileId": "t-1",
                "chunkIndex": 2,
                "totalChunks": 3,
                "isChunked": true,
            }
        });
        assert!(is_chunk_shaped(&value));

        let parsed = ChatMessage::deserialize(&value).unwrap();
        let fragment = parsed.file_fragment().unwrap();
        assert_eq!(fragment.transfer_id.as_deref(), Some("t-1"));
        assert_eq!(fragment.sequence_index, 2);
        assert_eq!(fragment.total_fragments, 3);
        assert_eq!(fragment.data, b"meow");
        assert!(fragment.chunked);
    }

    #[test]
    fn test_unchunked_file_defaults() {
        let value = json!({
            "username": "alice",
            "type": "file",
            "content": { "filename": "a.txt", "data": BASE64.encode(b"abc"), "mimeType": "text/plain" }
        });
        let parsed = ChatMessage::deserialize(&value).unwrap();
        let fragment = parsed.file_fragment().unwrap();
        assert!(!fragment.chunked);
        assert_eq!(fragment.total_fragments, 1);
        assert!(!is_chunk_shaped(&value));
    }

    #[test]
    fn test_invalid_fragments_rejected() {
        let out_of_range = json!({
            "username": "a", "type": "file",
            "content": { "data": "", "fileId": "t", "chunkIndex": 3, "totalChunks": 3, "isChunked": true }
        });
        assert!(ChatMessage::deserialize(&out_of_range).is_err());

        let no_id = json!({
            "username": "a", "type": "file",
            "content": { "data": "", "chunkIndex": 0, "totalChunks": 2, "isChunked": true }
        });
        assert!(ChatMessage::deserialize(&no_id).is_err());

        let bad_base64 = json!({
            "username": "a", "type": "file",
            "content": { "data": "***", "fileId": "t", "chunkIndex": 0, "totalChunks": 2, "isChunked": true }
        });
        assert!(ChatMessage::deserialize(&bad_base64).is_err());
    }

    #[test]
    fn test_text_with_object_content_rejected() {
        let value = json!({ "username": "a", "type": "text", "content": { "oops": 1 } });
        let wire: WireChat = serde_json::from_value(value).unwrap();
        assert!(matches!(
            ChatMessage::try_from(wire),
            Err(ProtocolError::InvalidContent(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let value = json!({ "username": "a", "type": "sticker", "content": "x" });
        assert!(ChatMessage::deserialize(&value).is_err());
    }

    #[test]
    fn test_parse_presence_notice() {
        let value = json!({ "username": "alce", "consumerId": "chat-user-alce-1a2b3c4d" });
        match InboundMessage::parse(Topic::Joined, &value).unwrap() {
            InboundMessage::Joined(notice) => {
                assert_eq!(notice.username, "alce");
                assert_eq!(notice.consumer_id, "chat-user-alce-1a2b3c4d");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(InboundMessage::parse(Topic::Left, &json!({})).is_err());
    }
}
