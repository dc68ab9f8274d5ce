use serde::{Deserialize, Serialize};

use crate::domain::{Jid, MessageKey};

/// Payload of an inbound message, as far as the bot cares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain `conversation` text.
    Text { text: String },
    /// Extended text (links, quotes, mentions).
    ExtendedText { text: String },
    Image {
        #[serde(default)]
        caption: Option<String>,
    },
    /// Any other media or protocol payload.
    #[serde(other)]
    Other,
}

impl MessageContent {
    /// Text lookup order: conversation, extended text, image caption.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } | MessageContent::ExtendedText { text } => Some(text),
            MessageContent::Image { caption } => caption.as_deref(),
            MessageContent::Other => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub push_name: Option<String>,
    /// `None` for stubs (receipts, key distribution) that carry no message.
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl InboundMessage {
    pub fn text(&self) -> &str {
        self.content
            .as_ref()
            .and_then(MessageContent::text)
            .unwrap_or("")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    /// New message delivered live.
    Notify,
    /// History sync / catch-up.
    Append,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    pub key: MessageKey,
    /// The sender revoked ("deleted for everyone") this message.
    #[serde(default)]
    pub revoked: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close {
        reason: String,
        status_code: Option<u16>,
        logged_out: bool,
    },
}

/// Events emitted by a protocol client connection.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    ConnectionUpdate(ConnectionState),
    MessagesUpsert {
        kind: UpsertKind,
        messages: Vec<InboundMessage>,
    },
    MessagesUpdate(Vec<MessageUpdate>),
    /// Opaque credential blob that must be persisted.
    CredsUpdate(serde_json::Value),
}

/// Outbound payloads the bot sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingMessage {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        quoted: Option<MessageKey>,
    },
    Reaction {
        key: MessageKey,
        emoji: String,
    },
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            quoted: None,
        }
    }

    pub fn reply(text: impl Into<String>, quoted: &MessageKey) -> Self {
        OutgoingMessage::Text {
            text: text.into(),
            quoted: Some(quoted.clone()),
        }
    }
}

/// Helper for tests and adapters that build keys by hand.
pub fn message_key(chat: &str, id: &str) -> MessageKey {
    MessageKey {
        remote_jid: Jid::new(chat),
        id: id.to_string(),
        from_me: false,
        participant: None,
    }
}
