//! NDJSON wire format spoken with the bridge process.
//!
//! stdin (one request per line):
//! `{"id":1,"op":"request_pairing_code","phone":"15551234567"}`
//!
//! stdout (one message per line):
//! - `{"type":"ready","registered":false}`
//! - `{"type":"response","id":1,"ok":true,"result":"ABCD-1234"}`
//! - `{"type":"event","event":"connection.update","connection":"open"}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wpb_core::{
    domain::{Jid, MessageKey},
    errors::Error,
    messaging::types::{
        ClientEvent, ConnectionState, InboundMessage, MessageUpdate, OutgoingMessage, UpsertKind,
    },
    Result,
};

/// Status the protocol library uses for an unlinked device.
const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op<'a>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op<'a> {
    RequestPairingCode {
        phone: &'a str,
    },
    SendMessage {
        jid: &'a Jid,
        message: &'a OutgoingMessage,
    },
    ReadMessages {
        keys: &'a [MessageKey],
    },
    Close,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Response {
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            return Ok(self.result);
        }
        Err(Error::Protocol {
            status: self.status,
            message: self
                .error
                .unwrap_or_else(|| "bridge request failed".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum WireEvent {
    #[serde(rename = "connection.update")]
    ConnectionUpdate {
        #[serde(default)]
        connection: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        logged_out: bool,
    },
    #[serde(rename = "messages.upsert")]
    MessagesUpsert {
        kind: UpsertKind,
        #[serde(default)]
        messages: Vec<InboundMessage>,
    },
    #[serde(rename = "messages.update")]
    MessagesUpdate {
        #[serde(default)]
        updates: Vec<MessageUpdate>,
    },
    #[serde(rename = "creds.update")]
    CredsUpdate { creds: Value },
}

#[derive(Debug)]
pub enum Inbound {
    Ready { registered: bool },
    Response(Response),
    Event(ClientEvent),
}

/// Parse one stdout line. `Ok(None)` for message types we don't know (or
/// connection updates that carry no state change).
pub fn parse_line(line: &str) -> Result<Option<Inbound>> {
    let value: Value = serde_json::from_str(line)?;
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match kind {
        "ready" => Ok(Some(Inbound::Ready {
            registered: value
                .get("registered")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })),
        "response" => Ok(Some(Inbound::Response(serde_json::from_value(value)?))),
        "event" => {
            let ev: WireEvent = serde_json::from_value(value)?;
            Ok(map_event(ev).map(Inbound::Event))
        }
        _ => Ok(None),
    }
}

fn map_event(ev: WireEvent) -> Option<ClientEvent> {
    let ev = match ev {
        WireEvent::ConnectionUpdate {
            connection,
            reason,
            status_code,
            logged_out,
        } => {
            let state = match connection.as_deref()? {
                "connecting" => ConnectionState::Connecting,
                "open" => ConnectionState::Open,
                "close" => ConnectionState::Close {
                    reason: reason.unwrap_or_default(),
                    status_code,
                    logged_out: logged_out || status_code == Some(LOGGED_OUT_STATUS),
                },
                _ => return None,
            };
            ClientEvent::ConnectionUpdate(state)
        }
        WireEvent::MessagesUpsert { kind, messages } => {
            ClientEvent::MessagesUpsert { kind, messages }
        }
        WireEvent::MessagesUpdate { updates } => ClientEvent::MessagesUpdate(updates),
        WireEvent::CredsUpdate { creds } => ClientEvent::CredsUpdate(creds),
    };
    Some(ev)
}

/// Extract the code from a `request_pairing_code` result (`"CODE"` or
/// `{"code":"CODE"}`).
pub fn pairing_code(result: &Value) -> Result<String> {
    result
        .as_str()
        .or_else(|| result.get("code").and_then(|v| v.as_str()))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol {
            status: None,
            message: "bridge returned no pairing code".to_string(),
        })
}
