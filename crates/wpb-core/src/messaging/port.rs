use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{Jid, MessageKey, PhoneKey},
    messaging::types::{ClientEvent, OutgoingMessage},
    Result,
};

/// Capability surface the core needs from a WhatsApp protocol client.
///
/// The protocol itself (E2E sessions, multi-device sync, framing) lives behind
/// this trait; adapters translate their library or bridge into it.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn request_pairing_code(&self, phone: &PhoneKey) -> Result<String>;

    async fn send_message(&self, jid: &Jid, message: OutgoingMessage) -> Result<()>;

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()>;

    /// Tear down the underlying connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A live connection: the client handle plus its event stream.
pub struct Connection {
    /// Whether the persisted credentials already belong to a linked device.
    pub registered: bool,
    pub client: Arc<dyn ProtocolClient>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Opens sessions from a persisted-state directory.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, phone: &PhoneKey, session_dir: &Path) -> Result<Connection>;
}

/// Persisted credential store. The core never interprets the blob.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Directory holding the phone's persisted state (created if missing).
    async fn session_dir(&self, phone: &PhoneKey) -> Result<PathBuf>;

    async fn save(&self, phone: &PhoneKey, creds: &serde_json::Value) -> Result<()>;
}
