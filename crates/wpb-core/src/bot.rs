//! Long-lived listener for a registered connection.
//!
//! Handles auto-view of status updates, auto-react, prefixed commands and
//! anti-delete recovery. Failures inside a handler are logged and swallowed;
//! one bad message never takes the listener down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    anti_delete::recovery_notice,
    commands::CommandDispatcher,
    domain::PhoneKey,
    messaging::{
        port::{CredentialStore, ProtocolClient},
        types::{
            ClientEvent, ConnectionState, InboundMessage, MessageUpdate, OutgoingMessage,
            UpsertKind,
        },
    },
    registry::{SessionRegistry, SharedBotSession},
    Result,
};

/// Why a connection's event loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The device was unlinked; state has been dropped.
    LoggedOut,
    /// Connection closed for another reason; reconnecting may help.
    Closed {
        reason: String,
        status_code: Option<u16>,
    },
    /// The client dropped its event stream without a close notice.
    StreamEnded,
    Cancelled,
}

pub struct MiniBot {
    phone: PhoneKey,
    client: Arc<dyn ProtocolClient>,
    session: SharedBotSession,
    registry: SessionRegistry,
    creds: Arc<dyn CredentialStore>,
    dispatcher: CommandDispatcher,
    opened: bool,
}

impl MiniBot {
    pub fn new(
        phone: PhoneKey,
        client: Arc<dyn ProtocolClient>,
        registry: SessionRegistry,
        creds: Arc<dyn CredentialStore>,
        dispatcher: CommandDispatcher,
    ) -> Self {
        let session = registry.get_or_create(&phone);
        Self {
            phone,
            client,
            session,
            registry,
            creds,
            dispatcher,
            opened: false,
        }
    }

    /// Whether this connection reached `Open` at least once.
    pub fn opened(&self) -> bool {
        self.opened
    }

    /// Consume events until the connection ends or `cancel` fires.
    pub async fn run(
        &mut self,
        events: &mut mpsc::Receiver<ClientEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                ev = events.recv() => ev,
            };
            let Some(ev) = ev else {
                return SessionEnd::StreamEnded;
            };
            if let Some(end) = self.handle_event(ev).await {
                return end;
            }
        }
    }

    /// Handle one event. Returns `Some` when the connection is over.
    pub async fn handle_event(&mut self, ev: ClientEvent) -> Option<SessionEnd> {
        match ev {
            ClientEvent::ConnectionUpdate(state) => return self.on_connection(state),
            ClientEvent::MessagesUpsert { kind, messages } => {
                if kind != UpsertKind::Notify {
                    return None;
                }
                for msg in messages {
                    if let Err(e) = self.on_message(&msg).await {
                        warn!(phone = %self.phone, id = %msg.key.id, error = %e, "message processing error");
                    }
                }
            }
            ClientEvent::MessagesUpdate(updates) => {
                for update in updates {
                    if let Err(e) = self.on_update(&update).await {
                        warn!(phone = %self.phone, id = %update.key.id, error = %e, "anti-delete error");
                    }
                }
            }
            ClientEvent::CredsUpdate(creds) => {
                if let Err(e) = self.creds.save(&self.phone, &creds).await {
                    warn!(phone = %self.phone, error = %e, "failed to persist credentials");
                }
            }
        }
        None
    }

    fn on_connection(&mut self, state: ConnectionState) -> Option<SessionEnd> {
        match state {
            ConnectionState::Connecting => None,
            ConnectionState::Open => {
                self.opened = true;
                info!(phone = %self.phone, "connection open");
                None
            }
            ConnectionState::Close {
                logged_out: true, ..
            } => {
                self.registry.remove(&self.phone);
                info!(phone = %self.phone, "session logged out");
                Some(SessionEnd::LoggedOut)
            }
            ConnectionState::Close {
                reason,
                status_code,
                ..
            } => {
                info!(phone = %self.phone, %reason, ?status_code, "connection closed");
                Some(SessionEnd::Closed {
                    reason,
                    status_code,
                })
            }
        }
    }

    async fn on_message(&self, msg: &InboundMessage) -> Result<()> {
        if msg.content.is_none() {
            return Ok(());
        }
        let jid = &msg.key.remote_jid;
        let text = msg.text();

        // Decide everything under the lock, then do I/O without it.
        let (auto_view, auto_react, emoji, reply) = {
            let mut s = self.session.lock().await;
            if s.config.anti_delete {
                s.cache.insert(msg);
            }
            let reply = if jid.is_group() || jid.is_status_broadcast() {
                None
            } else {
                self.dispatcher.dispatch(text, &mut s.config)
            };
            (
                s.config.auto_view,
                s.config.auto_react,
                s.config.react_emoji.clone(),
                reply,
            )
        };

        if jid.is_status_broadcast() {
            if auto_view {
                self.client
                    .read_messages(std::slice::from_ref(&msg.key))
                    .await?;
                debug!(phone = %self.phone, id = %msg.key.id, "status viewed");
            }
            return Ok(());
        }

        if jid.is_group() {
            return Ok(());
        }

        if auto_react && !self.dispatcher.is_command(text) {
            let reaction = OutgoingMessage::Reaction {
                key: msg.key.clone(),
                emoji,
            };
            if let Err(e) = self.client.send_message(jid, reaction).await {
                debug!(phone = %self.phone, error = %e, "auto-react failed");
            }
        }

        if let Some(reply) = reply {
            self.client
                .send_message(jid, OutgoingMessage::reply(reply, &msg.key))
                .await?;
        }
        Ok(())
    }

    async fn on_update(&self, update: &MessageUpdate) -> Result<()> {
        if !update.revoked {
            return Ok(());
        }
        let cached = self.session.lock().await.cache.take(&update.key.id);
        let Some(cached) = cached else {
            return Ok(());
        };

        info!(phone = %self.phone, id = %cached.id, "recovering deleted message");
        self.client
            .send_message(
                &update.key.remote_jid,
                OutgoingMessage::text(recovery_notice(&cached)),
            )
            .await
    }
}
