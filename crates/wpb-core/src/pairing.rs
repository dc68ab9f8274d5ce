//! Pairing flow: wait for the connection to open, then obtain a code.
//!
//! ```text
//! Idle -> AwaitingConnection -> RequestingCode -> Done
//!              |                      |---------> Failed
//!              |----------------------+---------> Failed (closed early)
//!   (any) --------------------------------------> TimedOut
//! ```
//!
//! A wall-clock deadline races the connection events. Whichever terminal
//! transition happens first wins the [`CompletionGate`]; anything after is a
//! no-op.

use std::{
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    time::{sleep, Sleep},
};
use tracing::{debug, info, warn};

use crate::{
    domain::PhoneKey,
    errors::Error,
    messaging::{
        port::{CredentialStore, ProtocolClient},
        types::{ClientEvent, ConnectionState},
    },
    retry::PairingRetrier,
    Result,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    AwaitingConnection,
    RequestingCode,
    Done,
    Failed,
    TimedOut,
}

/// One-shot completion flag: the first caller of `try_complete` wins.
#[derive(Debug, Default)]
pub struct CompletionGate {
    done: AtomicBool,
}

impl CompletionGate {
    pub fn try_complete(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

pub struct PairingFlow<'a> {
    phone: &'a PhoneKey,
    retrier: &'a PairingRetrier,
    creds: &'a dyn CredentialStore,
    timeout: Duration,
    state: PairingState,
    gate: CompletionGate,
}

impl<'a> PairingFlow<'a> {
    pub fn new(
        phone: &'a PhoneKey,
        retrier: &'a PairingRetrier,
        creds: &'a dyn CredentialStore,
        timeout: Duration,
    ) -> Self {
        Self {
            phone,
            retrier,
            creds,
            timeout,
            state: PairingState::Idle,
            gate: CompletionGate::default(),
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    fn transition(&mut self, next: PairingState) {
        debug!(phone = %self.phone, from = ?self.state, to = ?next, "pairing transition");
        self.state = next;
    }

    fn finish(&mut self, terminal: PairingState, outcome: Result<String>) -> Result<String> {
        if !self.gate.try_complete() {
            // Lost the race; the first outcome already went out.
            return Err(Error::External("pairing already finished".to_string()));
        }
        self.transition(terminal);
        match &outcome {
            Ok(_) => info!(phone = %self.phone, "pairing code ready"),
            Err(e) => warn!(phone = %self.phone, state = ?terminal, error = %e, "pairing failed"),
        }
        outcome
    }

    /// Drive the flow over a freshly opened, unregistered connection.
    pub async fn run(
        &mut self,
        client: &dyn ProtocolClient,
        events: &mut mpsc::Receiver<ClientEvent>,
    ) -> Result<String> {
        let timeout = self.timeout;
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        self.transition(PairingState::AwaitingConnection);

        // Wait for the connection to open.
        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut deadline => {
                    return self.finish(PairingState::TimedOut, Err(Error::TimedOut(timeout)));
                }
                ev = events.recv() => ev,
            };

            match ev {
                Some(ClientEvent::ConnectionUpdate(ConnectionState::Open)) => break,
                Some(ClientEvent::ConnectionUpdate(ConnectionState::Close { reason, .. })) => {
                    return self.finish(PairingState::Failed, Err(closed_early(reason)));
                }
                Some(ClientEvent::CredsUpdate(creds)) => {
                    if !save_before(deadline.as_mut(), self.creds, self.phone, &creds).await {
                        return self.finish(PairingState::TimedOut, Err(Error::TimedOut(timeout)));
                    }
                }
                Some(_) => {}
                None => {
                    return self.finish(
                        PairingState::Failed,
                        Err(closed_early("event stream ended".to_string())),
                    );
                }
            }
        }

        self.transition(PairingState::RequestingCode);
        let retrier = self.retrier;
        let phone = self.phone;
        let request = retrier.request_code(client, phone);
        tokio::pin!(request);

        // Keep draining events while the request runs so the client never
        // blocks on a full channel.
        let mut events_open = true;
        loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    return self.finish(PairingState::TimedOut, Err(Error::TimedOut(timeout)));
                }
                res = &mut request => {
                    let terminal = if res.is_ok() { PairingState::Done } else { PairingState::Failed };
                    return self.finish(terminal, res);
                }
                ev = events.recv(), if events_open => match ev {
                    Some(ClientEvent::ConnectionUpdate(ConnectionState::Close { reason, .. })) => {
                        return self.finish(PairingState::Failed, Err(closed_early(reason)));
                    }
                    Some(ClientEvent::CredsUpdate(creds)) => {
                        if !save_before(deadline.as_mut(), self.creds, self.phone, &creds).await {
                            return self.finish(PairingState::TimedOut, Err(Error::TimedOut(timeout)));
                        }
                    }
                    Some(_) => {}
                    None => events_open = false,
                },
            }
        }
    }
}

/// Persist credentials unless the deadline fires first. Returns `false` on timeout.
async fn save_before(
    deadline: Pin<&mut Sleep>,
    store: &dyn CredentialStore,
    phone: &PhoneKey,
    creds: &serde_json::Value,
) -> bool {
    tokio::select! {
        biased;
        _ = deadline => false,
        res = store.save(phone, creds) => {
            if let Err(e) = res {
                warn!(phone = %phone, error = %e, "failed to persist credentials");
            }
            true
        }
    }
}

fn closed_early(reason: String) -> Error {
    let details = if reason.trim().is_empty() {
        "unknown".to_string()
    } else {
        reason
    };
    Error::ConnectionClosedEarly { details }
}
