//! Connection lifecycle for one registered phone.
//!
//! Runs a [`MiniBot`] on the current connection and reconnects with
//! exponential backoff when it drops. The attempt counter resets whenever a
//! connection reaches `Open`, so only consecutive failures count.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    bot::{MiniBot, SessionEnd},
    commands::CommandDispatcher,
    domain::PhoneKey,
    messaging::port::{Connection, CredentialStore, SessionConnector},
    registry::SessionRegistry,
};

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_RECONNECT_BASE_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): base * 2^(attempt-1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorExit {
    LoggedOut,
    /// A reconnect came back without linked credentials.
    Unregistered,
    Exhausted { attempts: u32 },
    Cancelled,
}

pub struct Supervisor {
    phone: PhoneKey,
    session_dir: PathBuf,
    connector: Arc<dyn SessionConnector>,
    creds: Arc<dyn CredentialStore>,
    registry: SessionRegistry,
    dispatcher: CommandDispatcher,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phone: PhoneKey,
        session_dir: PathBuf,
        connector: Arc<dyn SessionConnector>,
        creds: Arc<dyn CredentialStore>,
        registry: SessionRegistry,
        dispatcher: CommandDispatcher,
        policy: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            phone,
            session_dir,
            connector,
            creds,
            registry,
            dispatcher,
            policy,
            cancel,
        }
    }

    /// Drive `conn` and its successors until the phone is done.
    pub async fn run(self, mut conn: Connection) -> SupervisorExit {
        let mut attempts = 0u32;
        loop {
            let mut bot = MiniBot::new(
                self.phone.clone(),
                conn.client.clone(),
                self.registry.clone(),
                self.creds.clone(),
                self.dispatcher.clone(),
            );
            let end = bot.run(&mut conn.events, &self.cancel).await;
            if let Err(e) = conn.client.close().await {
                warn!(phone = %self.phone, error = %e, "error closing connection");
            }

            match end {
                SessionEnd::LoggedOut => return SupervisorExit::LoggedOut,
                SessionEnd::Cancelled => return SupervisorExit::Cancelled,
                SessionEnd::Closed { .. } | SessionEnd::StreamEnded => {}
            }
            if bot.opened() {
                attempts = 0;
            }

            conn = loop {
                if attempts >= self.policy.max_attempts {
                    warn!(phone = %self.phone, attempts, "reconnect attempts exhausted");
                    return SupervisorExit::Exhausted { attempts };
                }
                attempts += 1;

                let delay = self.policy.delay(attempts);
                info!(phone = %self.phone, attempt = attempts, ?delay, "reconnecting");
                tokio::select! {
                    _ = self.cancel.cancelled() => return SupervisorExit::Cancelled,
                    _ = sleep(delay) => {}
                }

                match self.connector.connect(&self.phone, &self.session_dir).await {
                    Ok(next) if next.registered => break next,
                    Ok(next) => {
                        let _ = next.client.close().await;
                        self.registry.remove(&self.phone);
                        warn!(phone = %self.phone, "credentials no longer registered, stopping");
                        return SupervisorExit::Unregistered;
                    }
                    Err(e) => {
                        warn!(phone = %self.phone, attempt = attempts, error = %e, "reconnect failed");
                    }
                }
            };
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bot::tests::{NullCreds, RecordingClient};
    use crate::errors::Error;
    use crate::messaging::types::{ClientEvent, ConnectionState};
    use crate::phone::normalize;
    use crate::registry::SessionDefaults;
    use crate::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// What the next `connect` call should produce.
    pub(crate) struct Script {
        pub registered: bool,
        pub events: Vec<ClientEvent>,
        /// Keep the event stream open after the scripted events.
        pub hold_open: bool,
    }

    impl Script {
        pub fn closes_after_open() -> Self {
            Self {
                registered: true,
                events: vec![open(), close(false)],
                hold_open: false,
            }
        }
    }

    pub(crate) fn open() -> ClientEvent {
        ClientEvent::ConnectionUpdate(ConnectionState::Open)
    }

    pub(crate) fn close(logged_out: bool) -> ClientEvent {
        ClientEvent::ConnectionUpdate(ConnectionState::Close {
            reason: if logged_out { "logged out" } else { "connection lost" }.to_string(),
            status_code: Some(if logged_out { 401 } else { 428 }),
            logged_out,
        })
    }

    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub scripts: Mutex<VecDeque<Result<Script>>>,
        pub connects: Mutex<u32>,
        pub client: Arc<RecordingClient>,
        pub held: Mutex<Vec<mpsc::Sender<ClientEvent>>>,
    }

    impl FakeConnector {
        pub fn with(scripts: Vec<Result<Script>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            }
        }

        pub fn connects(&self) -> u32 {
            *self.connects.lock().unwrap()
        }

        pub fn build(&self, script: Script) -> Connection {
            let (tx, rx) = mpsc::channel(script.events.len() + 4);
            for ev in script.events {
                tx.try_send(ev).unwrap();
            }
            if script.hold_open {
                self.held.lock().unwrap().push(tx);
            }
            Connection {
                registered: script.registered,
                client: self.client.clone(),
                events: rx,
            }
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, _phone: &PhoneKey, _session_dir: &Path) -> Result<Connection> {
            *self.connects.lock().unwrap() += 1;
            let next = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::External("connection refused".to_string())));
            next.map(|s| self.build(s))
        }
    }

    fn supervisor(
        connector: Arc<FakeConnector>,
        registry: SessionRegistry,
        cancel: CancellationToken,
    ) -> Supervisor {
        Supervisor::new(
            normalize("15551234567").unwrap(),
            PathBuf::from("/tmp/wpb-test"),
            connector,
            Arc::new(NullCreds::default()),
            registry,
            CommandDispatcher::default(),
            ReconnectPolicy::default(),
            cancel,
        )
    }

    #[test]
    fn delay_doubles() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(5), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_consecutive_failures() {
        let connector = Arc::new(FakeConnector::default());
        let registry = SessionRegistry::new(SessionDefaults::default());
        let sup = supervisor(connector.clone(), registry, CancellationToken::new());
        let first = connector.build(Script::closes_after_open());

        let exit = sup.run(first).await;
        assert_eq!(exit, SupervisorExit::Exhausted { attempts: 5 });
        assert_eq!(connector.connects(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn open_connection_resets_attempts() {
        // Fail four times, open once, then fail until exhausted.
        let mut scripts: Vec<Result<Script>> = (0..4)
            .map(|_| Err(Error::External("refused".to_string())))
            .collect();
        scripts.push(Ok(Script::closes_after_open()));
        let connector = Arc::new(FakeConnector::with(scripts));
        let registry = SessionRegistry::new(SessionDefaults::default());
        let sup = supervisor(connector.clone(), registry, CancellationToken::new());
        let first = connector.build(Script::closes_after_open());

        let exit = sup.run(first).await;
        assert_eq!(exit, SupervisorExit::Exhausted { attempts: 5 });
        assert_eq!(connector.connects(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn closes_without_open_count_as_failures() {
        let scripts = (0..10)
            .map(|_| {
                Ok(Script {
                    registered: true,
                    events: vec![close(false)],
                    hold_open: false,
                })
            })
            .collect();
        let connector = Arc::new(FakeConnector::with(scripts));
        let registry = SessionRegistry::new(SessionDefaults::default());
        let sup = supervisor(connector.clone(), registry, CancellationToken::new());
        let first = connector.build(Script::closes_after_open());

        assert_eq!(sup.run(first).await, SupervisorExit::Exhausted { attempts: 5 });
        assert_eq!(connector.connects(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_ends_without_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let registry = SessionRegistry::new(SessionDefaults::default());
        let sup = supervisor(connector.clone(), registry.clone(), CancellationToken::new());
        let first = connector.build(Script {
            registered: true,
            events: vec![open(), close(true)],
            hold_open: false,
        });

        assert_eq!(sup.run(first).await, SupervisorExit::LoggedOut);
        assert_eq!(connector.connects(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_reconnect_stops() {
        let connector = Arc::new(FakeConnector::with(vec![Ok(Script {
            registered: false,
            events: vec![],
            hold_open: true,
        })]));
        let registry = SessionRegistry::new(SessionDefaults::default());
        let sup = supervisor(connector.clone(), registry.clone(), CancellationToken::new());
        let first = connector.build(Script::closes_after_open());

        assert_eq!(sup.run(first).await, SupervisorExit::Unregistered);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_a_live_connection() {
        let connector = Arc::new(FakeConnector::default());
        let registry = SessionRegistry::new(SessionDefaults::default());
        let cancel = CancellationToken::new();
        let sup = supervisor(connector.clone(), registry, cancel.clone());
        let first = connector.build(Script {
            registered: true,
            events: vec![open()],
            hold_open: true,
        });

        let handle = tokio::spawn(sup.run(first));
        sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), SupervisorExit::Cancelled);
        assert_eq!(connector.connects(), 0);
    }
}
