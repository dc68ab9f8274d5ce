//! Pairing service: the entry point behind `GET /pair`.
//!
//! ```text
//! normalize -> throttle -> running? -> session dir -> connect
//!   unregistered -> pairing flow -> Code (connection lingers for the link)
//!   registered   -> supervisor    -> Running
//! ```

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    commands::CommandDispatcher,
    config::Config,
    domain::PhoneKey,
    messaging::{
        port::{Connection, CredentialStore, SessionConnector},
        types::{ClientEvent, ConnectionState},
    },
    pairing::{PairingFlow, DEFAULT_TIMEOUT},
    phone,
    registry::{SessionDefaults, SessionRegistry},
    retry::{PairingRetrier, RetryPolicy},
    supervisor::{ReconnectPolicy, Supervisor},
    throttle::{PairingThrottle, DEFAULT_MIN_INTERVAL},
    Result,
};

pub const DEFAULT_LINGER: Duration = Duration::from_secs(180);

#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub min_interval: Duration,
    pub pairing_timeout: Duration,
    /// How long a connection stays up after a code is issued, waiting for
    /// the user to enter it.
    pub linger: Duration,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    pub session_defaults: SessionDefaults,
    pub command_prefix: char,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            pairing_timeout: DEFAULT_TIMEOUT,
            linger: DEFAULT_LINGER,
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            session_defaults: SessionDefaults::default(),
            command_prefix: crate::commands::DEFAULT_PREFIX,
        }
    }
}

impl ServiceSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_interval: cfg.pairing_min_interval,
            pairing_timeout: cfg.pairing_timeout,
            linger: cfg.pairing_linger,
            retry: cfg.retry_policy(),
            reconnect: ReconnectPolicy {
                max_attempts: cfg.reconnect_max_attempts,
                base_delay: cfg.reconnect_base_delay,
            },
            session_defaults: cfg.session_defaults(),
            command_prefix: cfg.command_prefix,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairOutcome {
    /// A fresh pairing code for an unlinked number.
    Code(String),
    /// The number is already linked and its bot is running.
    Running { phone: PhoneKey, registered: bool },
}

#[derive(Clone)]
pub struct PairingService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    connector: Arc<dyn SessionConnector>,
    creds: Arc<dyn CredentialStore>,
    throttle: PairingThrottle,
    retrier: PairingRetrier,
    registry: SessionRegistry,
    dispatcher: CommandDispatcher,
    settings: ServiceSettings,
    bots: Mutex<HashMap<PhoneKey, CancellationToken>>,
    shutdown: CancellationToken,
}

impl PairingService {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        creds: Arc<dyn CredentialStore>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                connector,
                creds,
                throttle: PairingThrottle::new(settings.min_interval),
                retrier: PairingRetrier::new(settings.retry.clone()),
                registry: SessionRegistry::new(settings.session_defaults.clone()),
                dispatcher: CommandDispatcher::new(settings.command_prefix),
                settings,
                bots: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn throttle(&self) -> &PairingThrottle {
        &self.inner.throttle
    }

    /// Number of phones with a running bot.
    pub fn session_count(&self) -> usize {
        self.bots().len()
    }

    pub fn is_running(&self, phone: &PhoneKey) -> bool {
        self.bots().contains_key(phone)
    }

    /// Stop every bot and lingering pairing connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn bots(&self) -> std::sync::MutexGuard<'_, HashMap<PhoneKey, CancellationToken>> {
        self.inner.bots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn pair(&self, raw_phone: &str) -> Result<PairOutcome> {
        let phone = phone::normalize(raw_phone)?;
        // Held until return; released on every path.
        let _lease = self.inner.throttle.acquire(&phone)?;

        if self.is_running(&phone) {
            debug!(phone = %phone, "bot already running");
            return Ok(PairOutcome::Running {
                phone,
                registered: true,
            });
        }

        let session_dir = self.inner.creds.session_dir(&phone).await?;
        let mut conn = self.inner.connector.connect(&phone, &session_dir).await?;

        if conn.registered {
            self.start_bot(phone.clone(), session_dir, conn).await;
            return Ok(PairOutcome::Running {
                phone,
                registered: true,
            });
        }

        info!(phone = %phone, "requesting pairing code");
        let mut flow = PairingFlow::new(
            &phone,
            &self.inner.retrier,
            self.inner.creds.as_ref(),
            self.inner.settings.pairing_timeout,
        );
        match flow.run(conn.client.as_ref(), &mut conn.events).await {
            Ok(code) => {
                self.spawn_linger(phone, session_dir, conn);
                Ok(PairOutcome::Code(code))
            }
            Err(e) => {
                if let Err(close_err) = conn.client.close().await {
                    debug!(phone = %phone, error = %close_err, "close after failed pairing");
                }
                Err(e)
            }
        }
    }

    async fn start_bot(&self, phone: PhoneKey, session_dir: PathBuf, conn: Connection) {
        let cancel = self.inner.shutdown.child_token();
        let inserted = {
            let mut bots = self.bots();
            if bots.contains_key(&phone) {
                false
            } else {
                bots.insert(phone.clone(), cancel.clone());
                true
            }
        };
        if !inserted {
            let _ = conn.client.close().await;
            return;
        }

        self.inner.registry.get_or_create(&phone);
        let supervisor = Supervisor::new(
            phone.clone(),
            session_dir,
            self.inner.connector.clone(),
            self.inner.creds.clone(),
            self.inner.registry.clone(),
            self.inner.dispatcher.clone(),
            self.inner.settings.reconnect.clone(),
            cancel,
        );

        info!(phone = %phone, "bot started");
        let svc = self.clone();
        tokio::spawn(async move {
            let exit = supervisor.run(conn).await;
            info!(phone = %phone, ?exit, "bot stopped");
            svc.bots().remove(&phone);
        });
    }

    fn spawn_linger(&self, phone: PhoneKey, session_dir: PathBuf, conn: Connection) {
        let svc = self.clone();
        tokio::spawn(async move {
            if svc.linger(&phone, conn).await {
                svc.resume(phone, session_dir).await;
            }
        });
    }

    /// Keep the pairing connection alive so the user can enter the code.
    /// Returns whether the device got linked (credentials changed and the
    /// connection closed for a restart rather than a logout).
    async fn linger(&self, phone: &PhoneKey, mut conn: Connection) -> bool {
        let deadline = sleep(self.inner.settings.linger);
        tokio::pin!(deadline);
        let mut creds_changed = false;

        let linked = loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break false,
                _ = &mut deadline => {
                    info!(phone = %phone, "pairing window expired");
                    break false;
                }
                ev = conn.events.recv() => match ev {
                    Some(ClientEvent::CredsUpdate(creds)) => {
                        creds_changed = true;
                        if let Err(e) = self.inner.creds.save(phone, &creds).await {
                            warn!(phone = %phone, error = %e, "failed to persist credentials");
                        }
                    }
                    Some(ClientEvent::ConnectionUpdate(ConnectionState::Close { logged_out, .. })) => {
                        break creds_changed && !logged_out;
                    }
                    Some(_) => {}
                    None => break creds_changed,
                },
            }
        };

        let _ = conn.client.close().await;
        linked
    }

    /// Reconnect after a completed link and hand the session to a bot.
    async fn resume(&self, phone: PhoneKey, session_dir: PathBuf) {
        if self.is_running(&phone) {
            return;
        }
        match self.inner.connector.connect(&phone, &session_dir).await {
            Ok(conn) if conn.registered => self.start_bot(phone, session_dir, conn).await,
            Ok(conn) => {
                let _ = conn.client.close().await;
                info!(phone = %phone, "device not linked after pairing");
            }
            Err(e) => warn!(phone = %phone, error = %e, "reconnect after pairing failed"),
        }
    }
}
