//! Process adapter for the WhatsApp protocol.
//!
//! Each connection spawns the bridge program with
//! `--session-dir <dir> --phone <digits>` and talks NDJSON over its stdio
//! (see [`wire`]). Responses are routed back to callers by request id; events
//! flow into the connection's event channel through a forwarder, so a slow
//! event consumer never holds up a response.
//!
//! The process lives as long as its [`BridgeClient`]: dropping the last handle
//! kills it.

pub mod wire;

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot, Mutex},
    time::timeout,
};
use tracing::{debug, info, warn};

use wpb_core::{
    domain::{Jid, MessageKey, PhoneKey},
    errors::Error,
    messaging::{
        port::{Connection, ProtocolClient, SessionConnector},
        types::{ClientEvent, ConnectionState, OutgoingMessage},
    },
    Result,
};

use crate::wire::{parse_line, pairing_code, Inbound, Op, Request, Response};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }
}

/// Spawns one bridge process per connection.
#[derive(Clone, Debug)]
pub struct BridgeConnector {
    program: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
    request_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, ready: Duration, request: Duration) -> Self {
        self.ready_timeout = ready;
        self.request_timeout = request;
        self
    }
}

#[async_trait]
impl SessionConnector for BridgeConnector {
    async fn connect(&self, phone: &PhoneKey, session_dir: &Path) -> Result<Connection> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--session-dir")
            .arg(session_dir)
            .arg("--phone")
            .arg(phone.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "failed to spawn bridge {}: {e}",
                self.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::External("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("bridge stdout was not captured".to_string()))?;
        let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let phone = phone.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    debug!(phone = %phone, "bridge: {line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        let mut early = Vec::new();
        let registered = match timeout(self.ready_timeout, wait_ready(&mut lines, &mut early)).await
        {
            Ok(Ok(registered)) => registered,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(with_stderr(e, &*stderr_tail.lock().await));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::External(format!(
                    "bridge not ready after {:?}",
                    self.ready_timeout
                )));
            }
        };
        info!(phone = %phone, registered, "bridge ready");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER.max(early.len()));
        for ev in early {
            let _ = tx.try_send(ev);
        }
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_events(phone.clone(), ev_rx, tx));

        let shared = Arc::new(Shared {
            phone: phone.clone(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(
            lines,
            phone.clone(),
            Arc::downgrade(&shared),
            stderr_tail,
            ev_tx,
        ));

        Ok(Connection {
            registered,
            client: Arc::new(BridgeClient {
                shared,
                request_timeout: self.request_timeout,
            }),
            events: rx,
        })
    }
}

/// Read until the `ready` line. Events seen before it are kept for replay.
async fn wait_ready(
    lines: &mut Lines<BufReader<ChildStdout>>,
    early: &mut Vec<ClientEvent>,
) -> Result<bool> {
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(Some(Inbound::Ready { registered })) => return Ok(registered),
            Ok(Some(Inbound::Event(ev))) => early.push(ev),
            Ok(_) => {}
            Err(e) => warn!(error = %e, line = %truncate_text(&line, 200), "unparsable bridge line"),
        }
    }
    Err(Error::External("bridge exited before ready".to_string()))
}

fn with_stderr(e: Error, tail: &StderrTail) -> Error {
    let stderr = tail.snapshot();
    if stderr.trim().is_empty() {
        return e;
    }
    Error::External(format!("{e}\nstderr (tail):\n{stderr}"))
}

type Pending = oneshot::Sender<Result<Value>>;

struct Shared {
    phone: PhoneKey,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: StdMutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, resp: Response) {
        let Some(waiter) = self.pending().remove(&resp.id) else {
            debug!(phone = %self.phone, id = resp.id, "response for unknown request");
            return;
        };
        let _ = waiter.send(resp.into_result());
    }

    fn fail_pending(&self, reason: &str) {
        let waiters: Vec<_> = self.pending().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::ConnectionClosedEarly {
                details: reason.to_string(),
            }));
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(Error::External("bridge stdin closed".to_string()));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Moves events from the reader into the bounded connection channel. Stops
/// once the receiver is gone.
async fn forward_events(
    phone: PhoneKey,
    mut ev_rx: mpsc::UnboundedReceiver<ClientEvent>,
    tx: mpsc::Sender<ClientEvent>,
) {
    while let Some(ev) = ev_rx.recv().await {
        if tx.send(ev).await.is_err() {
            debug!(phone = %phone, "event receiver dropped");
            return;
        }
    }
}

async fn read_loop(
    mut lines: Lines<BufReader<ChildStdout>>,
    phone: PhoneKey,
    shared: Weak<Shared>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    ev_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(phone = %phone, error = %e, "bridge stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(&line) {
            Ok(Some(Inbound::Response(resp))) => match shared.upgrade() {
                Some(shared) => shared.complete(resp),
                None => break,
            },
            Ok(Some(Inbound::Event(ev))) => {
                // Keep reading even without a listener: responses still matter.
                let _ = ev_tx.send(ev);
            }
            Ok(Some(Inbound::Ready { .. })) | Ok(None) => {}
            Err(e) => {
                warn!(phone = %phone, error = %e, line = %truncate_text(&line, 200), "unparsable bridge line");
            }
        }
    }

    let was_closed = match shared.upgrade() {
        Some(shared) => {
            let was_closed = shared.closed.swap(true, Ordering::AcqRel);
            shared.fail_pending("bridge process exited");
            was_closed
        }
        // Every client handle is gone; the process was killed with it.
        None => true,
    };

    let reason = {
        let tail = stderr_tail.lock().await;
        match tail.last() {
            Some(last) if !was_closed => format!("bridge process exited: {last}"),
            _ => "bridge process exited".to_string(),
        }
    };
    info!(phone = %phone, %reason, "bridge stream ended");
    let _ = ev_tx.send(ClientEvent::ConnectionUpdate(ConnectionState::Close {
        reason,
        status_code: None,
        logged_out: false,
    }));
}

/// [`ProtocolClient`] over a running bridge process.
pub struct BridgeClient {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

impl BridgeClient {
    async fn call(&self, op: Op<'_>) -> Result<Value> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::External("bridge connection closed".to_string()));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request { id, op })?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        if let Err(e) = self.shared.write_line(&line).await {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(Error::External("bridge dropped request".to_string())),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(Error::Protocol {
                    status: Some(408),
                    message: format!("bridge request timed out after {:?}", self.request_timeout),
                })
            }
        }
    }

    async fn kill_child(&self) -> Result<()> {
        let child = {
            let mut guard = self.shared.child.lock().await;
            guard.take()
        };
        let Some(mut child) = child else {
            return Ok(());
        };

        // Give the bridge a moment to flush its session state.
        if let Ok(waited) = timeout(CLOSE_GRACE, child.wait()).await {
            let status = waited?;
            debug!(phone = %self.shared.phone, %status, "bridge exited");
            return Ok(());
        }

        // Best-effort kill + reap. If kill fails and the process is still alive, keep
        // the handle so a later close can retry.
        if let Err(e) = child.kill().await {
            if child.try_wait()?.is_none() {
                let mut guard = self.shared.child.lock().await;
                *guard = Some(child);
                return Err(Error::Io(e));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn request_pairing_code(&self, phone: &PhoneKey) -> Result<String> {
        let result = self
            .call(Op::RequestPairingCode {
                phone: phone.as_str(),
            })
            .await?;
        pairing_code(&result)
    }

    async fn send_message(&self, jid: &Jid, message: OutgoingMessage) -> Result<()> {
        self.call(Op::SendMessage {
            jid,
            message: &message,
        })
        .await?;
        Ok(())
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.call(Op::ReadMessages { keys }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return self.kill_child().await;
        }

        // Ask politely, then close stdin so the bridge sees EOF either way.
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(line) = serde_json::to_string(&Request { id, op: Op::Close }) {
            if let Err(e) = self.shared.write_line(&line).await {
                debug!(phone = %self.shared.phone, error = %e, "close request not delivered");
            }
        }
        self.shared.stdin.lock().await.take();
        self.shared.fail_pending("connection closed");

        self.kill_child().await
    }
}

/// Cut to at most `max_chars` characters, marking the cut with "...".
fn truncate_text(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((at, _)) => format!("{}...", &s[..at]),
    }
}
