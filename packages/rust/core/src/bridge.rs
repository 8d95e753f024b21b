//! Subprocess bridge to the on-device generation service.
//!
//! Spawns the configured bridge executable and talks to it over a JSON-lines
//! stdin/stdout protocol:
//!
//! - bridge → us on startup: `{"type":"ready"}`
//! - requests: `probe`, `open`, `run`, `abort`, `destroy`, `shutdown`
//! - responses: `availability`, `opened`, `partial`, `result`, `error`
//!
//! Every request except `destroy`/`shutdown` carries an `id`; responses echo it.
//! Responses for an id we are no longer waiting on (typically the late answer
//! to an aborted run) are discarded.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use studydeck_shared::{Result, ServiceConfig, StudyDeckError, SummaryOptions};

use crate::service::{
    Availability, Capability, GenerationService, GenerationSession, SessionSpec,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireSpec<'a> {
    Summarizer { options: &'a SummaryOptions },
    Structured { schema: &'a serde_json::Value },
    Text,
}

impl<'a> From<&'a SessionSpec> for WireSpec<'a> {
    fn from(spec: &'a SessionSpec) -> Self {
        match spec {
            SessionSpec::Summarizer(options) => Self::Summarizer { options },
            SessionSpec::Structured { schema } => Self::Structured { schema },
            SessionSpec::Text => Self::Text,
        }
    }
}

/// Request message sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Probe {
        id: String,
        capability: Capability,
    },
    Open {
        id: String,
        session: &'a str,
        spec: WireSpec<'a>,
    },
    Run {
        id: String,
        session: &'a str,
        input: &'a str,
        stream: bool,
    },
    Abort {
        id: String,
    },
    Destroy {
        session: String,
    },
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Availability {
        id: String,
        status: Availability,
    },
    Opened {
        id: String,
    },
    Partial {
        id: String,
        text: String,
    },
    Result {
        id: String,
        text: String,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        error: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl ResponseMessage {
    /// Whether this message answers request `id`. Errors without an id apply
    /// to whatever is in flight.
    fn answers(&self, id: &str) -> bool {
        match self {
            Self::Ready => false,
            Self::Availability { id: r, .. }
            | Self::Opened { id: r }
            | Self::Partial { id: r, .. }
            | Self::Result { id: r, .. } => r == id,
            Self::Error { id: r, .. } => r.as_deref().is_none_or(|r| r == id),
        }
    }
}

fn bridge_error(code: Option<&str>, error: String) -> StudyDeckError {
    match code {
        Some("cancelled") => StudyDeckError::Cancelled,
        Some("unavailable") => StudyDeckError::unavailable("generation service", error),
        _ => StudyDeckError::Generation(error),
    }
}

fn unexpected(msg: &ResponseMessage) -> StudyDeckError {
    StudyDeckError::Generation(format!("unexpected bridge response: {msg:?}"))
}

// ---------------------------------------------------------------------------
// Process I/O
// ---------------------------------------------------------------------------

struct BridgeIo {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl BridgeIo {
    async fn send(&mut self, request: &RequestMessage<'_>) -> Result<()> {
        let mut json = serde_json::to_string(request).map_err(|e| {
            StudyDeckError::Generation(format!("failed to serialize request: {e}"))
        })?;
        json.push('\n');

        self.stdin.write_all(json.as_bytes()).await.map_err(|e| {
            StudyDeckError::Generation(format!("failed to write to bridge stdin: {e}"))
        })?;
        self.stdin.flush().await.map_err(|e| {
            StudyDeckError::Generation(format!("failed to flush bridge stdin: {e}"))
        })
    }

    /// Read one response. Cancel-safe: `next_line` keeps partial input buffered.
    async fn receive(&mut self) -> Result<ResponseMessage> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| StudyDeckError::Generation(format!("bridge read error: {e}")))?
            .ok_or_else(|| {
                StudyDeckError::Generation("bridge closed stdout unexpectedly".into())
            })?;

        serde_json::from_str(line.trim()).map_err(|e| {
            StudyDeckError::Generation(format!(
                "invalid bridge response: {e} (got: {})",
                line.chars().take(200).collect::<String>()
            ))
        })
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

struct Shared {
    io: Mutex<BridgeIo>,
    request_counter: AtomicU64,
    session_counter: AtomicU64,
    /// Sessions released from sync code, sent before the next request.
    pending_destroy: StdMutex<Vec<String>>,
}

impl Shared {
    fn next_request_id(&self) -> String {
        format!("req-{}", self.request_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn take_pending_destroys(&self) -> Vec<String> {
        let mut pending = self
            .pending_destroy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    async fn flush_destroys(&self, io: &mut BridgeIo) -> Result<()> {
        for session in self.take_pending_destroys() {
            debug!(%session, "destroying bridge session");
            io.send(&RequestMessage::Destroy { session }).await?;
        }
        Ok(())
    }

    /// Send `request` and wait for the response carrying `id`.
    async fn exchange(
        &self,
        id: &str,
        request: &RequestMessage<'_>,
        cancel: Option<&CancellationToken>,
        snapshots: Option<&watch::Sender<String>>,
    ) -> Result<ResponseMessage> {
        // Requests queue behind the one in flight; a cancel while queued sends nothing.
        let mut io = tokio::select! {
            biased;
            () = cancelled(cancel) => {
                debug!(id, "cancelled while waiting for the bridge");
                return Err(StudyDeckError::Cancelled);
            }
            io = self.io.lock() => io,
        };
        self.flush_destroys(&mut io).await?;
        io.send(request).await?;

        loop {
            let next = tokio::select! {
                msg = io.receive() => Some(msg),
                () = cancelled(cancel) => None,
            };
            let Some(msg) = next else {
                debug!(id, "aborting bridge request");
                io.send(&RequestMessage::Abort { id: id.to_string() }).await?;
                return Err(StudyDeckError::Cancelled);
            };

            let msg = msg?;
            if !msg.answers(id) {
                debug!(id, response = ?msg, "discarding stale bridge response");
                continue;
            }
            match msg {
                ResponseMessage::Partial { text, .. } => {
                    if let Some(tx) = snapshots {
                        tx.send_replace(text);
                    }
                }
                ResponseMessage::Error { error, code, .. } => {
                    return Err(bridge_error(code.as_deref(), error));
                }
                other => return Ok(other),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// [`GenerationService`] backed by a bridge subprocess.
pub struct BridgeService {
    shared: Arc<Shared>,
}

impl BridgeService {
    /// Spawn the bridge and wait for its ready signal.
    pub async fn spawn(config: &ServiceConfig) -> Result<Self> {
        info!(cmd = %config.command, args = ?config.args, "spawning generation bridge");

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            StudyDeckError::unavailable(
                "generation service",
                format!("failed to spawn bridge: {e}. Is `{}` installed?", config.command),
            )
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            StudyDeckError::Generation("failed to capture bridge stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            StudyDeckError::Generation("failed to capture bridge stdout".into())
        })?;

        let mut io = BridgeIo {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        };

        match io.receive().await? {
            ResponseMessage::Ready => info!("bridge is ready"),
            other => {
                return Err(StudyDeckError::Generation(format!(
                    "expected ready message, got: {other:?}"
                )));
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                io: Mutex::new(io),
                request_counter: AtomicU64::new(0),
                session_counter: AtomicU64::new(0),
                pending_destroy: StdMutex::new(Vec::new()),
            }),
        })
    }

    /// Release pending sessions, ask the bridge to exit, and wait for it.
    pub async fn shutdown(&self) -> Result<()> {
        let mut io = self.shared.io.lock().await;
        if let Err(e) = self.shared.flush_destroys(&mut io).await {
            warn!(error = %e, "failed to release sessions before shutdown");
        }
        if let Err(e) = io.send(&RequestMessage::Shutdown).await {
            warn!(error = %e, "failed to send shutdown to bridge");
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, io.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit in time; killing it");
                if let Err(e) = io.child.kill().await {
                    warn!("bridge kill error: {e}");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl GenerationService for BridgeService {
    async fn availability(&self, capability: Capability) -> Result<Availability> {
        let id = self.shared.next_request_id();
        let request = RequestMessage::Probe {
            id: id.clone(),
            capability,
        };
        match self.shared.exchange(&id, &request, None, None).await? {
            ResponseMessage::Availability { status, .. } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    async fn open_session(&self, spec: SessionSpec) -> Result<Arc<dyn GenerationSession>> {
        let id = self.shared.next_request_id();
        let session = format!(
            "s-{}",
            self.shared.session_counter.fetch_add(1, Ordering::Relaxed) + 1
        );
        let request = RequestMessage::Open {
            id: id.clone(),
            session: &session,
            spec: WireSpec::from(&spec),
        };

        match self.shared.exchange(&id, &request, None, None).await? {
            ResponseMessage::Opened { .. } => {
                debug!(%session, capability = %spec.capability(), "bridge session opened");
                Ok(Arc::new(BridgeSession {
                    shared: self.shared.clone(),
                    session,
                    destroyed: AtomicBool::new(false),
                }))
            }
            other => Err(unexpected(&other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct BridgeSession {
    shared: Arc<Shared>,
    session: String,
    destroyed: AtomicBool,
}

impl BridgeSession {
    async fn run_inner(
        &self,
        input: &str,
        cancel: &CancellationToken,
        snapshots: Option<&watch::Sender<String>>,
    ) -> Result<String> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StudyDeckError::Generation(format!(
                "session {} was already destroyed",
                self.session
            )));
        }

        let id = self.shared.next_request_id();
        let request = RequestMessage::Run {
            id: id.clone(),
            session: &self.session,
            input,
            stream: snapshots.is_some(),
        };

        match self
            .shared
            .exchange(&id, &request, Some(cancel), snapshots)
            .await?
        {
            ResponseMessage::Result { text, .. } => Ok(text),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl GenerationSession for BridgeSession {
    async fn run(&self, input: &str, cancel: &CancellationToken) -> Result<String> {
        self.run_inner(input, cancel, None).await
    }

    async fn run_streaming(
        &self,
        input: &str,
        cancel: &CancellationToken,
        snapshots: &watch::Sender<String>,
    ) -> Result<String> {
        let text = self.run_inner(input, cancel, Some(snapshots)).await?;
        snapshots.send_replace(text.clone());
        Ok(text)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .pending_destroy
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(self.session.clone());

        // Flush promptly when a runtime is around; otherwise the next request does it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let shared = self.shared.clone();
            handle.spawn(async move {
                let mut io = shared.io.lock().await;
                if let Err(e) = shared.flush_destroys(&mut io).await {
                    warn!(error = %e, "failed to release bridge session");
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
