//! One spawned `codex app-server` process and its stdio plumbing.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use climate_events::EventHub;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CodexError;

/// Event kind published for every line the child writes to stdout.
pub const STDOUT_EVENT_KIND: &str = "codex/stdout";

/// Constant acknowledgement returned for notifications.
pub const RPC_ACK: &[u8] = br#"{"ok":true}"#;

/// Default (and maximum) wait for a pending response.
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

type OnDead = Box<dyn FnOnce() + Send>;

/// A live `codex app-server` child.
///
/// The stdin lock serializes line writes only; it is never held while waiting
/// for a response. Every stdout line becomes a hub event, independent of
/// whether it also resolves a pending request.
pub struct Session {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
    dead: AtomicBool,
    dead_token: CancellationToken,
    kill_token: CancellationToken,
    last_activity_ms: AtomicU64,
    hub: Arc<EventHub>,
    on_dead: Mutex<Option<OnDead>>,
    init_reply: Mutex<Option<Value>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn `<bin> app-server` with piped stdin/stdout and inherited stderr.
    ///
    /// `on_dead` runs exactly once, on the first transition to dead (child
    /// exit, kill, or stdin write failure).
    pub fn spawn(
        bin: &Path,
        hub: Arc<EventHub>,
        on_dead: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Self>, CodexError> {
        let spawn_err = |source: std::io::Error| CodexError::Spawn {
            bin: bin.display().to_string(),
            source,
        };

        let mut child = Command::new(bin)
            .arg("app-server")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdout unavailable")))?;
        let pid = child.id();

        let session = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
            dead_token: CancellationToken::new(),
            kill_token: CancellationToken::new(),
            last_activity_ms: AtomicU64::new(0),
            hub,
            on_dead: Mutex::new(Some(Box::new(on_dead))),
            init_reply: Mutex::new(None),
            pid,
        });
        session.touch();

        drop(tokio::spawn(Arc::clone(&session).read_stdout(stdout)));
        drop(tokio::spawn(Arc::clone(&session).wait_for_exit(child)));

        info!(pid, "codex app-server started");
        Ok(session)
    }

    /// Whether the session has transitioned to dead.
    pub fn dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Child process id, when the OS reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Timestamp of the last successful stdin write (spawn counts as one).
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_activity_ms.load(Ordering::SeqCst);
        if ms == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(ms as i64)
    }

    /// How long the session has been idle, `None` before any activity.
    pub fn idle_for(&self) -> Option<Duration> {
        let ms = self.last_activity_ms.load(Ordering::SeqCst);
        if ms == 0 {
            return None;
        }
        Some(Duration::from_millis(now_ms().saturating_sub(ms)))
    }

    /// Terminate the child and mark the session dead.
    pub fn kill(&self) {
        self.kill_token.cancel();
        self.mark_dead();
    }

    /// Send one JSON-RPC envelope down the child's stdin.
    ///
    /// Requests (`method` + `id`) wait for the correlated response line, the
    /// session's death, or the earlier of 30 s and `deadline`. Anything else
    /// returns the constant acknowledgement after the write. Repeated
    /// `initialize` requests are answered from the cached first result
    /// without touching the child.
    pub async fn send_rpc(
        &self,
        payload: Value,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, CodexError> {
        if self.dead() {
            return Err(CodexError::NotRunning);
        }

        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let has_method = payload.get("method").is_some();
        let id = payload.get("id").cloned();

        if method.as_deref() == Some("initialize") && id.is_some() {
            let cached = self.init_reply.lock().clone();
            if let Some(result) = cached {
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
                return Ok(serde_json::to_vec(&reply)?);
            }
        }

        let id_key = id.as_ref().and_then(json_id_key);
        let is_request = has_method && id_key.is_some();

        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');

        let mut rx = None;
        if is_request {
            let key = id_key.clone().expect("checked above");
            let (tx, receiver) = oneshot::channel();
            let _ = self.pending.lock().insert(key, tx);
            rx = Some(receiver);
        }

        {
            let mut stdin = self.stdin.lock().await;
            let written = match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                drop(stdin);
                self.forget(id_key.as_deref());
                self.mark_dead();
                return Err(CodexError::Stdin(err));
            }
        }
        self.touch();

        let Some(mut rx) = rx else {
            return Ok(RPC_ACK.to_vec());
        };

        let timeout = deadline.map_or(DEFAULT_RPC_TIMEOUT, |d| d.min(DEFAULT_RPC_TIMEOUT));

        tokio::select! {
            res = &mut rx => match res {
                Ok(bytes) => {
                    if method.as_deref() == Some("initialize") {
                        self.cache_initialize_reply(&bytes);
                    }
                    Ok(bytes)
                }
                // All senders are dropped when the session dies.
                Err(_) => Err(CodexError::NotRunning),
            },
            () = self.dead_token.cancelled() => {
                self.forget(id_key.as_deref());
                Err(CodexError::NotRunning)
            }
            () = tokio::time::sleep(timeout) => {
                self.forget(id_key.as_deref());
                Err(CodexError::Timeout(timeout))
            }
        }
    }

    /// Idempotent transition to dead: fires the broadcast, closes every
    /// pending sink, and runs the on-dead callback once.
    pub(crate) fn mark_dead(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dead_token.cancel();
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drop(drained);
        if let Some(callback) = self.on_dead.lock().take() {
            callback();
        }
        debug!(pid = self.pid, "session marked dead");
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn forget(&self, id_key: Option<&str>) {
        if let Some(key) = id_key {
            let _ = self.pending.lock().remove(key);
        }
    }

    fn cache_initialize_reply(&self, response: &[u8]) {
        let Ok(decoded) = serde_json::from_slice::<Value>(response) else {
            return;
        };
        let Some(object) = decoded.as_object() else {
            return;
        };
        if object.contains_key("error") {
            return;
        }
        let Some(result) = object.get("result") else {
            return;
        };
        if result.is_null() {
            return;
        }
        let mut cache = self.init_reply.lock();
        if cache.is_none() {
            *cache = Some(result.clone());
        }
    }

    async fn read_stdout(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = self.hub.publish(STDOUT_EVENT_KIND, line.clone());
                    let Some(key) = extract_id_key(&line) else {
                        continue;
                    };
                    let sender = self.pending.lock().remove(&key);
                    if let Some(tx) = sender {
                        let _ = tx.send(line.into_bytes());
                    }
                }
                // EOF: the exit waiter observes the child and marks dead.
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "codex stdout read error");
                    self.mark_dead();
                    break;
                }
            }
        }
    }

    async fn wait_for_exit(self: Arc<Self>, mut child: Child) {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => info!(%status, pid = self.pid, "codex app-server exited"),
                Err(err) => warn!(error = %err, pid = self.pid, "failed to reap codex app-server"),
            },
            () = self.kill_token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        self.mark_dead();
    }
}

/// Canonical string form of a JSON-RPC id: strings pass through, numbers in
/// their shortest decimal form. Anything else never correlates.
pub(crate) fn json_id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_id_key(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id").and_then(json_id_key)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
