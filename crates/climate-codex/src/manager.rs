//! Session manager — lazy spawn, admission cap, idle sweep.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use climate_events::{EventHub, DEFAULT_CAPACITY};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::CodexError;
use crate::session::Session;

/// Live codex sessions (gauge).
pub const SESSIONS_RUNNING: &str = "codex_sessions_running";

/// How often the idle sweeper scans entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Manager construction parameters.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Path to the codex binary.
    pub codex_bin: PathBuf,
    /// Concurrency cap over live child processes.
    pub max_sessions: usize,
    /// Sessions idle longer than this are killed by the sweeper.
    pub idle_ttl: Duration,
    /// Replay ring capacity for each client's hub.
    pub ring_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            codex_bin: PathBuf::from("codex"),
            max_sessions: 16,
            idle_ttl: Duration::from_secs(600),
            ring_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Read-only description of a client's session state; the first payload on
/// every new event stream.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Stable client key.
    pub client_key: String,
    /// Whether a live child exists right now.
    pub codex_running: bool,
    /// Last stdin write, omitted when the client never had activity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    /// Greatest event id assigned on the client's hub.
    pub last_event_id: u64,
    /// Whether a child was ever spawned for this client.
    pub has_ever_run: bool,
}

struct EntryState {
    session: Option<Arc<Session>>,
    has_ever_run: bool,
}

struct ClientEntry {
    hub: Arc<EventHub>,
    state: tokio::sync::Mutex<EntryState>,
}

impl ClientEntry {
    fn new(ring_capacity: usize) -> Self {
        Self {
            hub: Arc::new(EventHub::new(ring_capacity)),
            state: tokio::sync::Mutex::new(EntryState {
                session: None,
                has_ever_run: false,
            }),
        }
    }
}

/// Maps client keys to `(hub, session)` entries.
///
/// The entry map is sharded and never held across spawn or I/O; each entry's
/// own lock serializes `ensure` against the idle sweeper. Hubs live for the
/// process lifetime — only sessions are evicted.
pub struct SessionManager {
    config: ManagerConfig,
    entries: DashMap<String, Arc<ClientEntry>>,
    running: Arc<AtomicUsize>,
}

impl SessionManager {
    /// Create a manager. No child is spawned until the first [`ensure`].
    ///
    /// [`ensure`]: SessionManager::ensure
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return a live session for the key, spawning one if necessary.
    #[instrument(skip(self), fields(client = client_key))]
    pub async fn ensure(&self, client_key: &str) -> Result<Arc<Session>, CodexError> {
        let key = client_key.trim();
        if key.is_empty() {
            return Err(CodexError::MissingKey);
        }

        let entry = self.get_or_create(key);
        let mut state = entry.state.lock().await;

        if let Some(session) = &state.session {
            if !session.dead() {
                return Ok(session.clone());
            }
        }

        self.acquire_slot()?;
        let running = Arc::clone(&self.running);
        let on_dead = move || {
            let live = running.fetch_sub(1, Ordering::SeqCst) - 1;
            metrics::gauge!(SESSIONS_RUNNING).set(live as f64);
        };

        let session = match Session::spawn(&self.config.codex_bin, entry.hub.clone(), on_dead) {
            Ok(session) => session,
            Err(err) => {
                let _ = self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        };

        metrics::gauge!(SESSIONS_RUNNING).set(self.running.load(Ordering::SeqCst) as f64);
        state.session = Some(session.clone());
        state.has_ever_run = true;
        debug!(client = key, pid = session.pid(), "session spawned");
        Ok(session)
    }

    /// The client's hub, creating the entry if needed. Never spawns a child,
    /// so stream subscribers can attach before any request exists.
    pub fn events(&self, client_key: &str) -> Arc<EventHub> {
        let key = client_key.trim();
        if key.is_empty() {
            // Caller validates identity first; hand back a detached hub
            // rather than panicking in handler code.
            return Arc::new(EventHub::new(256));
        }
        self.get_or_create(key).hub.clone()
    }

    /// Snapshot of the client's current state.
    pub async fn snapshot(&self, client_key: &str) -> SessionSnapshot {
        let key = client_key.trim();
        if key.is_empty() {
            return SessionSnapshot::default();
        }

        let Some(entry) = self.entries.get(key).map(|e| e.value().clone()) else {
            return SessionSnapshot {
                client_key: key.to_owned(),
                ..SessionSnapshot::default()
            };
        };

        let state = entry.state.lock().await;
        let session = state.session.as_ref();
        SessionSnapshot {
            client_key: key.to_owned(),
            codex_running: session.is_some_and(|s| !s.dead()),
            last_activity: session.and_then(|s| s.last_activity()),
            last_event_id: entry.hub.high_water_mark(),
            has_ever_run: state.has_ever_run,
        }
    }

    /// Number of live sessions.
    pub fn running_sessions(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the background idle sweeper. It exits when `shutdown` fires and
    /// never terminates the process on its own.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => manager.sweep_idle().await,
                    () = shutdown.cancelled() => {
                        debug!("idle sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Kill sessions whose last activity is older than the idle TTL. The hub
    /// is left intact so reconnecting subscribers still see recent history.
    pub async fn sweep_idle(&self) {
        let ttl = self.config.idle_ttl;
        if ttl.is_zero() {
            return;
        }

        let entries: Vec<(String, Arc<ClientEntry>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, entry) in entries {
            let mut state = entry.state.lock().await;
            let Some(session) = state.session.as_ref() else {
                continue;
            };
            if session.dead() {
                continue;
            }
            match session.idle_for() {
                Some(idle) if idle >= ttl => {
                    info!(client = %key, idle_secs = idle.as_secs(), "killing idle session");
                    session.kill();
                    state.session = None;
                }
                _ => {}
            }
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<ClientEntry> {
        self.entries
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(ClientEntry::new(self.config.ring_capacity)))
            .clone()
    }

    fn acquire_slot(&self) -> Result<(), CodexError> {
        loop {
            let current = self.running.load(Ordering::SeqCst);
            if current >= self.config.max_sessions {
                warn!(cap = self.config.max_sessions, "admission cap reached");
                return Err(CodexError::MaxSessions);
            }
            if self
                .running
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bin: &std::path::Path) -> ManagerConfig {
        ManagerConfig {
            codex_bin: bin.to_path_buf(),
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn ensure_rejects_empty_key() {
        let manager = SessionManager::new(ManagerConfig::default());
        let err = manager.ensure("").await.unwrap_err();
        assert!(matches!(err, CodexError::MissingKey));
        let err = manager.ensure("   ").await.unwrap_err();
        assert!(matches!(err, CodexError::MissingKey));
    }

    #[tokio::test]
    async fn events_does_not_spawn() {
        let manager = SessionManager::new(ManagerConfig::default());
        let hub = manager.events("client-a");
        assert_eq!(hub.high_water_mark(), 0);
        assert_eq!(manager.running_sessions(), 0);
    }

    #[tokio::test]
    async fn events_returns_the_same_hub_per_key() {
        let manager = SessionManager::new(ManagerConfig::default());
        let a = manager.events("client-a");
        let b = manager.events("client-a");
        assert!(Arc::ptr_eq(&a, &b));
        let other = manager.events("client-b");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn events_with_empty_key_is_detached() {
        let manager = SessionManager::new(ManagerConfig::default());
        let a = manager.events("");
        let b = manager.events("");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(manager.running_sessions(), 0);
    }

    #[tokio::test]
    async fn snapshot_for_unknown_client() {
        let manager = SessionManager::new(ManagerConfig::default());
        let snap = manager.snapshot("nobody").await;
        assert_eq!(snap.client_key, "nobody");
        assert!(!snap.codex_running);
        assert!(!snap.has_ever_run);
        assert_eq!(snap.last_event_id, 0);
        assert!(snap.last_activity.is_none());
    }

    #[tokio::test]
    async fn snapshot_serializes_camel_case() {
        let snap = SessionSnapshot {
            client_key: "c".into(),
            codex_running: true,
            last_activity: None,
            last_event_id: 7,
            has_ever_run: true,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["clientKey"], "c");
        assert_eq!(json["codexRunning"], true);
        assert_eq!(json["lastEventId"], 7);
        assert_eq!(json["hasEverRun"], true);
        assert!(json.get("lastActivity").is_none());
    }

    #[tokio::test]
    async fn spawn_failure_releases_the_slot() {
        let manager = SessionManager::new(config(std::path::Path::new("/nonexistent/codex")));
        let err = manager.ensure("client-a").await.unwrap_err();
        assert!(matches!(err, CodexError::Spawn { .. }));
        assert_eq!(manager.running_sessions(), 0);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const ECHO_STUB: &str = "#!/bin/sh\n[ \"$1\" = \"app-server\" ] || exit 2\nexec cat\n";

        fn stub_manager(overrides: impl FnOnce(&mut ManagerConfig)) -> (tempfile::TempDir, Arc<SessionManager>) {
            let dir = tempfile::tempdir().unwrap();
            let bin = dir.path().join("codex");
            std::fs::write(&bin, ECHO_STUB).unwrap();
            std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
            let mut cfg = config(&bin);
            overrides(&mut cfg);
            (dir, Arc::new(SessionManager::new(cfg)))
        }

        #[tokio::test]
        async fn ensure_reuses_the_live_session() {
            let (_dir, manager) = stub_manager(|_| {});
            let first = manager.ensure("client-a").await.unwrap();
            let second = manager.ensure("client-a").await.unwrap();
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(manager.running_sessions(), 1);
            first.kill();
        }

        #[tokio::test]
        async fn distinct_clients_get_distinct_children() {
            let (_dir, manager) = stub_manager(|_| {});
            let a = manager.ensure("client-a").await.unwrap();
            let b = manager.ensure("client-b").await.unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
            assert_ne!(a.pid(), b.pid());
            assert_eq!(manager.running_sessions(), 2);
            a.kill();
            b.kill();
        }

        #[tokio::test]
        async fn cap_is_enforced() {
            let (_dir, manager) = stub_manager(|cfg| cfg.max_sessions = 1);
            let a = manager.ensure("client-a").await.unwrap();
            let err = manager.ensure("client-b").await.unwrap_err();
            assert!(matches!(err, CodexError::MaxSessions));
            assert_eq!(manager.running_sessions(), 1);
            a.kill();
        }

        #[tokio::test]
        async fn dead_session_is_replaced_and_slot_reused() {
            let (_dir, manager) = stub_manager(|cfg| cfg.max_sessions = 1);
            let first = manager.ensure("client-a").await.unwrap();
            first.kill();
            // The on-dead callback released the slot synchronously.
            assert_eq!(manager.running_sessions(), 0);

            let second = manager.ensure("client-a").await.unwrap();
            assert!(!Arc::ptr_eq(&first, &second));
            assert_ne!(first.pid(), second.pid());
            second.kill();
        }

        #[tokio::test]
        async fn snapshot_reflects_a_running_session() {
            let (_dir, manager) = stub_manager(|_| {});
            let session = manager.ensure("client-a").await.unwrap();
            let snap = manager.snapshot("client-a").await;
            assert!(snap.codex_running);
            assert!(snap.has_ever_run);
            assert!(snap.last_activity.is_some());
            session.kill();

            let snap = manager.snapshot("client-a").await;
            assert!(!snap.codex_running);
            assert!(snap.has_ever_run, "has_ever_run survives death");
        }

        #[tokio::test]
        async fn concurrent_ensure_spawns_once() {
            let (_dir, manager) = stub_manager(|_| {});
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    tokio::spawn(async move { manager.ensure("client-a").await })
                })
                .collect();
            for task in tasks {
                let _ = task.await.unwrap().unwrap();
            }
            assert_eq!(manager.running_sessions(), 1);
            manager.ensure("client-a").await.unwrap().kill();
        }

        #[tokio::test]
        async fn idle_sweep_kills_but_keeps_the_hub() {
            let (_dir, manager) = stub_manager(|cfg| cfg.idle_ttl = Duration::from_millis(10));
            let session = manager.ensure("client-a").await.unwrap();
            let hub = manager.events("client-a");
            let _ = hub.publish("test", "before sweep");

            tokio::time::sleep(Duration::from_millis(30)).await;
            manager.sweep_idle().await;

            assert!(session.dead());
            assert_eq!(manager.running_sessions(), 0);
            let snap = manager.snapshot("client-a").await;
            assert!(!snap.codex_running);
            assert_eq!(snap.last_event_id, 1, "hub history survives the sweep");
        }

        #[tokio::test]
        async fn fresh_sessions_survive_the_sweep() {
            let (_dir, manager) = stub_manager(|cfg| cfg.idle_ttl = Duration::from_secs(600));
            let session = manager.ensure("client-a").await.unwrap();
            manager.sweep_idle().await;
            assert!(!session.dead());
            assert_eq!(manager.running_sessions(), 1);
            session.kill();
        }

        #[tokio::test]
        async fn sweeper_task_exits_on_shutdown() {
            let (_dir, manager) = stub_manager(|_| {});
            let token = CancellationToken::new();
            let handle = manager.spawn_idle_sweeper(token.clone());
            token.cancel();
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("sweeper did not stop")
                .unwrap();
        }
    }
}
