//! Tailnet node driven through the `tailscale` CLI.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Errors from the tailnet collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TailnetError {
    /// The tailnet listener is configured but no auth key was provided.
    #[error("tailnet auth key is required")]
    MissingAuthKey,

    /// The node state directory could not be created.
    #[error("failed to create tailnet state dir {dir}: {source}")]
    StateDir {
        /// Configured state directory.
        dir: String,
        #[source]
        source: std::io::Error,
    },

    /// A CLI invocation could not be started.
    #[error("failed to run `{command}`: {source}")]
    Command {
        /// The command line that failed.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A CLI invocation exited non-zero.
    #[error("`{command}` failed: {stderr}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Trimmed stderr from the child.
        stderr: String,
    },

    /// `status --json` carried no usable self address.
    #[error("tailnet status reports no self address")]
    NoSelfAddress,

    /// whois resolved no node identity for the peer.
    #[error("tailnet whois returned no node identity for {addr}")]
    NoIdentity {
        /// The remote address that was queried.
        addr: String,
    },

    /// CLI JSON output did not parse.
    #[error("failed to parse tailscale {what} output: {source}")]
    Parse {
        /// Which subcommand's output failed.
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Binding the listener on the tailnet address failed.
    #[error("failed to bind tailnet listener on {addr}: {source}")]
    Bind {
        /// The address:port that failed to bind.
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Identity of a tailnet peer, as reported by whois.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Numeric node id.
    pub node_id: u64,
    /// Stable node identifier; may be empty on very old control planes.
    pub stable_id: String,
    /// Peer DNS name, trailing dot stripped.
    pub dns_name: String,
}

/// The "who is the peer at this remote address" capability, separated from
/// [`Tailnet`] so the identity layer can be tested against a fake.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    /// Resolve the peer behind `remote_addr` (`ip` or `ip:port`).
    async fn whois(&self, remote_addr: &str) -> Result<Peer, TailnetError>;
}

/// Tailnet node configuration.
#[derive(Clone, Debug)]
pub struct TailnetConfig {
    /// Pre-auth key; non-empty enables the node.
    pub auth_key: String,
    /// Hostname advertised to the tailnet.
    pub hostname: String,
    /// Persistent node state (the only state this server keeps on disk).
    pub state_dir: PathBuf,
    /// Port the tailnet listener binds.
    pub port: u16,
    /// `tailscale` CLI binary.
    pub tailscale_bin: PathBuf,
    /// `tailscaled` daemon binary, used when no daemon is reachable.
    pub tailscaled_bin: PathBuf,
}

impl Default for TailnetConfig {
    fn default() -> Self {
        Self {
            auth_key: String::new(),
            hostname: "climate-server".into(),
            state_dir: PathBuf::from(".climate/tsnet"),
            port: 4500,
            tailscale_bin: PathBuf::from("tailscale"),
            tailscaled_bin: PathBuf::from("tailscaled"),
        }
    }
}

/// A running tailnet node.
///
/// Reuses an already-reachable tailscaled, or supervises a dedicated daemon
/// rooted at the state directory (in which case every CLI call targets its
/// control socket).
#[derive(Debug)]
pub struct Tailnet {
    bin: PathBuf,
    socket: Option<PathBuf>,
    port: u16,
    // Never held across an await; taken once on close.
    managed: Mutex<Option<Child>>,
}

impl Tailnet {
    /// Bring the node up: ensure a reachable daemon, then
    /// `tailscale up --authkey … --hostname …`.
    pub async fn start(config: TailnetConfig) -> Result<Self, TailnetError> {
        let auth_key = config.auth_key.trim().to_owned();
        if auth_key.is_empty() {
            return Err(TailnetError::MissingAuthKey);
        }
        let hostname = match config.hostname.trim() {
            "" => "climate-server".to_owned(),
            name => name.to_owned(),
        };
        std::fs::create_dir_all(&config.state_dir).map_err(|source| TailnetError::StateDir {
            dir: config.state_dir.display().to_string(),
            source,
        })?;

        let mut node = Self {
            bin: config.tailscale_bin,
            socket: None,
            port: config.port,
            managed: Mutex::new(None),
        };

        if node.run(&["status", "--json"]).await.is_err() {
            node.supervise_daemon(&config.tailscaled_bin, &config.state_dir)
                .await?;
        }

        let _ = node
            .run(&[
                "up",
                "--authkey",
                &auth_key,
                "--hostname",
                &hostname,
                "--timeout",
                "30s",
            ])
            .await?;
        info!(hostname, "tailnet node up");
        Ok(node)
    }

    /// Bind a TCP listener on the node's own tailnet address.
    ///
    /// Peer source addresses on this listener are tailnet addresses, so
    /// [`PeerResolver::whois`] identifies callers authoritatively.
    pub async fn bind(&self) -> Result<TcpListener, TailnetError> {
        let stdout = self.run(&["status", "--json"]).await?;
        let status = parse_status(&stdout)?;
        let ip = status.self_ip().ok_or(TailnetError::NoSelfAddress)?;
        let addr = SocketAddr::new(ip, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TailnetError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(%addr, "tailnet listener bound");
        Ok(listener)
    }

    /// Best-effort base URL clients on the tailnet can use.
    pub async fn connect_hint(&self) -> Option<String> {
        let stdout = self.run(&["status", "--json"]).await.ok()?;
        let status = parse_status(&stdout).ok()?;
        status.connect_hint(self.port)
    }

    /// Stop the supervised daemon, if this node spawned one.
    pub async fn close(&self) {
        let child = self.managed.lock().take();
        if let Some(mut child) = child {
            debug!("stopping supervised tailscaled");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    async fn supervise_daemon(
        &mut self,
        daemon_bin: &Path,
        state_dir: &Path,
    ) -> Result<(), TailnetError> {
        let socket = state_dir.join("tailscaled.sock");
        let command = format!(
            "{} --statedir {} --socket {}",
            daemon_bin.display(),
            state_dir.display(),
            socket.display()
        );

        let child = Command::new(daemon_bin)
            .arg("--statedir")
            .arg(state_dir)
            .arg("--socket")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TailnetError::Command {
                command: command.clone(),
                source,
            })?;
        info!(socket = %socket.display(), "supervising dedicated tailscaled");

        *self.managed.lock() = Some(child);
        self.socket = Some(socket.clone());

        for _ in 0..100 {
            if socket.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!("tailscaled control socket never appeared");
        Err(TailnetError::CommandFailed {
            command,
            stderr: "control socket never appeared".into(),
        })
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, TailnetError> {
        let mut cmd = Command::new(&self.bin);
        if let Some(socket) = &self.socket {
            let _ = cmd.arg("--socket").arg(socket);
        }
        let _ = cmd.args(args);

        let command = format!("{} {}", self.bin.display(), args.join(" "));
        let output = cmd
            .output()
            .await
            .map_err(|source| TailnetError::Command {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(TailnetError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl PeerResolver for Tailnet {
    async fn whois(&self, remote_addr: &str) -> Result<Peer, TailnetError> {
        let stdout = self.run(&["whois", "--json", remote_addr]).await?;
        parse_whois(&stdout, remote_addr)
    }
}

// ── CLI JSON parsing (pure, fixture-tested) ─────────────────────────────────

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(rename = "Self")]
    self_node: SelfNode,
}

#[derive(Debug, Deserialize)]
struct SelfNode {
    #[serde(rename = "DNSName")]
    dns_name: Option<String>,

    #[serde(rename = "TailscaleIPs")]
    tailscale_ips: Option<Vec<String>>,
}

impl StatusJson {
    fn self_ip(&self) -> Option<IpAddr> {
        let ips = self.self_node.tailscale_ips.as_deref()?;
        ips.iter()
            .find(|ip| ip.starts_with("100."))
            .or_else(|| ips.first())
            .and_then(|ip| ip.parse().ok())
    }

    fn connect_hint(&self, port: u16) -> Option<String> {
        if let Some(ip) = self.self_ip() {
            return Some(format!("http://{ip}:{port}"));
        }
        let name = self.self_node.dns_name.as_deref()?.trim_end_matches('.');
        if name.is_empty() {
            return None;
        }
        Some(format!("http://{name}:{port}"))
    }
}

#[derive(Debug, Deserialize)]
struct WhoisJson {
    #[serde(rename = "Node")]
    node: Option<WhoisNode>,
}

#[derive(Debug, Deserialize)]
struct WhoisNode {
    #[serde(rename = "ID")]
    id: Option<u64>,

    #[serde(rename = "StableID")]
    stable_id: Option<String>,

    #[serde(rename = "Name")]
    name: Option<String>,
}

fn parse_status(stdout: &[u8]) -> Result<StatusJson, TailnetError> {
    serde_json::from_slice(stdout).map_err(|source| TailnetError::Parse {
        what: "status",
        source,
    })
}

fn parse_whois(stdout: &[u8], addr: &str) -> Result<Peer, TailnetError> {
    let whois: WhoisJson = serde_json::from_slice(stdout).map_err(|source| TailnetError::Parse {
        what: "whois",
        source,
    })?;
    let node = whois.node.ok_or_else(|| TailnetError::NoIdentity {
        addr: addr.to_owned(),
    })?;
    Ok(Peer {
        node_id: node.id.unwrap_or(0),
        stable_id: node.stable_id.unwrap_or_default().trim().to_owned(),
        dns_name: node
            .name
            .unwrap_or_default()
            .trim_end_matches('.')
            .to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_FIXTURE: &[u8] = br#"{
        "Version": "1.80.0",
        "Self": {
            "DNSName": "climate-server.tailf00d.ts.net.",
            "TailscaleIPs": ["100.101.102.103", "fd7a:115c:a1e0::1"]
        }
    }"#;

    const WHOIS_FIXTURE: &[u8] = br#"{
        "Node": {
            "ID": 123456,
            "StableID": "nTESTSTABLE",
            "Name": "phone.tailf00d.ts.net."
        },
        "UserProfile": {"LoginName": "user@example.com"}
    }"#;

    #[test]
    fn status_prefers_the_cgnat_address() {
        let status = parse_status(STATUS_FIXTURE).unwrap();
        assert_eq!(
            status.self_ip(),
            Some("100.101.102.103".parse::<IpAddr>().unwrap())
        );
    }

    #[test]
    fn status_without_ips_falls_back_to_dns_name() {
        let status = parse_status(br#"{"Self":{"DNSName":"host.tail.ts.net."}}"#).unwrap();
        assert_eq!(status.self_ip(), None);
        assert_eq!(
            status.connect_hint(4500).as_deref(),
            Some("http://host.tail.ts.net:4500")
        );
    }

    #[test]
    fn connect_hint_uses_the_ip_when_available() {
        let status = parse_status(STATUS_FIXTURE).unwrap();
        assert_eq!(
            status.connect_hint(4500).as_deref(),
            Some("http://100.101.102.103:4500")
        );
    }

    #[test]
    fn connect_hint_empty_when_nothing_usable() {
        let status = parse_status(br#"{"Self":{}}"#).unwrap();
        assert_eq!(status.connect_hint(4500), None);
    }

    #[test]
    fn whois_parses_the_node_identity() {
        let peer = parse_whois(WHOIS_FIXTURE, "100.1.2.3:4500").unwrap();
        assert_eq!(peer.node_id, 123_456);
        assert_eq!(peer.stable_id, "nTESTSTABLE");
        assert_eq!(peer.dns_name, "phone.tailf00d.ts.net");
    }

    #[test]
    fn whois_without_node_is_no_identity() {
        let err = parse_whois(br#"{"UserProfile":{}}"#, "100.1.2.3").unwrap_err();
        assert!(matches!(err, TailnetError::NoIdentity { .. }));
    }

    #[test]
    fn whois_garbage_is_a_parse_error() {
        let err = parse_whois(b"not json", "100.1.2.3").unwrap_err();
        assert!(matches!(err, TailnetError::Parse { .. }));
    }

    #[test]
    fn status_garbage_is_a_parse_error() {
        assert!(matches!(
            parse_status(b"{").unwrap_err(),
            TailnetError::Parse { .. }
        ));
    }

    #[tokio::test]
    async fn start_requires_an_auth_key() {
        let err = Tailnet::start(TailnetConfig::default()).await.unwrap_err();
        assert!(matches!(err, TailnetError::MissingAuthKey));
    }

    #[tokio::test]
    async fn missing_cli_binary_is_a_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TailnetConfig {
            auth_key: "tskey-test".into(),
            state_dir: dir.path().join("tsnet"),
            tailscale_bin: dir.path().join("no-such-tailscale"),
            tailscaled_bin: dir.path().join("no-such-tailscaled"),
            ..TailnetConfig::default()
        };
        let err = Tailnet::start(config).await.unwrap_err();
        // The status probe fails, then supervising the daemon fails too.
        assert!(matches!(err, TailnetError::Command { .. }));
    }

    #[test]
    fn default_config_defaults() {
        let config = TailnetConfig::default();
        assert_eq!(config.hostname, "climate-server");
        assert_eq!(config.port, 4500);
        assert!(config.auth_key.is_empty());
    }
}
