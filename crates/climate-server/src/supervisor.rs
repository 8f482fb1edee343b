//! Dual-listener supervision and coordinated shutdown.
//!
//! Both the loopback and the tailnet listener serve the same router (modulo
//! the identity provider baked into their state). A run-time failure on
//! either server takes both down; a shutdown signal drains them with a
//! bounded grace period.

use std::net::SocketAddr;

use axum::Router;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long draining servers get after the shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Serve one listener until the token fires. Connect info is attached so
/// identity providers can see real peer addresses.
pub fn spawn_server(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    })
}

/// Serve every listener until shutdown or the first server failure, then
/// drain the rest within [`SHUTDOWN_GRACE`].
pub async fn run(
    listeners: Vec<(TcpListener, Router)>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut handles = Vec::with_capacity(listeners.len());
    for (listener, router) in listeners {
        let addr = listener.local_addr()?;
        info!(%addr, "listener serving");
        handles.push(spawn_server(listener, router, shutdown.clone()));
    }
    if handles.is_empty() {
        return Ok(());
    }

    let mut first_error = None;

    // The first server to finish either failed or observed the shutdown
    // token; stop the others in both cases.
    let (finished, _index, rest) = futures::future::select_all(handles).await;
    record(finished, &mut first_error);
    shutdown.cancel();

    for handle in rest {
        let abort = handle.abort_handle();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(finished) => record(finished, &mut first_error),
            Err(_) => {
                warn!(
                    grace_secs = SHUTDOWN_GRACE.as_secs(),
                    "listener did not drain within the grace period"
                );
                abort.abort();
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn record(
    finished: Result<std::io::Result<()>, tokio::task::JoinError>,
    first_error: &mut Option<std::io::Error>,
) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(error = %err, "http server failed");
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
        Err(join_err) => warn!(error = %join_err, "server task did not join cleanly"),
    }
}
