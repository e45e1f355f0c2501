//! Process signal handling.
//!
//! SIGTERM and SIGINT start a graceful shutdown. On Unix, SIGUSR1 and SIGHUP
//! start the next sync pass immediately.

use modelsync_core::SyncDaemon;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wait for a shutdown request and return the signal's name.
pub async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = tokio::signal::ctrl_c() => "SIGINT",
            },
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl-C stops the daemon");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

/// Trigger a sync pass whenever SIGUSR1 or SIGHUP arrives.
#[cfg(unix)]
pub fn spawn_trigger_listener(daemon: Arc<SyncDaemon>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut usr1, mut hup) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(usr1), Ok(hup)) => (usr1, hup),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Cannot listen for trigger signals");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                received = usr1.recv() => match received { Some(()) => "SIGUSR1", None => break },
                received = hup.recv() => match received { Some(()) => "SIGHUP", None => break },
            };
            info!(signal = name, "Sync pass requested");
            daemon.trigger();
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_trigger_listener(_daemon: Arc<SyncDaemon>) -> Option<JoinHandle<()>> {
    None
}
