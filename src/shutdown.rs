use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Resolve with the name of the first termination signal received.
///
/// Falls back to Ctrl-C alone when the Unix handlers cannot be installed.
async fn termination_signal() -> &'static str {
    let handlers = signal(SignalKind::terminate()).and_then(|term| {
        signal(SignalKind::interrupt()).map(|int| (term, int))
    });

    match handlers {
        Ok((mut sigterm, mut sigint)) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        },
        Err(e) => {
            tracing::error!(error = %e, "Signal handlers unavailable, listening for Ctrl-C only");
            match tokio::signal::ctrl_c().await {
                Ok(()) => "Ctrl-C",
                // Nothing left to listen on: never resolve.
                Err(_) => std::future::pending().await,
            }
        }
    }
}

/// Token cancelled on SIGTERM or SIGINT.
///
/// The API server stops accepting, the connectivity monitor stops probing
/// and the orchestrator drains its worker pool once it fires.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let received = termination_signal().await;
        tracing::info!(signal = received, "Shutdown requested");
        trigger.cancel();
    });

    token
}
