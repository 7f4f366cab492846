use futures::future::{Either, select};
use std::io;
use std::pin::pin;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

// In-flight requests get this long to finish once we are asked to stop.
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Resolves on SIGTERM or SIGINT.
pub(crate) async fn termination() -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r?,
        _ = sigterm.recv() => (),
    }
    log::warn!("Termination signal received; shutting down");
    Ok(())
}

/// Run an [`axum_server`] serve future until it fails or `stop` resolves,
/// in which case the server is shut down gracefully through `handle`.
pub(crate) async fn run_until<F, T>(
    serve: F,
    handle: axum_server::Handle,
    stop: T,
) -> io::Result<()>
where
    F: Future<Output = io::Result<()>> + Send + 'static,
    T: Future<Output = io::Result<()>>,
{
    let task = tokio::spawn(serve);
    match select(pin!(stop), task).await {
        Either::Left((r, task)) => {
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
            r?;
            task.await??;
        }
        Either::Right((r, _)) => r??,
    }
    Ok(())
}
