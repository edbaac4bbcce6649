use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownReceiver, ShutdownSender};

/// One shutdown notification fans out to every subscriber.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    Interrupt,
    Terminate,
}

#[must_use]
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel::<()>(SHUTDOWN_CHANNEL_CAPACITY)
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
async fn interrupt() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
}

/// Resolves on SIGTERM; pending forever where there is no such signal.
async fn terminate() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                return;
            }
            Err(err) => warn!("Failed to register SIGTERM handler: {}", err),
        }
    }
    std::future::pending::<()>().await;
}

/// Turns Ctrl+C or SIGTERM into one broadcast on `shutdown_tx`. The task
/// also exits when someone else broadcasts first.
pub fn setup_signal_shutdown_handler(shutdown_tx: &ShutdownSender) -> JoinHandle<()> {
    let shutdown_tx = shutdown_tx.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let reason = tokio::select! {
            _ = shutdown_rx.recv() => StopReason::Requested,
            () = interrupt() => StopReason::Interrupt,
            () = terminate() => StopReason::Terminate,
        };
        match reason {
            StopReason::Requested => debug!("Shutdown requested; signal handler exiting"),
            StopReason::Interrupt | StopReason::Terminate => {
                info!("{:?} received, shutting down", reason);
                if shutdown_tx.send(()).is_err() {
                    debug!("No shutdown subscribers left");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult, ValidationError};
    use std::future::Future;
    use std::time::Duration;

    const SHUTDOWN_HANDLER_TIMEOUT: Duration = Duration::from_secs(1);

    fn run_async_test<F>(future: F) -> AppResult<()>
    where
        F: Future<Output = AppResult<()>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| AppError::validation(format!("Failed to build runtime: {}", err)))?;
        runtime.block_on(future)
    }

    #[test]
    fn signal_handler_sees_shutdown_sent_right_after_setup() -> AppResult<()> {
        run_async_test(async {
            let (shutdown_tx, _) = shutdown_channel();
            let handle = setup_signal_shutdown_handler(&shutdown_tx);

            if shutdown_tx.send(()).is_err() {
                return Err(AppError::validation(ValidationError::from(
                    "Failed to send shutdown",
                )));
            }

            tokio::time::timeout(SHUTDOWN_HANDLER_TIMEOUT, handle)
                .await
                .map_err(|err| {
                    AppError::validation(format!("Timed out waiting for shutdown handler: {}", err))
                })?
                .map_err(|err| {
                    AppError::validation(format!("Shutdown task join error: {}", err))
                })?;
            Ok(())
        })
    }
}
