use std::future::Future;
use std::pin::Pin;

use cfg_if::cfg_if;
use futures::{future::Shared, FutureExt};
use tokio::select;
use tracing::{info, warn};

cfg_if! {
    if #[cfg(windows)] {
        use tokio::signal::windows::*;

        async fn raw_shutdown_signal() -> &'static str {
            let (Ok(mut ctrl_c), Ok(mut ctrl_close), Ok(mut ctrl_shutdown)) =
                (ctrl_c(), ctrl_close(), ctrl_shutdown())
            else {
                warn!("Could not attach console shutdown handlers, OS signals are ignored");
                return futures::future::pending().await;
            };
            select! {
                _ = ctrl_c.recv() => "ctrl-c",
                _ = ctrl_close.recv() => "ctrl-close",
                _ = ctrl_shutdown.recv() => "ctrl-shutdown",
            }
        }
    } else if #[cfg(unix)] {
        use tokio::signal::unix::*;

        async fn unix_shutdown_signal(signal_kind: SignalKind, name: &'static str) -> &'static str {
            match signal(signal_kind) {
                Ok(mut signal) => {
                    signal.recv().await;
                    name
                }
                Err(e) => {
                    warn!(error = %e, signal = name, "Could not listen to unix signal");
                    futures::future::pending().await
                }
            }
        }

        async fn raw_shutdown_signal() -> &'static str {
            select! {
                name = unix_shutdown_signal(SignalKind::interrupt(), "SIGINT") => name,
                name = unix_shutdown_signal(SignalKind::terminate(), "SIGTERM") => name,
                name = unix_shutdown_signal(SignalKind::hangup(), "SIGHUP") => name,
            }
        }
    } else {
        compile_error!("Your OS does not support shutdown signal ! Are you targeting wasm ?");
    }
}

/// Future resolving once the process is asked to stop. Cloning it is cheap.
pub type ShutdownSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;

pub fn shutdown_signal() -> ShutdownSignal {
    async {
        let signal = raw_shutdown_signal().await;
        info!(signal, "Shutdown signal received, stopping the queue");
    }
    .boxed()
    .shared()
}
