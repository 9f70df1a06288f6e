//! Process shutdown signals.

use tokio::signal;
use tracing::info;

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Interrupt,
    Terminate,
}

/// Ctrl+C plus, on unix, SIGTERM.
///
/// The SIGTERM handler is registered by [`ShutdownSignal::install`]; a
/// SIGTERM that arrives before [`ShutdownSignal::wait`] is polled is buffered.
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: signal::unix::signal(signal::unix::SignalKind::terminate())?,
        })
    }

    /// Resolve on the first shutdown signal.
    pub async fn wait(&mut self) -> std::io::Result<ShutdownKind> {
        #[cfg(unix)]
        let terminate = self.terminate.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        let kind = tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                ShutdownKind::Interrupt
            }
            _ = terminate => ShutdownKind::Terminate,
        };
        info!(signal = ?kind, "Shutdown signal received, finishing in-flight messages");
        Ok(kind)
    }
}
