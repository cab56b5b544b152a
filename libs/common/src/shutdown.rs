//! Shutdown signal handling
//!
//! Services park on [`wait_for_shutdown`] after spawning their workers and tear
//! down once it returns.

use std::fmt;
use tracing::{info, warn};

/// Signal that ended the wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Block until Ctrl+C, or SIGTERM on Unix
///
/// ```ignore
/// let handle = driver.spawn();
/// let signal = common::shutdown::wait_for_shutdown().await;
/// handle.stop().await;
/// ```
pub async fn wait_for_shutdown() -> ShutdownSignal {
    let signal = next_signal().await;
    info!("{} received, shutting down", signal);
    signal
}

#[cfg(unix)]
async fn next_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("SIGTERM handler unavailable ({}), Ctrl+C only", e);
            return interrupt().await;
        },
    };

    tokio::select! {
        signal = interrupt() => signal,
        _ = terminate.recv() => ShutdownSignal::Terminate,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> ShutdownSignal {
    interrupt().await
}

async fn interrupt() -> ShutdownSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler failed: {}", e);
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
