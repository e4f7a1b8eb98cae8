//! Process signals that end the server.
//!
//! `axum::serve` stops accepting connections once [`ShutdownSignal::recv`]
//! resolves; `main` then stops the usage pipeline so buffered reports are
//! flushed before exit.

use std::fmt;
use std::io;
use tokio::signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Wait for the first SIGINT or SIGTERM.
    ///
    /// Fails only when a handler cannot be installed.
    pub async fn recv() -> io::Result<Self> {
        #[cfg(unix)]
        {
            let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            tokio::select! {
                res = signal::ctrl_c() => res.map(|()| Self::Interrupt),
                _ = terminate.recv() => Ok(Self::Terminate),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.map(|()| Self::Interrupt)
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_signal() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
