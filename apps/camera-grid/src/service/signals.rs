use std::fmt;
use tokio::signal;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    Terminate,
    Interrupt,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalType::Terminate => f.write_str("SIGTERM"),
            SignalType::Interrupt => f.write_str("SIGINT"),
        }
    }
}

/// Wait for the first of SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn wait_for_shutdown() -> std::io::Result<SignalType> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                debug!("Received SIGINT");
                Ok(SignalType::Interrupt)
            }
            _ = sigterm.recv() => {
                debug!("Received SIGTERM");
                Ok(SignalType::Terminate)
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        debug!("Received SIGINT");
        Ok(SignalType::Interrupt)
    }
}
