//! Fault taxonomy and the retry policy applied to every session fault.

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::chain::AssemblyError;
use crate::engine::EngineError;

pub mod backoff;

pub use backoff::{Backoff, BackoffPolicy};

/// Why a session left its current connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The source could not be opened, or failed before any media was
    /// negotiated.
    #[error("Connection failure: {0}")]
    Connection(EngineError),

    #[error("Connection failure reported by {element}: {message}")]
    ConnectionLost { element: String, message: String },

    #[error("Chain assembly failure: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("Runtime error from {element}: {message}")]
    Runtime { element: String, message: String },

    #[error("End of stream")]
    EndOfStream,

    #[error("No playable video negotiated within {0:?}")]
    NegotiationTimeout(Duration),
}

impl Fault {
    /// Every fault is retried until the session is stopped.
    pub fn is_recoverable(&self) -> bool {
        true
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Fault::Connection(_) | Fault::ConnectionLost { .. } | Fault::NegotiationTimeout(_) => {
                "connection"
            }
            Fault::Assembly(_) => "assembly",
            Fault::Runtime { .. } => "runtime",
            Fault::EndOfStream => "eos",
        }
    }
}

/// Per-session retry decisions.
#[derive(Debug, Clone)]
pub struct FaultPolicy {
    backoff: Backoff,
}

impl FaultPolicy {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
        }
    }

    /// Delay to wait before reconnecting after `fault`.
    pub fn on_fault(&mut self, fault: &Fault) -> Duration {
        let delay = self.backoff.next_delay();
        debug!(
            kind = fault.kind(),
            recoverable = fault.is_recoverable(),
            attempt = self.backoff.get_attempt(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        delay
    }

    /// The session reached playing: start over from the base delay.
    pub fn on_playing(&mut self) {
        self.backoff.reset();
    }

    /// Delay the next fault will wait for.
    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }
}
