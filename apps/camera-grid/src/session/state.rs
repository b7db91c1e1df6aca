use std::fmt;
use std::time::Duration;

use crate::codec::CodecTag;
use crate::recovery::Fault;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Connecting,
    Negotiating,
    Assembling,
    Playing,
    Faulted,
    Backoff,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Negotiating => "negotiating",
            Phase::Assembling => "assembling",
            Phase::Playing => "playing",
            Phase::Faulted => "faulted",
            Phase::Backoff => "backoff",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub stream: String,
    pub phase: Phase,
    /// Delay the next fault will wait for.
    pub backoff: Duration,
    pub connect_attempts: u32,
    pub playing_cycles: u32,
    pub decoder: Option<String>,
    pub last_fault: Option<Fault>,
}

impl SessionStatus {
    pub fn new(stream: &str, backoff: Duration) -> Self {
        Self {
            stream: stream.to_string(),
            phase: Phase::Idle,
            backoff,
            connect_attempts: 0,
            playing_cycles: 0,
            decoder: None,
            last_fault: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub stream: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    PhaseChanged { from: Phase, to: Phase },
    ConnectAttempt { attempt: u32 },
    DecoderSelected { codec: CodecTag, decoder: String },
    Warning { element: String, message: String },
    Fault(Fault),
    BackoffScheduled { delay: Duration },
}
