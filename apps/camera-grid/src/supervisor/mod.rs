//! Owns one session thread per enabled stream and coordinates shutdown.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::chain::ChainAssembler;
use crate::config::{Config, StreamDescriptor};
use crate::display::{presenter_for, DisplaySurface};
use crate::engine::MediaEngine;
use crate::session::{Phase, Session, SessionContext, SessionEvent, SessionStatus, StopSignal};
use crate::{CameraGridError, Result};

/// Everything the supervisor publishes about its sessions.
pub type SupervisorEvent = SessionEvent;

/// Events kept for a subscriber that falls behind. Older ones are dropped and
/// the subscriber is told how many it missed.
pub const EVENT_CAPACITY: usize = 1024;

struct SessionHandle {
    stream: String,
    stop: StopSignal,
    status: Arc<Mutex<SessionStatus>>,
    thread: Option<JoinHandle<SessionStatus>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub stream: String,
    pub phase: Phase,
    pub connect_attempts: u32,
    pub playing_cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub streams: Vec<StreamOutcome>,
    pub elapsed: Duration,
    /// Some session took longer than the configured shutdown timeout.
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn all_stopped(&self) -> bool {
        self.streams.iter().all(|s| s.phase == Phase::Stopped)
    }
}

pub struct Supervisor {
    ctx: Arc<SessionContext>,
    descriptors: Vec<StreamDescriptor>,
    display: Arc<dyn DisplaySurface>,
    shutdown_timeout: Duration,
    events: broadcast::Sender<SupervisorEvent>,
    sessions: Vec<SessionHandle>,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        display: Arc<dyn DisplaySurface>,
    ) -> Result<Self> {
        config.validate().map_err(CameraGridError::ConfigError)?;
        let descriptors = config.descriptors().map_err(CameraGridError::ConfigError)?;

        let ctx = SessionContext {
            engine,
            assembler: ChainAssembler::from_config(&config.decode),
            presenter: presenter_for(config.display.backend),
            sync: config.display.sync_policy(),
            backoff: config.recovery.policy(),
            poll_interval: config.poll_interval(),
            negotiation_timeout: config.recovery.negotiation_timeout(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            ctx: Arc::new(ctx),
            descriptors,
            display,
            shutdown_timeout: config.shutdown_timeout(),
            events,
            sessions: Vec::new(),
        })
    }

    /// Receive every event published from now on. Events published while
    /// nobody is subscribed are discarded.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Events published but not yet seen by every subscriber.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn descriptors(&self) -> &[StreamDescriptor] {
        &self.descriptors
    }

    /// Spawn a session thread for every enabled stream. Calling it again
    /// while sessions are running does nothing.
    pub fn start(&mut self) -> Result<()> {
        if !self.sessions.is_empty() {
            warn!("Supervisor already started");
            return Ok(());
        }

        for descriptor in &self.descriptors {
            if !descriptor.enabled {
                info!("Stream {} is disabled, not starting it", descriptor.name);
                continue;
            }

            let stop = StopSignal::new();
            let target = self.display.target(descriptor);
            let session = Session::new(
                descriptor.clone(),
                target,
                Arc::clone(&self.ctx),
                stop.clone(),
                self.events.clone(),
            );
            let status = session.status_handle();

            let thread = thread::Builder::new()
                .name(format!("session-{}", descriptor.name))
                .spawn(move || session.run())
                .map_err(|error| CameraGridError::SpawnError {
                    stream: descriptor.name.clone(),
                    error,
                })?;

            self.sessions.push(SessionHandle {
                stream: descriptor.name.clone(),
                stop,
                status,
                thread: Some(thread),
            });
        }

        info!(
            "Started {} of {} streams",
            self.sessions.len(),
            self.descriptors.len()
        );
        Ok(())
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.sessions
            .iter()
            .map(|handle| handle.status.lock().clone())
            .collect()
    }

    pub fn status(&self, stream: &str) -> Option<SessionStatus> {
        self.sessions
            .iter()
            .find(|handle| handle.stream == stream)
            .map(|handle| handle.status.lock().clone())
    }

    /// Stop every session and wait for all of their threads to exit.
    pub fn shutdown(&mut self) -> ShutdownReport {
        stop_sessions(std::mem::take(&mut self.sessions), self.shutdown_timeout)
    }

    /// Start every session, wait for `signal`, then shut down. Session threads
    /// are joined on the blocking pool so the runtime keeps serving other
    /// tasks meanwhile.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;

        let sessions = std::mem::take(&mut self.sessions);
        let timeout = self.shutdown_timeout;
        let report = tokio::task::spawn_blocking(move || stop_sessions(sessions, timeout)).await?;
        Ok(report)
    }
}

fn stop_sessions(sessions: Vec<SessionHandle>, shutdown_timeout: Duration) -> ShutdownReport {
    let started = Instant::now();
    info!(
        "Initiating shutdown of {} sessions with {:?} timeout",
        sessions.len(),
        shutdown_timeout
    );

    for handle in &sessions {
        handle.stop.stop();
    }

    let deadline = started + shutdown_timeout;
    let mut timed_out = false;
    while sessions
        .iter()
        .filter_map(|handle| handle.thread.as_ref())
        .any(|thread| !thread.is_finished())
    {
        if Instant::now() >= deadline {
            timed_out = true;
            warn!("Shutdown timeout exceeded, waiting for remaining sessions");
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let mut streams = Vec::with_capacity(sessions.len());
    for mut handle in sessions {
        let status = match handle.thread.take().map(JoinHandle::join) {
            Some(Ok(status)) => status,
            Some(Err(_)) => {
                error!("Session {} panicked", handle.stream);
                handle.status.lock().clone()
            }
            None => handle.status.lock().clone(),
        };
        streams.push(StreamOutcome {
            stream: handle.stream,
            phase: status.phase,
            connect_attempts: status.connect_attempts,
            playing_cycles: status.playing_cycles,
        });
    }

    let report = ShutdownReport {
        streams,
        elapsed: started.elapsed(),
        timed_out,
    };
    info!("Shutdown complete in {:?}", report.elapsed);
    report
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.sessions.is_empty() {
            self.shutdown();
        }
    }
}
