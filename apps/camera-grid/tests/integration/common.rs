use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};

use camera_grid::{
    display::StaticDisplay,
    engine::fake::FakeEngine,
    recovery::Fault,
    session::{Phase, SessionEventKind, SessionStatus},
    Config, Supervisor, SupervisorEvent,
};

/// Supervisor running on a scripted engine, with its event stream.
pub struct TestFixture {
    pub engine: FakeEngine,
    pub supervisor: Supervisor,
    pub events: broadcast::Receiver<SupervisorEvent>,
}

impl TestFixture {
    /// Build the fixture. Script `engine` before calling [`TestFixture::start`].
    pub fn new(config: &str) -> Self {
        super::init_test_environment();
        let config = Config::from_toml(config).expect("test configuration is valid");
        let engine = FakeEngine::new();
        let supervisor = Supervisor::new(
            &config,
            Arc::new(engine.clone()),
            Arc::new(StaticDisplay::default()),
        )
        .expect("supervisor builds");
        let events = supervisor.subscribe();
        Self {
            engine,
            supervisor,
            events,
        }
    }

    pub fn start(&mut self) {
        self.supervisor.start().expect("sessions start");
    }

    /// Block until the status of `stream` satisfies `predicate`.
    pub fn wait_for(
        &self,
        stream: &str,
        timeout: Duration,
        predicate: impl Fn(&SessionStatus) -> bool,
    ) -> SessionStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.supervisor.status(stream) {
                if predicate(&status) {
                    return status;
                }
                assert!(
                    Instant::now() < deadline,
                    "timed out waiting on {}: {:?}",
                    stream,
                    status
                );
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Every event received so far.
    pub fn drain(&mut self) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(missed)) => panic!("fixture missed {} events", missed),
                Err(_) => return events,
            }
        }
    }
}

pub fn backoff_delays(events: &[SupervisorEvent], stream: &str) -> Vec<Duration> {
    events
        .iter()
        .filter(|e| e.stream == stream)
        .filter_map(|e| match e.kind {
            SessionEventKind::BackoffScheduled { delay } => Some(delay),
            _ => None,
        })
        .collect()
}

pub fn faults(events: &[SupervisorEvent], stream: &str) -> Vec<Fault> {
    events
        .iter()
        .filter(|e| e.stream == stream)
        .filter_map(|e| match &e.kind {
            SessionEventKind::Fault(fault) => Some(fault.clone()),
            _ => None,
        })
        .collect()
}

pub fn phases(events: &[SupervisorEvent], stream: &str) -> Vec<Phase> {
    events
        .iter()
        .filter(|e| e.stream == stream)
        .filter_map(|e| match e.kind {
            SessionEventKind::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
