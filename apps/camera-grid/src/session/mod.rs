//! Stream session: the connect, negotiate, assemble, play and recover loop
//! of one stream, run on its own thread.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::chain::{self, Chain, ChainAssembler, LinkOutcome};
use crate::codec::{classify, Classification};
use crate::config::StreamDescriptor;
use crate::display::{DisplayTarget, Presenter, SyncPolicy};
use crate::engine::{
    BusEvent, Capabilities, EngineError, MediaEngine, MediaPipeline, OutputPoint, RunState,
};
use crate::recovery::{BackoffPolicy, Fault, FaultPolicy};

pub mod source;
pub mod state;
pub mod stop;

pub use source::{apply_source_options, open_source, SOURCE_FACTORY};
pub use state::{Phase, SessionEvent, SessionEventKind, SessionStatus};
pub use stop::StopSignal;

/// Collaborators and tuning shared, read-only, by every session.
pub struct SessionContext {
    pub engine: Arc<dyn MediaEngine>,
    pub assembler: ChainAssembler,
    pub presenter: Box<dyn Presenter>,
    pub sync: SyncPolicy,
    pub backoff: BackoffPolicy,
    pub poll_interval: Duration,
    pub negotiation_timeout: Duration,
}

pub struct Session {
    descriptor: StreamDescriptor,
    target: DisplayTarget,
    ctx: Arc<SessionContext>,
    stop: StopSignal,
    events: broadcast::Sender<SessionEvent>,
    status: Arc<Mutex<SessionStatus>>,
    policy: FaultPolicy,
    phase: Phase,
    pipeline: Option<Box<dyn MediaPipeline>>,
    chain: Option<Chain>,
    linked: bool,
    connect_attempts: u32,
}

impl Session {
    pub fn new(
        descriptor: StreamDescriptor,
        target: DisplayTarget,
        ctx: Arc<SessionContext>,
        stop: StopSignal,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let policy = FaultPolicy::new(ctx.backoff);
        let status = SessionStatus::new(&descriptor.name, policy.current_backoff());
        Self {
            descriptor,
            target,
            ctx,
            stop,
            events,
            status: Arc::new(Mutex::new(status)),
            policy,
            phase: Phase::Idle,
            pipeline: None,
            chain: None,
            linked: false,
            connect_attempts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Live status, updated by the session as it runs.
    pub fn status_handle(&self) -> Arc<Mutex<SessionStatus>> {
        Arc::clone(&self.status)
    }

    /// Run until the stop signal is raised. Faults never end the loop.
    pub fn run(mut self) -> SessionStatus {
        let span = info_span!("session", stream = %self.descriptor.name);
        let _enter = span.enter();
        info!(uri = %self.descriptor.source.location, "Session started");

        while !self.stop.is_stopped() {
            let fault = match self.attempt() {
                Ok(()) => break,
                Err(fault) => fault,
            };

            warn!("{}", fault);
            self.transition(Phase::Faulted);
            self.teardown();

            let delay = self.policy.on_fault(&fault);
            let backoff = self.policy.current_backoff();
            self.update_status(|status| {
                status.last_fault = Some(fault.clone());
                status.backoff = backoff;
            });
            self.emit(SessionEventKind::Fault(fault));

            self.transition(Phase::Backoff);
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            self.emit(SessionEventKind::BackoffScheduled { delay });
            if self.stop.wait_timeout(delay) {
                break;
            }
        }

        self.teardown();
        self.transition(Phase::Stopped);
        info!("Session stopped");
        self.status.lock().clone()
    }

    /// One connection attempt. Returns `Ok` only when a stop was requested.
    fn attempt(&mut self) -> Result<(), Fault> {
        self.transition(Phase::Connecting);
        self.connect()?;
        self.transition(Phase::Negotiating);

        let deadline = Instant::now() + self.ctx.negotiation_timeout;
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            if self.phase != Phase::Playing && Instant::now() >= deadline {
                return Err(Fault::NegotiationTimeout(self.ctx.negotiation_timeout));
            }

            let poll_interval = self.ctx.poll_interval;
            let event = self.pipeline()?.next_event(poll_interval);
            if let Some(event) = event {
                self.handle_event(event)?;
            }
        }
    }

    fn pipeline(&mut self) -> Result<&mut (dyn MediaPipeline + 'static), Fault> {
        self.pipeline
            .as_deref_mut()
            .ok_or(Fault::Connection(EngineError::TornDown))
    }

    fn connect(&mut self) -> Result<(), Fault> {
        self.connect_attempts += 1;
        let attempt = self.connect_attempts;
        self.update_status(|status| status.connect_attempts = attempt);
        self.emit(SessionEventKind::ConnectAttempt { attempt });
        info!(attempt, transport = %self.descriptor.source.transport, "Connecting");

        let pipeline = self
            .ctx
            .engine
            .create_pipeline(&self.descriptor.name)
            .map_err(Fault::Connection)?;
        self.pipeline = Some(pipeline);

        let source_name = format!("{}-src", self.descriptor.name);
        let options = self.descriptor.source.clone();
        let source =
            open_source(self.pipeline()?, &source_name, &options).map_err(Fault::Connection)?;
        debug!("Source {} started", source);
        Ok(())
    }

    fn handle_event(&mut self, event: BusEvent) -> Result<(), Fault> {
        match event {
            BusEvent::OutputAnnounced { point, caps } => self.on_output(point, caps),
            BusEvent::StateChanged { old, current } => {
                debug!("Pipeline state changed from {} to {}", old, current);
                if current == RunState::Playing && self.linked {
                    self.enter_playing();
                }
                Ok(())
            }
            BusEvent::Warning {
                source,
                message,
                debug: details,
            } => {
                warn!(
                    "Warning from {}: {} ({})",
                    source,
                    message,
                    details.as_deref().unwrap_or("no details")
                );
                self.emit(SessionEventKind::Warning {
                    element: source,
                    message,
                });
                Ok(())
            }
            BusEvent::Error {
                source,
                message,
                debug: details,
            } => {
                debug!("Error details: {}", details.as_deref().unwrap_or("none"));
                if self.phase == Phase::Playing {
                    Err(Fault::Runtime {
                        element: source,
                        message,
                    })
                } else {
                    Err(Fault::ConnectionLost {
                        element: source,
                        message,
                    })
                }
            }
            BusEvent::Eos => Err(Fault::EndOfStream),
        }
    }

    fn on_output(&mut self, point: OutputPoint, caps: Capabilities) -> Result<(), Fault> {
        let codec = match classify(&caps) {
            Classification::Supported(codec) => codec,
            Classification::Ignored(reason) => {
                debug!("Ignoring output {}: {}", point.name, reason);
                self.pipeline()?.release_output(&point);
                return Ok(());
            }
            Classification::Unsupported(encoding) => {
                warn!(
                    "Ignoring output {} with unsupported encoding '{}'",
                    point.name, encoding
                );
                self.pipeline()?.release_output(&point);
                return Ok(());
            }
        };

        if self.chain.is_none() {
            info!(codec = %codec, output = %point.name, "Video announced");
            self.transition(Phase::Assembling);

            let ctx = Arc::clone(&self.ctx);
            let target = self.target;
            let chain = ctx.assembler.assemble(
                self.pipeline()?,
                codec,
                ctx.presenter.as_ref(),
                &ctx.sync,
                &target,
            )?;

            let decoder = chain.decoder().unwrap_or_default().to_string();
            self.update_status(|status| status.decoder = Some(decoder.clone()));
            self.emit(SessionEventKind::DecoderSelected { codec, decoder });
            self.chain = Some(chain);
        }

        let (Some(pipeline), Some(chain)) = (self.pipeline.as_deref_mut(), self.chain.as_ref())
        else {
            return Err(Fault::Connection(EngineError::TornDown));
        };
        match chain::link_output(pipeline, chain, &point)? {
            LinkOutcome::Linked => {
                debug!("Linked {} to the chain input", point.name);
                self.linked = true;
                if pipeline.current_state() == RunState::Playing {
                    self.enter_playing();
                }
            }
            LinkOutcome::AlreadyLinked => pipeline.release_output(&point),
        }
        Ok(())
    }

    fn enter_playing(&mut self) {
        if self.phase == Phase::Playing {
            return;
        }
        self.transition(Phase::Playing);
        self.policy.on_playing();
        let backoff = self.policy.current_backoff();
        self.update_status(|status| {
            status.playing_cycles += 1;
            status.backoff = backoff;
        });
        info!("Stream playing");
    }

    /// Release the pipeline and everything built in it. A no-op when nothing
    /// has been built yet.
    pub fn teardown(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            debug!("Tearing down pipeline {}", pipeline.name());
            pipeline.teardown();
        }
        self.chain = None;
        self.linked = false;
    }

    fn transition(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        let from = self.phase;
        self.phase = to;
        debug!("Phase {} -> {}", from, to);
        self.update_status(|status| status.phase = to);
        self.emit(SessionEventKind::PhaseChanged { from, to });
    }

    fn update_status(&self, f: impl FnOnce(&mut SessionStatus)) {
        f(&mut self.status.lock());
    }

    fn emit(&self, kind: SessionEventKind) {
        // Dropped when nobody subscribed.
        let _ = self.events.send(SessionEvent {
            stream: self.descriptor.name.clone(),
            kind,
        });
    }
}
