//! Scripted in-process media engine.
//!
//! Every pipeline created by a [`FakeEngine`] plays back the next scripted
//! [`Attempt`] for its stream (pipelines are named after their stream) and
//! records each collaborator call in a per-stream [`StreamJournal`]. The
//! session and supervisor test suites run entirely on top of it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{
    BusEvent, Capabilities, EngineError, MediaEngine, MediaPipeline, OutputPoint, PropertyValue,
    RunState, StageId,
};
use crate::display::Region;

/// Behaviour of the remote end for one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    /// Creating the pipeline fails outright.
    Refused,
    /// The source reports an error right after being started.
    Unreachable,
    /// The handshake never completes: no announcement, no error.
    Silent,
    /// The source announces one output per entry, in order. Once the first
    /// output has been linked the pipeline goes to playing and `then` runs.
    Announce {
        outputs: Vec<Capabilities>,
        then: AfterLink,
    },
}

impl Attempt {
    /// A single video track that keeps playing.
    pub fn video(encoding_name: &str) -> Self {
        Attempt::Announce {
            outputs: vec![Capabilities::rtp("video", encoding_name)],
            then: AfterLink::Hold,
        }
    }

    /// A single video track that plays for `after` and then errors out.
    pub fn video_then_error(encoding_name: &str, after: Duration) -> Self {
        Attempt::Announce {
            outputs: vec![Capabilities::rtp("video", encoding_name)],
            then: AfterLink::ErrorAfter(after),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLink {
    Hold,
    ErrorAfter(Duration),
    EosAfter(Duration),
    WarnThenHold,
}

/// Everything one stream's pipelines did, across all its connection attempts.
#[derive(Debug, Clone, Default)]
pub struct StreamJournal {
    pub connects: usize,
    pub connect_times: Vec<Instant>,
    /// Factory names, in creation order.
    pub stages: Vec<String>,
    /// `upstream -> downstream` stage names for static links.
    pub links: Vec<(String, String)>,
    /// `output point -> downstream` for announced outputs.
    pub output_links: Vec<(String, String)>,
    pub released_outputs: Vec<String>,
    pub teardowns: usize,
    pub synced: Vec<String>,
    pub properties: Vec<(String, String, PropertyValue)>,
    pub regions: Vec<(String, Region)>,
    pub handles: Vec<(String, u64)>,
}

impl StreamJournal {
    /// Last value set for `property` on stages created from `factory`.
    pub fn property(&self, stage_prefix: &str, property: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .rev()
            .find(|(stage, name, _)| stage.starts_with(stage_prefix) && name == property)
            .map(|(_, _, value)| value)
    }
}

#[derive(Default)]
struct Shared {
    unavailable: HashSet<String>,
    scripts: HashMap<String, VecDeque<Attempt>>,
    fallbacks: HashMap<String, Attempt>,
    journals: HashMap<String, StreamJournal>,
}

impl Shared {
    fn next_attempt(&mut self, stream: &str) -> Attempt {
        if let Some(attempt) = self.scripts.get_mut(stream).and_then(VecDeque::pop_front) {
            return attempt;
        }
        self.fallbacks
            .get(stream)
            .cloned()
            .unwrap_or_else(|| Attempt::video("H264"))
    }

    fn journal(&mut self, stream: &str) -> &mut StreamJournal {
        self.journals.entry(stream.to_string()).or_default()
    }
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    shared: Arc<Mutex<Shared>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `factory` impossible to instantiate.
    pub fn mark_unavailable(&self, factory: &str) {
        self.shared.lock().unavailable.insert(factory.to_string());
    }

    /// Queue attempts for `stream`, consumed one per connection.
    pub fn script(&self, stream: &str, attempts: impl IntoIterator<Item = Attempt>) {
        self.shared
            .lock()
            .scripts
            .entry(stream.to_string())
            .or_default()
            .extend(attempts);
    }

    /// Attempt used once the script of `stream` is exhausted. Defaults to a
    /// healthy H.264 stream.
    pub fn set_fallback(&self, stream: &str, attempt: Attempt) {
        self.shared
            .lock()
            .fallbacks
            .insert(stream.to_string(), attempt);
    }

    pub fn journal(&self, stream: &str) -> StreamJournal {
        self.shared
            .lock()
            .journals
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }
}

impl MediaEngine for FakeEngine {
    fn create_pipeline(&self, name: &str) -> Result<Box<dyn MediaPipeline>, EngineError> {
        let mut shared = self.shared.lock();
        let attempt = shared.next_attempt(name);
        let journal = shared.journal(name);
        journal.connects += 1;
        journal.connect_times.push(Instant::now());

        if attempt == Attempt::Refused {
            return Err(EngineError::PipelineCreation {
                name: name.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(Box::new(FakePipeline {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
            attempt,
            stages: Vec::new(),
            watched: None,
            announced: Vec::new(),
            queue: Vec::new(),
            state: RunState::Null,
            torn_down: false,
        }))
    }

    fn has_factory(&self, factory: &str) -> bool {
        !self.shared.lock().unavailable.contains(factory)
    }
}

struct FakeStage {
    name: String,
    input_linked: bool,
}

struct FakePipeline {
    name: String,
    shared: Arc<Mutex<Shared>>,
    attempt: Attempt,
    stages: Vec<FakeStage>,
    watched: Option<StageId>,
    announced: Vec<OutputPoint>,
    queue: Vec<(Instant, BusEvent)>,
    state: RunState,
    torn_down: bool,
}

impl FakePipeline {
    fn record(&self, f: impl FnOnce(&mut StreamJournal)) {
        let mut shared = self.shared.lock();
        f(shared.journal(&self.name));
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.torn_down {
            Err(EngineError::TornDown)
        } else {
            Ok(())
        }
    }

    fn stage(&self, id: StageId) -> Result<&FakeStage, EngineError> {
        self.stages.get(id.0).ok_or(EngineError::UnknownStage(id))
    }

    fn push_event(&mut self, delay: Duration, event: BusEvent) {
        self.queue.push((Instant::now() + delay, event));
    }

    fn change_state(&mut self, current: RunState) {
        let old = self.state;
        self.state = current;
        self.push_event(Duration::ZERO, BusEvent::StateChanged { old, current });
    }

    fn source_name(&self) -> String {
        self.watched
            .and_then(|id| self.stage_name(id))
            .unwrap_or_else(|| self.name.clone())
    }

    fn start(&mut self) {
        self.change_state(RunState::Ready);
        self.change_state(RunState::Paused);

        match self.attempt.clone() {
            Attempt::Refused | Attempt::Silent => {}
            Attempt::Unreachable => {
                let source = self.source_name();
                self.push_event(
                    Duration::ZERO,
                    BusEvent::Error {
                        source,
                        message: "Could not open resource for reading and writing.".to_string(),
                        debug: Some("Failed to connect.".to_string()),
                    },
                );
            }
            Attempt::Announce { outputs, .. } => {
                let Some(stage) = self.watched else {
                    return;
                };
                for (index, caps) in outputs.into_iter().enumerate() {
                    let point = OutputPoint {
                        stage,
                        name: format!("recv_rtp_src_{}_{}_96", index, 1000 + index),
                    };
                    self.announced.push(point.clone());
                    self.push_event(Duration::ZERO, BusEvent::OutputAnnounced { point, caps });
                }
            }
        }
    }

    fn on_first_output_link(&mut self) {
        self.change_state(RunState::Playing);
        let then = match &self.attempt {
            Attempt::Announce { then, .. } => *then,
            _ => AfterLink::Hold,
        };
        let source = self.source_name();
        match then {
            AfterLink::Hold => {}
            AfterLink::ErrorAfter(after) => self.push_event(
                after,
                BusEvent::Error {
                    source,
                    message: "Internal data stream error.".to_string(),
                    debug: Some("streaming stopped, reason error (-5)".to_string()),
                },
            ),
            AfterLink::EosAfter(after) => self.push_event(after, BusEvent::Eos),
            AfterLink::WarnThenHold => self.push_event(
                Duration::ZERO,
                BusEvent::Warning {
                    source,
                    message: "Could not read from resource.".to_string(),
                    debug: None,
                },
            ),
        }
    }
}

impl MediaPipeline for FakePipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_stage(&mut self, factory: &str, name: &str) -> Result<StageId, EngineError> {
        self.ensure_alive()?;
        if self.shared.lock().unavailable.contains(factory) {
            return Err(EngineError::StageUnavailable {
                factory: factory.to_string(),
            });
        }
        let id = StageId(self.stages.len());
        self.stages.push(FakeStage {
            name: name.to_string(),
            input_linked: false,
        });
        self.record(|journal| journal.stages.push(factory.to_string()));
        Ok(id)
    }

    fn stage_name(&self, stage: StageId) -> Option<String> {
        self.stages.get(stage.0).map(|s| s.name.clone())
    }

    fn set_property(
        &mut self,
        stage: StageId,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let name = self.stage(stage)?.name.clone();
        let property = property.to_string();
        self.record(|journal| journal.properties.push((name, property, value)));
        Ok(())
    }

    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let up = self.stage(upstream)?.name.clone();
        let down = self.stage(downstream)?;
        if down.input_linked {
            return Err(EngineError::LinkFailed {
                upstream: up,
                downstream: down.name.clone(),
                reason: "input already linked".to_string(),
            });
        }
        let down = down.name.clone();
        self.stages[downstream.0].input_linked = true;
        self.record(|journal| journal.links.push((up, down)));
        Ok(())
    }

    fn watch_outputs(&mut self, stage: StageId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.stage(stage)?;
        self.watched = Some(stage);
        Ok(())
    }

    fn is_input_linked(&self, stage: StageId) -> Result<bool, EngineError> {
        self.ensure_alive()?;
        Ok(self.stage(stage)?.input_linked)
    }

    fn link_output(&mut self, output: &OutputPoint, downstream: StageId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        if !self.announced.contains(output) {
            return Err(EngineError::UnknownOutput(output.name.clone()));
        }
        let down = self.stage(downstream)?;
        if down.input_linked {
            return Err(EngineError::LinkFailed {
                upstream: output.name.clone(),
                downstream: down.name.clone(),
                reason: "input already linked".to_string(),
            });
        }
        let down = down.name.clone();
        self.stages[downstream.0].input_linked = true;
        let first = self.state != RunState::Playing;
        let point = output.name.clone();
        self.record(|journal| journal.output_links.push((point, down)));
        if first {
            self.on_first_output_link();
        }
        Ok(())
    }

    fn release_output(&mut self, output: &OutputPoint) {
        let point = output.name.clone();
        self.record(|journal| journal.released_outputs.push(point));
    }

    fn sync_with_pipeline(&mut self, stage: StageId) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let name = self.stage(stage)?.name.clone();
        self.record(|journal| journal.synced.push(name));
        Ok(())
    }

    fn set_window_handle(&mut self, stage: StageId, handle: u64) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let name = self.stage(stage)?.name.clone();
        self.record(|journal| journal.handles.push((name, handle)));
        Ok(())
    }

    fn set_render_region(&mut self, stage: StageId, region: Region) -> Result<(), EngineError> {
        self.ensure_alive()?;
        let name = self.stage(stage)?.name.clone();
        self.record(|journal| journal.regions.push((name, region)));
        Ok(())
    }

    fn set_state(&mut self, state: RunState) -> Result<(), EngineError> {
        self.ensure_alive()?;
        match state {
            RunState::Playing if self.state == RunState::Null => self.start(),
            RunState::Playing => {}
            other => self.state = other,
        }
        Ok(())
    }

    fn current_state(&self) -> RunState {
        self.state
    }

    fn next_event(&mut self, timeout: Duration) -> Option<BusEvent> {
        if self.torn_down {
            thread::sleep(timeout);
            return None;
        }

        let now = Instant::now();
        let next = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, (due, _))| *due)
            .map(|(index, (due, _))| (index, *due));

        match next {
            Some((index, due)) if due <= now + timeout => {
                if due > now {
                    thread::sleep(due - now);
                }
                Some(self.queue.remove(index).1)
            }
            _ => {
                thread::sleep(timeout);
                None
            }
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.state = RunState::Null;
        self.stages.clear();
        self.announced.clear();
        self.queue.clear();
        self.record(|journal| journal.teardowns += 1);
    }
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
