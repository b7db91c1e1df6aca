//! Interface to the media-processing engine.
//!
//! The supervision core never touches the engine directly: it creates
//! pipelines through [`MediaEngine`], drives them through [`MediaPipeline`]
//! and reacts to the [`BusEvent`]s they report. The GStreamer backend lives in
//! `gst_engine` (feature `gstreamer`), the scripted backend used by the test
//! suites in `fake` (feature `test-utils`).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::display::Region;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
#[cfg(feature = "gstreamer")]
pub mod gst_engine;

/// Handle to a stage owned by a pipeline. Only meaningful for the pipeline
/// that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) usize);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// A dynamic output connection point, announced by a stage once the
/// protocol handshake has completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputPoint {
    pub stage: StageId,
    pub name: String,
}

/// Capability attributes reported for a connection point: a media type
/// (`application/x-rtp`, `video/x-raw`, ...) plus key/value fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub media_type: String,
    pub fields: BTreeMap<String, String>,
}

impl Capabilities {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// RTP payload description as announced by an RTSP source.
    pub fn rtp(media: &str, encoding_name: &str) -> Self {
        Self::new("application/x-rtp")
            .with_field("media", media)
            .with_field("encoding-name", encoding_name)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (key, value) in &self.fields {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Value assigned to a stage property. Backends convert it to the native
/// type of the property; enum and flag properties take their nick as
/// [`PropertyValue::Str`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::UInt(v) => write!(f, "{}", v),
            PropertyValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

/// Pipeline-wide running status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Null => "NULL",
            RunState::Ready => "READY",
            RunState::Paused => "PAUSED",
            RunState::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// Structured notification read from a pipeline's bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A watched stage exposed a new output connection point.
    OutputAnnounced {
        point: OutputPoint,
        caps: Capabilities,
    },
    /// The pipeline itself changed state. Stage-level transitions are not
    /// reported.
    StateChanged { old: RunState, current: RunState },
    Warning {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Eos,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Media engine initialization failed: {0}")]
    Init(String),

    #[error("Failed to create pipeline {name}: {reason}")]
    PipelineCreation { name: String, reason: String },

    #[error("Stage factory {factory} is not available")]
    StageUnavailable { factory: String },

    #[error("Failed to add stage {factory}: {reason}")]
    AddStage { factory: String, reason: String },

    #[error("Unknown {0}")]
    UnknownStage(StageId),

    #[error("Unknown output connection point {0}")]
    UnknownOutput(String),

    #[error("Stage {stage} has no property {property}")]
    UnknownProperty { stage: String, property: String },

    #[error("Invalid value {value} for property {property} of {stage}")]
    InvalidProperty {
        stage: String,
        property: String,
        value: String,
    },

    #[error("Failed to link {upstream} -> {downstream}: {reason}")]
    LinkFailed {
        upstream: String,
        downstream: String,
        reason: String,
    },

    #[error("Failed to change pipeline state to {target}: {reason}")]
    StateChange { target: RunState, reason: String },

    #[error("Cannot attach {stage} to the display: {reason}")]
    Attach { stage: String, reason: String },

    #[error("Pipeline has already been torn down")]
    TornDown,
}

/// Factory for pipelines. One engine is shared by every session.
pub trait MediaEngine: Send + Sync {
    fn create_pipeline(&self, name: &str) -> Result<Box<dyn MediaPipeline>, EngineError>;

    /// Whether a stage of type `factory` could be instantiated right now.
    fn has_factory(&self, factory: &str) -> bool;
}

/// One pipeline: a shared execution context holding stages, links between
/// them and a bus of structured events.
///
/// Every method must be safe to call after [`MediaPipeline::teardown`]; calls
/// that need the pipeline then fail with [`EngineError::TornDown`].
pub trait MediaPipeline: Send {
    fn name(&self) -> &str;

    /// Instantiate a stage of type `factory` and add it to the pipeline.
    fn add_stage(&mut self, factory: &str, name: &str) -> Result<StageId, EngineError>;

    /// Human readable name of a stage, for diagnostics.
    fn stage_name(&self, stage: StageId) -> Option<String>;

    fn set_property(
        &mut self,
        stage: StageId,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), EngineError>;

    /// Static link between two stages whose connection points exist already.
    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), EngineError>;

    /// Report [`BusEvent::OutputAnnounced`] for every output `stage` exposes
    /// from now on.
    fn watch_outputs(&mut self, stage: StageId) -> Result<(), EngineError>;

    /// Whether the input connection point of `stage` has a peer.
    fn is_input_linked(&self, stage: StageId) -> Result<bool, EngineError>;

    /// Link an announced output to the input of `downstream`.
    fn link_output(&mut self, output: &OutputPoint, downstream: StageId) -> Result<(), EngineError>;

    /// Give up on an announced output that will not be linked.
    fn release_output(&mut self, output: &OutputPoint);

    /// Bring a stage added late to the running status of the pipeline.
    fn sync_with_pipeline(&mut self, stage: StageId) -> Result<(), EngineError>;

    fn set_window_handle(&mut self, stage: StageId, handle: u64) -> Result<(), EngineError>;

    fn set_render_region(&mut self, stage: StageId, region: Region) -> Result<(), EngineError>;

    fn set_state(&mut self, state: RunState) -> Result<(), EngineError>;

    fn current_state(&self) -> RunState;

    /// Wait at most `timeout` for the next event.
    fn next_event(&mut self, timeout: Duration) -> Option<BusEvent>;

    /// Stop the pipeline and release it together with every stage it owns.
    /// Idempotent.
    fn teardown(&mut self);
}

/// Availability of one factory the configuration may ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryAvailability {
    pub role: String,
    pub factory: String,
    pub available: bool,
}

/// Check every factory a deployment can end up instantiating.
pub fn availability_report(
    engine: &dyn MediaEngine,
    assembler: &crate::chain::ChainAssembler,
    presenter: &dyn crate::display::Presenter,
) -> Vec<FactoryAvailability> {
    let mut report = Vec::new();
    let mut push = |role: &str, factory: &str| {
        report.push(FactoryAvailability {
            role: role.to_string(),
            factory: factory.to_string(),
            available: engine.has_factory(factory),
        });
    };

    push("source", crate::session::SOURCE_FACTORY);
    for codec in crate::codec::CodecTag::ALL {
        let plan = assembler.plan(codec);
        for spec in plan.stages() {
            let role = format!("{} {}", codec, spec.role);
            for candidate in &spec.candidates {
                push(&role, candidate);
            }
        }
    }
    for factory in presenter.candidates() {
        push("presenter", factory);
    }

    report
}
