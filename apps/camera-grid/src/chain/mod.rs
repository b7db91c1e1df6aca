//! Decode chain assembly.
//!
//! A chain is planned from the codec tag and the immutable decode settings,
//! then instantiated inside a session's pipeline: every stage is created from
//! the first factory of its ranked candidate list that the engine can provide,
//! the stages are linked statically in plan order and finally brought to the
//! running state of the pipeline. The source's announced output is linked to
//! the chain input separately, once per chain, by [`link_output`].

use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::CodecTag;
use crate::config::DecodeConfig;
use crate::display::{DisplayTarget, Presenter, SyncPolicy};
use crate::engine::{EngineError, MediaPipeline, OutputPoint, PropertyValue, StageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    Depayloader,
    Parser,
    Queue,
    Decoder,
    Converter,
    Scaler,
    Filter,
    Presenter,
}

impl StageRole {
    fn suffix(&self) -> &'static str {
        match self {
            StageRole::Depayloader => "depay",
            StageRole::Parser => "parse",
            StageRole::Queue => "queue",
            StageRole::Decoder => "dec",
            StageRole::Converter => "convert",
            StageRole::Scaler => "scale",
            StageRole::Filter => "caps",
            StageRole::Presenter => "sink",
        }
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageRole::Depayloader => "depayloader",
            StageRole::Parser => "parser",
            StageRole::Queue => "queue",
            StageRole::Decoder => "decoder",
            StageRole::Converter => "converter",
            StageRole::Scaler => "scaler",
            StageRole::Filter => "capsfilter",
            StageRole::Presenter => "presenter",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("No {role} could be instantiated (tried {})", .candidates.join(", "))]
    MissingStage {
        role: StageRole,
        candidates: Vec<String>,
    },

    #[error("No {codec} decoder could be instantiated (tried {})", .candidates.join(", "))]
    NoDecoder {
        codec: CodecTag,
        candidates: Vec<String>,
    },

    #[error("Failed to configure {role}: {error}")]
    Configure { role: StageRole, error: EngineError },

    #[error("Link failed: {0}")]
    Link(EngineError),
}

/// One planned stage: its role, the factories to try in order and the
/// properties to set once instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub role: StageRole,
    pub candidates: Vec<String>,
    pub properties: Vec<(String, PropertyValue)>,
}

impl StageSpec {
    fn single(role: StageRole, factory: &str) -> Self {
        Self {
            role,
            candidates: vec![factory.to_string()],
            properties: Vec::new(),
        }
    }

    fn with_property(mut self, name: &str, value: PropertyValue) -> Self {
        self.properties.push((name.to_string(), value));
        self
    }
}

/// Ordered stage list for one codec, presenter excluded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainPlan {
    codec: CodecTag,
    stages: Vec<StageSpec>,
}

impl ChainPlan {
    pub fn codec(&self) -> CodecTag {
        self.codec
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStage {
    pub role: StageRole,
    pub id: StageId,
    pub factory: String,
}

/// A built and internally linked chain living inside a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub codec: CodecTag,
    pub stages: Vec<ChainStage>,
}

impl Chain {
    /// First stage, fed by the source's announced output.
    pub fn input(&self) -> Option<StageId> {
        self.stages.first().map(|stage| stage.id)
    }

    fn factory(&self, role: StageRole) -> Option<&str> {
        self.stages
            .iter()
            .find(|stage| stage.role == role)
            .map(|stage| stage.factory.as_str())
    }

    pub fn decoder(&self) -> Option<&str> {
        self.factory(StageRole::Decoder)
    }

    pub fn presenter(&self) -> Option<&str> {
        self.factory(StageRole::Presenter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    /// The chain input already had a peer; nothing was changed.
    AlreadyLinked,
}

/// Builds decode chains from the decode settings, which never change after
/// startup.
#[derive(Debug, Clone)]
pub struct ChainAssembler {
    h264: Vec<String>,
    h265: Vec<String>,
    leaky_queue: bool,
    convert: bool,
    output_caps: Option<String>,
}

impl ChainAssembler {
    pub fn from_config(config: &DecodeConfig) -> Self {
        let output_caps = config.output.as_ref().map(|output| output.caps_string());
        let convert = config.convert
            || config
                .output
                .as_ref()
                .is_some_and(|output| output.format.is_some());
        Self {
            h264: config.h264.clone(),
            h265: config.h265.clone(),
            leaky_queue: config.leaky_queue,
            convert,
            output_caps,
        }
    }

    pub fn decoder_candidates(&self, codec: CodecTag) -> &[String] {
        match codec {
            CodecTag::H264 => &self.h264,
            CodecTag::H265 => &self.h265,
        }
    }

    pub fn plan(&self, codec: CodecTag) -> ChainPlan {
        let mut stages = vec![
            StageSpec::single(StageRole::Depayloader, codec.depayloader()),
            StageSpec::single(StageRole::Parser, codec.parser()),
        ];

        if self.leaky_queue {
            stages.push(
                StageSpec::single(StageRole::Queue, "queue")
                    .with_property("leaky", PropertyValue::from("downstream"))
                    .with_property("max-size-buffers", PropertyValue::UInt(1))
                    .with_property("max-size-bytes", PropertyValue::UInt(0))
                    .with_property("max-size-time", PropertyValue::UInt(0)),
            );
        }

        stages.push(StageSpec {
            role: StageRole::Decoder,
            candidates: self.decoder_candidates(codec).to_vec(),
            properties: Vec::new(),
        });

        if self.convert {
            stages.push(StageSpec::single(StageRole::Converter, "videoconvert"));
        }

        if let Some(caps) = &self.output_caps {
            stages.push(StageSpec::single(StageRole::Scaler, "videoscale"));
            stages.push(
                StageSpec::single(StageRole::Filter, "capsfilter")
                    .with_property("caps", PropertyValue::Str(caps.clone())),
            );
        }

        ChainPlan { codec, stages }
    }

    /// Instantiate the chain for `codec` in `pipeline`, ending in a stage of
    /// `presenter` bound to `target`.
    pub fn assemble(
        &self,
        pipeline: &mut dyn MediaPipeline,
        codec: CodecTag,
        presenter: &dyn Presenter,
        policy: &SyncPolicy,
        target: &DisplayTarget,
    ) -> Result<Chain, AssemblyError> {
        let plan = self.plan(codec);
        let prefix = pipeline.name().to_string();
        let mut stages = Vec::with_capacity(plan.stages().len() + 1);

        for spec in plan.stages() {
            let name = format!("{}-{}", prefix, spec.role.suffix());
            let (id, factory) = instantiate(pipeline, &spec.candidates, &name).ok_or_else(|| {
                if spec.role == StageRole::Decoder {
                    AssemblyError::NoDecoder {
                        codec,
                        candidates: spec.candidates.clone(),
                    }
                } else {
                    AssemblyError::MissingStage {
                        role: spec.role,
                        candidates: spec.candidates.clone(),
                    }
                }
            })?;

            for (property, value) in &spec.properties {
                pipeline
                    .set_property(id, property, value.clone())
                    .map_err(|error| AssemblyError::Configure {
                        role: spec.role,
                        error,
                    })?;
            }

            stages.push(ChainStage {
                role: spec.role,
                id,
                factory,
            });
        }

        let name = format!("{}-{}", prefix, StageRole::Presenter.suffix());
        let candidates: Vec<String> = presenter
            .candidates()
            .iter()
            .map(|factory| factory.to_string())
            .collect();
        let (sink, factory) = instantiate(pipeline, &candidates, &name).ok_or_else(|| {
            AssemblyError::MissingStage {
                role: StageRole::Presenter,
                candidates: candidates.clone(),
            }
        })?;
        let configure_err = |error| AssemblyError::Configure {
            role: StageRole::Presenter,
            error,
        };
        presenter
            .configure(pipeline, sink, policy)
            .map_err(configure_err)?;
        presenter
            .attach(pipeline, sink, target)
            .map_err(configure_err)?;
        stages.push(ChainStage {
            role: StageRole::Presenter,
            id: sink,
            factory,
        });

        for pair in stages.windows(2) {
            pipeline
                .link(pair[0].id, pair[1].id)
                .map_err(AssemblyError::Link)?;
        }

        for stage in &stages {
            pipeline
                .sync_with_pipeline(stage.id)
                .map_err(AssemblyError::Link)?;
        }

        let chain = Chain { codec, stages };
        info!(
            codec = %codec,
            decoder = chain.decoder().unwrap_or("none"),
            presenter = chain.presenter().unwrap_or("none"),
            "Decode chain assembled"
        );
        Ok(chain)
    }
}

/// Create a stage from the first candidate the engine can provide.
pub fn instantiate(
    pipeline: &mut dyn MediaPipeline,
    candidates: &[String],
    name: &str,
) -> Option<(StageId, String)> {
    for factory in candidates {
        match pipeline.add_stage(factory, name) {
            Ok(id) => return Some((id, factory.clone())),
            Err(e) => debug!("Candidate {} rejected: {}", factory, e),
        }
    }
    None
}

/// Connect an announced output to the chain input. A second announcement for
/// an already fed chain is a no-op.
pub fn link_output(
    pipeline: &mut dyn MediaPipeline,
    chain: &Chain,
    output: &OutputPoint,
) -> Result<LinkOutcome, AssemblyError> {
    let input = chain.input().ok_or_else(|| AssemblyError::MissingStage {
        role: StageRole::Depayloader,
        candidates: Vec::new(),
    })?;

    if pipeline.is_input_linked(input).map_err(AssemblyError::Link)? {
        debug!("Chain input already linked, ignoring {}", output.name);
        return Ok(LinkOutcome::AlreadyLinked);
    }

    pipeline
        .link_output(output, input)
        .map_err(AssemblyError::Link)?;
    Ok(LinkOutcome::Linked)
}
