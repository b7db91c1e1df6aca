//! Presenter stages: the last stage of every chain, drawing decoded frames
//! into the stream's display target.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::DisplayTarget;
use crate::engine::{EngineError, MediaPipeline, PropertyValue, StageId};

/// Display backend family, chosen once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenterBackend {
    /// Hardware display plane, no window system.
    #[default]
    Plane,
    /// GPU composited window.
    Composited,
    /// Native overlay window, one per cell.
    Overlay,
}

impl fmt::Display for PresenterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenterBackend::Plane => "plane",
            PresenterBackend::Composited => "composited",
            PresenterBackend::Overlay => "overlay",
        };
        f.write_str(name)
    }
}

/// Clock synchronisation and scaling behaviour of a presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Render frames against the pipeline clock. Off for lowest latency.
    pub sync: bool,
    pub qos: bool,
    pub force_aspect_ratio: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            sync: false,
            qos: false,
            force_aspect_ratio: true,
        }
    }
}

pub trait Presenter: Send + Sync {
    fn backend(&self) -> PresenterBackend;

    /// Factories to try, best first.
    fn candidates(&self) -> &[&'static str];

    fn configure(
        &self,
        pipeline: &mut dyn MediaPipeline,
        stage: StageId,
        policy: &SyncPolicy,
    ) -> Result<(), EngineError> {
        let settings = [
            ("sync", PropertyValue::Bool(policy.sync)),
            ("async", PropertyValue::Bool(policy.sync)),
            ("qos", PropertyValue::Bool(policy.qos)),
            (
                "force-aspect-ratio",
                PropertyValue::Bool(policy.force_aspect_ratio),
            ),
            ("enable-last-sample", PropertyValue::Bool(false)),
        ];
        for (property, value) in settings {
            match pipeline.set_property(stage, property, value) {
                Ok(()) => {}
                Err(EngineError::UnknownProperty { stage, property }) => {
                    debug!("Presenter {} has no property {}, skipping", stage, property);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bind the presenter to its place on the display.
    fn attach(
        &self,
        pipeline: &mut dyn MediaPipeline,
        stage: StageId,
        target: &DisplayTarget,
    ) -> Result<(), EngineError>;
}

pub struct PlanePresenter;

impl Presenter for PlanePresenter {
    fn backend(&self) -> PresenterBackend {
        PresenterBackend::Plane
    }

    fn candidates(&self) -> &[&'static str] {
        &["kmssink"]
    }

    fn attach(
        &self,
        pipeline: &mut dyn MediaPipeline,
        stage: StageId,
        target: &DisplayTarget,
    ) -> Result<(), EngineError> {
        pipeline.set_render_region(stage, target.region)
    }
}

pub struct CompositedPresenter;

impl Presenter for CompositedPresenter {
    fn backend(&self) -> PresenterBackend {
        PresenterBackend::Composited
    }

    fn candidates(&self) -> &[&'static str] {
        &["glimagesink", "autovideosink"]
    }

    fn attach(
        &self,
        pipeline: &mut dyn MediaPipeline,
        stage: StageId,
        target: &DisplayTarget,
    ) -> Result<(), EngineError> {
        if let Some(handle) = target.window_handle {
            pipeline.set_window_handle(stage, handle)?;
        }
        pipeline.set_render_region(stage, target.region)
    }
}

pub struct OverlayPresenter;

impl Presenter for OverlayPresenter {
    fn backend(&self) -> PresenterBackend {
        PresenterBackend::Overlay
    }

    fn candidates(&self) -> &[&'static str] {
        &["d3dvideosink", "xvimagesink", "ximagesink", "autovideosink"]
    }

    fn attach(
        &self,
        pipeline: &mut dyn MediaPipeline,
        stage: StageId,
        target: &DisplayTarget,
    ) -> Result<(), EngineError> {
        let handle = target.window_handle.ok_or_else(|| EngineError::Attach {
            stage: pipeline
                .stage_name(stage)
                .unwrap_or_else(|| stage.to_string()),
            reason: "overlay output needs a window handle".to_string(),
        })?;
        pipeline.set_window_handle(stage, handle)
    }
}

pub fn presenter_for(backend: PresenterBackend) -> Box<dyn Presenter> {
    match backend {
        PresenterBackend::Plane => Box::new(PlanePresenter),
        PresenterBackend::Composited => Box::new(CompositedPresenter),
        PresenterBackend::Overlay => Box::new(OverlayPresenter),
    }
}
