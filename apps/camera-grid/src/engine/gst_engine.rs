//! GStreamer backend of the media engine interface.

use gst::glib;
use gst::prelude::*;
use gst_video::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{
    BusEvent, Capabilities, EngineError, MediaEngine, MediaPipeline, OutputPoint, PropertyValue,
    RunState, StageId,
};
use crate::display::Region;

/// Name of the application message announcing a new source output.
const OUTPUT_ANNOUNCED: &str = "camera-grid/output-announced";

impl From<gst::State> for RunState {
    fn from(state: gst::State) -> Self {
        match state {
            gst::State::VoidPending | gst::State::Null => RunState::Null,
            gst::State::Ready => RunState::Ready,
            gst::State::Paused => RunState::Paused,
            gst::State::Playing => RunState::Playing,
        }
    }
}

impl From<RunState> for gst::State {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Null => gst::State::Null,
            RunState::Ready => gst::State::Ready,
            RunState::Paused => gst::State::Paused,
            RunState::Playing => gst::State::Playing,
        }
    }
}

pub struct GstEngine;

impl GstEngine {
    /// Initialize GStreamer. Must be called before any pipeline is created.
    pub fn initialize() -> Result<Self, EngineError> {
        info!("Initializing GStreamer");
        gst::init().map_err(|e| {
            error!("Failed to initialize GStreamer: {}", e);
            EngineError::Init(e.to_string())
        })?;

        let (major, minor, micro, nano) = gst::version();
        info!("GStreamer version: {}.{}.{}.{}", major, minor, micro, nano);

        if let Ok(plugin_path) = std::env::var("GST_PLUGIN_PATH") {
            info!("Using custom GST_PLUGIN_PATH: {}", plugin_path);
        }

        Ok(Self)
    }

    pub fn version_string() -> String {
        gst::version_string().to_string()
    }
}

impl MediaEngine for GstEngine {
    fn create_pipeline(&self, name: &str) -> Result<Box<dyn MediaPipeline>, EngineError> {
        let pipeline = gst::Pipeline::builder().name(name).build();
        let bus = pipeline.bus().ok_or_else(|| EngineError::PipelineCreation {
            name: name.to_string(),
            reason: "pipeline has no bus".to_string(),
        })?;

        let overlays: Arc<Mutex<Vec<OverlayBinding>>> = Arc::default();
        let bindings = Arc::clone(&overlays);
        bus.set_sync_handler(move |_, msg| {
            if gst_video::is_video_overlay_prepare_window_handle_message(msg) {
                if let Some(src) = msg.src() {
                    for binding in bindings.lock().iter() {
                        if src == binding.element.upcast_ref::<gst::Object>()
                            || src.has_as_ancestor(&binding.element)
                        {
                            binding.apply(src);
                        }
                    }
                }
            }
            gst::BusSyncReply::Pass
        });

        Ok(Box::new(GstPipeline {
            name: name.to_string(),
            pipeline: Some(pipeline),
            bus: Some(bus),
            stages: Vec::new(),
            outputs: Arc::default(),
            overlays,
        }))
    }

    fn has_factory(&self, factory: &str) -> bool {
        gst::ElementFactory::find(factory).is_some()
    }
}

/// Display placement requested for a presenter, applied again whenever the
/// actual video sink asks for its window.
struct OverlayBinding {
    element: gst::Element,
    handle: Option<u64>,
    region: Option<Region>,
}

impl OverlayBinding {
    fn apply(&self, target: &gst::Object) {
        let Some(overlay) = target.dynamic_cast_ref::<gst_video::VideoOverlay>() else {
            return;
        };
        if let Some(handle) = self.handle {
            // SAFETY: the handle names a native window owned by the display
            // side, which outlives the pipeline.
            unsafe { overlay.set_window_handle(handle as usize) };
        }
        if let Some(region) = self.region {
            if let Err(e) = overlay.set_render_rectangle(
                region.x,
                region.y,
                region.width as i32,
                region.height as i32,
            ) {
                debug!("Render rectangle rejected by {}: {}", target.name(), e);
            }
        }
        overlay.expose();
    }
}

type PendingOutputs = Arc<Mutex<HashMap<String, (gst::Pad, Option<gst::PadProbeId>)>>>;

struct GstPipeline {
    name: String,
    pipeline: Option<gst::Pipeline>,
    bus: Option<gst::Bus>,
    stages: Vec<gst::Element>,
    outputs: PendingOutputs,
    overlays: Arc<Mutex<Vec<OverlayBinding>>>,
}

impl GstPipeline {
    fn pipeline(&self) -> Result<&gst::Pipeline, EngineError> {
        self.pipeline.as_ref().ok_or(EngineError::TornDown)
    }

    fn element(&self, stage: StageId) -> Result<&gst::Element, EngineError> {
        self.pipeline()?;
        self.stages
            .get(stage.0)
            .ok_or(EngineError::UnknownStage(stage))
    }

    fn stage_of(&self, object: Option<&gst::Object>) -> Option<StageId> {
        let object = object?;
        self.stages
            .iter()
            .position(|element| element.upcast_ref::<gst::Object>() == object)
            .map(StageId)
    }

    fn bind_overlay(
        &self,
        stage: StageId,
        handle: Option<u64>,
        region: Option<Region>,
    ) -> Result<(), EngineError> {
        let element = self.element(stage)?.clone();
        let mut overlays = self.overlays.lock();
        let index = match overlays.iter().position(|b| b.element == element) {
            Some(index) => index,
            None => {
                overlays.push(OverlayBinding {
                    element: element.clone(),
                    handle: None,
                    region: None,
                });
                overlays.len() - 1
            }
        };
        let binding = &mut overlays[index];
        if handle.is_some() {
            binding.handle = handle;
        }
        if region.is_some() {
            binding.region = region;
        }

        if element.is::<gst_video::VideoOverlay>() {
            binding.apply(element.upcast_ref());
        } else if let Some(bin) = element.downcast_ref::<gst::Bin>() {
            if let Some(child) = bin.by_interface(gst_video::VideoOverlay::static_type()) {
                binding.apply(child.upcast_ref());
            }
        } else {
            return Err(EngineError::Attach {
                stage: element.name().to_string(),
                reason: "element does not implement the video overlay interface".to_string(),
            });
        }
        Ok(())
    }

    fn translate(&self, msg: &gst::Message) -> Option<BusEvent> {
        use gst::MessageView;

        let source = || {
            msg.src()
                .map(|s| s.path_string().to_string())
                .unwrap_or_else(|| self.name.clone())
        };

        match msg.view() {
            MessageView::Error(err) => Some(BusEvent::Error {
                source: source(),
                message: err.error().to_string(),
                debug: err.debug().map(|d| d.to_string()),
            }),
            MessageView::Warning(warning) => Some(BusEvent::Warning {
                source: source(),
                message: warning.error().to_string(),
                debug: warning.debug().map(|d| d.to_string()),
            }),
            MessageView::Eos(_) => Some(BusEvent::Eos),
            MessageView::StateChanged(changed) => {
                let pipeline = self.pipeline.as_ref()?;
                if msg.src() != Some(pipeline.upcast_ref::<gst::Object>()) {
                    return None;
                }
                Some(BusEvent::StateChanged {
                    old: changed.old().into(),
                    current: changed.current().into(),
                })
            }
            MessageView::Application(app) => {
                let structure = app.structure()?;
                if !structure.has_name(OUTPUT_ANNOUNCED) {
                    return None;
                }
                let pad = structure.get::<String>("pad").ok()?;
                let caps = structure.get::<gst::Caps>("caps").ok()?;
                let stage = self.stage_of(msg.src())?;
                Some(BusEvent::OutputAnnounced {
                    point: OutputPoint { stage, name: pad },
                    caps: capabilities(&caps),
                })
            }
            _ => None,
        }
    }
}

fn capabilities(caps: &gst::CapsRef) -> Capabilities {
    let Some(structure) = caps.structure(0) else {
        return Capabilities::default();
    };
    let mut result = Capabilities::new(structure.name().to_string());
    for (field, value) in structure.iter() {
        let text = value
            .get::<String>()
            .ok()
            .or_else(|| value.serialize().ok().map(|s| s.to_string()))
            .unwrap_or_default();
        result = result.with_field(field.to_string(), text);
    }
    result
}

fn to_value(value: &PropertyValue, ty: glib::Type) -> Option<glib::Value> {
    match value {
        PropertyValue::Bool(v) if ty == bool::static_type() => Some(v.to_value()),
        PropertyValue::Int(v) if ty == i32::static_type() => {
            i32::try_from(*v).ok().map(|v| v.to_value())
        }
        PropertyValue::Int(v) if ty == i64::static_type() => Some(v.to_value()),
        PropertyValue::UInt(v) if ty == u32::static_type() => {
            u32::try_from(*v).ok().map(|v| v.to_value())
        }
        PropertyValue::UInt(v) if ty == u64::static_type() => Some(v.to_value()),
        PropertyValue::UInt(v) if ty == i64::static_type() => {
            i64::try_from(*v).ok().map(|v| v.to_value())
        }
        PropertyValue::Str(v) if ty == String::static_type() => Some(v.to_value()),
        // Enums, flags and caps are parsed from their string form.
        other => glib::Value::deserialize(&other.to_string(), ty).ok(),
    }
}

impl MediaPipeline for GstPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_stage(&mut self, factory: &str, name: &str) -> Result<StageId, EngineError> {
        let pipeline = self.pipeline()?;
        if gst::ElementFactory::find(factory).is_none() {
            return Err(EngineError::StageUnavailable {
                factory: factory.to_string(),
            });
        }
        let element = gst::ElementFactory::make(factory)
            .name(name)
            .build()
            .map_err(|e| EngineError::AddStage {
                factory: factory.to_string(),
                reason: e.to_string(),
            })?;
        pipeline.add(&element).map_err(|e| EngineError::AddStage {
            factory: factory.to_string(),
            reason: e.to_string(),
        })?;

        let id = StageId(self.stages.len());
        self.stages.push(element);
        Ok(id)
    }

    fn stage_name(&self, stage: StageId) -> Option<String> {
        self.stages.get(stage.0).map(|e| e.name().to_string())
    }

    fn set_property(
        &mut self,
        stage: StageId,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), EngineError> {
        let element = self.element(stage)?;
        let pspec = element
            .find_property(property)
            .ok_or_else(|| EngineError::UnknownProperty {
                stage: element.name().to_string(),
                property: property.to_string(),
            })?;

        let converted =
            to_value(&value, pspec.value_type()).ok_or_else(|| EngineError::InvalidProperty {
                stage: element.name().to_string(),
                property: property.to_string(),
                value: value.to_string(),
            })?;
        element.set_property_from_value(property, &converted);
        Ok(())
    }

    fn link(&mut self, upstream: StageId, downstream: StageId) -> Result<(), EngineError> {
        let up = self.element(upstream)?;
        let down = self.element(downstream)?;
        up.link(down).map_err(|e| EngineError::LinkFailed {
            upstream: up.name().to_string(),
            downstream: down.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn watch_outputs(&mut self, stage: StageId) -> Result<(), EngineError> {
        let element = self.element(stage)?;
        let outputs = Arc::clone(&self.outputs);

        element.connect_pad_added(move |element, pad| {
            if pad.direction() != gst::PadDirection::Src {
                return;
            }

            // Hold data back until the session has decided what to do with
            // this output.
            let probe = pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| {
                gst::PadProbeReturn::Ok
            });
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            outputs
                .lock()
                .insert(pad.name().to_string(), (pad.clone(), probe));

            let structure = gst::Structure::builder(OUTPUT_ANNOUNCED)
                .field("pad", pad.name().as_str())
                .field("caps", &caps)
                .build();
            let msg = gst::message::Application::builder(structure)
                .src(element)
                .build();
            if element.post_message(msg).is_err() {
                warn!("Failed to announce output {}", pad.name());
            }
        });

        Ok(())
    }

    fn is_input_linked(&self, stage: StageId) -> Result<bool, EngineError> {
        let element = self.element(stage)?;
        Ok(element
            .static_pad("sink")
            .map(|pad| pad.is_linked())
            .unwrap_or(false))
    }

    fn link_output(&mut self, output: &OutputPoint, downstream: StageId) -> Result<(), EngineError> {
        let down = self.element(downstream)?.clone();
        let (pad, probe) = self
            .outputs
            .lock()
            .remove(&output.name)
            .ok_or_else(|| EngineError::UnknownOutput(output.name.clone()))?;

        let link_failed = |reason: String| EngineError::LinkFailed {
            upstream: output.name.clone(),
            downstream: down.name().to_string(),
            reason,
        };
        let sink = down
            .static_pad("sink")
            .ok_or_else(|| link_failed("no sink pad".to_string()))?;

        let result = pad.link(&sink);
        if let Some(probe) = probe {
            pad.remove_probe(probe);
        }
        result
            .map(|_| ())
            .map_err(|e| link_failed(format!("{:?}", e)))
    }

    fn release_output(&mut self, output: &OutputPoint) {
        if let Some((pad, Some(probe))) = self.outputs.lock().remove(&output.name) {
            pad.remove_probe(probe);
        }
    }

    fn sync_with_pipeline(&mut self, stage: StageId) -> Result<(), EngineError> {
        let element = self.element(stage)?;
        element
            .sync_state_with_parent()
            .map_err(|e| EngineError::StateChange {
                target: self.current_state(),
                reason: format!("{}: {}", element.name(), e),
            })
    }

    fn set_window_handle(&mut self, stage: StageId, handle: u64) -> Result<(), EngineError> {
        self.bind_overlay(stage, Some(handle), None)
    }

    fn set_render_region(&mut self, stage: StageId, region: Region) -> Result<(), EngineError> {
        self.bind_overlay(stage, None, Some(region))
    }

    fn set_state(&mut self, state: RunState) -> Result<(), EngineError> {
        self.pipeline()?
            .set_state(state.into())
            .map(|_| ())
            .map_err(|e| EngineError::StateChange {
                target: state,
                reason: e.to_string(),
            })
    }

    fn current_state(&self) -> RunState {
        self.pipeline
            .as_ref()
            .map(|p| p.current_state().into())
            .unwrap_or(RunState::Null)
    }

    fn next_event(&mut self, timeout: Duration) -> Option<BusEvent> {
        let Some(bus) = self.bus.clone() else {
            thread::sleep(timeout);
            return None;
        };

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_nseconds(remaining.as_nanos() as u64),
                &[
                    gst::MessageType::Error,
                    gst::MessageType::Warning,
                    gst::MessageType::Eos,
                    gst::MessageType::StateChanged,
                    gst::MessageType::Application,
                ],
            )?;
            if let Some(event) = self.translate(&msg) {
                return Some(event);
            }
            if remaining.is_zero() {
                return None;
            }
        }
    }

    fn teardown(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            return;
        };
        if let Err(e) = pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline {}: {}", self.name, e);
        }
        if let Some(bus) = self.bus.take() {
            bus.unset_sync_handler();
        }
        self.outputs.lock().clear();
        self.overlays.lock().clear();
        self.stages.clear();
        debug!("Pipeline {} released", self.name);
    }
}

impl Drop for GstPipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}
