use tracing::debug;

use crate::config::SourceOptions;
use crate::engine::{EngineError, MediaPipeline, PropertyValue, RunState, StageId};

/// Factory of the network source stage.
pub const SOURCE_FACTORY: &str = "rtspsrc";

/// Configure the source stage. Only the location is mandatory; tuning
/// properties the source does not know are skipped.
pub fn apply_source_options(
    pipeline: &mut dyn MediaPipeline,
    stage: StageId,
    options: &SourceOptions,
) -> Result<(), EngineError> {
    pipeline.set_property(stage, "location", PropertyValue::from(options.location.as_str()))?;

    let mut optional = vec![
        ("latency", PropertyValue::UInt(u64::from(options.latency_ms))),
        ("protocols", PropertyValue::from(options.transport.protocols())),
        // microseconds
        ("timeout", PropertyValue::UInt(options.timeout.as_micros() as u64)),
        ("drop-on-latency", PropertyValue::Bool(options.drop_on_latency)),
    ];
    if let Some(user) = &options.user_id {
        optional.push(("user-id", PropertyValue::from(user.as_str())));
    }
    if let Some(password) = &options.user_pw {
        optional.push(("user-pw", PropertyValue::from(password.as_str())));
    }

    for (property, value) in optional {
        match pipeline.set_property(stage, property, value) {
            Ok(()) => {}
            Err(EngineError::UnknownProperty { stage, property }) => {
                debug!("Source {} has no property {}, skipping", stage, property);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Add the source stage, configure it and start the pipeline. The source's
/// outputs are announced on the bus once the handshake completes.
pub fn open_source(
    pipeline: &mut dyn MediaPipeline,
    name: &str,
    options: &SourceOptions,
) -> Result<StageId, EngineError> {
    let source = pipeline.add_stage(SOURCE_FACTORY, name)?;
    apply_source_options(pipeline, source, options)?;
    pipeline.watch_outputs(source)?;
    pipeline.set_state(RunState::Playing)?;
    Ok(source)
}
