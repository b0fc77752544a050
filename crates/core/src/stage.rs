use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::graph::NodeConfig;
use crate::types::{Detection, Frame};

/// Canonical stage names as they appear in stage history and tap attach
/// points.
pub const STAGE_RAW: &str = "raw";
pub const STAGE_PREPROCESS: &str = "preprocess";
pub const STAGE_DETECT: &str = "detect";
pub const STAGE_OVERLAY: &str = "detect_overlay";

/// Attach point name for taps fed directly from the source.
pub const SOURCE_ATTACH_POINT: &str = "__source__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Adaptive,
    Binary,
}

/// Tunable settings for the preprocess stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub blur_kernel_size: u32,
    pub threshold_type: ThresholdKind,
    pub adaptive_block_size: u32,
    pub adaptive_c: i32,
    pub binary_threshold: u8,
    pub morphology: bool,
    pub morph_kernel_size: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            blur_kernel_size: 3,
            threshold_type: ThresholdKind::Adaptive,
            adaptive_block_size: 15,
            adaptive_c: 3,
            binary_threshold: 127,
            morphology: false,
            morph_kernel_size: 3,
        }
    }
}

impl PreprocessConfig {
    /// Read from a node config map; unknown keys are ignored, missing keys
    /// take defaults.
    pub fn from_node_config(config: &NodeConfig) -> Self {
        serde_json::from_value(serde_json::Value::Object(config.clone())).unwrap_or_default()
    }
}

/// Image conditioning ahead of detection. Implementations are shared across
/// threads, so configuration updates go through interior mutability.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, frame: &Frame) -> Result<Frame>;
    fn config(&self) -> PreprocessConfig;
    fn set_config(&self, config: PreprocessConfig);
}

/// Fiducial tag detection and overlay drawing.
pub trait TagDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
    fn draw_overlay(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame>;
}

/// Anything that accepts frames fanned out from the pipeline: stream taps
/// and save sinks. Delivery failures are the consumer's problem; the
/// pipeline never blocks on a consumer.
pub trait FrameConsumer: Send + Sync {
    fn consumer_id(&self) -> &str;
    fn push_frame(&self, frame: &Arc<Frame>);
}

/// Per-frame state threaded through the stage chain.
pub struct StageContext {
    /// The unmodified source frame; the overlay stage draws on this, not on
    /// the preprocessed intermediate.
    pub raw: Arc<Frame>,
    pub detections: Vec<Detection>,
}

impl StageContext {
    pub fn new(raw: Arc<Frame>) -> Self {
        Self {
            raw,
            detections: Vec::new(),
        }
    }
}

/// One step of the main processing path.
pub trait PipelineStage: Send + Sync {
    /// Canonical stage name, used for history buffers and tap attach points.
    fn name(&self) -> &str;
    fn process(&self, input: &Frame, ctx: &mut StageContext) -> Result<Frame>;
}

/// Preprocessing step delegating to a [`Preprocessor`] capability.
pub struct PreprocessStage {
    preprocessor: Arc<dyn Preprocessor>,
}

impl PreprocessStage {
    pub fn new(preprocessor: Arc<dyn Preprocessor>) -> Self {
        Self { preprocessor }
    }
}

impl PipelineStage for PreprocessStage {
    fn name(&self) -> &str {
        STAGE_PREPROCESS
    }

    fn process(&self, input: &Frame, _ctx: &mut StageContext) -> Result<Frame> {
        self.preprocessor.preprocess(input)
    }
}

/// Detection step: records detections in the context and passes the frame
/// through unchanged.
pub struct DetectStage {
    detector: Arc<dyn TagDetector>,
}

impl DetectStage {
    pub fn new(detector: Arc<dyn TagDetector>) -> Self {
        Self { detector }
    }
}

impl PipelineStage for DetectStage {
    fn name(&self) -> &str {
        STAGE_DETECT
    }

    fn process(&self, input: &Frame, ctx: &mut StageContext) -> Result<Frame> {
        ctx.detections = self.detector.detect(input)?;
        Ok(input.clone())
    }
}

/// Overlay step: draws the detections collected so far onto the raw frame.
pub struct OverlayStage {
    detector: Arc<dyn TagDetector>,
}

impl OverlayStage {
    pub fn new(detector: Arc<dyn TagDetector>) -> Self {
        Self { detector }
    }
}

impl PipelineStage for OverlayStage {
    fn name(&self) -> &str {
        STAGE_OVERLAY
    }

    fn process(&self, _input: &Frame, ctx: &mut StageContext) -> Result<Frame> {
        self.detector.draw_overlay(&ctx.raw, &ctx.detections)
    }
}
