use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compile::ExecutionPlan;
use crate::graph::{NodeConfig, PipelineGraph, SinkKind};
use crate::pipeline::VisionPipeline;
use crate::registry::{ExecutionKind, StageRegistry};
use crate::sink::{SaveImageMode, SaveImageSink, SaveSink, SaveVideoSink};
use crate::stage::{
    DetectStage, FrameConsumer, OverlayStage, PipelineStage, PreprocessConfig, PreprocessStage,
    Preprocessor, TagDetector, SOURCE_ATTACH_POINT,
};

pub const DEFAULT_TAG_FAMILY: &str = "tag36h11";
const DEFAULT_SAVE_FPS: f64 = 30.0;

/// Resolves stage kinds to concrete capability implementations.
///
/// The core never picks detection or preprocessing algorithms itself; hosts
/// supply them through this trait.
pub trait BuildContext: Send + Sync {
    fn create_preprocessor(
        &self,
        execution: ExecutionKind,
        config: &PreprocessConfig,
    ) -> Result<Arc<dyn Preprocessor>>;

    fn create_detector(&self, family: &str) -> Result<Arc<dyn TagDetector>>;
}

/// Everything a running instance needs: the engine plus the side sinks that
/// must be registered (taps) and closed (save sinks) around its lifetime.
pub struct BuiltPipeline {
    pub pipeline: Arc<VisionPipeline>,
    pub stream_taps: Vec<Arc<crate::tap::StreamTap>>,
    pub save_sinks: Vec<Arc<dyn SaveSink>>,
}

impl std::fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("stream_taps", &self.stream_taps.len())
            .field("save_sinks", &self.save_sinks.len())
            .finish()
    }
}

/// Assemble a runnable pipeline from a compiled plan.
///
/// Walks the main path creating one stage per stage node, then wires each
/// side tap to its attach point. A plan whose graph defines no stream tap
/// gets a synthesized `preview` tap on the source so there is always
/// something to watch.
pub fn build_pipeline(
    graph: &PipelineGraph,
    plan: &ExecutionPlan,
    registry: &StageRegistry,
    ctx: &dyn BuildContext,
    save_dir: &Path,
) -> Result<BuiltPipeline> {
    let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
    // Node id -> attach point name, for side-tap resolution.
    let mut attach_names: HashMap<&str, String> = HashMap::new();
    let mut detector: Option<Arc<dyn TagDetector>> = None;
    let tag_family = tag_family(graph, plan);

    for (position, node_id) in plan.main_path.iter().enumerate() {
        let node = graph
            .node_by_id(node_id)
            .with_context(|| format!("plan references unknown node '{node_id}'"))?;

        if position == 0 {
            attach_names.insert(node_id.as_str(), SOURCE_ATTACH_POINT.to_string());
            continue;
        }
        if node.kind.sink_kind().is_some() {
            continue;
        }
        let Some(stage_id) = node.kind.stage_id() else {
            bail!("main path node '{node_id}' is neither a stage nor a sink");
        };
        let descriptor = registry
            .get_stage(stage_id)
            .with_context(|| format!("unknown stage kind '{stage_id}'"))?;

        let stage: Box<dyn PipelineStage> = match stage_id {
            "preprocess_cpu" | "preprocess_gpu" => {
                let config = PreprocessConfig::from_node_config(node.kind.config());
                let preprocessor = ctx
                    .create_preprocessor(descriptor.execution, &config)
                    .with_context(|| format!("creating preprocessor for node '{node_id}'"))?;
                Box::new(PreprocessStage::new(preprocessor))
            }
            "detect_apriltag_cpu" => Box::new(DetectStage::new(resolve_detector(
                &mut detector,
                ctx,
                &tag_family,
            )?)),
            "overlay_cpu" => Box::new(OverlayStage::new(resolve_detector(
                &mut detector,
                ctx,
                &tag_family,
            )?)),
            other => bail!("no runtime implementation for stage kind '{other}'"),
        };
        attach_names.insert(node_id.as_str(), stage.name().to_string());
        stages.push(stage);
    }

    let mut consumers: HashMap<String, Vec<Arc<dyn FrameConsumer>>> = HashMap::new();
    let mut stream_taps = Vec::new();
    let mut save_sinks: Vec<Arc<dyn SaveSink>> = Vec::new();

    for tap in &plan.side_taps {
        let attach = attach_names
            .get(tap.attach_point.as_str())
            .with_context(|| {
                format!(
                    "side tap '{}' attaches to '{}', which is not on the pipeline",
                    tap.node_id, tap.attach_point
                )
            })?
            .clone();
        let config = plan.node_config(&tap.node_id);

        let consumer: Arc<dyn FrameConsumer> = match tap.sink {
            SinkKind::StreamTap => {
                let stream_tap = crate::tap::StreamTap::new(tap.node_id.clone(), attach.clone());
                stream_taps.push(stream_tap.clone());
                stream_tap
            }
            SinkKind::SaveVideo => {
                let path = resolve_output_path(config, save_dir, "mp4");
                let fps = config
                    .and_then(|c| c.get("fps"))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(DEFAULT_SAVE_FPS);
                let sink = SaveVideoSink::new(tap.node_id.clone(), attach.clone(), path, fps);
                save_sinks.push(sink.clone());
                sink
            }
            SinkKind::SaveImage => {
                let path = resolve_output_path(config, save_dir, "jpg");
                let mode = config
                    .and_then(|c| c.get("mode"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(SaveImageMode::Overwrite);
                let sink = SaveImageSink::new(tap.node_id.clone(), attach.clone(), path, mode);
                save_sinks.push(sink.clone());
                sink
            }
            SinkKind::TerminalOutput => continue,
        };
        debug!(
            consumer = consumer.consumer_id(),
            attach = attach.as_str(),
            "wired side sink"
        );
        consumers.entry(attach).or_default().push(consumer);
    }

    if stream_taps.is_empty() {
        let preview = crate::tap::StreamTap::new("preview", SOURCE_ATTACH_POINT);
        consumers
            .entry(SOURCE_ATTACH_POINT.to_string())
            .or_default()
            .push(preview.clone());
        stream_taps.push(preview);
        debug!("no stream tap in graph, synthesized 'preview' on the source");
    }

    info!(
        stages = stages.len(),
        taps = stream_taps.len(),
        sinks = save_sinks.len(),
        "pipeline built"
    );

    Ok(BuiltPipeline {
        pipeline: Arc::new(VisionPipeline::new(stages, consumers)),
        stream_taps,
        save_sinks,
    })
}

fn resolve_detector(
    slot: &mut Option<Arc<dyn TagDetector>>,
    ctx: &dyn BuildContext,
    family: &str,
) -> Result<Arc<dyn TagDetector>> {
    if let Some(detector) = slot {
        return Ok(detector.clone());
    }
    let detector = ctx
        .create_detector(family)
        .with_context(|| format!("creating detector for family '{family}'"))?;
    *slot = Some(detector.clone());
    Ok(detector)
}

/// The tag family comes from the first detect node on the main path.
fn tag_family(graph: &PipelineGraph, plan: &ExecutionPlan) -> String {
    plan.main_path
        .iter()
        .filter_map(|id| graph.node_by_id(id))
        .find(|n| n.kind.stage_id() == Some("detect_apriltag_cpu"))
        .and_then(|n| n.kind.config().get("tag_family"))
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_TAG_FAMILY)
        .to_string()
}

/// Absolute configured paths are honored as-is; relative or missing paths
/// land in the save dir, missing ones under a randomized name.
fn resolve_output_path(config: Option<&NodeConfig>, save_dir: &Path, extension: &str) -> PathBuf {
    match config.and_then(|c| c.get("path")).and_then(|v| v.as_str()) {
        Some(path) => {
            let path = Path::new(path);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                save_dir.join(path)
            }
        }
        None => save_dir.join(format!("capture_{}.{extension}", Uuid::new_v4())),
    }
}
