use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::stage::{FrameConsumer, PipelineStage, StageContext, SOURCE_ATTACH_POINT, STAGE_RAW};
use crate::types::{Detection, Frame, StageFrame};

/// Frames retained per stage.
const HISTORY_DEPTH: usize = 3;

/// Detection summary log cadence, in processed frames.
const SUMMARY_INTERVAL: u64 = 100;

/// Outcome of running one frame through the stage chain.
pub struct FrameOutput {
    pub raw: Arc<StageFrame>,
    /// Output of the last stage that ran; the raw frame when no stage did.
    pub last: Arc<StageFrame>,
    /// False when a stage failed and the rest of the chain was skipped.
    pub completed: bool,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TagMetrics {
    pub count: u64,
    pub detection_rate_percent: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineMetrics {
    pub frames_processed: u64,
    pub total_detections: u64,
    pub frames_with_detections: u64,
    pub detection_rate_percent: f64,
    pub tags: BTreeMap<u32, TagMetrics>,
}

struct TagStats {
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct DetectionStats {
    frames_processed: u64,
    total_detections: u64,
    frames_with_detections: u64,
    tags: BTreeMap<u32, TagStats>,
}

/// The frame-processing engine: a fixed stage chain with per-stage history
/// buffers, side-consumer fan-out, and detection statistics.
///
/// All methods take `&self`; the pipeline is shared behind an `Arc` between
/// the consumer thread and inspection callers.
pub struct VisionPipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    /// Consumers keyed by attach point: `__source__` or a canonical stage
    /// name on the chain.
    consumers: HashMap<String, Vec<Arc<dyn FrameConsumer>>>,
    history: Mutex<HashMap<String, VecDeque<Arc<StageFrame>>>>,
    latest_detections: Mutex<Vec<Detection>>,
    stats: Mutex<DetectionStats>,
}

impl VisionPipeline {
    pub fn new(
        stages: Vec<Box<dyn PipelineStage>>,
        consumers: HashMap<String, Vec<Arc<dyn FrameConsumer>>>,
    ) -> Self {
        Self {
            stages,
            consumers,
            history: Mutex::new(HashMap::new()),
            latest_detections: Mutex::new(Vec::new()),
            stats: Mutex::new(DetectionStats::default()),
        }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one frame through the chain.
    ///
    /// A stage failure drops the remainder of the chain for this frame only;
    /// the frame still counts and everything produced so far is kept.
    pub fn process_frame(&self, raw: Frame) -> FrameOutput {
        let raw_arc = Arc::new(raw);
        let raw_stage = Arc::new(StageFrame::new(STAGE_RAW, raw_arc.clone()));
        self.record(STAGE_RAW, raw_stage.clone());
        self.dispatch(SOURCE_ATTACH_POINT, &raw_arc);

        let mut ctx = StageContext::new(raw_arc.clone());
        // The chain runs single-channel; `ctx.raw` keeps the original for
        // the overlay.
        let mut current = Arc::new(raw_arc.to_gray());
        let mut last = raw_stage.clone();
        let mut completed = true;

        for stage in &self.stages {
            match stage.process(&current, &mut ctx) {
                Ok(output) => {
                    current = Arc::new(output);
                    let stage_frame = Arc::new(StageFrame::new(stage.name(), current.clone()));
                    self.record(stage.name(), stage_frame.clone());
                    self.dispatch(stage.name(), &current);
                    last = stage_frame;
                }
                Err(err) => {
                    warn!(stage = stage.name(), error = %err, "stage failed, skipping rest of chain");
                    completed = false;
                    break;
                }
            }
        }

        let detections = ctx.detections;
        *self.latest_detections.lock().unwrap_or_else(|e| e.into_inner()) = detections.clone();
        self.update_stats(&detections);

        FrameOutput {
            raw: raw_stage,
            last,
            completed,
            detections,
        }
    }

    fn record(&self, stage: &str, frame: Arc<StageFrame>) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = history.entry(stage.to_string()).or_default();
        if buffer.len() >= HISTORY_DEPTH {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    fn dispatch(&self, attach_point: &str, frame: &Arc<Frame>) {
        if let Some(consumers) = self.consumers.get(attach_point) {
            for consumer in consumers {
                consumer.push_frame(frame);
            }
        }
    }

    fn update_stats(&self, detections: &[Detection]) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.frames_processed += 1;
        stats.total_detections += detections.len() as u64;
        if !detections.is_empty() {
            stats.frames_with_detections += 1;
        }
        let now = Utc::now();
        for detection in detections {
            let tag = stats.tags.entry(detection.tag_id).or_insert_with(|| TagStats {
                count: 0,
                first_seen: now,
                last_seen: now,
            });
            tag.count += 1;
            tag.last_seen = now;
        }

        if stats.frames_processed % SUMMARY_INTERVAL == 0 {
            let rate =
                100.0 * stats.frames_with_detections as f64 / stats.frames_processed as f64;
            info!(
                frames = stats.frames_processed,
                detections = stats.total_detections,
                detection_rate_percent = format!("{rate:.1}").as_str(),
                unique_tags = stats.tags.len(),
                "detection summary"
            );
        } else {
            debug!(detections = detections.len(), "frame processed");
        }
    }

    /// Most recent frame for a stage (`raw` included).
    pub fn latest_frame(&self, stage: &str) -> Option<Arc<StageFrame>> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stage)
            .and_then(|buffer| buffer.back().cloned())
    }

    /// Retained frames for a stage, oldest first.
    pub fn frame_history(&self, stage: &str) -> Vec<Arc<StageFrame>> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(stage)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest_detections(&self) -> Vec<Detection> {
        self.latest_detections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let rate = if stats.frames_processed == 0 {
            0.0
        } else {
            100.0 * stats.frames_with_detections as f64 / stats.frames_processed as f64
        };
        let tags = stats
            .tags
            .iter()
            .map(|(&tag_id, tag)| {
                let tag_rate = if stats.frames_processed == 0 {
                    0.0
                } else {
                    100.0 * tag.count as f64 / stats.frames_processed as f64
                };
                (
                    tag_id,
                    TagMetrics {
                        count: tag.count,
                        detection_rate_percent: tag_rate,
                        first_seen: tag.first_seen,
                        last_seen: tag.last_seen,
                    },
                )
            })
            .collect();
        PipelineMetrics {
            frames_processed: stats.frames_processed,
            total_detections: stats.total_detections,
            frames_with_detections: stats.frames_with_detections,
            detection_rate_percent: rate,
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;
    use crate::stage::tests::{PassthroughPreprocessor, ScriptedDetector};
    use crate::stage::{DetectStage, OverlayStage, PreprocessStage, STAGE_DETECT, STAGE_OVERLAY, STAGE_PREPROCESS};

    struct RecordingConsumer {
        id: String,
        frames: Mutex<Vec<Arc<Frame>>>,
    }

    impl RecordingConsumer {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameConsumer for RecordingConsumer {
        fn consumer_id(&self) -> &str {
            &self.id
        }

        fn push_frame(&self, frame: &Arc<Frame>) {
            self.frames.lock().unwrap().push(frame.clone());
        }
    }

    struct FailingStage;

    impl PipelineStage for FailingStage {
        fn name(&self) -> &str {
            STAGE_PREPROCESS
        }

        fn process(&self, _input: &Frame, _ctx: &mut StageContext) -> anyhow::Result<Frame> {
            bail!("preprocess exploded")
        }
    }

    fn test_frame() -> Frame {
        Frame::Rgb8 {
            data: vec![0; 4 * 4 * 3],
            width: 4,
            height: 4,
        }
    }

    fn full_pipeline(detector: Arc<ScriptedDetector>) -> VisionPipeline {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(PreprocessStage::new(Arc::new(PassthroughPreprocessor::new()))),
            Box::new(DetectStage::new(detector.clone())),
            Box::new(OverlayStage::new(detector)),
        ];
        VisionPipeline::new(stages, HashMap::new())
    }

    struct InputRecordingDetector {
        inputs: Mutex<Vec<Frame>>,
    }

    impl InputRecordingDetector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inputs: Mutex::new(Vec::new()),
            })
        }
    }

    impl crate::stage::TagDetector for InputRecordingDetector {
        fn detect(&self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            self.inputs.lock().unwrap().push(frame.clone());
            Ok(Vec::new())
        }

        fn draw_overlay(&self, frame: &Frame, _detections: &[Detection]) -> anyhow::Result<Frame> {
            Ok(frame.clone())
        }
    }

    #[test]
    fn test_stages_receive_single_channel_input() {
        let detector = InputRecordingDetector::new();
        let stages: Vec<Box<dyn PipelineStage>> =
            vec![Box::new(DetectStage::new(detector.clone()))];
        let pipeline = VisionPipeline::new(stages, HashMap::new());

        // RGB capture, no preprocess stage in front of the detector.
        pipeline.process_frame(test_frame());

        let inputs = detector.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(matches!(inputs[0], Frame::Gray8 { .. }));
    }

    #[test]
    fn test_full_chain_produces_all_stage_frames() {
        let pipeline = full_pipeline(Arc::new(ScriptedDetector::with_tag(11)));
        let output = pipeline.process_frame(test_frame());

        assert!(output.completed);
        assert_eq!(output.detections.len(), 1);
        assert_eq!(output.last.stage, STAGE_OVERLAY);
        assert!(pipeline.latest_frame(STAGE_RAW).is_some());
        assert!(pipeline.latest_frame(STAGE_PREPROCESS).is_some());
        assert!(pipeline.latest_frame(STAGE_DETECT).is_some());
        assert!(pipeline.latest_frame(STAGE_OVERLAY).is_some());
    }

    #[test]
    fn test_history_bounded_at_three() {
        let pipeline = full_pipeline(Arc::new(ScriptedDetector::empty()));
        for _ in 0..5 {
            pipeline.process_frame(test_frame());
        }
        assert_eq!(pipeline.frame_history(STAGE_RAW).len(), 3);
        assert_eq!(pipeline.frame_history(STAGE_OVERLAY).len(), 3);
    }

    #[test]
    fn test_stage_failure_is_partial_not_fatal() {
        let stages: Vec<Box<dyn PipelineStage>> = vec![
            Box::new(FailingStage),
            Box::new(DetectStage::new(Arc::new(ScriptedDetector::with_tag(1)))),
        ];
        let pipeline = VisionPipeline::new(stages, HashMap::new());

        let output = pipeline.process_frame(test_frame());
        assert!(!output.completed);
        assert_eq!(output.last.stage, STAGE_RAW);
        // Detect never ran, so no detections were recorded.
        assert!(output.detections.is_empty());
        // The frame still counts.
        assert_eq!(pipeline.metrics().frames_processed, 1);

        // The next frame processes normally again.
        let output = pipeline.process_frame(test_frame());
        assert!(!output.completed);
        assert_eq!(pipeline.metrics().frames_processed, 2);
    }

    #[test]
    fn test_source_consumers_receive_raw_frames() {
        let tap = RecordingConsumer::new("tap1");
        let stage_tap = RecordingConsumer::new("tap2");
        let mut consumers: HashMap<String, Vec<Arc<dyn FrameConsumer>>> = HashMap::new();
        consumers.insert(SOURCE_ATTACH_POINT.to_string(), vec![tap.clone()]);
        consumers.insert(STAGE_DETECT.to_string(), vec![stage_tap.clone()]);

        let detector = Arc::new(ScriptedDetector::empty());
        let stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(DetectStage::new(detector))];
        let pipeline = VisionPipeline::new(stages, consumers);

        pipeline.process_frame(test_frame());
        pipeline.process_frame(test_frame());

        assert_eq!(tap.count(), 2);
        assert_eq!(stage_tap.count(), 2);
    }

    #[test]
    fn test_metrics_track_detection_rates() {
        let detector = Arc::new(ScriptedDetector::with_tag(5));
        let with_detections = full_pipeline(detector);
        let no_detections = full_pipeline(Arc::new(ScriptedDetector::empty()));

        for _ in 0..4 {
            with_detections.process_frame(test_frame());
        }
        no_detections.process_frame(test_frame());

        let metrics = with_detections.metrics();
        assert_eq!(metrics.frames_processed, 4);
        assert_eq!(metrics.total_detections, 4);
        assert_eq!(metrics.detection_rate_percent, 100.0);
        assert_eq!(metrics.tags.get(&5).unwrap().count, 4);

        let metrics = no_detections.metrics();
        assert_eq!(metrics.frames_processed, 1);
        assert_eq!(metrics.detection_rate_percent, 0.0);
        assert!(metrics.tags.is_empty());
    }

    #[test]
    fn test_tag_metrics_track_first_and_last_seen() {
        let pipeline = full_pipeline(Arc::new(ScriptedDetector::with_tag(5)));
        pipeline.process_frame(test_frame());
        let first = pipeline.metrics().tags.get(&5).unwrap().clone();
        assert!(first.first_seen <= first.last_seen);

        std::thread::sleep(std::time::Duration::from_millis(5));
        pipeline.process_frame(test_frame());

        let tag = pipeline.metrics().tags.get(&5).unwrap().clone();
        assert_eq!(tag.count, 2);
        // The first sighting is pinned; only the last one advances.
        assert_eq!(tag.first_seen, first.first_seen);
        assert!(tag.last_seen > first.last_seen);
    }

    #[test]
    fn test_latest_detections_replaced_each_frame() {
        let pipeline = full_pipeline(Arc::new(ScriptedDetector::with_tag(9)));
        pipeline.process_frame(test_frame());
        assert_eq!(pipeline.latest_detections()[0].tag_id, 9);

        let empty = full_pipeline(Arc::new(ScriptedDetector::empty()));
        empty.process_frame(test_frame());
        assert!(empty.latest_detections().is_empty());
    }
}
