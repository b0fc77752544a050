use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::builder::{build_pipeline, BuildContext};
use crate::camera::{CameraDevice, CameraManager, CameraMetrics, CameraSettings};
use crate::compile::compile;
use crate::error::StartError;
use crate::graph::{PipelineGraph, SourceKind};
use crate::media::{probe_video, read_first_frame, VideoFileReader, VideoProbe};
use crate::pipeline::{PipelineMetrics, VisionPipeline};
use crate::registry::StageRegistry;
use crate::service::CameraService;
use crate::sink::SaveSink;
use crate::tap::{StreamTap, StreamTapRegistry, TapFrameMessage, TapMetrics};
use crate::types::Frame;

/// Replay rate for still-image sources.
const IMAGE_REPLAY_FPS: f64 = 2.0;

/// Algorithm id recorded for instances started from an inline graph.
pub const INLINE_ALGORITHM_ID: &str = "__inline__";

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const WORKER_JOIN_POLL: Duration = Duration::from_millis(10);

/// Pipeline graphs persisted as JSON files, one per algorithm id.
pub struct AlgorithmStore {
    dir: PathBuf,
}

impl AlgorithmStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn check_id(id: &str) -> Result<()> {
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("invalid algorithm id '{id}'");
        }
        Ok(())
    }

    pub fn save(&self, id: &str, graph: &PipelineGraph) -> Result<()> {
        Self::check_id(id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(graph)?;
        let path = self.path_for(id);
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        debug!(algorithm_id = id, path = %path.display(), "algorithm saved");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<PipelineGraph>> {
        Self::check_id(id)?;
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let graph = serde_json::from_str(&json)
            .with_context(|| format!("invalid algorithm file {}", path.display()))?;
        Ok(Some(graph))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        Self::check_id(id)?;
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("failed to delete {}", path.display()))?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
}

/// A started pipeline bound to its target.
pub struct PipelineInstance {
    pub instance_id: String,
    pub algorithm_id: String,
    pub target: String,
    pub pipeline: Option<Arc<VisionPipeline>>,
    state: Arc<Mutex<InstanceState>>,
}

impl PipelineInstance {
    pub fn state(&self) -> InstanceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum InstanceKind {
    Camera { camera_id: String },
    File { stop: Sender<()>, handle: JoinHandle<()> },
}

struct InstanceEntry {
    instance: PipelineInstance,
    save_sinks: Vec<Arc<dyn SaveSink>>,
    kind: InstanceKind,
}

/// One row of [`VisionPipelineManager::list_instances`].
#[derive(Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub algorithm_id: String,
    pub target: String,
    pub state: InstanceState,
    pub pipeline: Option<PipelineMetrics>,
    pub camera: Option<CameraMetrics>,
    pub taps: Vec<TapMetrics>,
}

/// Owns pipeline instances and the cameras they attach to.
///
/// Camera-source graphs attach to an already-open camera and reuse its
/// capture/consumer threads; file-source graphs get a dedicated worker
/// thread that paces frames from the file.
pub struct VisionPipelineManager {
    registry: StageRegistry,
    build_ctx: Arc<dyn BuildContext>,
    algorithms: AlgorithmStore,
    service: Arc<CameraService>,
    instances: DashMap<String, InstanceEntry>,
    taps: StreamTapRegistry,
    save_dir: PathBuf,
    media_dirs: Vec<PathBuf>,
}

impl VisionPipelineManager {
    pub fn new(
        registry: StageRegistry,
        build_ctx: Arc<dyn BuildContext>,
        algorithms_dir: impl Into<PathBuf>,
        save_dir: impl Into<PathBuf>,
        media_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            registry,
            build_ctx,
            algorithms: AlgorithmStore::new(algorithms_dir),
            service: Arc::new(CameraService::new()),
            instances: DashMap::new(),
            taps: StreamTapRegistry::new(),
            save_dir: save_dir.into(),
            media_dirs,
        }
    }

    pub fn algorithms(&self) -> &AlgorithmStore {
        &self.algorithms
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Open a camera and register it with the shared capture/consumer
    /// service.
    pub fn open_camera(
        &self,
        camera_id: &str,
        device: Box<dyn CameraDevice>,
        device_path: &str,
        settings: &CameraSettings,
    ) -> Result<()> {
        if self.service.manager(camera_id).is_some() {
            bail!("camera '{camera_id}' is already open");
        }
        let manager = Arc::new(CameraManager::new(device));
        manager.open(device_path, settings)?;
        self.service.open_camera(camera_id, manager)
    }

    /// Stop any attached pipeline, then unregister and close the device.
    pub fn close_camera(&self, camera_id: &str) -> Result<()> {
        if self.instances.contains_key(camera_id) {
            self.stop(camera_id)?;
        }
        self.service.close_camera(camera_id)
    }

    pub fn camera(&self, camera_id: &str) -> Option<Arc<CameraManager>> {
        self.service.manager(camera_id)
    }

    pub fn open_cameras(&self) -> Vec<String> {
        self.service.camera_ids()
    }

    /// Start a stored algorithm against a target (camera id or media file
    /// name). Returns the instance id: the camera id for camera sources, a
    /// fresh uuid for file sources.
    pub fn start(&self, algorithm_id: &str, target: &str) -> Result<String, StartError> {
        let graph = self
            .algorithms
            .load(algorithm_id)
            .map_err(|e| StartError::BuildFailed(format!("{e:#}")))?
            .ok_or_else(|| StartError::AlgorithmNotFound(algorithm_id.to_string()))?;
        self.start_compiled(algorithm_id, &graph, target)
    }

    /// Start a graph supplied inline, without persisting it first.
    pub fn start_graph(&self, graph: &PipelineGraph, target: &str) -> Result<String, StartError> {
        self.start_compiled(INLINE_ALGORITHM_ID, graph, target)
    }

    fn start_compiled(
        &self,
        algorithm_id: &str,
        graph: &PipelineGraph,
        target: &str,
    ) -> Result<String, StartError> {
        let plan = compile(graph)?;

        let source_kind = plan
            .source_id()
            .and_then(|id| graph.node_by_id(id))
            .and_then(|node| node.kind.source_kind())
            .ok_or_else(|| StartError::BuildFailed("plan has no source node".to_string()))?;

        match source_kind {
            SourceKind::Camera => self.start_on_camera(algorithm_id, target, graph, plan),
            SourceKind::VideoFile | SourceKind::ImageFile => {
                self.start_on_file(algorithm_id, target, graph, plan, source_kind)
            }
        }
    }

    fn start_on_camera(
        &self,
        algorithm_id: &str,
        target: &str,
        graph: &PipelineGraph,
        plan: crate::compile::ExecutionPlan,
    ) -> Result<String, StartError> {
        // The source node may pin a camera id; otherwise the start target
        // names the camera.
        let camera_id = plan
            .source_id()
            .and_then(|id| plan.node_config(id))
            .and_then(|config| config.get("camera_id"))
            .and_then(Value::as_str)
            .unwrap_or(target)
            .to_string();

        let camera = match self.service.manager(&camera_id) {
            Some(camera) if camera.is_open() => camera,
            _ => {
                // A closed camera target that names an existing media file
                // points at a graph/target mismatch, not a missing camera.
                if self.resolve_media_path(target).is_some() {
                    return Err(StartError::NoFileSource(target.to_string()));
                }
                return Err(StartError::CameraNotOpen(camera_id));
            }
        };

        if self.instances.contains_key(&camera_id) {
            return Err(StartError::BuildFailed(format!(
                "camera '{camera_id}' already has a running pipeline"
            )));
        }

        let built = build_pipeline(
            graph,
            &plan,
            &self.registry,
            self.build_ctx.as_ref(),
            &self.save_dir,
        )
        .map_err(|e| StartError::BuildFailed(format!("{e:#}")))?;

        let instance_id = camera_id.clone();
        for tap in &built.stream_taps {
            self.taps.register(&instance_id, tap.clone());
        }
        camera.attach_pipeline(built.pipeline.clone());

        self.instances.insert(
            instance_id.clone(),
            InstanceEntry {
                instance: PipelineInstance {
                    instance_id: instance_id.clone(),
                    algorithm_id: algorithm_id.to_string(),
                    target: target.to_string(),
                    pipeline: Some(built.pipeline),
                    state: Arc::new(Mutex::new(InstanceState::Running)),
                },
                save_sinks: built.save_sinks,
                kind: InstanceKind::Camera { camera_id },
            },
        );
        info!(instance_id = instance_id.as_str(), algorithm_id, "pipeline started on camera");
        Ok(instance_id)
    }

    fn start_on_file(
        &self,
        algorithm_id: &str,
        target: &str,
        graph: &PipelineGraph,
        plan: crate::compile::ExecutionPlan,
        source_kind: SourceKind,
    ) -> Result<String, StartError> {
        let path = self
            .resolve_media_path(target)
            .ok_or_else(|| StartError::FileNotFound(target.to_string()))?;

        // Probe up front so an unreadable video fails the start, not the
        // worker thread.
        let probe = match source_kind {
            SourceKind::VideoFile => Some(
                probe_video(&path).map_err(|e| StartError::BuildFailed(format!("{e:#}")))?,
            ),
            _ => None,
        };

        let built = build_pipeline(
            graph,
            &plan,
            &self.registry,
            self.build_ctx.as_ref(),
            &self.save_dir,
        )
        .map_err(|e| StartError::BuildFailed(format!("{e:#}")))?;

        let instance_id = Uuid::new_v4().to_string();
        for tap in &built.stream_taps {
            self.taps.register(&instance_id, tap.clone());
        }

        let state = Arc::new(Mutex::new(InstanceState::Running));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let pipeline = built.pipeline.clone();
        let worker_state = state.clone();
        let handle = thread::Builder::new()
            .name(format!("file-{instance_id}"))
            .spawn(move || match probe {
                Some(probe) => video_worker(&path, probe, pipeline, stop_rx, worker_state),
                None => image_worker(&path, pipeline, stop_rx, worker_state),
            })
            .map_err(|e| StartError::BuildFailed(e.to_string()))?;

        self.instances.insert(
            instance_id.clone(),
            InstanceEntry {
                instance: PipelineInstance {
                    instance_id: instance_id.clone(),
                    algorithm_id: algorithm_id.to_string(),
                    target: target.to_string(),
                    pipeline: Some(built.pipeline),
                    state,
                },
                save_sinks: built.save_sinks,
                kind: InstanceKind::File {
                    stop: stop_tx,
                    handle,
                },
            },
        );
        info!(instance_id = instance_id.as_str(), algorithm_id, target, "pipeline started on file");
        Ok(instance_id)
    }

    /// Stop an instance: detach from its camera or join its file worker,
    /// then unregister taps and close save sinks.
    pub fn stop(&self, instance_id: &str) -> Result<()> {
        let Some((_, entry)) = self.instances.remove(instance_id) else {
            bail!("no pipeline instance '{instance_id}'");
        };

        match entry.kind {
            InstanceKind::Camera { camera_id } => {
                if let Some(camera) = self.service.manager(&camera_id) {
                    camera.detach_pipeline();
                }
            }
            InstanceKind::File { stop, handle } => {
                let _ = stop.send(());
                let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
                while !handle.is_finished() {
                    if Instant::now() >= deadline {
                        warn!(instance_id, "file worker did not stop in time, detaching");
                        break;
                    }
                    thread::sleep(WORKER_JOIN_POLL);
                }
                if handle.is_finished() && handle.join().is_err() {
                    warn!(instance_id, "file worker panicked");
                }
            }
        }

        for sink in &entry.save_sinks {
            sink.close();
        }
        let taps = self.taps.unregister_instance(instance_id);
        *entry
            .instance
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = InstanceState::Stopped;
        info!(instance_id, taps, "pipeline stopped");
        Ok(())
    }

    /// Stop every instance, then close every camera.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(err) = self.stop(&id) {
                warn!(instance_id = id.as_str(), error = %err, "failed to stop instance");
            }
        }
        for id in self.service.camera_ids() {
            if let Err(err) = self.close_camera(&id) {
                warn!(camera_id = id.as_str(), error = %err, "failed to close camera");
            }
        }
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        let mut summaries: Vec<InstanceSummary> = self
            .instances
            .iter()
            .map(|entry| {
                let instance = &entry.instance;
                let camera = match &entry.kind {
                    InstanceKind::Camera { camera_id } => {
                        self.service.manager(camera_id).map(|m| m.metrics())
                    }
                    InstanceKind::File { .. } => None,
                };
                InstanceSummary {
                    instance_id: instance.instance_id.clone(),
                    algorithm_id: instance.algorithm_id.clone(),
                    target: instance.target.clone(),
                    state: instance.state(),
                    pipeline: instance.pipeline.as_ref().map(|p| p.metrics()),
                    camera,
                    taps: self.taps.instance_metrics(&instance.instance_id),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        summaries
    }

    pub fn get_stream_tap(&self, instance_id: &str, tap_id: &str) -> Option<Arc<StreamTap>> {
        self.taps.get(instance_id, tap_id)
    }

    /// Latest wire message for a tap, carrying the instance's current
    /// detections.
    pub fn tap_message(
        &self,
        instance_id: &str,
        tap_id: &str,
    ) -> Result<Option<TapFrameMessage>> {
        let Some(tap) = self.taps.get(instance_id, tap_id) else {
            return Ok(None);
        };
        let detections = self
            .instances
            .get(instance_id)
            .and_then(|entry| {
                entry
                    .instance
                    .pipeline
                    .as_ref()
                    .map(|p| p.latest_detections())
            })
            .unwrap_or_default();
        tap.latest_message(instance_id, detections)
    }

    /// Resolve a media target: absolute paths as-is, otherwise the first
    /// match across the configured media directories.
    fn resolve_media_path(&self, target: &str) -> Option<PathBuf> {
        let direct = Path::new(target);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        self.media_dirs
            .iter()
            .map(|dir| dir.join(target))
            .find(|candidate| candidate.is_file())
    }
}

fn video_worker(
    path: &Path,
    probe: VideoProbe,
    pipeline: Arc<VisionPipeline>,
    stop: Receiver<()>,
    state: Arc<Mutex<InstanceState>>,
) {
    let period = Duration::from_secs_f64(1.0 / probe.fps.max(1.0));
    match VideoFileReader::with_probe(path, probe) {
        Ok(mut reader) => loop {
            match stop.recv_timeout(period) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            match reader.next() {
                Some(Ok(frame)) => {
                    pipeline.process_frame(frame);
                }
                Some(Err(err)) => {
                    warn!(path = %path.display(), error = %err, "video read failed");
                    break;
                }
                None => {
                    debug!(path = %path.display(), "video playback finished");
                    break;
                }
            }
        },
        Err(err) => warn!(path = %path.display(), error = %err, "failed to open video"),
    }
    *state.lock().unwrap_or_else(|e| e.into_inner()) = InstanceState::Stopped;
}

fn image_worker(
    path: &Path,
    pipeline: Arc<VisionPipeline>,
    stop: Receiver<()>,
    state: Arc<Mutex<InstanceState>>,
) {
    match read_first_frame(path) {
        Ok(frame) => replay_worker(frame, IMAGE_REPLAY_FPS, pipeline, &stop),
        Err(err) => warn!(path = %path.display(), error = %err, "failed to decode image"),
    }
    *state.lock().unwrap_or_else(|e| e.into_inner()) = InstanceState::Stopped;
}

/// Re-process the same frame at a fixed rate until signalled to stop.
fn replay_worker(frame: Frame, fps: f64, pipeline: Arc<VisionPipeline>, stop: &Receiver<()>) {
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    loop {
        match stop.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        pipeline.process_frame(frame.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::FakeDevice;
    use crate::graph::tests::{edge, sink_node, source_node, stage_node};
    use crate::graph::SinkKind;
    use crate::registry::ExecutionKind;
    use crate::stage::tests::{PassthroughPreprocessor, ScriptedDetector};
    use crate::stage::{PreprocessConfig, Preprocessor, TagDetector};

    struct MockContext;

    impl BuildContext for MockContext {
        fn create_preprocessor(
            &self,
            _execution: ExecutionKind,
            _config: &PreprocessConfig,
        ) -> Result<Arc<dyn Preprocessor>> {
            Ok(Arc::new(PassthroughPreprocessor::new()))
        }

        fn create_detector(&self, _family: &str) -> Result<Arc<dyn TagDetector>> {
            Ok(Arc::new(ScriptedDetector::with_tag(3)))
        }
    }

    fn camera_graph() -> PipelineGraph {
        let mut g = PipelineGraph::new();
        g.add_node(source_node("cam")).unwrap();
        g.add_node(stage_node("det", "detect_apriltag_cpu")).unwrap();
        g.add_node(sink_node("out", SinkKind::TerminalOutput)).unwrap();
        g.add_edge("cam", "det", edge("e1")).unwrap();
        g.add_edge("det", "out", edge("e2")).unwrap();
        g
    }

    fn manager_in(dir: &Path) -> VisionPipelineManager {
        VisionPipelineManager::new(
            StageRegistry::builtin(),
            Arc::new(MockContext),
            dir.join("algorithms"),
            dir.join("captures"),
            vec![dir.join("media")],
        )
    }

    #[test]
    fn test_algorithm_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlgorithmStore::new(dir.path());

        assert!(store.load("demo").unwrap().is_none());
        store.save("demo", &camera_graph()).unwrap();
        let loaded = store.load("demo").unwrap().unwrap();
        assert_eq!(loaded.node_count(), 3);
        assert_eq!(store.list().unwrap(), vec!["demo".to_string()]);

        assert!(store.delete("demo").unwrap());
        assert!(!store.delete("demo").unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_algorithm_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlgorithmStore::new(dir.path());
        assert!(store.save("../escape", &camera_graph()).is_err());
        assert!(store.load("a/b").is_err());
    }

    #[test]
    fn test_start_unknown_algorithm() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        let err = manager.start("missing", "cam0").unwrap_err();
        assert!(matches!(err, StartError::AlgorithmNotFound(id) if id == "missing"));
    }

    #[test]
    fn test_start_invalid_graph() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let mut g = PipelineGraph::new();
        g.add_node(stage_node("det", "detect_apriltag_cpu")).unwrap();
        manager.algorithms().save("bad", &g).unwrap();

        let err = manager.start("bad", "cam0").unwrap_err();
        assert!(matches!(err, StartError::InvalidGraph(_)));
    }

    #[test]
    fn test_start_with_closed_camera() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager.algorithms().save("demo", &camera_graph()).unwrap();

        let err = manager.start("demo", "cam0").unwrap_err();
        assert!(matches!(err, StartError::CameraNotOpen(id) if id == "cam0"));
    }

    #[test]
    fn test_camera_target_naming_a_file_is_no_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        fs::create_dir_all(&media).unwrap();
        fs::write(media.join("clip.mp4"), b"not a real video").unwrap();

        let manager = manager_in(dir.path());
        manager.algorithms().save("demo", &camera_graph()).unwrap();

        let err = manager.start("demo", "clip.mp4").unwrap_err();
        assert!(matches!(err, StartError::NoFileSource(t) if t == "clip.mp4"));
    }

    #[test]
    fn test_file_source_with_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());

        let mut g = PipelineGraph::new();
        g.add_node(video_source_node("vid")).unwrap();
        g.add_node(sink_node("out", SinkKind::TerminalOutput)).unwrap();
        g.add_edge("vid", "out", edge("e1")).unwrap();
        manager.algorithms().save("filealg", &g).unwrap();

        let err = manager.start("filealg", "nope.mp4").unwrap_err();
        assert!(matches!(err, StartError::FileNotFound(t) if t == "nope.mp4"));
    }

    fn video_source_node(id: &str) -> crate::graph::GraphNode {
        crate::graph::GraphNode {
            id: id.to_string(),
            kind: crate::graph::NodeKind::Source {
                source: SourceKind::VideoFile,
                config: crate::graph::NodeConfig::new(),
            },
        }
    }

    #[test]
    fn test_camera_lifecycle_with_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager.algorithms().save("demo", &camera_graph()).unwrap();

        manager
            .open_camera(
                "cam0",
                Box::new(FakeDevice::new()),
                "/dev/video0",
                &CameraSettings::default(),
            )
            .unwrap();
        assert_eq!(manager.open_cameras(), vec!["cam0".to_string()]);

        let instance_id = manager.start("demo", "cam0").unwrap();
        assert_eq!(instance_id, "cam0");
        let camera = manager.camera("cam0").unwrap();
        assert!(camera.pipeline().is_some());

        // A second start on the same camera is rejected.
        assert!(manager.start("demo", "cam0").is_err());

        // With no explicit stream tap, the preview tap is synthesized.
        assert!(manager.get_stream_tap("cam0", "preview").is_some());

        let summaries = manager.list_instances();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].state, InstanceState::Running);
        assert!(summaries[0].camera.is_some());
        assert_eq!(summaries[0].taps.len(), 1);

        manager.stop("cam0").unwrap();
        assert!(camera.pipeline().is_none());
        assert!(manager.get_stream_tap("cam0", "preview").is_none());
        assert!(manager.list_instances().is_empty());

        // The camera stays open and streaming after the pipeline stops.
        assert!(camera.is_open());
        manager.close_camera("cam0").unwrap();
        assert!(manager.open_cameras().is_empty());
    }

    #[test]
    fn test_start_inline_graph_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager
            .open_camera(
                "cam0",
                Box::new(FakeDevice::new()),
                "/dev/video0",
                &CameraSettings::default(),
            )
            .unwrap();

        let instance_id = manager.start_graph(&camera_graph(), "cam0").unwrap();
        assert_eq!(instance_id, "cam0");

        let summaries = manager.list_instances();
        assert_eq!(summaries[0].algorithm_id, INLINE_ALGORITHM_ID);
        // Nothing landed in the store.
        assert!(manager.algorithms().list().unwrap().is_empty());

        manager.stop("cam0").unwrap();
        manager.close_camera("cam0").unwrap();
    }

    #[test]
    fn test_stop_unknown_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        assert!(manager.stop("nope").is_err());
    }

    #[test]
    fn test_close_camera_stops_its_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager.algorithms().save("demo", &camera_graph()).unwrap();
        manager
            .open_camera(
                "cam0",
                Box::new(FakeDevice::new()),
                "/dev/video0",
                &CameraSettings::default(),
            )
            .unwrap();
        manager.start("demo", "cam0").unwrap();

        manager.close_camera("cam0").unwrap();
        assert!(manager.list_instances().is_empty());
        assert!(manager.camera("cam0").is_none());
    }

    #[test]
    fn test_replay_worker_stops_within_join_timeout() {
        use crate::stage::{DetectStage, PipelineStage};

        let stages: Vec<Box<dyn PipelineStage>> =
            vec![Box::new(DetectStage::new(Arc::new(ScriptedDetector::with_tag(4))))];
        let pipeline = Arc::new(VisionPipeline::new(stages, std::collections::HashMap::new()));

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let worker_pipeline = pipeline.clone();
        let handle = thread::spawn(move || {
            let frame = Frame::Gray8 {
                data: vec![0; 16],
                width: 4,
                height: 4,
            };
            replay_worker(frame, 100.0, worker_pipeline, &stop_rx);
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while pipeline.metrics().frames_processed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(pipeline.metrics().frames_processed > 0);

        stop_tx.send(()).unwrap();
        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(WORKER_JOIN_POLL);
        }
        assert!(handle.is_finished());
        handle.join().unwrap();
    }

    #[test]
    fn test_tap_message_carries_detections() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path());
        manager.algorithms().save("demo", &camera_graph()).unwrap();
        manager
            .open_camera(
                "cam0",
                Box::new(FakeDevice::new()),
                "/dev/video0",
                &CameraSettings::default(),
            )
            .unwrap();
        manager.start("demo", "cam0").unwrap();

        let camera = manager.camera("cam0").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while camera
            .pipeline()
            .map(|p| p.metrics().frames_processed)
            .unwrap_or(0)
            == 0
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }

        let message = manager
            .tap_message("cam0", "preview")
            .unwrap()
            .expect("tap should have a frame");
        assert_eq!(message.instance_id, "cam0");
        assert_eq!(message.detections[0].tag_id, 3);
        assert!(!message.image_base64.is_empty());

        manager.shutdown();
    }
}
