use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pipeline::VisionPipeline;
use crate::types::Frame;

/// Processed frames retained for streaming consumers.
const PROCESSED_QUEUE_CAPACITY: usize = 10;

/// Frames older than this are considered stale for the fps estimate.
const STALE_FRAME_MS: u64 = 2_000;

const FPS_VERIFY_TOLERANCE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30.0,
            format: "YUYV".to_string(),
        }
    }
}

/// A capture device. Implementations are platform-specific; the manager
/// only ever talks to this trait.
pub trait CameraDevice: Send {
    fn open(&mut self, device_path: &str, settings: &CameraSettings) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// One capture attempt. `Ok(None)` means no frame was ready.
    fn capture_frame_raw(&mut self) -> Result<Option<Frame>>;
    /// Settings the device actually negotiated.
    fn actual_settings(&self) -> CameraSettings;
    fn apply_settings(&mut self, settings: &CameraSettings) -> Result<()>;
    fn apply_control_settings(
        &mut self,
        exposure: Option<i32>,
        gain: Option<f64>,
        saturation: Option<f64>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldMismatch {
    pub expected: String,
    pub actual: String,
}

/// Outcome of comparing requested settings against what the device
/// negotiated. fps tolerates a ±1 difference, everything else is exact.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SettingsVerification {
    pub verified: bool,
    pub expected: CameraSettings,
    pub actual: CameraSettings,
    pub mismatches: BTreeMap<String, FieldMismatch>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraMetrics {
    pub device_path: Option<String>,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub fps_estimate: f64,
    pub last_frame_age_ms: Option<u64>,
    pub settings: CameraSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraUseCase {
    StreamOnly,
    VisionPipeline,
}

#[derive(Default)]
struct CaptureCounters {
    frames_captured: u64,
    frames_dropped: u64,
    last_frame_at: Option<Instant>,
}

/// Per-camera state: the device handle, the single-slot raw frame exchange
/// between the capture and consumer threads, and the bounded processed
/// queue feeding stream viewers.
///
/// Frame policy is latest-wins everywhere: an unread raw frame is replaced
/// (counted as dropped), and the processed queue evicts its oldest entry
/// when full.
pub struct CameraManager {
    device: Mutex<Box<dyn CameraDevice>>,
    device_path: Mutex<Option<String>>,
    settings: Mutex<CameraSettings>,
    raw_slot: Mutex<Option<Frame>>,
    processed: Mutex<VecDeque<Arc<[u8]>>>,
    pipeline: Mutex<Option<Arc<VisionPipeline>>>,
    use_case: Mutex<CameraUseCase>,
    counters: Mutex<CaptureCounters>,
}

impl CameraManager {
    pub fn new(device: Box<dyn CameraDevice>) -> Self {
        Self {
            device: Mutex::new(device),
            device_path: Mutex::new(None),
            settings: Mutex::new(CameraSettings::default()),
            raw_slot: Mutex::new(None),
            processed: Mutex::new(VecDeque::with_capacity(PROCESSED_QUEUE_CAPACITY)),
            pipeline: Mutex::new(None),
            use_case: Mutex::new(CameraUseCase::StreamOnly),
            counters: Mutex::new(CaptureCounters::default()),
        }
    }

    pub fn open(&self, device_path: &str, settings: &CameraSettings) -> Result<()> {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if device.is_open() {
            bail!("camera already open on {device_path}");
        }
        device.open(device_path, settings)?;
        let actual = device.actual_settings();
        drop(device);

        *self.device_path.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(device_path.to_string());
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = actual.clone();
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = CaptureCounters::default();
        self.raw_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.processed.lock().unwrap_or_else(|e| e.into_inner()).clear();

        info!(
            device_path,
            width = actual.width,
            height = actual.height,
            fps = actual.fps,
            format = actual.format.as_str(),
            "camera opened"
        );
        Ok(())
    }

    pub fn close(&self) {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).close();
        self.raw_slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.processed.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let path = self.device_path.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(path) = path {
            info!(device_path = path.as_str(), "camera closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).is_open()
    }

    /// One capture attempt, called from the shared capture thread. Returns
    /// true when a frame entered the raw slot.
    pub fn capture_frame(&self) -> bool {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if !device.is_open() {
            return false;
        }
        match device.capture_frame_raw() {
            Ok(Some(frame)) => {
                drop(device);
                self.push_raw_frame(frame);
                true
            }
            Ok(None) => false,
            Err(err) => {
                drop(device);
                let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.frames_dropped += 1;
                debug!(error = %err, "capture failed");
                false
            }
        }
    }

    /// Place a frame in the single raw slot. An unread frame being replaced
    /// counts as exactly one drop.
    pub fn push_raw_frame(&self, frame: Frame) {
        let mut slot = self.raw_slot.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = slot.replace(frame).is_some();
        drop(slot);

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.frames_captured += 1;
        counters.last_frame_at = Some(Instant::now());
        if replaced {
            counters.frames_dropped += 1;
        }
    }

    pub fn take_raw_frame(&self) -> Option<Frame> {
        self.raw_slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Append to the processed queue, evicting the oldest entry when full.
    pub fn push_processed(&self, jpeg: Arc<[u8]>) {
        let mut queue = self.processed.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= PROCESSED_QUEUE_CAPACITY {
            queue.pop_front();
            drop(queue);
            self.counters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .frames_dropped += 1;
            self.processed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(jpeg);
        } else {
            queue.push_back(jpeg);
        }
    }

    pub fn latest_processed(&self) -> Option<Arc<[u8]>> {
        self.processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    pub fn processed_len(&self) -> usize {
        self.processed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn attach_pipeline(&self, pipeline: Arc<VisionPipeline>) {
        *self.pipeline.lock().unwrap_or_else(|e| e.into_inner()) = Some(pipeline);
        *self.use_case.lock().unwrap_or_else(|e| e.into_inner()) = CameraUseCase::VisionPipeline;
        debug!("pipeline attached");
    }

    pub fn detach_pipeline(&self) -> Option<Arc<VisionPipeline>> {
        let pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).take();
        *self.use_case.lock().unwrap_or_else(|e| e.into_inner()) = CameraUseCase::StreamOnly;
        if pipeline.is_some() {
            debug!("pipeline detached");
        }
        pipeline
    }

    pub fn pipeline(&self) -> Option<Arc<VisionPipeline>> {
        self.pipeline.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn use_case(&self) -> CameraUseCase {
        *self.use_case.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> CameraSettings {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn configured_fps(&self) -> f64 {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).fps
    }

    pub fn apply_settings(&self, settings: &CameraSettings) -> Result<()> {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        device.apply_settings(settings)?;
        let actual = device.actual_settings();
        drop(device);
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = actual;
        Ok(())
    }

    pub fn apply_control_settings(
        &self,
        exposure: Option<i32>,
        gain: Option<f64>,
        saturation: Option<f64>,
    ) -> Result<()> {
        self.device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .apply_control_settings(exposure, gain, saturation)
    }

    /// Compare requested settings against the negotiated ones.
    pub fn verify_settings(&self, expected: &CameraSettings) -> SettingsVerification {
        let actual = self
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .actual_settings();

        let mut mismatches = BTreeMap::new();
        if expected.width != actual.width {
            mismatches.insert(
                "width".to_string(),
                FieldMismatch {
                    expected: expected.width.to_string(),
                    actual: actual.width.to_string(),
                },
            );
        }
        if expected.height != actual.height {
            mismatches.insert(
                "height".to_string(),
                FieldMismatch {
                    expected: expected.height.to_string(),
                    actual: actual.height.to_string(),
                },
            );
        }
        if (expected.fps - actual.fps).abs() > FPS_VERIFY_TOLERANCE {
            mismatches.insert(
                "fps".to_string(),
                FieldMismatch {
                    expected: expected.fps.to_string(),
                    actual: actual.fps.to_string(),
                },
            );
        }
        if expected.format != actual.format {
            mismatches.insert(
                "format".to_string(),
                FieldMismatch {
                    expected: expected.format.clone(),
                    actual: actual.format.clone(),
                },
            );
        }

        if !mismatches.is_empty() {
            warn!(fields = ?mismatches.keys().collect::<Vec<_>>(), "camera settings mismatch");
        }

        SettingsVerification {
            verified: mismatches.is_empty(),
            expected: expected.clone(),
            actual,
            mismatches,
        }
    }

    /// Snapshot of the capture counters with an age-based fps estimate.
    ///
    /// The estimate is `1000 / age_ms` clamped to `[0, configured fps]` and
    /// forced to zero once the last frame is older than 2 s, so a stalled
    /// camera reads as 0 rather than freezing at its last rate.
    pub fn metrics(&self) -> CameraMetrics {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let settings = self.settings();

        let age_ms = counters
            .last_frame_at
            .map(|t| t.elapsed().as_millis() as u64);
        let fps_estimate = match age_ms {
            Some(age) if age >= STALE_FRAME_MS => 0.0,
            Some(age) => (1000.0 / age.max(1) as f64).clamp(0.0, settings.fps),
            None => 0.0,
        };

        CameraMetrics {
            device_path: self
                .device_path
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            frames_captured: counters.frames_captured,
            frames_dropped: counters.frames_dropped,
            fps_estimate,
            last_frame_age_ms: age_ms,
            settings,
        }
    }
}
