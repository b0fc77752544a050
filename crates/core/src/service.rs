use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::camera::CameraManager;

/// Capture headroom over the fastest configured frame rate, so the poll
/// never becomes the bottleneck when a device delivers slightly fast.
const CAPTURE_RATE_HEADROOM: f64 = 1.5;

/// Consumer sleep when no camera had a frame to offer.
const CONSUMER_IDLE: Duration = Duration::from_millis(2);

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(10);

struct Worker {
    name: &'static str,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Signal the thread and wait up to [`JOIN_TIMEOUT`] for it to exit.
    fn stop(self) {
        let _ = self.stop.send(());
        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(worker = self.name, "worker did not stop in time, detaching");
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if self.handle.join().is_err() {
            warn!(worker = self.name, "worker panicked");
        }
    }
}

struct ServiceWorkers {
    capture: Worker,
    consumer: Worker,
}

/// Drives every open camera with a single pair of background threads: one
/// capture thread feeding each manager's raw slot, one consumer thread
/// draining the slots, through the attached pipeline when one is present.
/// The threads start when the first camera opens and stop when the last
/// one closes; pipeline attach/detach never restarts capture.
pub struct CameraService {
    cameras: Arc<DashMap<String, Arc<CameraManager>>>,
    workers: Mutex<Option<ServiceWorkers>>,
}

impl CameraService {
    pub fn new() -> Self {
        Self {
            cameras: Arc::new(DashMap::new()),
            workers: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn manager(&self, camera_id: &str) -> Option<Arc<CameraManager>> {
        self.cameras.get(camera_id).map(|m| m.clone())
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Register an already-open camera and make sure the capture/consumer
    /// threads are up.
    pub fn open_camera(&self, camera_id: &str, manager: Arc<CameraManager>) -> Result<()> {
        if !manager.is_open() {
            bail!("camera '{camera_id}' is not open");
        }
        if self.cameras.contains_key(camera_id) {
            bail!("camera '{camera_id}' is already registered");
        }
        self.cameras.insert(camera_id.to_string(), manager);
        self.ensure_started()?;
        info!(camera_id, open_cameras = self.cameras.len(), "camera registered");
        Ok(())
    }

    /// Remove a camera, close its device, and stop the shared threads when
    /// it was the last one.
    pub fn close_camera(&self, camera_id: &str) -> Result<()> {
        let Some((_, manager)) = self.cameras.remove(camera_id) else {
            bail!("camera '{camera_id}' is not registered");
        };
        manager.close();
        if self.cameras.is_empty() {
            self.stop_workers();
        }
        info!(camera_id, open_cameras = self.cameras.len(), "camera closed");
        Ok(())
    }

    /// Stop the shared threads unconditionally. Open cameras stay
    /// registered; the next `open_camera` restarts the threads.
    pub fn stop(&self) {
        self.stop_workers();
    }

    fn ensure_started(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            return Ok(());
        }

        let (capture_stop_tx, capture_stop_rx) = bounded::<()>(1);
        let cameras = self.cameras.clone();
        let capture_handle = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_loop(cameras, capture_stop_rx))?;

        let (consumer_stop_tx, consumer_stop_rx) = bounded::<()>(1);
        let cameras = self.cameras.clone();
        let consumer_handle = thread::Builder::new()
            .name("camera-consume".to_string())
            .spawn(move || consumer_loop(cameras, consumer_stop_rx))?;

        *workers = Some(ServiceWorkers {
            capture: Worker {
                name: "capture",
                stop: capture_stop_tx,
                handle: capture_handle,
            },
            consumer: Worker {
                name: "consumer",
                stop: consumer_stop_tx,
                handle: consumer_handle,
            },
        });
        info!("camera service threads started");
        Ok(())
    }

    fn stop_workers(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(workers) = workers {
            workers.capture.stop();
            workers.consumer.stop();
            info!("camera service threads stopped");
        }
    }
}

impl Default for CameraService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CameraService {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn snapshot(cameras: &DashMap<String, Arc<CameraManager>>) -> Vec<Arc<CameraManager>> {
    // Clone the Arcs out so no shard lock is held while capturing or
    // processing; a camera opened mid-loop is picked up next iteration.
    cameras.iter().map(|e| e.value().clone()).collect()
}

/// Poll period tracking the fastest open camera, with headroom.
fn capture_period(cameras: &DashMap<String, Arc<CameraManager>>) -> Duration {
    let fastest = cameras
        .iter()
        .map(|e| e.value().configured_fps())
        .fold(1.0_f64, f64::max);
    Duration::from_secs_f64(1.0 / (fastest * CAPTURE_RATE_HEADROOM))
}

fn capture_loop(cameras: Arc<DashMap<String, Arc<CameraManager>>>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(capture_period(&cameras)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        for manager in snapshot(&cameras) {
            manager.capture_frame();
        }
    }
    debug!("capture loop exited");
}

fn consumer_loop(cameras: Arc<DashMap<String, Arc<CameraManager>>>, stop: Receiver<()>) {
    loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let mut idle = true;
        for manager in snapshot(&cameras) {
            let Some(frame) = manager.take_raw_frame() else {
                continue;
            };
            idle = false;

            if let Some(pipeline) = manager.pipeline() {
                let output = pipeline.process_frame(frame);
                match output.last.jpeg_bytes() {
                    Ok(jpeg) => manager.push_processed(jpeg),
                    Err(err) => warn!(error = %err, "failed to encode processed frame"),
                }
            } else {
                match frame.encode_jpeg() {
                    Ok(jpeg) => manager.push_processed(Arc::from(jpeg.into_boxed_slice())),
                    Err(err) => warn!(error = %err, "failed to encode raw frame"),
                }
            }
        }

        if idle {
            // Nothing queued anywhere; park briefly but stay responsive to
            // stop.
            match stop.recv_timeout(CONSUMER_IDLE) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
    debug!("consumer loop exited");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::camera::tests::FakeDevice;
    use crate::camera::CameraSettings;
    use crate::pipeline::VisionPipeline;
    use crate::stage::tests::ScriptedDetector;
    use crate::stage::{DetectStage, PipelineStage};

    fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn open_manager() -> Arc<CameraManager> {
        let manager = Arc::new(CameraManager::new(Box::new(FakeDevice::new())));
        manager.open("/dev/video0", &CameraSettings::default()).unwrap();
        manager
    }

    #[test]
    fn test_open_requires_open_camera() {
        let service = CameraService::new();
        let manager = Arc::new(CameraManager::new(Box::new(FakeDevice::new())));
        assert!(service.open_camera("cam0", manager).is_err());
        assert!(!service.is_running());
    }

    #[test]
    fn test_open_same_id_twice_fails() {
        let service = CameraService::new();
        service.open_camera("cam0", open_manager()).unwrap();
        assert!(service.open_camera("cam0", open_manager()).is_err());
        service.close_camera("cam0").unwrap();
    }

    #[test]
    fn test_stream_only_fills_processed_queue() {
        let service = CameraService::new();
        let manager = open_manager();
        service.open_camera("cam0", manager.clone()).unwrap();
        assert!(service.is_running());

        assert!(wait_until(|| manager.latest_processed().is_some()));
        assert!(manager.metrics().frames_captured > 0);

        service.close_camera("cam0").unwrap();
        assert!(!service.is_running());
        assert!(!manager.is_open());
    }

    #[test]
    fn test_threads_shared_across_cameras() {
        let service = CameraService::new();
        let first = open_manager();
        let second = open_manager();
        service.open_camera("cam0", first.clone()).unwrap();
        service.open_camera("cam1", second.clone()).unwrap();
        assert_eq!(service.camera_ids(), vec!["cam0", "cam1"]);

        assert!(wait_until(|| {
            first.latest_processed().is_some() && second.latest_processed().is_some()
        }));

        service.close_camera("cam0").unwrap();
        assert!(service.is_running());
        service.close_camera("cam1").unwrap();
        assert!(!service.is_running());
    }

    #[test]
    fn test_attached_pipeline_processes_frames() {
        let service = CameraService::new();
        let manager = open_manager();
        let detector = Arc::new(ScriptedDetector::with_tag(7));
        let stages: Vec<Box<dyn PipelineStage>> = vec![Box::new(DetectStage::new(detector))];
        let pipeline = Arc::new(VisionPipeline::new(stages, HashMap::new()));
        manager.attach_pipeline(pipeline.clone());

        service.open_camera("cam0", manager.clone()).unwrap();
        assert!(wait_until(|| pipeline.metrics().frames_processed > 0));
        // Close clears the processed queue, so inspect before closing.
        assert!(wait_until(|| manager.latest_processed().is_some()));
        service.close_camera("cam0").unwrap();

        assert_eq!(pipeline.latest_detections()[0].tag_id, 7);
    }

    #[test]
    fn test_close_unknown_camera_fails() {
        let service = CameraService::new();
        assert!(service.close_camera("nope").is_err());
    }
}
