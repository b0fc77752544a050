use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub device_path: String,
    pub available: bool,
}

/// Enumerates attached cameras. Implementations are platform-specific.
pub trait CameraDiscovery: Send + Sync {
    fn discover(&self) -> Result<Vec<CameraInfo>>;
}

struct MonitorWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Polls a [`CameraDiscovery`] on a fixed interval and publishes the result
/// into a snapshot readers can take without blocking the poll.
pub struct HotplugMonitor {
    discovery: Arc<dyn CameraDiscovery>,
    snapshot: Arc<RwLock<Vec<CameraInfo>>>,
    worker: Mutex<Option<MonitorWorker>>,
    interval: Duration,
}

impl HotplugMonitor {
    pub fn new(discovery: Arc<dyn CameraDiscovery>) -> Self {
        Self::with_interval(discovery, POLL_INTERVAL)
    }

    pub fn with_interval(discovery: Arc<dyn CameraDiscovery>, interval: Duration) -> Self {
        Self {
            discovery,
            snapshot: Arc::new(RwLock::new(Vec::new())),
            worker: Mutex::new(None),
            interval,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Start the poll thread. Runs one discovery pass synchronously first so
    /// the snapshot is populated before this returns. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Ok(());
        }

        publish(&self.discovery, &self.snapshot);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let discovery = self.discovery.clone();
        let snapshot = self.snapshot.clone();
        let interval = self.interval;
        let handle = thread::Builder::new()
            .name("hotplug-monitor".to_string())
            .spawn(move || poll_loop(discovery, snapshot, stop_rx, interval))?;

        *worker = Some(MonitorWorker {
            stop: stop_tx,
            handle,
        });
        info!(interval_ms = self.interval.as_millis() as u64, "hotplug monitor started");
        Ok(())
    }

    /// Stop the poll thread, waiting up to 2 s. Idempotent.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !worker.handle.is_finished() {
                if Instant::now() >= deadline {
                    warn!("hotplug monitor did not stop in time, detaching");
                    return;
                }
                thread::sleep(JOIN_POLL);
            }
            let _ = worker.handle.join();
            info!("hotplug monitor stopped");
        }
    }

    /// Latest discovered camera list.
    pub fn cameras(&self) -> Vec<CameraInfo> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish(discovery: &Arc<dyn CameraDiscovery>, snapshot: &Arc<RwLock<Vec<CameraInfo>>>) {
    match discovery.discover() {
        Ok(cameras) => {
            let mut guard = snapshot.write().unwrap_or_else(|e| e.into_inner());
            if *guard != cameras {
                debug!(count = cameras.len(), "camera list changed");
            }
            *guard = cameras;
        }
        Err(err) => warn!(error = %err, "camera discovery failed"),
    }
}

fn poll_loop(
    discovery: Arc<dyn CameraDiscovery>,
    snapshot: Arc<RwLock<Vec<CameraInfo>>>,
    stop: Receiver<()>,
    interval: Duration,
) {
    loop {
        match stop.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        publish(&discovery, &snapshot);
    }
    debug!("hotplug poll loop exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct ScriptedDiscovery {
        calls: AtomicUsize,
        lists: Vec<Vec<CameraInfo>>,
    }

    impl ScriptedDiscovery {
        fn new(lists: Vec<Vec<CameraInfo>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lists,
            })
        }
    }

    impl CameraDiscovery for ScriptedDiscovery {
        fn discover(&self) -> Result<Vec<CameraInfo>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.lists[call.min(self.lists.len() - 1)].clone())
        }
    }

    fn cam(id: &str) -> CameraInfo {
        CameraInfo {
            id: id.to_string(),
            name: format!("Camera {id}"),
            device_path: format!("/dev/video-{id}"),
            available: true,
        }
    }

    #[test]
    fn test_snapshot_populated_on_start() {
        let discovery = ScriptedDiscovery::new(vec![vec![cam("a"), cam("b")]]);
        let monitor = HotplugMonitor::new(discovery);
        monitor.start().unwrap();
        assert_eq!(monitor.cameras().len(), 2);
        monitor.stop();
    }

    #[test]
    fn test_poll_updates_snapshot() {
        let discovery =
            ScriptedDiscovery::new(vec![vec![cam("a")], vec![cam("a"), cam("b")]]);
        let monitor =
            HotplugMonitor::with_interval(discovery, Duration::from_millis(10));
        monitor.start().unwrap();
        assert_eq!(monitor.cameras().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.cameras().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(monitor.cameras().len(), 2);
        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_discovery_failure_keeps_last_snapshot() {
        struct Failing;
        impl CameraDiscovery for Failing {
            fn discover(&self) -> Result<Vec<CameraInfo>> {
                anyhow::bail!("no backend")
            }
        }

        let monitor = HotplugMonitor::new(Arc::new(Failing));
        monitor.start().unwrap();
        assert!(monitor.cameras().is_empty());
        monitor.stop();
    }

    #[test]
    fn test_start_twice_is_noop() {
        let discovery = ScriptedDiscovery::new(vec![vec![cam("a")]]);
        let monitor = HotplugMonitor::new(discovery);
        monitor.start().unwrap();
        monitor.start().unwrap();
        assert!(monitor.is_running());
        monitor.stop();
    }
}
