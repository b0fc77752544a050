use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::stage::FrameConsumer;
use crate::types::{Detection, Frame};

/// Latest frame held by a tap, with a memoized JPEG encoding.
pub struct StreamTapFrame {
    pub frame: Arc<Frame>,
    pub captured_at: DateTime<Utc>,
    jpeg: OnceLock<Arc<[u8]>>,
}

impl StreamTapFrame {
    fn new(frame: Arc<Frame>) -> Self {
        Self {
            frame,
            captured_at: Utc::now(),
            jpeg: OnceLock::new(),
        }
    }

    pub fn jpeg_bytes(&self) -> Result<Arc<[u8]>> {
        if let Some(bytes) = self.jpeg.get() {
            return Ok(bytes.clone());
        }
        let encoded: Arc<[u8]> = self.frame.encode_jpeg()?.into();
        let _ = self.jpeg.set(encoded.clone());
        Ok(self.jpeg.get().cloned().unwrap_or(encoded))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TapMetrics {
    pub tap_id: String,
    pub attach_point: String,
    pub frame_count: u64,
    pub has_frame: bool,
    pub uptime_seconds: f64,
}

/// Push message sent to stream viewers: one frame plus its context.
#[derive(Debug, Clone, Serialize)]
pub struct TapFrameMessage {
    pub instance_id: String,
    pub tap_id: String,
    pub attach_point: String,
    pub captured_at: DateTime<Utc>,
    pub image_base64: String,
    pub metrics: TapMetrics,
    pub detections: Vec<Detection>,
}

struct TapState {
    frame: Option<Arc<StreamTapFrame>>,
    frame_count: u64,
}

/// A latest-value observation point on the pipeline. New frames replace the
/// held one; viewers polling slower than the frame rate simply miss frames.
pub struct StreamTap {
    pub tap_id: String,
    pub attach_point: String,
    state: Mutex<TapState>,
    created_at: Instant,
}

impl StreamTap {
    pub fn new(tap_id: impl Into<String>, attach_point: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tap_id: tap_id.into(),
            attach_point: attach_point.into(),
            state: Mutex::new(TapState {
                frame: None,
                frame_count: 0,
            }),
            created_at: Instant::now(),
        })
    }

    pub fn latest_frame(&self) -> Option<Arc<StreamTapFrame>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frame
            .clone()
    }

    pub fn metrics(&self) -> TapMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        TapMetrics {
            tap_id: self.tap_id.clone(),
            attach_point: self.attach_point.clone(),
            frame_count: state.frame_count,
            has_frame: state.frame.is_some(),
            uptime_seconds: self.created_at.elapsed().as_secs_f64(),
        }
    }

    /// Build a push message from the held frame. `None` when no frame has
    /// arrived yet; encoding failures surface as errors.
    pub fn latest_message(
        &self,
        instance_id: &str,
        detections: Vec<Detection>,
    ) -> Result<Option<TapFrameMessage>> {
        let Some(frame) = self.latest_frame() else {
            return Ok(None);
        };
        let jpeg = frame.jpeg_bytes()?;
        Ok(Some(TapFrameMessage {
            instance_id: instance_id.to_string(),
            tap_id: self.tap_id.clone(),
            attach_point: self.attach_point.clone(),
            captured_at: frame.captured_at,
            image_base64: BASE64.encode(jpeg.as_ref()),
            metrics: self.metrics(),
            detections,
        }))
    }
}

impl FrameConsumer for StreamTap {
    fn consumer_id(&self) -> &str {
        &self.tap_id
    }

    fn push_frame(&self, frame: &Arc<Frame>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.frame = Some(Arc::new(StreamTapFrame::new(frame.clone())));
        state.frame_count += 1;
    }
}

/// Process-wide lookup of live taps, keyed by pipeline instance.
#[derive(Default)]
pub struct StreamTapRegistry {
    taps: DashMap<String, Vec<Arc<StreamTap>>>,
}

impl StreamTapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: &str, tap: Arc<StreamTap>) {
        debug!(instance_id, tap_id = tap.tap_id.as_str(), "registering stream tap");
        self.taps
            .entry(instance_id.to_string())
            .or_default()
            .push(tap);
    }

    /// Drop all taps of an instance. Returns how many were removed.
    pub fn unregister_instance(&self, instance_id: &str) -> usize {
        self.taps
            .remove(instance_id)
            .map(|(_, taps)| taps.len())
            .unwrap_or(0)
    }

    pub fn get(&self, instance_id: &str, tap_id: &str) -> Option<Arc<StreamTap>> {
        self.taps
            .get(instance_id)
            .and_then(|taps| taps.iter().find(|t| t.tap_id == tap_id).cloned())
    }

    pub fn instance_metrics(&self, instance_id: &str) -> Vec<TapMetrics> {
        self.taps
            .get(instance_id)
            .map(|taps| taps.iter().map(|t| t.metrics()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Arc<Frame> {
        Arc::new(Frame::Gray8 {
            data: vec![128; 16],
            width: 4,
            height: 4,
        })
    }

    #[test]
    fn test_latest_wins() {
        let tap = StreamTap::new("tap1", "detect");
        assert!(tap.latest_frame().is_none());

        let first = frame();
        let second = frame();
        tap.push_frame(&first);
        tap.push_frame(&second);

        let held = tap.latest_frame().unwrap();
        assert!(Arc::ptr_eq(&held.frame, &second));
        assert_eq!(tap.metrics().frame_count, 2);
    }

    #[test]
    fn test_message_carries_base64_jpeg() {
        let tap = StreamTap::new("tap1", "__source__");
        tap.push_frame(&frame());

        let message = tap.latest_message("inst1", Vec::new()).unwrap().unwrap();
        assert_eq!(message.instance_id, "inst1");
        assert_eq!(message.tap_id, "tap1");
        let decoded = BASE64.decode(&message.image_base64).unwrap();
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_message_none_before_first_frame() {
        let tap = StreamTap::new("tap1", "detect");
        assert!(tap.latest_message("inst1", Vec::new()).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_push_and_read() {
        let tap = StreamTap::new("tap1", "detect");

        // Every pushed frame is uniform, so a reader seeing mixed bytes
        // would have observed a torn write.
        let pusher = {
            let tap = tap.clone();
            std::thread::spawn(move || {
                for i in 0..500u32 {
                    tap.push_frame(&Arc::new(Frame::Gray8 {
                        data: vec![(i % 256) as u8; 16],
                        width: 4,
                        height: 4,
                    }));
                }
            })
        };

        let mut observed = 0u32;
        while !pusher.is_finished() {
            if let Some(held) = tap.latest_frame() {
                match held.frame.as_ref() {
                    Frame::Gray8 { data, .. } => {
                        assert!(data.iter().all(|&b| b == data[0]));
                        observed += 1;
                    }
                    other => panic!("unexpected frame variant: {other:?}"),
                }
            }
        }
        pusher.join().unwrap();

        assert!(observed > 0);
        assert_eq!(tap.metrics().frame_count, 500);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = StreamTapRegistry::new();
        registry.register("inst1", StreamTap::new("a", "__source__"));
        registry.register("inst1", StreamTap::new("b", "detect"));
        registry.register("inst2", StreamTap::new("a", "__source__"));

        assert!(registry.get("inst1", "b").is_some());
        assert!(registry.get("inst1", "missing").is_none());
        assert_eq!(registry.instance_metrics("inst1").len(), 2);

        assert_eq!(registry.unregister_instance("inst1"), 2);
        assert!(registry.get("inst1", "a").is_none());
        assert!(registry.get("inst2", "a").is_some());
    }
}
