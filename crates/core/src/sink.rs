use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::media::VideoFileWriter;
use crate::stage::FrameConsumer;
use crate::types::Frame;

const MIN_SAVE_FPS: f64 = 1.0;
const MAX_SAVE_FPS: f64 = 300.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SinkMetrics {
    pub sink_id: String,
    pub attach_point: String,
    pub kind: String,
    pub path: PathBuf,
    pub frames_written: u64,
    pub open: bool,
}

/// A save sink: consumes frames off the pipeline and must be closed when
/// its instance stops.
pub trait SaveSink: FrameConsumer {
    fn close(&self);
    fn metrics(&self) -> SinkMetrics;
}

struct VideoSinkState {
    writer: Option<VideoFileWriter>,
    frames_written: u64,
    /// Set after a writer failure so one bad file does not log per frame.
    failed: bool,
}

/// Writes frames to a video file. The FFmpeg child is started lazily on
/// the first frame because frame dimensions are not known until then.
pub struct SaveVideoSink {
    sink_id: String,
    attach_point: String,
    output_path: PathBuf,
    fps: f64,
    state: Mutex<VideoSinkState>,
}

impl SaveVideoSink {
    pub fn new(
        sink_id: impl Into<String>,
        attach_point: impl Into<String>,
        output_path: PathBuf,
        fps: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink_id: sink_id.into(),
            attach_point: attach_point.into(),
            output_path,
            fps: fps.clamp(MIN_SAVE_FPS, MAX_SAVE_FPS),
            state: Mutex::new(VideoSinkState {
                writer: None,
                frames_written: 0,
                failed: false,
            }),
        })
    }
}

impl FrameConsumer for SaveVideoSink {
    fn consumer_id(&self) -> &str {
        &self.sink_id
    }

    fn push_frame(&self, frame: &Arc<Frame>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.failed {
            return;
        }
        if state.writer.is_none() {
            match VideoFileWriter::create(
                &self.output_path,
                frame.width(),
                frame.height(),
                self.fps,
            ) {
                Ok(writer) => state.writer = Some(writer),
                Err(err) => {
                    warn!(
                        sink_id = self.sink_id.as_str(),
                        path = %self.output_path.display(),
                        error = %err,
                        "failed to open video sink, disabling it"
                    );
                    state.failed = true;
                    return;
                }
            }
        }
        if let Some(writer) = state.writer.as_mut() {
            match writer.write_frame(frame) {
                Ok(()) => state.frames_written += 1,
                Err(err) => {
                    warn!(
                        sink_id = self.sink_id.as_str(),
                        error = %err,
                        "video sink write failed, disabling it"
                    );
                    state.writer = None;
                    state.failed = true;
                }
            }
        }
    }
}

impl SaveSink for SaveVideoSink {
    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut writer) = state.writer.take() {
            if let Err(err) = writer.finish() {
                warn!(
                    sink_id = self.sink_id.as_str(),
                    error = %err,
                    "video sink close failed"
                );
            }
        }
        info!(
            sink_id = self.sink_id.as_str(),
            frames = state.frames_written,
            path = %self.output_path.display(),
            "video sink closed"
        );
    }

    fn metrics(&self) -> SinkMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        SinkMetrics {
            sink_id: self.sink_id.clone(),
            attach_point: self.attach_point.clone(),
            kind: "save_video".to_string(),
            path: self.output_path.clone(),
            frames_written: state.frames_written,
            open: state.writer.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveImageMode {
    /// Each frame replaces the file.
    Overwrite,
    /// Frames land in numbered files next to the configured path.
    Sequence,
}

/// Writes frames as JPEG images, either overwriting one file or producing a
/// numbered sequence.
pub struct SaveImageSink {
    sink_id: String,
    attach_point: String,
    output_path: PathBuf,
    mode: SaveImageMode,
    frames_written: Mutex<u64>,
}

impl SaveImageSink {
    pub fn new(
        sink_id: impl Into<String>,
        attach_point: impl Into<String>,
        output_path: PathBuf,
        mode: SaveImageMode,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink_id: sink_id.into(),
            attach_point: attach_point.into(),
            output_path,
            mode,
            frames_written: Mutex::new(0),
        })
    }

    fn target_path(&self, index: u64) -> PathBuf {
        match self.mode {
            SaveImageMode::Overwrite => self.output_path.clone(),
            SaveImageMode::Sequence => {
                let stem = self
                    .output_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "frame".to_string());
                let ext = self
                    .output_path
                    .extension()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "jpg".to_string());
                self.output_path
                    .with_file_name(format!("{stem}_{index:05}.{ext}"))
            }
        }
    }

    fn write(&self, frame: &Frame, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let jpeg = frame.encode_jpeg()?;
        std::fs::write(path, jpeg).with_context(|| format!("failed to write {}", path.display()))
    }
}

impl FrameConsumer for SaveImageSink {
    fn consumer_id(&self) -> &str {
        &self.sink_id
    }

    fn push_frame(&self, frame: &Arc<Frame>) {
        let index = {
            let count = self.frames_written.lock().unwrap_or_else(|e| e.into_inner());
            *count
        };
        let path = self.target_path(index);
        match self.write(frame, &path) {
            Ok(()) => {
                *self.frames_written.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            }
            Err(err) => {
                warn!(
                    sink_id = self.sink_id.as_str(),
                    path = %path.display(),
                    error = %err,
                    "image sink write failed"
                );
            }
        }
    }
}

impl SaveSink for SaveImageSink {
    fn close(&self) {
        let frames = *self.frames_written.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            sink_id = self.sink_id.as_str(),
            frames,
            path = %self.output_path.display(),
            "image sink closed"
        );
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            sink_id: self.sink_id.clone(),
            attach_point: self.attach_point.clone(),
            kind: "save_image".to_string(),
            path: self.output_path.clone(),
            frames_written: *self.frames_written.lock().unwrap_or_else(|e| e.into_inner()),
            open: true,
        }
    }
}
