//! Video file I/O via FFmpeg subprocesses.
//!
//! Decode and encode both go through rawvideo pipes: `ffmpeg` writes RGB24
//! frames to stdout for reading, and accepts RGB24 frames on stdin for
//! writing. stderr is drained in a background thread to prevent pipe
//! deadlock.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::types::Frame;

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

/// Probed properties of a video (or still image) file.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: Option<u64>,
}

fn parse_probe(json: &[u8]) -> Result<VideoProbe> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let stream = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .min_by_key(|s| s.index)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = parse_frame_rate(fps_str).unwrap_or(0.0);
    let fps = if fps <= 0.0 {
        warn!("could not determine frame rate (got {fps_str}), defaulting to 30");
        30.0
    } else {
        fps
    };

    let frame_count = stream.nb_frames.as_deref().and_then(|n| n.parse().ok());

    Ok(VideoProbe {
        width,
        height,
        fps,
        frame_count,
    })
}

pub fn probe_video(path: &Path) -> Result<VideoProbe> {
    if !path.exists() {
        bail!("input file does not exist: {}", path.display());
    }
    let output = command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe(&output.stdout)
}

// Decode side
// ---------------------------------------------------------------------------

fn build_reader_args(path: &Path) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

fn spawn_stderr_drain(child: &mut Child) -> Option<JoinHandle<()>> {
    let stderr = child.stderr.take()?;
    Some(thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    debug!(target: "ffmpeg_stderr", "{}", line);
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }))
}

/// Decodes a video file to raw RGB frames via an FFmpeg subprocess, one
/// frame per `next()`. Kills FFmpeg on [`Drop`].
pub struct VideoFileReader {
    child: Child,
    probe: VideoProbe,
    frame_size: usize,
    buf: Vec<u8>,
    done: bool,
    _stderr_thread: Option<JoinHandle<()>>,
}

impl VideoFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let probe = probe_video(path)?;
        Self::with_probe(path, probe)
    }

    pub fn with_probe(path: &Path, probe: VideoProbe) -> Result<Self> {
        let frame_size = probe.width as usize * probe.height as usize * 3;
        let mut child = command_for("ffmpeg")
            .args(build_reader_args(path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stderr_thread = spawn_stderr_drain(&mut child);

        debug!(
            path = %path.display(),
            width = probe.width,
            height = probe.height,
            fps = probe.fps,
            "video reader started"
        );

        Ok(Self {
            child,
            frame_size,
            buf: vec![0u8; frame_size],
            probe,
            done: false,
            _stderr_thread: stderr_thread,
        })
    }

    pub fn probe(&self) -> &VideoProbe {
        &self.probe
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        Ok(Some(Frame::Rgb8 {
            data: self.buf[..self.frame_size].to_vec(),
            width: self.probe.width,
            height: self.probe.height,
        }))
    }
}

impl Iterator for VideoFileReader {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoFileReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self._stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Decode the first frame of a file; works for still images as well since
/// FFmpeg treats them as one-frame videos.
pub fn read_first_frame(path: &Path) -> Result<Frame> {
    let mut reader = VideoFileReader::open(path)?;
    reader
        .next()
        .transpose()?
        .ok_or_else(|| anyhow!("no frames decoded from {}", path.display()))
}

// Encode side
// ---------------------------------------------------------------------------

fn build_writer_args(output_path: &Path, width: u32, height: u32, fps: f64) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-s".to_string(),
        format!("{width}x{height}"),
        "-r".to_string(),
        format!("{fps}"),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-v".to_string(),
        "error".to_string(),
        output_path.to_string_lossy().into_owned(),
    ]
}

/// Encodes raw RGB frames to a video file through an FFmpeg subprocess fed
/// via stdin. `finish()` closes the pipe and waits for the mux to complete.
pub struct VideoFileWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    output_path: PathBuf,
    width: u32,
    height: u32,
    frames_written: u64,
    _stderr_thread: Option<JoinHandle<()>>,
}

impl VideoFileWriter {
    pub fn create(output_path: &Path, width: u32, height: u32, fps: f64) -> Result<Self> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut child = command_for("ffmpeg")
            .args(build_writer_args(output_path, width, height, fps))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stdin = child.stdin.take();
        let stderr_thread = spawn_stderr_drain(&mut child);

        debug!(path = %output_path.display(), width, height, fps, "video writer started");

        Ok(Self {
            child,
            stdin,
            output_path: output_path.to_path_buf(),
            width,
            height,
            frames_written: 0,
            _stderr_thread: stderr_thread,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Write one frame, converting to RGB when necessary. Dimensions must
    /// match the writer's.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            bail!(
                "frame size {}x{} does not match writer {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("video writer already finished"))?;

        let rgb = frame.to_rgb();
        let Frame::Rgb8 { data, .. } = &rgb else {
            bail!("RGB conversion produced unexpected format");
        };
        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    /// Close the input pipe and wait for FFmpeg to finish muxing.
    pub fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with status {status}");
        }
        info!(
            path = %self.output_path.display(),
            frames = self.frames_written,
            "video file written"
        );
        Ok(())
    }
}

impl Drop for VideoFileWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self._stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

// Binary resolution
// ---------------------------------------------------------------------------

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }
    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") {
        return vec![binary.to_string()];
    }
    vec![format!("{binary}.exe"), binary.to_string()]
}

/// Resolve a helper binary, preferring copies shipped next to the
/// executable over whatever is on PATH.
pub fn command_for(binary: &str) -> Command {
    let names = candidate_binary_names(binary);
    for dir in candidate_bin_dirs() {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Command::new(candidate);
            }
        }
    }
    Command::new(binary)
}
