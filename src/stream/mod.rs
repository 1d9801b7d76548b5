//! RTSP frame acquisition
//!
//! ## Design
//!
//! Decoding is delegated to an ffmpeg child process writing raw `bgr24`
//! frames to stdout; the connection reads exact `width * height * 3` chunks
//! under a caller-supplied timeout. Stream resolution is probed once with
//! ffprobe before the decode loop starts.
//!
//! The `FrameSource` / `FrameConnection` traits are the seam between the
//! camera worker and the decoder so the worker loop can be driven by a
//! synthetic source in tests.

use crate::error::{Error, Result};
use crate::imaging::Frame;
use serde::Deserialize;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// Probe timeout for resolving the stream dimensions
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A factory for stream connections
pub trait FrameSource: Send + Sync + 'static {
    type Connection: FrameConnection;

    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// One live decoder connection
pub trait FrameConnection: Send {
    /// Read the next decoded frame, failing after `timeout` without one.
    fn read_frame(&mut self, timeout: Duration) -> impl Future<Output = Result<Frame>> + Send;
}

/// ffmpeg-backed source used in production
#[derive(Debug, Clone, Default)]
pub struct FfmpegSource;

impl FfmpegSource {
    pub fn new() -> Self {
        Self
    }
}

impl FrameSource for FfmpegSource {
    type Connection = FfmpegConnection;

    async fn connect(&self, url: &str) -> Result<FfmpegConnection> {
        let (width, height) = probe_resolution(url).await?;
        FfmpegConnection::open(url, width, height)
    }
}

/// A running ffmpeg decode process
pub struct FfmpegConnection {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl FfmpegConnection {
    fn open(url: &str, width: u32, height: u32) -> Result<Self> {
        let mut command = Command::new("ffmpeg");
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay")
            .arg("-i")
            .arg(url)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Stream(format!("failed to spawn ffmpeg: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Stream("failed to capture ffmpeg stdout".to_string()))?;

        let frame_bytes = width as usize * height as usize * 3;
        tracing::debug!(url = %url, width = width, height = height, "ffmpeg decoder started");

        Ok(Self {
            child,
            stdout,
            width,
            height,
            buffer: vec![0u8; frame_bytes],
        })
    }
}

impl FrameConnection for FfmpegConnection {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Frame> {
        let read = tokio::time::timeout(timeout, self.stdout.read_exact(&mut self.buffer)).await;
        match read {
            Ok(Ok(_)) => Frame::from_bgr(self.width, self.height, self.buffer.clone()),
            Ok(Err(e)) => {
                let _ = self.child.start_kill();
                Err(Error::Stream(format!("decoder read failed: {}", e)))
            }
            Err(_) => {
                let _ = self.child.start_kill();
                Err(Error::Stream(format!(
                    "no frame within {:.0}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }
}

// ========================================
// ffprobe
// ========================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Resolve the video resolution of a source with ffprobe.
async fn probe_resolution(url: &str) -> Result<(u32, u32)> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-rtsp_transport")
            .arg("tcp")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height")
            .arg("-of")
            .arg("json")
            .arg(url)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| Error::Stream(format!("ffprobe timed out for {}", url)))?
    .map_err(|e| Error::Stream(format!("failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Stream(format!(
            "ffprobe failed for {} (status {})",
            url, output.status
        )));
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<(u32, u32)> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| Error::Stream(format!("unparseable ffprobe output: {}", e)))?;

    let stream = probe
        .streams
        .first()
        .ok_or_else(|| Error::Stream("no video stream found".to_string()))?;

    match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(Error::Stream("stream reports no resolution".to_string())),
    }
}
