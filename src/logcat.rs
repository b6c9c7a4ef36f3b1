//! Device log access: clearing, buffer sizing, streaming, capture to file,
//! and tag-based demultiplexing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::bridge::LineStream;
use crate::device::{Device, DeviceError};
use crate::parser::ExecutionMarker;

/// Ring buffer size requested at [`DeviceLog`] construction.
pub const DEFAULT_LOGCAT_BUFFER_SIZE: &str = "5M";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("output path {path} already exists; will not overwrite")]
    OutputExists { path: PathBuf },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read, capture and clear a device's log.
pub struct DeviceLog {
    device: Device,
}

impl DeviceLog {
    /// Wrap the device's log, growing its ring buffer to
    /// [`DEFAULT_LOGCAT_BUFFER_SIZE`] so bursts of output are not dropped
    /// mid-run.
    pub async fn new(device: Device) -> Result<Self, DeviceError> {
        device
            .execute(["logcat", "-G", DEFAULT_LOGCAT_BUFFER_SIZE])
            .await?;
        Ok(Self { device })
    }

    /// Ring buffer size of the given channel (`main`, `system`, `crash`),
    /// or `None` if the channel is not reported.
    pub async fn buffer_size(&self, channel: &str) -> Option<String> {
        let output = self.device.execute(["logcat", "-g"]).await.ok()?;
        for line in output.lines() {
            // format: "<channel>: ring buffer is <size> ..."
            if line.starts_with(channel) {
                return line.split_whitespace().nth(4).map(str::to_string);
            }
        }
        None
    }

    pub async fn set_buffer_size(&self, size_spec: &str) -> Result<(), DeviceError> {
        self.device.execute(["logcat", "-G", size_spec]).await?;
        Ok(())
    }

    /// Clear the device log across all buffers.
    pub async fn clear(&self) -> Result<(), DeviceError> {
        self.device.execute(["logcat", "-b", "all", "-c"]).await?;
        Ok(())
    }

    /// Stream the log filtered to the given (tag, priority) pairs in brief
    /// format, silencing everything else.
    pub fn tagged_stream(&self, tags: &[(String, char)]) -> Result<LineStream, DeviceError> {
        let mut args: Vec<String> = vec!["logcat".into(), "-v".into(), "brief".into(), "-s".into()];
        args.extend(tags.iter().map(|(tag, priority)| format!("{tag}:{priority}")));
        self.device.stream(args)
    }

    /// Capture the full log to a file in the background until stopped.
    pub fn capture_to_file(&self, output_path: &Path) -> Result<LogCapture, LogError> {
        LogCapture::start(&self.device, output_path)
    }
}

/// Background capture of logcat output to a file.
///
/// Doubles as an [`ExecutionMarker`]: each mark records the current byte
/// offset in the capture file, so a test's slice of the log can be located
/// afterwards from the marker file.
pub struct LogCapture {
    output_path: PathBuf,
    child: Mutex<Option<Child>>,
    markers: Mutex<Vec<(String, u64)>>,
}

impl LogCapture {
    fn start(device: &Device, output_path: &Path) -> Result<Self, LogError> {
        if output_path.exists() {
            return Err(LogError::OutputExists {
                path: output_path.to_path_buf(),
            });
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(output_path)?;
        let mut cmd = tokio::process::Command::new(device.adb_path());
        cmd.arg("-s")
            .arg(device.device_id())
            .arg("logcat")
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        Ok(Self {
            output_path: output_path.to_path_buf(),
            child: Mutex::new(Some(child)),
            markers: Mutex::new(Vec::new()),
        })
    }

    fn position(&self) -> u64 {
        std::fs::metadata(&self.output_path)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Markers recorded so far, in insertion order.
    pub fn markers(&self) -> Vec<(String, u64)> {
        self.markers.lock().expect("marker lock poisoned").clone()
    }

    /// Write recorded markers as `name=position` lines.
    pub async fn write_markers(&self, path: &Path) -> Result<(), LogError> {
        let mut content = String::new();
        for (marker, pos) in self.markers() {
            content.push_str(&format!("{marker}={pos}\n"));
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Stop the capture, terminating the logcat process.
    pub async fn stop(&self) {
        let child = self.child.lock().expect("capture lock poisoned").take();
        if let Some(mut child) = child {
            child.kill().await.ok();
        }
    }
}

impl ExecutionMarker for LogCapture {
    fn mark_start(&self, test: &str) {
        let pos = self.position();
        self.markers
            .lock()
            .expect("marker lock poisoned")
            .push((format!("{test}.start"), pos));
    }

    fn mark_end(&self, test: &str) {
        let pos = self.position();
        self.markers
            .lock()
            .expect("marker lock poisoned")
            .push((format!("{test}.end"), pos));
    }
}

/// Consumer of demultiplexed log lines for one tag.
#[async_trait]
pub trait TagHandler: Send + Sync {
    async fn handle_line(&self, tag: &str, priority: char, message: &str);
}

/// Routes brief-format log lines to the handler registered for their tag.
///
/// Banner lines and lines for unregistered tags are dropped silently; one
/// handler never sees another handler's traffic.
pub struct LogDemuxer {
    handlers: HashMap<String, Arc<dyn TagHandler>>,
    brief: Regex,
}

impl LogDemuxer {
    pub fn new(handlers: HashMap<String, Arc<dyn TagHandler>>) -> Self {
        Self {
            handlers,
            // brief format: P/Tag( pid): message
            brief: Regex::new(r"^([A-Z])/(.+?)\(\s*\d+\):\s?(.*)$")
                .expect("brief-format pattern is valid"),
        }
    }

    /// Tags this demuxer routes, paired with the priority to monitor.
    pub fn monitored_tags(&self, priority: char) -> Vec<(String, char)> {
        self.handlers.keys().map(|tag| (tag.clone(), priority)).collect()
    }

    /// Route one log line to its tag's handler, if any.
    pub async fn demux_line(&self, line: &str) {
        let Some(captures) = self.brief.captures(line) else {
            // Banner lines ("--------- beginning of main") and anything
            // else not in brief format.
            debug!("ignoring non-brief log line: '{line}'");
            return;
        };
        let priority = captures[1].chars().next().unwrap_or(' ');
        let tag = captures[2].trim();
        let message = &captures[3];
        match self.handlers.get(tag) {
            Some(handler) => handler.handle_line(tag, priority, message).await,
            None => debug!("no handler for tag '{tag}', dropping line"),
        }
    }

    /// Drain a log stream through the demuxer until it ends or errors.
    pub async fn process(&self, stream: &mut LineStream) {
        loop {
            match stream.next_line().await {
                Ok(Some(line)) => self.demux_line(&line).await,
                Ok(None) => break,
                Err(e) => {
                    warn!("log stream ended with error [{e}]");
                    break;
                }
            }
        }
    }
}
