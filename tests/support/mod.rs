//! Shared helpers for the integration tests.

#![allow(dead_code, unused_macros)]

pub mod socket_guard;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mediadl_core::download::RetrySchedule;
use mediadl_core::{DownloadEngine, EngineConfig, ProgressSurface, ToolError, Transmuxer};
use wiremock::{Request, Respond, ResponseTemplate};

/// Starts a mock server, or returns from the test when sockets are unavailable.
macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = support::socket_guard::start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

/// One call made to a [`RecordingTool`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Combine {
        video: PathBuf,
        audio: PathBuf,
        output: PathBuf,
        flac: bool,
    },
    Concat {
        inputs: Vec<PathBuf>,
        output: PathBuf,
    },
    Clip {
        input: PathBuf,
        start: f64,
        duration: f64,
        output: PathBuf,
    },
}

/// Transmux tool that records its calls and stands in for ffmpeg with plain
/// file operations: combine and concat append their inputs, clip copies.
/// Inputs are removed afterwards, like the real tool.
#[derive(Debug, Default)]
pub struct RecordingTool {
    calls: Mutex<Vec<ToolCall>>,
}

impl RecordingTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: ToolCall) {
        self.calls.lock().unwrap().push(call);
    }
}

async fn append_all(inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
    let mut joined = Vec::new();
    for input in inputs {
        let bytes = tokio::fs::read(input)
            .await
            .map_err(|e| ToolError::io(input, e))?;
        joined.extend_from_slice(&bytes);
    }
    tokio::fs::write(output, joined)
        .await
        .map_err(|e| ToolError::io(output, e))?;
    for input in inputs {
        tokio::fs::remove_file(input)
            .await
            .map_err(|e| ToolError::io(input, e))?;
    }
    Ok(())
}

#[async_trait]
impl Transmuxer for RecordingTool {
    async fn combine(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        flac: bool,
    ) -> Result<(), ToolError> {
        self.record(ToolCall::Combine {
            video: video.to_path_buf(),
            audio: audio.to_path_buf(),
            output: output.to_path_buf(),
            flac,
        });
        append_all(&[video.to_path_buf(), audio.to_path_buf()], output).await
    }

    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        self.record(ToolCall::Concat {
            inputs: inputs.to_vec(),
            output: output.to_path_buf(),
        });
        append_all(inputs, output).await
    }

    async fn clip(
        &self,
        input: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), ToolError> {
        self.record(ToolCall::Clip {
            input: input.to_path_buf(),
            start,
            duration,
            output: output.to_path_buf(),
        });
        append_all(&[input.to_path_buf()], output).await
    }
}

/// Serves `body` honouring `Range: bytes=a-b` headers, which wiremock
/// ignores on its own. Every range header seen is recorded.
#[derive(Clone)]
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    ranges: Arc<Mutex<Vec<String>>>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ranges: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Range headers received so far, in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.ranges.lock().unwrap().clone()
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.to_vec());
        };
        self.ranges.lock().unwrap().push(range.clone());

        let spec = range.trim_start_matches("bytes=");
        let (start, end) = spec.split_once('-').unwrap_or((spec, ""));
        let start: usize = start.parse().unwrap_or(0);
        let end: usize = end
            .parse()
            .map_or(total - 1, |end: usize| end.min(total - 1));
        if start > end {
            return ResponseTemplate::new(416);
        }
        ResponseTemplate::new(206)
            .insert_header("content-range", format!("bytes {start}-{end}/{total}").as_str())
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

/// Deterministic test payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

/// Engine over a hidden progress surface with immediate retries.
pub fn engine(
    part_concurrency: usize,
    speed_limit: Option<f64>,
    tool: Arc<RecordingTool>,
) -> DownloadEngine {
    let config = EngineConfig {
        part_concurrency,
        speed_limit,
        retry: RetrySchedule::immediate(),
        ..EngineConfig::default()
    };
    DownloadEngine::new(config, Arc::new(ProgressSurface::hidden()), tool).unwrap()
}

/// Names of the entries in `dir`, sorted.
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
