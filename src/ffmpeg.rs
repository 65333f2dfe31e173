//! External transmux tool protocol.
//!
//! Muxing, concatenation and trimming are delegated to `ffmpeg`. The
//! [`Transmuxer`] trait is the seam: the engine and orchestrator only see the
//! trait, [`Ffmpeg`] runs the real binary and tests plug in a recorder.
//!
//! Every operation removes its inputs once the tool exits successfully.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Default program name, resolved through `PATH`.
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Errors from running the transmux tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started (usually: not installed).
    #[error("cannot run {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully.
    #[error("{program} failed with {status}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// An operation received the wrong number of inputs.
    #[error("expected {expected} inputs, got {found}")]
    MissingInputs {
        /// Inputs the operation needs.
        expected: usize,
        /// Inputs provided.
        found: usize,
    },

    /// Preparing inputs or cleaning up failed.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Post-processing operations on downloaded media.
#[async_trait]
pub trait Transmuxer: Send + Sync {
    /// Muxes a video and an audio stream into `output` without re-encoding.
    async fn combine(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        flac: bool,
    ) -> Result<(), ToolError>;

    /// Concatenates `inputs` in order into `output` without re-encoding.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError>;

    /// Copies `duration` seconds starting at `start` of `input` into `output`.
    async fn clip(
        &self,
        input: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), ToolError>;
}

/// [`Transmuxer`] backed by the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: String,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new(DEFAULT_FFMPEG)
    }
}

impl Ffmpeg {
    /// Uses `program` as the ffmpeg executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The configured executable.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), ToolError> {
        debug!(program = %self.program, ?args, "running transmux tool");
        let status = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| ToolError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

#[async_trait]
impl Transmuxer for Ffmpeg {
    #[instrument(skip(self))]
    async fn combine(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        flac: bool,
    ) -> Result<(), ToolError> {
        self.run(combine_args(video, audio, output, flac)).await?;
        remove_inputs(&[video.to_path_buf(), audio.to_path_buf()]).await
    }

    #[instrument(skip(self, inputs), fields(inputs = inputs.len()))]
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<(), ToolError> {
        let list = listing_path(output);
        tokio::fs::write(&list, listing_contents(inputs))
            .await
            .map_err(|e| ToolError::io(&list, e))?;
        let result = self.run(concat_args(&list, output)).await;
        if let Err(error) = tokio::fs::remove_file(&list).await {
            debug!(path = %list.display(), error = %error, "failed to remove concat list");
        }
        result?;
        remove_inputs(inputs).await
    }

    #[instrument(skip(self))]
    async fn clip(
        &self,
        input: &Path,
        start: f64,
        duration: f64,
        output: &Path,
    ) -> Result<(), ToolError> {
        self.run(clip_args(input, start, duration, output)).await?;
        remove_inputs(&[input.to_path_buf()]).await
    }
}

async fn remove_inputs(inputs: &[PathBuf]) -> Result<(), ToolError> {
    for input in inputs {
        tokio::fs::remove_file(input)
            .await
            .map_err(|e| ToolError::io(input, e))?;
    }
    Ok(())
}

/// `-i <v> -i <a> -c copy [-strict -2] -loglevel quiet <out>`
#[must_use]
pub fn combine_args(video: &Path, audio: &Path, output: &Path, flac: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        video.into(),
        "-i".into(),
        audio.into(),
        "-c".into(),
        "copy".into(),
    ];
    if flac {
        args.extend(["-strict".into(), "-2".into()]);
    }
    args.extend(["-loglevel".into(), "quiet".into(), output.into()]);
    args
}

/// `-f concat -safe 0 -i <list> -c copy -loglevel quiet <out>`
#[must_use]
pub fn concat_args(list: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.into(),
        "-c".into(),
        "copy".into(),
        "-loglevel".into(),
        "quiet".into(),
        output.into(),
    ]
}

/// `-ss <start> -t <dur> -i <in> -codec copy -loglevel quiet -f mp4 <out>`
#[must_use]
pub fn clip_args(input: &Path, start: f64, duration: f64, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-ss".into(),
        format!("{start:.1}").into(),
        "-t".into(),
        format!("{duration:.1}").into(),
        "-i".into(),
        input.into(),
        "-codec".into(),
        "copy".into(),
        "-loglevel".into(),
        "quiet".into(),
        "-f".into(),
        "mp4".into(),
        output.into(),
    ]
}

/// Listing file written next to the concat output.
#[must_use]
pub fn listing_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".concat.txt");
    output.with_file_name(name)
}

/// `file '<name>'` lines for the concat demuxer.
///
/// Inputs in the listing's directory are referenced by name only; single
/// quotes are escaped the way the demuxer expects.
#[must_use]
pub fn listing_contents(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|input| {
            let name = input.file_name().map_or_else(
                || input.to_string_lossy(),
                |name| name.to_string_lossy(),
            );
            format!("file '{}'\n", name.replace('\'', r"'\''"))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_combine_args_add_strict_for_flac() {
        let plain = strings(&combine_args(
            Path::new("a-v"),
            Path::new("a-a"),
            Path::new("a.mp4"),
            false,
        ));
        assert!(!plain.contains(&"-strict".to_string()));
        assert_eq!(plain.last().unwrap(), "a.mp4");

        let flac = strings(&combine_args(
            Path::new("a-v"),
            Path::new("a-a"),
            Path::new("a.mp4"),
            true,
        ));
        let idx = flac.iter().position(|a| a == "-strict").unwrap();
        assert_eq!(flac[idx + 1], "-2");
    }

    #[test]
    fn test_clip_args_format_one_decimal() {
        let args = strings(&clip_args(
            Path::new("in.ts"),
            4.0,
            18.26,
            Path::new("out.mp4"),
        ));
        assert_eq!(&args[1..5], ["-ss", "4.0", "-t", "18.3"]);
        assert!(args.windows(2).any(|w| w == ["-f", "mp4"]));
    }

    #[test]
    fn test_listing_contents_uses_names_and_escapes_quotes() {
        let inputs = vec![
            PathBuf::from("/d/Clip-0.mp4"),
            PathBuf::from("/d/It's-1.mp4"),
        ];
        assert_eq!(
            listing_contents(&inputs),
            "file 'Clip-0.mp4'\nfile 'It'\\''s-1.mp4'\n"
        );
        assert_eq!(
            listing_path(Path::new("/d/Clip.mp4")),
            PathBuf::from("/d/Clip.mp4.concat.txt")
        );
    }

    #[tokio::test]
    async fn test_missing_program_maps_to_spawn_error() {
        let tool = Ffmpeg::new("mediadl-no-such-ffmpeg-binary");
        let dir = tempfile::TempDir::new().unwrap();
        let video = dir.path().join("v");
        let audio = dir.path().join("a");
        std::fs::write(&video, b"v").unwrap();
        std::fs::write(&audio, b"a").unwrap();

        let result = tool
            .combine(&video, &audio, &dir.path().join("out.mp4"), false)
            .await;
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
        assert!(video.exists(), "inputs must survive a failed run");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_maps_to_failed() {
        let tool = Ffmpeg::new("false");
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("in.ts");
        std::fs::write(&input, b"x").unwrap();

        let result = tool.clip(&input, 0.0, 1.0, &dir.path().join("o.mp4")).await;
        match result {
            Err(ToolError::Failed { program, .. }) => assert_eq!(program, "false"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(input.exists());
    }
}
