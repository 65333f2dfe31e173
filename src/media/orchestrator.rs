//! Media job orchestration: stream choice, job dispatch and post-processing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join, join_all};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use super::error::{ApiError, MediaError};
use super::quality::{CodecChoice, Quality, choose_quality};
use super::subtitle::json_to_srt;
use super::{MediaDescriptor, Stream, StreamKind};
use crate::download::{DownloadEngine, DownloadError, PATH_CHECK_RETRY, path_check, sanitize};
use crate::ffmpeg::ToolError;
use crate::progress::{TaskId, TaskSpec, TaskUpdate};
use crate::units::TimeRange;

/// Titles longer than this (in chars) are replaced by the page name on disk
/// in hierarchy mode.
pub const TITLE_OVERFLOW: usize = 50;

/// Per-job choices.
#[derive(Debug, Clone)]
pub struct MediaOptions {
    /// Video quality.
    pub quality: Quality,
    /// Codec prefixes.
    pub codec: CodecChoice,
    /// Download audio only.
    pub only_audio: bool,
    /// Also download the cover image.
    pub image: bool,
    /// Also download subtitles as SRT.
    pub subtitle: bool,
    /// Also download danmaku.
    pub dm: bool,
    /// Clip HLS and dash media to this window.
    pub time_range: Option<TimeRange>,
    /// Nest series into directories and side artifacts into `extra/`.
    pub hierarchy: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            codec: CodecChoice::default(),
            only_audio: false,
            image: false,
            subtitle: false,
            dm: false,
            time_range: None,
            hierarchy: true,
        }
    }
}

/// Returns `(display name, on-disk base name)` for a descriptor.
///
/// The display name joins title and page name. The base name is the page
/// name alone when the title is longer than [`TITLE_OVERFLOW`] chars, the
/// page name is non-empty and hierarchy mode is on.
#[must_use]
pub fn media_names(descriptor: &MediaDescriptor, hierarchy: bool) -> (String, String) {
    let page_name = sanitize(descriptor.page_name(), None);
    let task_name = sanitize(&descriptor.title, Some(&page_name));
    let base_name = if descriptor.title.chars().count() > TITLE_OVERFLOW
        && hierarchy
        && !page_name.is_empty()
    {
        page_name
    } else {
        task_name.clone()
    };
    (task_name, base_name)
}

/// What the media part of a job will do.
enum MediaPlan {
    /// Range jobs, optionally bounded by their own gate, merged by the
    /// task's post-completion action into `output`.
    Ranged {
        jobs: Vec<(Vec<String>, PathBuf)>,
        gate: Option<Arc<Semaphore>>,
        output: Option<PathBuf>,
    },
    /// Dash streams cut to `range`. The first stream fixes the start that
    /// later streams are aligned to.
    Clipped {
        jobs: Vec<(Stream, PathBuf)>,
        range: TimeRange,
        output: Option<PathBuf>,
    },
    /// One HLS job.
    Hls { url: String, path: PathBuf },
    /// The final file is already on disk.
    Existing(PathBuf),
    /// Nothing downloadable.
    Nothing,
}

/// Turns descriptors into engine jobs.
#[derive(Debug, Clone)]
pub struct MediaOrchestrator {
    engine: DownloadEngine,
}

impl MediaOrchestrator {
    /// Creates an orchestrator over `engine`.
    #[must_use]
    pub fn new(engine: DownloadEngine) -> Self {
        Self { engine }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &DownloadEngine {
        &self.engine
    }

    /// Downloads the media of `descriptor` into `dir`, plus any requested
    /// side artifacts.
    ///
    /// Side artifact failures are logged and do not fail the job.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::NoMatchingQuality`] when the requested quality
    /// or codec is not offered, or the first download or transmux error.
    #[instrument(skip(self, descriptor, options), fields(title = %descriptor.title))]
    pub async fn get_media(
        &self,
        descriptor: &MediaDescriptor,
        dir: &Path,
        options: &MediaOptions,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let (task_name, base_name) = media_names(descriptor, options.hierarchy);
        let progress = Arc::clone(self.engine.progress());
        let task = progress.add_task(TaskSpec::new(task_name.as_str()));

        let (plan, plan_error) = match self
            .plan(descriptor, dir, &base_name, &task_name, options, task)
            .await
        {
            Ok(plan) => (plan, None),
            Err(error) => (MediaPlan::Nothing, Some(error)),
        };

        let output = match &plan {
            MediaPlan::Ranged { output, .. } | MediaPlan::Clipped { output, .. } => output.clone(),
            _ => None,
        };
        let media = self.run_plan(plan, options.time_range, task);
        let extras = self.get_extras(descriptor, dir, &base_name, options);
        let (media, ()) = join(media, extras).await;

        let result = match (plan_error, media) {
            (Some(error), _) => Err(error),
            (None, Ok(paths)) => match progress.take_upper(task) {
                Some(upper) => match upper(paths).await {
                    Ok(()) => {
                        let output = output.unwrap_or_default();
                        info!(path = %output.display(), "done");
                        Ok(vec![output])
                    }
                    Err(tool) => Err(MediaError::Download(DownloadError::Tool(tool))),
                },
                None => Ok(paths),
            },
            (None, Err(error)) => Err(MediaError::Download(error)),
        };

        progress.update(task, TaskUpdate::new().visible(false));
        if let Err(error) = &result {
            if error.is_warning() {
                warn!(name = %task_name, error = %error, "skipped");
            } else {
                error!(name = %task_name, error = %error, "media failed");
            }
        }
        result
    }

    async fn plan(
        &self,
        descriptor: &MediaDescriptor,
        dir: &Path,
        base_name: &str,
        task_name: &str,
        options: &MediaOptions,
        task: TaskId,
    ) -> Result<MediaPlan, MediaError> {
        if let Some(dash) = &descriptor.dash {
            let (video, audio) = choose_quality(dash, &options.quality, &options.codec)
                .ok_or_else(|| MediaError::NoMatchingQuality {
                    title: task_name.to_string(),
                    quality: options.quality.to_string(),
                    codec: options.codec.to_string(),
                })?;
            let media_name = match options.time_range {
                Some(range) => sanitize(base_name, Some(&range.to_string())),
                None => base_name.to_string(),
            };
            let (jobs, output) = match (audio, options.only_audio) {
                (None, false) => (vec![(video, dir.join(format!("{media_name}.mp4")))], None),
                (Some(audio), false) => {
                    let (exists, output) =
                        path_check(&dir.join(format!("{media_name}.mp4")), PATH_CHECK_RETRY).await?;
                    if exists {
                        info!(path = %output.display(), "exists");
                        return Ok(MediaPlan::Existing(output));
                    }
                    let flac = audio.codec == "fLaC";
                    let tool = Arc::clone(self.engine.tool());
                    let target = output.clone();
                    self.engine.progress().set_upper(
                        task,
                        Box::new(move |paths: Vec<PathBuf>| {
                            async move {
                                match paths.as_slice() {
                                    [video, audio] => tool.combine(video, audio, &target, flac).await,
                                    other => Err(ToolError::MissingInputs {
                                        expected: 2,
                                        found: other.len(),
                                    }),
                                }
                            }
                            .boxed()
                        }),
                    );
                    (
                        vec![
                            (video, dir.join(format!("{media_name}-v"))),
                            (audio, dir.join(format!("{media_name}-a"))),
                        ],
                        Some(output),
                    )
                }
                (Some(audio), true) => (
                    vec![(audio, dir.join(format!("{media_name}{}", audio.suffix)))],
                    None,
                ),
                (None, true) => {
                    warn!(name = %task_name, "no audio stream");
                    return Ok(MediaPlan::Nothing);
                }
            };
            return Ok(match options.time_range {
                Some(range) => MediaPlan::Clipped {
                    jobs: jobs
                        .into_iter()
                        .map(|(stream, path)| (stream.clone(), path))
                        .collect(),
                    range,
                    output,
                },
                None => MediaPlan::Ranged {
                    jobs: jobs
                        .into_iter()
                        .map(|(stream, path)| (stream.urls.clone(), path))
                        .collect(),
                    gate: None,
                    output,
                },
            });
        }

        match descriptor.files.as_slice() {
            [] => {}
            [file] => {
                return Ok(MediaPlan::Ranged {
                    jobs: vec![(
                        file.urls.clone(),
                        dir.join(format!("{base_name}.{}", file.suffix)),
                    )],
                    gate: None,
                    output: None,
                });
            }
            files => {
                let (exists, output) =
                    path_check(&dir.join(format!("{base_name}.mp4")), PATH_CHECK_RETRY).await?;
                if exists {
                    info!(path = %output.display(), "exists");
                    return Ok(MediaPlan::Existing(output));
                }
                let tool = Arc::clone(self.engine.tool());
                let target = output.clone();
                self.engine.progress().set_upper(
                    task,
                    Box::new(move |paths: Vec<PathBuf>| {
                        async move { tool.concat(&paths, &target).await }.boxed()
                    }),
                );
                let jobs = files
                    .iter()
                    .enumerate()
                    .map(|(i, file)| {
                        (
                            file.urls.clone(),
                            dir.join(format!("{base_name}-{i}.{}", file.suffix)),
                        )
                    })
                    .collect();
                return Ok(MediaPlan::Ranged {
                    jobs,
                    gate: Some(self.engine.governor().part_gate()),
                    output: Some(output),
                });
            }
        }

        if let Some(url) = &descriptor.hls_url {
            return Ok(MediaPlan::Hls {
                url: url.clone(),
                path: dir.join(format!("{base_name}.mp4")),
            });
        }

        Err(MediaError::Api(ApiError::resource(
            "no downloadable stream (membership or region restricted)",
            descriptor.source_url.as_str(),
        )))
    }

    async fn run_plan(
        &self,
        plan: MediaPlan,
        time_range: Option<TimeRange>,
        task: TaskId,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        match plan {
            MediaPlan::Ranged { jobs, gate, .. } => {
                let _job = self.engine.acquire_job().await?;
                let downloads = jobs.into_iter().map(|(urls, path)| {
                    let gate = gate.clone();
                    async move {
                        let _permit = match gate {
                            Some(gate) => Some(
                                gate.acquire_owned()
                                    .await
                                    .map_err(|_| DownloadError::GateClosed)?,
                            ),
                            None => None,
                        };
                        self.engine.get_file(&urls, &path, Some(task)).await
                    }
                });
                join_all(downloads).await.into_iter().collect()
            }
            MediaPlan::Clipped { jobs, range, .. } => {
                let _job = self.engine.acquire_job().await?;
                self.run_clips(&jobs, range, task).await
            }
            MediaPlan::Hls { url, path } => self
                .engine
                .get_m3u8_video(&url, &path, time_range, Some(task))
                .await
                .map(|path| vec![path]),
            MediaPlan::Existing(path) => Ok(vec![path]),
            MediaPlan::Nothing => Ok(Vec::new()),
        }
    }

    /// Plans every clip in order, then downloads them concurrently.
    ///
    /// The first stream's clip starts on the subsegment holding
    /// `range.start`; later streams are cut from that same instant so the
    /// tracks stay in sync.
    async fn run_clips(
        &self,
        jobs: &[(Stream, PathBuf)],
        range: TimeRange,
        task: TaskId,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let mut aligned = range.start;
        let mut planned = Vec::with_capacity(jobs.len());
        for (i, (stream, path)) in jobs.iter().enumerate() {
            let base = stream.segment_base.as_ref().ok_or_else(|| {
                DownloadError::segment_index(
                    stream.urls.first().cloned().unwrap_or_default(),
                    "stream has no segment base",
                )
            })?;
            let window = TimeRange {
                start: aligned,
                end: range.end,
            };
            let clip = self
                .engine
                .plan_media_clip(&stream.urls, base, window)
                .await?;
            let start = if i == 0 {
                aligned = range.start - clip.lead;
                0.0
            } else {
                clip.lead
            };
            planned.push((stream, path, clip, start));
        }
        debug!(aligned, end = range.end, "clip start aligned");

        let duration = range.end - aligned;
        let downloads = planned.iter().map(|(stream, path, clip, start)| {
            self.engine
                .get_media_clip(&stream.urls, clip, *start, duration, path, Some(task))
        });
        join_all(downloads).await.into_iter().collect()
    }

    /// Downloads requested side artifacts; failures are logged.
    async fn get_extras(
        &self,
        descriptor: &MediaDescriptor,
        dir: &Path,
        base_name: &str,
        options: &MediaOptions,
    ) {
        if !(options.image || options.subtitle || options.dm) {
            return;
        }
        let extra_dir = if options.hierarchy {
            dir.join("extra")
        } else {
            dir.to_path_buf()
        };
        if let Err(error) = tokio::fs::create_dir_all(&extra_dir).await {
            warn!(path = %extra_dir.display(), error = %error, "cannot create extra directory");
            return;
        }

        let mut jobs: Vec<BoxFuture<'_, Result<Vec<PathBuf>, MediaError>>> = Vec::new();
        if options.image {
            if let Some(cover) = descriptor.streams_of(StreamKind::Image).next() {
                let path = extra_dir.join(base_name);
                jobs.push(
                    async move {
                        let url = cover.urls.first().map(String::as_str).unwrap_or_default();
                        let saved = self.engine.get_static(url, &path).await?;
                        Ok::<_, MediaError>(vec![saved])
                    }
                    .boxed(),
                );
            }
        }
        if options.subtitle {
            jobs.push(self.get_subtitles(descriptor, &extra_dir, base_name).boxed());
        }
        if options.dm {
            jobs.push(
                async {
                    let saved = self.get_danmaku(descriptor, &extra_dir, base_name).await?;
                    Ok::<_, MediaError>(saved.into_iter().collect())
                }
                .boxed(),
            );
        }

        for result in join_all(jobs).await {
            if let Err(error) = result {
                warn!(name = %base_name, error = %error, "side artifact failed");
            }
        }
    }

    /// Saves every subtitle track of `descriptor` as `{base}-{lang}.srt`.
    ///
    /// # Errors
    ///
    /// Returns the first request, decode or IO error.
    pub async fn get_subtitles(
        &self,
        descriptor: &MediaDescriptor,
        dir: &Path,
        base_name: &str,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let tracks = descriptor
            .streams_of(StreamKind::Subtitle)
            .map(|track| self.get_subtitle_track(track, dir, base_name));
        join_all(tracks).await.into_iter().collect()
    }

    async fn get_subtitle_track(
        &self,
        track: &Stream,
        dir: &Path,
        base_name: &str,
    ) -> Result<PathBuf, MediaError> {
        let name = sanitize(base_name, Some(&track.quality));
        let (exists, path) = path_check(&dir.join(format!("{name}.srt")), PATH_CHECK_RETRY).await?;
        if exists {
            info!(path = %path.display(), "exists");
            return Ok(path);
        }
        let url = track.urls.first().map(String::as_str).unwrap_or_default();
        let json = self.engine.client().get_text(url).await?;
        let srt = json_to_srt(&json).map_err(|e| ApiError::parse(format!("subtitle {url}"), e))?;
        tokio::fs::write(&path, srt)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        info!(path = %path.display(), "done");
        Ok(path)
    }

    /// Saves the concatenated danmaku segments as `{base}-danmaku.pb`.
    ///
    /// Returns `None` when the descriptor has no danmaku.
    ///
    /// # Errors
    ///
    /// Returns the first request or IO error.
    pub async fn get_danmaku(
        &self,
        descriptor: &MediaDescriptor,
        dir: &Path,
        base_name: &str,
    ) -> Result<Option<PathBuf>, MediaError> {
        let segments: Vec<&str> = descriptor
            .streams_of(StreamKind::Danmaku)
            .filter_map(|s| s.urls.first().map(String::as_str))
            .collect();
        if segments.is_empty() {
            return Ok(None);
        }
        let name = sanitize(base_name, Some("danmaku"));
        let (exists, path) = path_check(&dir.join(format!("{name}.pb")), PATH_CHECK_RETRY).await?;
        if exists {
            info!(path = %path.display(), "exists");
            return Ok(Some(path));
        }
        let client = self.engine.client();
        let bodies = join_all(segments.iter().map(|url| client.get_bytes(url))).await;
        let mut content = Vec::new();
        for body in bodies {
            content.extend_from_slice(&body?);
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        info!(path = %path.display(), "done");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PageInfo;

    fn descriptor(title: &str, page: &str) -> MediaDescriptor {
        MediaDescriptor {
            title: title.to_string(),
            page: Some(PageInfo {
                index: 1,
                name: page.to_string(),
                url: String::new(),
            }),
            ..MediaDescriptor::default()
        }
    }

    #[test]
    fn test_media_names_join_title_and_page() {
        let (task, base) = media_names(&descriptor("Hello: World", "P2-Intro"), true);
        assert_eq!(task, "Hello World-P2-Intro");
        assert_eq!(base, task);
    }

    #[test]
    fn test_media_names_long_title_uses_page_in_hierarchy() {
        let long = "x".repeat(TITLE_OVERFLOW + 1);
        let (task, base) = media_names(&descriptor(&long, "P1-Start"), true);
        assert_eq!(base, "P1-Start");
        assert!(task.ends_with("-P1-Start"));

        let (_, flat) = media_names(&descriptor(&long, "P1-Start"), false);
        assert_eq!(flat, task);

        let (_, no_page) = media_names(&descriptor(&long, ""), true);
        assert_eq!(no_page, long);
    }
}
