//! Segmented byte-range downloader.
//!
//! A file is split into `part_concurrency` contiguous ranges, each fetched by
//! its own worker into a part file named `{name}-{start}-{end}`. Part files
//! survive interruption and are resumed from their on-disk length. Once every
//! worker finishes, the parts are copied in order into `{name}.merging`,
//! which is renamed to the target path before the parts are removed, so an
//! interrupted merge is simply redone on the next run.
//!
//! Time-range clips of dash streams fetch the initialization range plus the
//! subsegments listed by the stream's segment index, through the same part
//! machinery, then cut the merged file with the transmux tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use super::client::{ContentInfo, FetchRequest, map_send_error, read_body};
use super::constants::PATH_CHECK_RETRY;
use super::engine::EngineCore;
use super::error::DownloadError;
use super::governor::reslice;
use super::path::{file_name_from_url, path_check, sanitize, with_name_suffix};
use super::retry::{PART_RETRY_LIMIT, classify_error};
use super::sidx::{ClipRanges, SegmentBase, clip_ranges, parse_sidx};
use crate::progress::{TaskId, TaskSpec, TaskUpdate};
use crate::units::TimeRange;

/// One byte range of a file and the part file holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFile {
    /// Part file path (`{name}-{start}-{end}`).
    pub path: PathBuf,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
}

impl PartFile {
    fn new(target: &Path, start: u64, end: u64) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: target.with_file_name(format!("{name}-{start}-{end}")),
            start,
            end,
        }
    }

    /// Number of bytes the range covers.
    pub(crate) fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Partitions `[0, total - 1]` into at most `parts` contiguous inclusive ranges.
///
/// Every range but the last has `total / parts` bytes; the last absorbs the
/// remainder. Empty ranges are dropped, so a resource smaller than `parts`
/// bytes yields a single range and an empty resource yields none.
#[must_use]
pub fn plan_parts(total: u64, parts: usize) -> Vec<(u64, u64)> {
    if total == 0 {
        return Vec::new();
    }
    let parts = u64::try_from(parts.max(1)).unwrap_or(1);
    let length = total / parts;
    (0..parts)
        .filter_map(|i| {
            let start = i * length;
            let end = if i < parts - 1 {
                ((i + 1) * length).checked_sub(1)?
            } else {
                total - 1
            };
            (start <= end).then_some((start, end))
        })
        .collect()
}

/// Downloads files as concurrently fetched byte ranges.
#[derive(Clone)]
pub struct RangeDownloader {
    core: Arc<EngineCore>,
}

impl std::fmt::Debug for RangeDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDownloader").finish_non_exhaustive()
    }
}

impl RangeDownloader {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Downloads `urls` (a primary URL followed by backups) to `path`.
    ///
    /// When `path` is a directory the file name comes from the
    /// `Content-Disposition` header, else from the last URL path segment.
    /// With `task`, the file's size is added to that task's total and the
    /// task is left visible if it has a post-completion action; otherwise a
    /// new task is created and hidden when done.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::PartRetryExceeded`] when a part keeps failing,
    /// or the size probe, IO or path errors.
    #[instrument(skip(self, urls), fields(path = %path.display(), urls = urls.len()))]
    pub async fn get_file(
        &self,
        urls: &[String],
        path: &Path,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        let progress = Arc::clone(self.core.governor.progress());
        let has_upper = task.is_some_and(|id| progress.has_upper(id));
        if urls.is_empty() {
            return Err(DownloadError::invalid_url("<no url>"));
        }

        let is_dir = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        let mut target = path.to_path_buf();
        if !is_dir {
            let (exists, checked) = path_check(&target, PATH_CHECK_RETRY).await?;
            if exists {
                if !has_upper {
                    info!(path = %checked.display(), "exists");
                }
                return Ok(checked);
            }
            target = checked;
        }

        let (probed, info) = self.probe(urls).await?;
        let mut urls = urls.to_vec();
        if info.final_url != urls[probed] {
            debug!(from = %urls[probed], to = %info.final_url, "using redirected url");
            urls[probed] = info.final_url.clone();
        }

        if is_dir {
            let name = info
                .filename
                .as_deref()
                .map(|name| sanitize(name, None))
                .filter(|name| !name.is_empty())
                .or_else(|| file_name_from_url(&urls[0]))
                .unwrap_or_else(|| "download".to_string());
            let (exists, checked) = path_check(&path.join(name), PATH_CHECK_RETRY).await?;
            if exists {
                if !has_upper {
                    info!(path = %checked.display(), "exists");
                }
                return Ok(checked);
            }
            target = checked;
        }

        #[allow(clippy::cast_precision_loss)]
        let total = info.total as f64;
        let task = match task {
            Some(id) => {
                progress.update(id, TaskUpdate::new().add_total(total));
                id
            }
            None => {
                let name = target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                progress.add_task(TaskSpec::new(name).with_total(total))
            }
        };

        let parts: Vec<PartFile> = plan_parts(info.total, self.core.governor.part_concurrency())
            .into_iter()
            .map(|(start, end)| PartFile::new(&target, start, end))
            .collect();
        debug!(total = info.total, parts = parts.len(), "planned parts");

        if let Err(error) = self.fetch_parts(urls, &parts, task, None).await {
            error!(path = %target.display(), error = %error, "download failed");
            return Err(error);
        }

        let part_paths: Vec<PathBuf> = parts.into_iter().map(|p| p.path).collect();
        merge_files(&part_paths, &target).await?;

        if !progress.has_upper(task) {
            progress.update(task, TaskUpdate::new().visible(false));
            info!(path = %target.display(), "done");
        }
        Ok(target)
    }

    /// Fetches every part concurrently, each behind `gate` when given.
    ///
    /// Returns the first part error once every worker has finished.
    async fn fetch_parts(
        &self,
        urls: Vec<String>,
        parts: &[PartFile],
        task: TaskId,
        gate: Option<Arc<Semaphore>>,
    ) -> Result<(), DownloadError> {
        let urls: Arc<[String]> = urls.into();
        let mut handles = Vec::with_capacity(parts.len());
        for part in parts.iter().cloned() {
            let this = self.clone();
            let urls = Arc::clone(&urls);
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match gate {
                    Some(gate) => Some(
                        gate.acquire_owned()
                            .await
                            .map_err(|_| DownloadError::GateClosed)?,
                    ),
                    None => None,
                };
                this.get_part(&urls, &part, task).await
            }));
        }

        let first = urls.first().map_or("<no url>", String::as_str);
        let mut first_error = None;
        for handle in handles {
            let outcome = handle
                .await
                .unwrap_or_else(|e| Err(DownloadError::unknown(first, e.to_string())));
            if let Err(error) = outcome {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reads the segment index of a dash stream and picks the byte ranges
    /// overlapping `range`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::SegmentIndex`] when the index cannot be
    /// parsed, [`DownloadError::EmptyTimeRange`] when nothing overlaps, or
    /// the request error.
    #[instrument(skip(self, urls, base), fields(urls = urls.len(), range = %range))]
    pub async fn plan_clip(
        &self,
        urls: &[String],
        base: &SegmentBase,
        range: TimeRange,
    ) -> Result<ClipRanges, DownloadError> {
        let first = urls
            .first()
            .ok_or_else(|| DownloadError::invalid_url("<no url>"))?;
        let (start, end) = base.index_range;
        let request = FetchRequest::get()
            .with_header(RANGE, &format!("bytes={start}-{end}"))
            .with_retries(self.core.stream_retry);
        let scores = self.core.governor.scores();
        let response = self.core.client.fetch(urls, &request, Some(scores)).await?;
        let body = read_body(response, first).await?;
        let index =
            parse_sidx(&body).map_err(|message| DownloadError::segment_index(first, message))?;
        let clip = clip_ranges(&index, base, range).ok_or(DownloadError::EmptyTimeRange {
            url: first.clone(),
            start: range.start,
            end: range.end,
        })?;
        debug!(ranges = clip.ranges.len(), lead = clip.lead, "planned clip");
        Ok(clip)
    }

    /// Downloads the byte ranges of `clip` and cuts `duration` seconds
    /// starting `start` seconds into them, writing `path`.
    ///
    /// Task handling matches [`RangeDownloader::get_file`], with the total
    /// counting only the selected ranges.
    ///
    /// # Errors
    ///
    /// Returns part, IO, path or transmux errors.
    #[instrument(skip(self, urls, clip), fields(path = %path.display(), ranges = clip.ranges.len()))]
    pub async fn get_clip(
        &self,
        urls: &[String],
        clip: &ClipRanges,
        start: f64,
        duration: f64,
        path: &Path,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        let progress = Arc::clone(self.core.governor.progress());
        let (exists, target) = path_check(path, PATH_CHECK_RETRY).await?;
        if exists {
            if !task.is_some_and(|id| progress.has_upper(id)) {
                info!(path = %target.display(), "exists");
            }
            return Ok(target);
        }

        #[allow(clippy::cast_precision_loss)]
        let total = clip.total() as f64;
        let task = match task {
            Some(id) => {
                progress.update(id, TaskUpdate::new().add_total(total));
                id
            }
            None => {
                let name = target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                progress.add_task(TaskSpec::new(name).with_total(total))
            }
        };

        let parts: Vec<PartFile> = clip
            .ranges
            .iter()
            .map(|&(start, end)| PartFile::new(&target, start, end))
            .collect();
        let gate = self.core.governor.part_gate();
        if let Err(error) = self.fetch_parts(urls.to_vec(), &parts, task, Some(gate)).await {
            error!(path = %target.display(), error = %error, "clip failed");
            return Err(error);
        }

        let merged = with_name_suffix(&target, ".clip");
        let part_paths: Vec<PathBuf> = parts.into_iter().map(|p| p.path).collect();
        merge_files(&part_paths, &merged).await?;
        self.core.tool.clip(&merged, start, duration, &target).await?;

        if !progress.has_upper(task) {
            progress.update(task, TaskUpdate::new().visible(false));
            info!(path = %target.display(), "done");
        }
        Ok(target)
    }

    /// Probes the size from the first URL that answers. URLs that fail the
    /// probe are penalized.
    async fn probe(&self, urls: &[String]) -> Result<(usize, ContentInfo), DownloadError> {
        let scores = self.core.governor.scores();
        let mut last_error = None;
        for (index, url) in urls.iter().enumerate() {
            match self.core.client.content_length(url).await {
                Ok(info) => return Ok((index, info)),
                Err(error) => {
                    scores.penalize(url, classify_error(&error));
                    debug!(url = %url, error = %error, "size probe failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DownloadError::invalid_url("<no url>")))
    }

    /// Fetches one part, resuming from its on-disk length and retrying up to
    /// [`PART_RETRY_LIMIT`] times.
    async fn get_part(
        &self,
        urls: &[String],
        part: &PartFile,
        task: TaskId,
    ) -> Result<PathBuf, DownloadError> {
        let progress = self.core.governor.progress();
        let retry = self.core.governor.retry();
        let scores = self.core.governor.scores();

        let mut already = file_len(&part.path).await;
        if already > part.len() {
            warn!(part = %part.name(), size = already, expected = part.len(), "truncating oversized part");
            truncate_part(&part.path, part.len()).await?;
            already = part.len();
        }
        if already > 0 {
            #[allow(clippy::cast_precision_loss)]
            progress.update(task, TaskUpdate::new().advance(already as f64));
        }

        let mut attempt = 0;
        loop {
            if attempt > PART_RETRY_LIMIT {
                error!(part = %part.name(), attempts = attempt, "part retries exhausted");
                return Err(DownloadError::PartRetryExceeded {
                    part: part.name(),
                    attempts: attempt,
                });
            }

            let start = part.start + file_len(&part.path).await;
            if start > part.end {
                return Ok(part.path.clone());
            }

            let Some(url) = scores.choose(urls) else {
                return Err(DownloadError::invalid_url("<no url>"));
            };
            match self.stream_range(url, start, part, task).await {
                Ok(()) => return Ok(part.path.clone()),
                Err(error) => {
                    let kind = classify_error(&error);
                    scores.penalize(url, kind);
                    let mut delay = retry.part_delay(kind, attempt);
                    if kind.is_forbidden() {
                        delay += retry.forbidden_delay(attempt);
                    }
                    warn!(
                        part = %part.name(),
                        url = %url,
                        error = %error,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "part failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Streams `[start, part.end]` of `url` onto the end of the part file.
    async fn stream_range(
        &self,
        url: &str,
        start: u64,
        part: &PartFile,
        task: TaskId,
    ) -> Result<(), DownloadError> {
        let governor = &self.core.governor;
        let progress = governor.progress();
        let request =
            FetchRequest::get().with_header(RANGE, &format!("bytes={start}-{}", part.end));
        let response = self.core.client.send(url, &request).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part.path)
            .await
            .map_err(|e| DownloadError::io(&part.path, e))?;

        let mut remaining = part.end - start + 1;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_send_error(url, e))?;
            for slice in reslice(&chunk, governor.chunk_limit()) {
                let take = usize::try_from(remaining).map_or(slice.len(), |r| slice.len().min(r));
                file.write_all(&slice[..take])
                    .await
                    .map_err(|e| DownloadError::io(&part.path, e))?;
                remaining -= take as u64;
                #[allow(clippy::cast_precision_loss)]
                progress.update(task, TaskUpdate::new().advance(take as f64));
                governor.throttle(take).await;
                if remaining == 0 {
                    break;
                }
            }
            if remaining == 0 {
                break;
            }
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::io(&part.path, e))?;
        if remaining > 0 {
            return Err(DownloadError::unknown(
                url,
                format!("body ended {remaining} bytes short"),
            ));
        }
        Ok(())
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |m| m.len())
}

async fn truncate_part(path: &Path, len: u64) -> Result<(), DownloadError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.set_len(len)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

/// Copies `parts` in order into `{target}.merging`, renames that file to
/// `target`, then removes the parts. No parts yields an empty `target`.
///
/// The parts stay on disk until `target` exists, so a merge interrupted at
/// any point is redone from scratch by the next call.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on any file system failure.
pub async fn merge_files(parts: &[PathBuf], target: &Path) -> Result<(), DownloadError> {
    let merging = with_name_suffix(target, ".merging");
    let mut out = tokio::fs::File::create(&merging)
        .await
        .map_err(|e| DownloadError::io(&merging, e))?;
    for part in parts {
        let mut input = tokio::fs::File::open(part)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
    }
    out.flush().await.map_err(|e| DownloadError::io(&merging, e))?;
    out.sync_all()
        .await
        .map_err(|e| DownloadError::io(&merging, e))?;
    drop(out);

    tokio::fs::rename(&merging, target)
        .await
        .map_err(|e| DownloadError::io(target, e))?;
    for part in parts {
        if let Err(error) = tokio::fs::remove_file(part).await {
            warn!(part = %part.display(), error = %error, "cannot remove merged part");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plan_parts_cover_total_disjointly() {
        for (total, parts) in [(10u64, 3usize), (1_000_003, 10), (7, 7), (100, 1)] {
            let plan = plan_parts(total, parts);
            assert_eq!(plan.first().unwrap().0, 0);
            assert_eq!(plan.last().unwrap().1, total - 1);
            for pair in plan.windows(2) {
                assert_eq!(pair[0].1 + 1, pair[1].0, "gap or overlap in {plan:?}");
            }
            let sum: u64 = plan.iter().map(|(s, e)| e - s + 1).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn test_plan_parts_last_absorbs_remainder() {
        assert_eq!(plan_parts(10, 3), vec![(0, 2), (3, 5), (6, 9)]);
    }

    #[test]
    fn test_plan_parts_small_and_empty_resources() {
        assert!(plan_parts(0, 10).is_empty());
        assert_eq!(plan_parts(3, 10), vec![(0, 2)]);
    }

    #[test]
    fn test_part_file_naming() {
        let part = PartFile::new(Path::new("/d/Hello-v"), 0, 2_621_439);
        assert_eq!(part.path, PathBuf::from("/d/Hello-v-0-2621439"));
        assert_eq!(part.len(), 2_621_440);
    }

    #[tokio::test]
    async fn test_merge_files_concatenates_in_order_and_removes_parts() {
        let dir = TempDir::new().unwrap();
        let parts: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("p{i}"))).collect();
        for (i, part) in parts.iter().enumerate() {
            std::fs::write(part, format!("chunk{i};")).unwrap();
        }
        let target = dir.path().join("out.bin");

        merge_files(&parts, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "chunk0;chunk1;chunk2;");
        assert!(parts.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_merge_files_overwrites_stale_merge_output() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.bin");
        std::fs::write(dir.path().join("out.bin.merging"), "half-written garbage").unwrap();
        let parts: Vec<PathBuf> = (0..2).map(|i| dir.path().join(format!("p{i}"))).collect();
        for (i, part) in parts.iter().enumerate() {
            std::fs::write(part, format!("chunk{i};")).unwrap();
        }

        merge_files(&parts, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "chunk0;chunk1;");
        assert!(!dir.path().join("out.bin.merging").exists());
    }

    #[tokio::test]
    async fn test_truncate_part_drops_bytes_past_the_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin-0-3");
        std::fs::write(&path, b"abcdefgh").unwrap();
        truncate_part(&path, 4).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_merge_files_without_parts_creates_empty_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("empty.bin");
        merge_files(&[], &target).await.unwrap();
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }
}
