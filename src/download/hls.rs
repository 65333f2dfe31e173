//! HLS (m3u8) downloader.
//!
//! A playlist is resolved to a media playlist (a master playlist follows its
//! first variant), its segments are fetched concurrently under a per-job
//! part gate, decrypted when an `EXT-X-KEY` applies, and concatenated in
//! playlist order. With a time range only overlapping segments are fetched and
//! the result is trimmed by the transmux tool.
//!
//! Keys are fetched at most once per job through [`KeyCache`]: concurrent
//! segments that need the same key share one in-flight request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, StreamExt};
use m3u8_rs::{KeyMethod, MediaPlaylist, Playlist};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};
use url::Url;

use super::client::{FetchRequest, HttpClient, map_send_error};
use super::constants::PATH_CHECK_RETRY;
use super::engine::EngineCore;
use super::error::DownloadError;
use super::governor::reslice;
use super::path::{path_check, with_name_suffix};
use super::range::merge_files;
use super::retry::{FailureKind, classify_error};
use crate::progress::{TaskId, TaskSpec, TaskUpdate};
use crate::units::TimeRange;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A 16-byte AES-128 key.
pub type AesKey = [u8; 16];

/// Master playlists nested deeper than this are rejected.
const MAX_VARIANT_DEPTH: usize = 5;

/// MPEG-TS sync byte.
const TS_SYNC: u8 = 0x47;

type KeyFuture = Shared<BoxFuture<'static, Result<AesKey, String>>>;

/// State of one key URI in a [`KeyCache`].
#[derive(Clone)]
pub enum KeyEntry {
    /// A fetch is in flight; await the shared future.
    Pending(KeyFuture),
    /// The key is available.
    Ready(AesKey),
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(_) => f.write_str("Pending"),
            Self::Ready(_) => f.write_str("Ready"),
        }
    }
}

/// Per-job cache of decryption keys keyed by URI.
#[derive(Debug, Default)]
pub struct KeyCache {
    entries: Mutex<HashMap<String, KeyEntry>>,
}

impl KeyCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeyEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the key for `uri`, starting `fetch` only if no entry exists.
    ///
    /// A failed fetch removes its entry so a later caller can try again.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Decrypt`] with the fetch's failure message.
    pub async fn get_or_fetch<F>(&self, uri: &str, fetch: F) -> Result<AesKey, DownloadError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<AesKey, String>>,
    {
        let pending = {
            let mut entries = self.lock();
            match entries.get(uri) {
                Some(KeyEntry::Ready(key)) => return Ok(*key),
                Some(KeyEntry::Pending(shared)) => shared.clone(),
                None => {
                    debug!(uri = %uri, "fetching key");
                    let shared = fetch().shared();
                    entries.insert(uri.to_string(), KeyEntry::Pending(shared.clone()));
                    shared
                }
            }
        };

        let result = pending.clone().await;
        let mut entries = self.lock();
        let same_entry = matches!(
            entries.get(uri),
            Some(KeyEntry::Pending(current)) if Shared::ptr_eq(current, &pending)
        );
        match result {
            Ok(key) => {
                if same_entry {
                    entries.insert(uri.to_string(), KeyEntry::Ready(key));
                }
                Ok(key)
            }
            Err(message) => {
                if same_entry {
                    entries.remove(uri);
                }
                Err(DownloadError::decrypt(uri, message))
            }
        }
    }

    /// Snapshot of the entry for `uri`.
    #[must_use]
    pub fn entry(&self, uri: &str) -> Option<KeyEntry> {
        self.lock().get(uri).cloned()
    }
}

/// Encryption parameters that apply to one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    /// Absolute key URI.
    pub uri: String,
    /// Initialization vector.
    pub iv: [u8; 16],
}

/// One segment of a resolved media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    /// Position in the playlist.
    pub index: usize,
    /// Absolute segment URL.
    pub url: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Key in effect, if the segment is encrypted.
    pub key: Option<SegmentKey>,
}

/// A media playlist with absolute URLs and keys propagated to every segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlaylist {
    /// Segments in playlist order.
    pub segments: Vec<HlsSegment>,
    /// Absolute URL of the `EXT-X-MAP` init section, if any.
    pub init_url: Option<String>,
}

/// Segments overlapping a time range plus the offset of the range start into
/// the first selected segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Selected segments in order.
    pub segments: Vec<HlsSegment>,
    /// Seconds between the first selected segment's start and the range start.
    pub offset: f64,
}

/// Resolves `reference` against the playlist URL.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidUrl`] when neither URL can be parsed.
pub fn resolve_uri(base: &str, reference: &str) -> Result<String, DownloadError> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute.to_string());
    }
    Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(|url| url.to_string())
        .map_err(|_| DownloadError::invalid_url(reference))
}

/// Parses an IV attribute (`0x` prefix optional) into 16 bytes.
#[must_use]
pub fn parse_iv(value: &str) -> Option<[u8; 16]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(digits).ok()?;
    let mut iv = [0u8; 16];
    let offset = 16usize.checked_sub(bytes.len())?;
    iv[offset..].copy_from_slice(&bytes);
    Some(iv)
}

/// IV used when a key tag has none: the media sequence number, big-endian.
#[must_use]
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    u128::from(sequence).to_be_bytes()
}

/// Propagates keys and resolves URIs of a parsed media playlist.
///
/// # Errors
///
/// Returns [`DownloadError::Playlist`] for keys without a usable URI or IV,
/// or [`DownloadError::InvalidUrl`] for unresolvable URIs.
pub fn resolve_media_playlist(
    playlist_url: &str,
    playlist: &MediaPlaylist,
) -> Result<ResolvedPlaylist, DownloadError> {
    let mut current_key: Option<(String, Option<[u8; 16]>)> = None;
    let mut init_url = None;
    let mut segments = Vec::with_capacity(playlist.segments.len());

    for (index, segment) in playlist.segments.iter().enumerate() {
        if let Some(key) = &segment.key {
            current_key = match &key.method {
                KeyMethod::None => None,
                KeyMethod::AES128 => {
                    let uri = key.uri.as_deref().ok_or_else(|| {
                        DownloadError::playlist(playlist_url, "AES-128 key without URI")
                    })?;
                    let iv = match key.iv.as_deref() {
                        Some(raw) => Some(parse_iv(raw).ok_or_else(|| {
                            DownloadError::playlist(playlist_url, format!("invalid IV {raw}"))
                        })?),
                        None => None,
                    };
                    Some((resolve_uri(playlist_url, uri)?, iv))
                }
                other => {
                    return Err(DownloadError::playlist(
                        playlist_url,
                        format!("unsupported key method {other:?}"),
                    ));
                }
            };
        }
        if let (None, Some(map)) = (&init_url, &segment.map) {
            init_url = Some(resolve_uri(playlist_url, &map.uri)?);
        }

        let sequence = playlist.media_sequence + index as u64;
        segments.push(HlsSegment {
            index,
            url: resolve_uri(playlist_url, &segment.uri)?,
            duration: f64::from(segment.duration),
            key: current_key.as_ref().map(|(uri, iv)| SegmentKey {
                uri: uri.clone(),
                iv: iv.unwrap_or_else(|| sequence_iv(sequence)),
            }),
        });
    }

    Ok(ResolvedPlaylist { segments, init_url })
}

/// Selects every segment overlapping `[range.start, range.end]`.
///
/// Returns `None` when nothing overlaps.
#[must_use]
pub fn select_time_range(segments: &[HlsSegment], range: TimeRange) -> Option<Selection> {
    let mut elapsed = 0.0;
    let mut offset = None;
    let mut selected = Vec::new();
    for segment in segments {
        let seg_start = elapsed;
        let seg_end = elapsed + segment.duration;
        elapsed = seg_end;
        if seg_end <= range.start {
            continue;
        }
        if seg_start >= range.end {
            break;
        }
        if offset.is_none() {
            offset = Some(range.start - seg_start);
        }
        selected.push(segment.clone());
    }
    Some(Selection {
        segments: selected,
        offset: offset?,
    })
}

/// Drops bytes that precede the first MPEG-TS packet start.
///
/// Some hosts disguise segments by prefixing them with image data; the real
/// stream starts at a sync byte followed by `0x40` or `0x41`.
#[must_use]
pub fn strip_camouflage(content: &[u8]) -> &[u8] {
    content
        .windows(2)
        .position(|w| w[0] == TS_SYNC && (w[1] == 0x40 || w[1] == 0x41))
        .map_or(content, |start| &content[start..])
}

/// Decrypts AES-128-CBC content with PKCS#7 padding.
///
/// # Errors
///
/// Returns a message for bad key material or padding.
pub fn decrypt_segment(key: &AesKey, iv: &[u8; 16], content: &mut Vec<u8>) -> Result<(), String> {
    let decryptor =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|_| "invalid key length".to_string())?;
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(content)
        .map_err(|_| "invalid padding".to_string())?
        .len();
    content.truncate(len);
    Ok(())
}

/// Downloads HLS playlists into a single file.
#[derive(Clone)]
pub struct HlsDownloader {
    core: Arc<EngineCore>,
}

impl std::fmt::Debug for HlsDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlsDownloader").finish_non_exhaustive()
    }
}

struct SegmentJob {
    task: TaskId,
    keys: KeyCache,
    gate: Arc<Semaphore>,
}

impl HlsDownloader {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Downloads the playlist at `playlist_url` into `path`.
    ///
    /// When `path` is a directory the file is named after the playlist's URL
    /// stem with an `.mp4` suffix. With `time_range` the file stem gains
    /// `-{start}-{end}`, only overlapping segments are fetched and the
    /// concatenation is trimmed to the range.
    ///
    /// Progress is measured in seconds of media: the task's total grows by
    /// the summed duration of the selected segments and advances by each
    /// segment's duration once it is on disk. With `task`, that task is
    /// reused and left visible if it has a post-completion action;
    /// otherwise a new task is created and hidden when done.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::StreamRetryExceeded`] when a segment keeps
    /// failing, [`DownloadError::EmptyTimeRange`] when the range selects no
    /// segment, and playlist, key, IO or tool errors.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn get_m3u8_video(
        &self,
        playlist_url: &str,
        path: &Path,
        time_range: Option<TimeRange>,
        task: Option<TaskId>,
    ) -> Result<PathBuf, DownloadError> {
        let mut target = if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
            let stem = Url::parse(playlist_url)
                .ok()
                .and_then(|url| {
                    url.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .and_then(|name| {
                    Path::new(&name)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                })
                .filter(|stem| !stem.is_empty())
                .unwrap_or_else(|| "video".to_string());
            path.join(format!("{stem}.mp4"))
        } else {
            path.to_path_buf()
        };
        if let Some(range) = time_range {
            let stem = target
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = match target.extension() {
                Some(ext) => format!("{stem}-{range}.{}", ext.to_string_lossy()),
                None => format!("{stem}-{range}"),
            };
            target.set_file_name(name);
        }

        let (exists, target) = path_check(&target, PATH_CHECK_RETRY).await?;
        if exists {
            info!(path = %target.display(), "exists");
            return Ok(target);
        }

        let _job = self.core.governor.acquire_job().await?;
        let progress = Arc::clone(self.core.governor.progress());

        let playlist = self.media_playlist(playlist_url).await?;
        let (segments, offset) = match time_range {
            Some(range) => {
                let selection = select_time_range(&playlist.segments, range).ok_or(
                    DownloadError::EmptyTimeRange {
                        url: playlist_url.to_string(),
                        start: range.start,
                        end: range.end,
                    },
                )?;
                (selection.segments, selection.offset)
            }
            None => (playlist.segments, 0.0),
        };
        if segments.is_empty() {
            return Err(DownloadError::playlist(playlist_url, "no segments"));
        }

        let total_secs: f64 = segments.iter().map(|s| s.duration).sum();
        let task = match task {
            Some(id) => {
                progress.update(id, TaskUpdate::new().add_total(total_secs));
                id
            }
            None => {
                let name = target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                progress.add_task(TaskSpec::new(name).with_total(total_secs))
            }
        };

        let job = Arc::new(SegmentJob {
            task,
            keys: KeyCache::new(),
            gate: self.core.governor.part_gate(),
        });
        debug!(segments = segments.len(), total_secs, "fetching segments");

        let mut handles = Vec::with_capacity(segments.len() + 1);
        if let Some(init_url) = playlist.init_url {
            let this = self.clone();
            let init_path = with_name_suffix(&file_stem_path(&target), "-init");
            handles.push(tokio::spawn(async move {
                this.get_init(&init_url, &init_path).await
            }));
        }
        for segment in segments {
            let this = self.clone();
            let job = Arc::clone(&job);
            let seg_path = with_name_suffix(&file_stem_path(&target), &format!("-{}.ts", segment.index));
            handles.push(tokio::spawn(async move {
                this.get_segment(&segment, &seg_path, &job).await
            }));
        }

        let mut files = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(file)) => files.push(file),
                Ok(Err(error)) => {
                    first_error.get_or_insert(error);
                }
                Err(join) => {
                    first_error.get_or_insert(DownloadError::unknown(playlist_url, join.to_string()));
                }
            }
        }
        if let Some(error) = first_error {
            error!(path = %target.display(), error = %error, "download failed");
            return Err(error);
        }

        match time_range {
            None => merge_files(&files, &target).await?,
            Some(range) => {
                let concatenated = with_name_suffix(&file_stem_path(&target), ".ts");
                merge_files(&files, &concatenated).await?;
                self.core
                    .tool
                    .clip(&concatenated, offset, range.duration(), &target)
                    .await?;
            }
        }

        if !progress.has_upper(task) {
            progress.update(task, TaskUpdate::new().visible(false));
        }
        info!(path = %target.display(), "done");
        Ok(target)
    }

    /// Fetches and parses the playlist, following master playlists to their
    /// first variant.
    async fn media_playlist(&self, playlist_url: &str) -> Result<ResolvedPlaylist, DownloadError> {
        let mut url = playlist_url.to_string();
        for _ in 0..MAX_VARIANT_DEPTH {
            let request = FetchRequest::get().with_retries(self.core.stream_retry);
            let response = self.core.client.fetch(&[url.clone()], &request, None).await?;
            let final_url = response.url().to_string();
            let body = response
                .bytes()
                .await
                .map_err(|e| map_send_error(&url, e))?;
            match m3u8_rs::parse_playlist_res(&body) {
                Ok(Playlist::MediaPlaylist(media)) => {
                    return resolve_media_playlist(&final_url, &media);
                }
                Ok(Playlist::MasterPlaylist(master)) => {
                    let variant = master.variants.first().ok_or_else(|| {
                        DownloadError::playlist(&final_url, "master playlist without variants")
                    })?;
                    let next = resolve_uri(&final_url, &variant.uri)?;
                    debug!(variant = %next, "following first variant");
                    url = next;
                }
                Err(_) => return Err(DownloadError::playlist(&final_url, "cannot parse playlist")),
            }
        }
        Err(DownloadError::playlist(playlist_url, "too many nested master playlists"))
    }

    async fn get_init(&self, url: &str, path: &Path) -> Result<PathBuf, DownloadError> {
        let (exists, path) = path_check(path, PATH_CHECK_RETRY).await?;
        if exists {
            return Ok(path);
        }
        let bytes = self.core.client.get_bytes(url).await?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        Ok(path)
    }

    async fn get_segment(
        &self,
        segment: &HlsSegment,
        path: &Path,
        job: &SegmentJob,
    ) -> Result<PathBuf, DownloadError> {
        let progress = self.core.governor.progress();
        let (exists, path) = path_check(path, PATH_CHECK_RETRY).await?;
        if exists {
            progress.update(job.task, TaskUpdate::new().advance(segment.duration));
            return Ok(path);
        }

        let _permit = Arc::clone(&job.gate)
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::GateClosed)?;

        let mut content = self.fetch_segment(segment).await?;

        match &segment.key {
            Some(key) => {
                let client = self.core.client.clone();
                let uri = key.uri.clone();
                let aes_key = job
                    .keys
                    .get_or_fetch(&key.uri, move || fetch_key(client, uri).boxed())
                    .await?;
                decrypt_segment(&aes_key, &key.iv, &mut content)
                    .map_err(|message| DownloadError::decrypt(&key.uri, message))?;
            }
            None if !segment.url.split('?').next().unwrap_or("").ends_with(".ts") => {
                let stripped = strip_camouflage(&content);
                if stripped.len() != content.len() {
                    debug!(url = %segment.url, skipped = content.len() - stripped.len(), "stripped camouflage");
                    content = stripped.to_vec();
                }
            }
            None => {}
        }

        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        progress.update(job.task, TaskUpdate::new().advance(segment.duration));
        Ok(path)
    }

    async fn fetch_segment(&self, segment: &HlsSegment) -> Result<Vec<u8>, DownloadError> {
        let governor = &self.core.governor;
        let retries = self.core.stream_retry;
        let request = &FetchRequest::get().with_retries(retries);
        let urls = [segment.url.clone()];
        let result = self
            .core
            .client
            .retrying(&urls, request, Some(governor.scores()), |url| async move {
                let response = self.core.client.send(&url, &request).await?;
                let mut content = Vec::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| map_send_error(&url, e))?;
                    for slice in reslice(&chunk, governor.chunk_limit()) {
                        content.extend_from_slice(slice);
                        governor.throttle(slice.len()).await;
                    }
                }
                Ok(content)
            })
            .await;

        result.map_err(|error| match classify_error(&error) {
            FailureKind::Transport | FailureKind::HttpStatus(_) => {
                error!(url = %segment.url, error = %error, "segment retries exhausted");
                DownloadError::StreamRetryExceeded {
                    url: segment.url.clone(),
                    attempts: retries + 1,
                }
            }
            FailureKind::Unknown => error,
        })
    }
}

async fn fetch_key(client: HttpClient, uri: String) -> Result<AesKey, String> {
    let bytes = client.get_bytes(&uri).await.map_err(|e| e.to_string())?;
    AesKey::try_from(bytes.as_slice())
        .map_err(|_| format!("expected a 16-byte key, got {} bytes", bytes.len()))
}

/// `path` without its extension (`/d/clip.mp4` → `/d/clip`).
fn file_stem_path(path: &Path) -> PathBuf {
    path.with_extension("")
}
