//! HTTP Download Manager
//!
//! Retrieves driver packages: parallel ranged segments when the server
//! supports them, a resumable single stream otherwise, or a plain copy
//! for local-path locators.

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resume::{SegmentLedger, SegmentState};
use super::verify::calculate_sha256;
use crate::engine::config::DownloadConfig;
use crate::engine::error::{EngineError, Result};
use crate::engine::model::{CatalogEntry, DeviceRecord, DownloadResult, Locator, TransferMethod};

/// What a range probe learned about a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSupport {
    pub accepts_ranges: bool,
    pub length: Option<u64>,
}

/// Per-plan download directory, keyed by locator, hardware ID and device
/// instance. Stable across runs so interrupted transfers resume.
pub fn plan_dir(root: &Path, entry: &CatalogEntry, device: &DeviceRecord) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(entry.package.locator.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(device.hardware_id.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(device.instance_id.as_deref().unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());
    root.join(format!("{}-{}", device.hardware_id.short_id(), &digest[..16]))
}

pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("download client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Retrieve a package into `dest_dir` and hash it.
    ///
    /// A size that disagrees with the catalog triggers one full
    /// single-stream re-download before failing with `IntegrityMismatch`.
    pub async fn fetch(
        &self,
        entry: &CatalogEntry,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        fs::create_dir_all(dest_dir).await?;
        let locator = &entry.package.locator;
        let dest = dest_dir.join(locator.file_name());

        let (mut method, mut resumed) = self.retrieve(locator, &dest, true, cancel).await?;
        let mut bytes = fs::metadata(&dest).await?.len();

        if let Some(expected) = entry.package.size {
            if bytes != expected {
                warn!(
                    locator = %locator,
                    expected,
                    actual = bytes,
                    "Downloaded size differs from catalog, retrying once"
                );
                let _ = fs::remove_file(&dest).await;
                (method, resumed) = self.retrieve(locator, &dest, false, cancel).await?;
                bytes = fs::metadata(&dest).await?.len();
                if bytes != expected {
                    let _ = fs::remove_file(&dest).await;
                    return Err(EngineError::IntegrityMismatch {
                        expected,
                        actual: bytes,
                    });
                }
            }
        }

        let hash_path = dest.clone();
        let sha256 = tokio::task::spawn_blocking(move || calculate_sha256(&hash_path))
            .await
            .map_err(|e| EngineError::TransferFailed(format!("hashing task failed: {}", e)))??;

        info!(locator = %locator, bytes, ?method, resumed, "Package retrieved");
        Ok(DownloadResult {
            path: dest,
            bytes,
            sha256,
            method,
            resumed,
        })
    }

    async fn retrieve(
        &self,
        locator: &Locator,
        dest: &Path,
        allow_segments: bool,
        cancel: &CancellationToken,
    ) -> Result<(TransferMethod, bool)> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let url = match locator {
            Locator::File(source) => {
                if !source.exists() {
                    return Err(EngineError::TransferFailed(format!(
                        "package not found at {}",
                        source.display()
                    )));
                }
                fs::copy(source, dest).await?;
                return Ok((TransferMethod::LocalCopy, false));
            }
            Locator::Http(url) => url.as_str(),
        };

        if allow_segments {
            let support = self.probe(url).await?;
            if let (true, Some(total)) = (support.accepts_ranges, support.length) {
                let count = self.segment_count(total);
                if count > 1 {
                    match self.fetch_segmented(url, dest, total, count, cancel).await {
                        Ok(resumed) => return Ok((TransferMethod::Segmented { segments: count }, resumed)),
                        Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                        Err(e) => {
                            warn!(url, error = %e, "Segmented transfer failed, falling back to single stream");
                            if let Some(ledger) = SegmentLedger::load(dest) {
                                ledger.clear(dest);
                            }
                        }
                    }
                }
            }
        }

        let resumed = self.fetch_single(url, dest, cancel).await?;
        Ok((TransferMethod::SingleStream, resumed))
    }

    fn segment_count(&self, total: u64) -> usize {
        if self.config.max_segments <= 1 {
            return 1;
        }
        let by_size = total / self.config.min_segment_size.max(1);
        by_size.min(self.config.max_segments as u64) as usize
    }

    /// Check whether a URL serves byte ranges: HEAD first, then a one-byte ranged GET.
    pub async fn probe(&self, url: &str) -> Result<RangeSupport> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => {
                let headers = response.headers();
                let accepts = header_str(headers, ACCEPT_RANGES.as_str());
                let length = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
                match accepts.as_deref() {
                    Some("bytes") if length.is_some() => {
                        return Ok(RangeSupport { accepts_ranges: true, length });
                    }
                    Some("none") => return Ok(RangeSupport { accepts_ranges: false, length }),
                    _ => {}
                }
            }
            Ok(response) => debug!(url, status = %response.status(), "HEAD inconclusive"),
            Err(e) if e.is_connect() => return Err(e.into()),
            Err(e) => debug!(url, error = %e, "HEAD failed"),
        }

        let response = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            let total = header_str(response.headers(), CONTENT_RANGE.as_str())
                .and_then(|v| v.rsplit('/').next().and_then(|t| t.parse::<u64>().ok()));
            return Ok(RangeSupport {
                accepts_ranges: total.is_some(),
                length: total,
            });
        }
        if !status.is_success() {
            return Err(EngineError::TransferFailed(format!("HTTP {} from {}", status, url)));
        }
        let length = header_str(response.headers(), CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
        Ok(RangeSupport {
            accepts_ranges: false,
            length,
        })
    }

    /// Returns whether any bytes were reused from an earlier attempt.
    async fn fetch_segmented(
        &self,
        url: &str,
        dest: &Path,
        total: u64,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut ledger = match SegmentLedger::load(dest) {
            Some(existing) if existing.matches(url, total) && existing.segments.len() == count => existing,
            Some(stale) => {
                stale.clear(dest);
                SegmentLedger::plan(url, total, count)
            }
            None => SegmentLedger::plan(url, total, count),
        };
        ledger.revalidate(dest);

        let mut resumed = false;
        for segment in &ledger.segments {
            if segment.done || part_len(&SegmentLedger::part_path(dest, segment.index)).await > 0 {
                resumed = true;
            }
        }
        ledger.save(dest)?;
        debug!(url, segments = count, resumed, "Starting segmented transfer");

        let pending: Vec<SegmentState> = ledger.segments.iter().filter(|s| !s.done).cloned().collect();
        let ledger = Arc::new(Mutex::new(ledger));

        let tasks = pending.into_iter().map(|segment| {
            let ledger = Arc::clone(&ledger);
            async move {
                self.fetch_segment(url, dest, &segment, cancel).await?;
                let mut ledger = ledger.lock().await;
                ledger.mark_done(segment.index);
                ledger.save(dest)
            }
        });
        let results = futures_util::future::join_all(tasks).await;

        let mut failure = None;
        for result in results {
            match result {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let ledger = ledger.lock().await.clone();
        assemble(dest, &ledger).await?;
        ledger.clear(dest);
        Ok(resumed)
    }

    async fn fetch_segment(
        &self,
        url: &str,
        dest: &Path,
        segment: &SegmentState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let part = SegmentLedger::part_path(dest, segment.index);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.try_segment(url, &part, segment, cancel).await {
                Ok(()) => return Ok(()),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if attempt >= self.config.max_attempts => {
                    warn!(segment = segment.index, attempts = attempt, error = %e, "Segment exhausted its retries");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    debug!(segment = segment.index, attempt, error = %e, ?delay, "Retrying segment");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_segment(
        &self,
        url: &str,
        part: &Path,
        segment: &SegmentState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expected = segment.len();
        let mut have = part_len(part).await;
        if have > expected {
            fs::remove_file(part).await?;
            have = 0;
        }
        if have == expected {
            return Ok(());
        }

        let range = format!("bytes={}-{}", segment.start + have, segment.end);
        let response = self.client.get(url).header(RANGE, range).send().await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(EngineError::TransferFailed(format!(
                "segment {} got HTTP {}",
                segment.index,
                response.status()
            )));
        }

        let mut file = OpenOptions::new().create(true).append(true).open(part).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                file.flush().await?;
                return Err(EngineError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };
            let take = chunk.len().min((expected - have) as usize);
            file.write_all(&chunk[..take]).await?;
            have += take as u64;
        }
        file.flush().await?;

        if have != expected {
            return Err(EngineError::TransferFailed(format!(
                "segment {} ended at {} of {} bytes",
                segment.index, have, expected
            )));
        }
        Ok(())
    }

    /// Full-stream transfer through a `.partial` file, resumed with a Range
    /// request when one exists. Returns whether earlier bytes were reused.
    async fn fetch_single(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<bool> {
        let partial = partial_path(dest);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.try_single(url, dest, &partial, cancel).await {
                Ok(resumed) => return Ok(resumed),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if attempt >= self.config.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.config.backoff(attempt);
                    debug!(url, attempt, error = %e, ?delay, "Retrying transfer");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_single(
        &self,
        url: &str,
        dest: &Path,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let start = part_len(partial).await;
        let mut request = self.client.get(url);
        if start > 0 {
            request = request.header(RANGE, format!("bytes={}-", start));
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            fs::remove_file(partial).await?;
            return Err(EngineError::TransferFailed("stale partial download discarded".into()));
        }
        if !status.is_success() {
            return Err(EngineError::TransferFailed(format!("HTTP {} from {}", status, url)));
        }

        let resumed = start > 0 && status == StatusCode::PARTIAL_CONTENT;
        let mut file = if resumed {
            OpenOptions::new().append(true).open(partial).await?
        } else {
            File::create(partial).await?
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                file.flush().await?;
                return Err(EngineError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        fs::rename(partial, dest).await?;
        Ok(resumed)
    }
}

async fn assemble(dest: &Path, ledger: &SegmentLedger) -> Result<()> {
    let mut out = File::create(dest).await?;
    for segment in &ledger.segments {
        let mut part = File::open(SegmentLedger::part_path(dest, segment.index)).await?;
        tokio::io::copy(&mut part, &mut out).await?;
    }
    out.flush().await?;
    Ok(())
}

async fn part_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!("{}.partial", name))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
}
