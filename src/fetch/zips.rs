// src/fetch/zips.rs
use std::path::PathBuf;
use std::time::Duration;
use tokio::{fs, time};
use tracing::{debug, info, instrument, warn};

use super::source::{FetchResponse, RemoteSource, SourceError};
use super::urls::archive_url;
use super::YearTask;
use crate::config::{DataLayout, PipelineConfig};
use crate::error::YearError;
use crate::history::ResumeIndex;

pub const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub base_url: String,
    pub min_archive_bytes: u64,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl FetchSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            base_url: cfg.base_url.clone(),
            min_archive_bytes: cfg.min_archive_bytes,
            timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Downloaded {
        path: PathBuf,
        name: String,
        bytes: u64,
    },
    AlreadyPresent(PathBuf),
}

impl FetchOutcome {
    pub fn path(&self) -> &PathBuf {
        match self {
            FetchOutcome::Downloaded { path, .. } | FetchOutcome::AlreadyPresent(path) => path,
        }
    }
}

/// Why one candidate name was given up on.
enum Miss {
    NotFound(u16),
    TooSmall(usize),
    Failed(String),
}

/// GET `url`, bounding each attempt by the fetch timeout and sleeping the
/// retry delay between transient failures.
pub async fn get_with_retry(
    source: &dyn RemoteSource,
    url: &url::Url,
    settings: &FetchSettings,
) -> Result<FetchResponse, SourceError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match time::timeout(settings.timeout, source.get(url)).await {
            Ok(r) => r,
            Err(_) => Err(SourceError::Transient(format!(
                "timed out after {:?}",
                settings.timeout
            ))),
        };
        match result {
            Err(SourceError::Transient(e)) if attempt < MAX_RETRIES => {
                warn!(%url, attempt, error = %e, "transient fetch failure, retrying");
                time::sleep(settings.retry_delay).await;
            }
            other => return other,
        }
    }
}

async fn try_candidate(
    source: &dyn RemoteSource,
    url: &url::Url,
    settings: &FetchSettings,
) -> Result<Vec<u8>, Miss> {
    match get_with_retry(source, url, settings).await {
        Ok(FetchResponse::Found(bytes)) if (bytes.len() as u64) < settings.min_archive_bytes => {
            Err(Miss::TooSmall(bytes.len()))
        }
        Ok(FetchResponse::Found(bytes)) => Ok(bytes),
        Ok(FetchResponse::NotFound(status)) => Err(Miss::NotFound(status)),
        Err(e) => Err(Miss::Failed(e.to_string())),
    }
}

/// Make sure `archives/brfss_<year>.zip` exists, downloading the first
/// candidate that resolves.
#[instrument(skip_all, fields(year = task.year))]
pub async fn fetch_year_archive(
    source: &dyn RemoteSource,
    task: &YearTask,
    settings: &FetchSettings,
    layout: &DataLayout,
    resume: &ResumeIndex,
) -> Result<FetchOutcome, YearError> {
    let dest = layout.archive_path(task.year);
    if resume.archive_ready(task.year) {
        debug!(path = %dest.display(), "archive already present");
        return Ok(FetchOutcome::AlreadyPresent(dest));
    }

    let mut tried = Vec::with_capacity(task.candidates.len());
    for name in &task.candidates {
        let url = archive_url(&settings.base_url, task.year, name).map_err(|e| {
            YearError::FetchUnavailable {
                year: task.year,
                tried: vec![format!("{name}: {e:#}")],
            }
        })?;
        match try_candidate(source, &url, settings).await {
            Ok(bytes) => {
                // 1) write beside the final name, 2) rename into place
                let part = dest.with_extension("zip.part");
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&part, &bytes)
                    .await
                    .map_err(|e| YearError::write(&part, e))?;
                fs::rename(&part, &dest)
                    .await
                    .map_err(|e| YearError::write(&dest, e))?;
                let len = bytes.len() as u64;
                resume.record_archive(task.year, len);
                info!(%url, bytes = len, "archive downloaded");
                return Ok(FetchOutcome::Downloaded {
                    path: dest,
                    name: name.clone(),
                    bytes: len,
                });
            }
            Err(Miss::NotFound(status)) => {
                debug!(%url, status, "candidate did not resolve");
                tried.push(format!("{name} (HTTP {status})"));
            }
            Err(Miss::TooSmall(len)) => {
                debug!(%url, len, "candidate payload below minimum size");
                tried.push(format!("{name} ({len} bytes)"));
            }
            Err(Miss::Failed(e)) => {
                warn!(%url, error = %e, "candidate abandoned");
                tried.push(format!("{name} ({e})"));
            }
        }
    }

    Err(YearError::FetchUnavailable {
        year: task.year,
        tried,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::source::memory::MemorySource;
    use tempfile::tempdir;

    fn settings(base: &str) -> FetchSettings {
        FetchSettings {
            base_url: base.to_string(),
            min_archive_bytes: 16,
            timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(1),
        }
    }

    fn task(year: u16, names: &[&str]) -> YearTask {
        YearTask {
            year,
            candidates: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    const BASE: &str = "http://remote.test/{yyyy}/";

    #[tokio::test]
    async fn falls_through_to_the_second_candidate() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let resume = ResumeIndex::empty(16);
        let source = MemorySource::default().with("http://remote.test/2005/B.ZIP", vec![1u8; 64]);

        let outcome = fetch_year_archive(
            &source,
            &task(2005, &["A.ZIP", "B.ZIP"]),
            &settings(BASE),
            &layout,
            &resume,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FetchOutcome::Downloaded { ref name, bytes: 64, .. } if name == "B.ZIP"));
        assert_eq!(std::fs::read(layout.archive_path(2005)).unwrap().len(), 64);
        assert!(resume.archive_ready(2005));
        assert_eq!(source.hits().len(), 2);
    }

    #[tokio::test]
    async fn undersized_payload_does_not_count() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let resume = ResumeIndex::empty(16);
        let source = MemorySource::default().with("http://remote.test/1991/A.ZIP", vec![1u8; 4]);

        let err = fetch_year_archive(
            &source,
            &task(1991, &["A.ZIP"]),
            &settings(BASE),
            &layout,
            &resume,
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "fetch_unavailable");
        assert!(!layout.archive_path(1991).exists());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let resume = ResumeIndex::empty(16);
        let url = "http://remote.test/1995/A.ZIP";
        let source = MemorySource::default()
            .with(url, vec![2u8; 32])
            .flaky(url, MAX_RETRIES - 1);

        fetch_year_archive(&source, &task(1995, &["A.ZIP"]), &settings(BASE), &layout, &resume)
            .await
            .unwrap();
        assert_eq!(source.hits().len(), MAX_RETRIES);
    }

    #[tokio::test]
    async fn present_archive_is_not_refetched() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let resume = ResumeIndex::empty(16);
        resume.record_archive(1990, 4096);
        let source = MemorySource::default();

        let outcome =
            fetch_year_archive(&source, &task(1990, &["A.ZIP"]), &settings(BASE), &layout, &resume)
                .await
                .unwrap();
        assert!(matches!(outcome, FetchOutcome::AlreadyPresent(_)));
        assert!(source.hits().is_empty());
    }

    struct Stalled;

    #[async_trait::async_trait]
    impl RemoteSource for Stalled {
        async fn get(&self, _url: &url::Url) -> Result<FetchResponse, SourceError> {
            time::sleep(Duration::from_secs(30)).await;
            Ok(FetchResponse::NotFound(404))
        }
    }

    #[tokio::test]
    async fn stalled_requests_time_out_on_every_attempt() {
        let settings = FetchSettings {
            timeout: Duration::from_millis(20),
            ..settings(BASE)
        };
        let url = url::Url::parse("http://remote.test/1990/A.ZIP").unwrap();
        let started = std::time::Instant::now();
        let err = get_with_retry(&Stalled, &url, &settings).await.unwrap_err();
        assert!(matches!(err, SourceError::Transient(ref e) if e.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
