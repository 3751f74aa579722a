// src/pipeline.rs

//! Batch orchestration.
//!
//! Every requested survey year runs as its own task: fetch under a shared
//! semaphore, then extract/decode/normalize/write on a dedicated rayon pool.
//! The labor series is loaded alongside. Aggregation and merging wait until
//! every year is terminal.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::ThreadPool;
use serde::Serialize;
use std::{collections::BTreeSet, fs, io, path::Path, sync::Arc};
use tokio::{
    sync::{oneshot, Semaphore},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{
    self, policy_for, Aggregator, StateYearAggregate, COUNTY_YEAR_FILE, STATE_YEAR_FILE,
};
use crate::config::{ConfigError, DataLayout, Dataset, PipelineConfig};
use crate::error::{Notice, YearError};
use crate::fetch::{fetch_year_archive, FetchSettings, RemoteSource, YearTask};
use crate::history::{OutcomeRow, ResumeIndex, TableHistory, YearStatus};
use crate::labor::{self, LaborYearAggregate, LABOR_FILE};
use crate::merge::{merge, write_merged, MERGED_FILE};
use crate::process::{process_year, YearJob, YearProduct};
use crate::schema::{read_year_table, write::tmp_path, CanonicalMap};
use crate::xport::DecoderChain;

pub const REPORT_FILE: &str = "last_run.json";

/// Terminal result of one (dataset, year).
#[derive(Debug, Clone, Serialize)]
pub struct YearReport {
    pub dataset: &'static str,
    pub year: u16,
    pub status: YearStatus,
    /// Error kind for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub detail: String,
    pub rows: u64,
}

impl YearReport {
    fn brfss(year: u16, status: YearStatus, detail: impl Into<String>, rows: u64) -> Self {
        Self {
            dataset: "brfss",
            year,
            status,
            error: None,
            detail: detail.into(),
            rows,
        }
    }

    fn failed(dataset: &'static str, year: u16, err: &YearError) -> Self {
        Self {
            dataset,
            year,
            status: YearStatus::Failed,
            error: Some(err.kind().to_string()),
            detail: err.to_string(),
            rows: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaborReport {
    pub status: YearStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub aggregates: usize,
    #[serde(skip)]
    pub rows: Vec<LaborYearAggregate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub dataset: Dataset,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub years: Vec<YearReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labor: Option<LaborReport>,
    pub notices: Vec<Notice>,
    /// Tables written under the data directory.
    pub outputs: Vec<String>,
}

impl RunSummary {
    pub fn brfss_usable(&self) -> bool {
        self.years
            .iter()
            .any(|r| r.dataset == "brfss" && r.status.is_usable())
    }

    pub fn labor_succeeded(&self) -> bool {
        self.labor
            .as_ref()
            .is_some_and(|l| l.status == YearStatus::Succeeded)
    }

    /// 0 when anything usable came out of the run, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.brfss_usable() || self.labor_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &YearReport> {
        self.years.iter().filter(|r| r.status == YearStatus::Failed)
    }
}

enum YearResult {
    Done(YearProduct),
    Skipped,
    Failed(YearError),
}

pub struct Pipeline {
    cfg: PipelineConfig,
    dataset: Dataset,
    layout: DataLayout,
    remote: Arc<dyn RemoteSource>,
    map: Option<Arc<CanonicalMap>>,
    chain: Arc<DecoderChain>,
}

impl Pipeline {
    /// Validate the configuration and load the canonical map. Every error
    /// here is a configuration fault.
    pub fn new(
        cfg: PipelineConfig,
        dataset: Dataset,
        remote: Arc<dyn RemoteSource>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let map = if dataset.includes_brfss() {
            let path = cfg
                .canonical_map
                .as_ref()
                .ok_or(ConfigError::MissingCanonicalMap)?;
            let map = CanonicalMap::load(path)?;
            info!(
                path = %path.display(),
                version = map.version(),
                variables = map.canonical_names().len(),
                "canonical map loaded"
            );
            Some(Arc::new(map))
        } else {
            None
        };
        Ok(Self {
            layout: cfg.layout(),
            cfg,
            dataset,
            remote,
            map,
            chain: Arc::new(DecoderChain::default()),
        })
    }

    #[instrument(level = "info", skip(self), fields(dataset = ?self.dataset))]
    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = started_at.format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let years = self.cfg.sorted_years();

        // 1) layout and resume state
        self.layout
            .ensure()
            .with_context(|| format!("creating {}", self.layout.root().display()))?;
        let resume = Arc::new(ResumeIndex::scan(&self.layout, self.cfg.min_archive_bytes)?);

        // 2) survey years and labor series side by side
        let brfss = async {
            match (self.dataset.includes_brfss(), &self.map) {
                (true, Some(map)) => Some(self.run_brfss(&years, map.clone(), resume.clone()).await),
                _ => None,
            }
        };
        let labor = async {
            if self.dataset.includes_labor() {
                Some(self.run_labor(&years).await)
            } else {
                None
            }
        };
        let (brfss, labor) = tokio::join!(brfss, labor);

        let mut reports = Vec::new();
        let mut notices = Vec::new();
        let mut outputs = Vec::new();

        // 3) aggregate barrier
        let mut health = None;
        if let Some((year_reports, year_notices)) = brfss {
            let usable: Vec<u16> = year_reports
                .iter()
                .filter(|r| r.status.is_usable())
                .map(|r| r.year)
                .collect();
            reports.extend(year_reports);
            notices.extend(year_notices);
            let rollup = self.aggregate(usable).await?;
            for (year, err) in &rollup.unreadable {
                if let Some(r) = reports.iter_mut().find(|r| r.dataset == "brfss" && r.year == *year) {
                    *r = YearReport::failed("brfss", *year, err);
                }
            }
            outputs.push(format!("aggregates/{STATE_YEAR_FILE}"));
            outputs.push(format!("aggregates/{COUNTY_YEAR_FILE}"));
            health = Some(rollup.states);
        }
        if let Some(report) = &labor {
            if report.status == YearStatus::Succeeded {
                outputs.push(format!("aggregates/{LABOR_FILE}"));
            }
            reports.extend(labor_year_reports(report, &years));
        }

        // 4) merge
        if self.dataset == Dataset::All {
            let health = health.unwrap_or_default();
            let labor_rows = labor.as_ref().map(|l| l.rows.as_slice()).unwrap_or_default();
            let (merged, join_notices) = merge(&health, labor_rows);
            let path = self.layout.merged().join(MERGED_FILE);
            write_merged(&path, &self.metric_names(), &merged)?;
            info!(rows = merged.len(), missing = join_notices.len(), "merged table written");
            notices.extend(join_notices);
            outputs.push(format!("merged/{MERGED_FILE}"));
        }

        let summary = RunSummary {
            run_id,
            dataset: self.dataset,
            started_at,
            finished_at: Utc::now(),
            years: reports,
            labor,
            notices,
            outputs,
        };

        // 5) report and ledger
        self.record(&summary)?;
        Ok(summary)
    }

    fn metric_names(&self) -> Vec<String> {
        self.cfg.metrics.iter().map(|m| m.name.clone()).collect()
    }

    async fn run_brfss(
        &self,
        years: &[u16],
        map: Arc<CanonicalMap>,
        resume: Arc<ResumeIndex>,
    ) -> (Vec<YearReport>, Vec<Notice>) {
        let pool: Arc<ThreadPool> = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.cpu_workers)
            .thread_name(|i| format!("brfss-cpu-{i}"))
            .build()
        {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                let err = YearError::Io(io::Error::other(e.to_string()));
                error!(error = %e, "cpu pool could not start");
                return (
                    years.iter().map(|&y| YearReport::failed("brfss", y, &err)).collect(),
                    Vec::new(),
                );
            }
        };
        let fetch_sem = Arc::new(Semaphore::new(self.cfg.concurrency));
        let settings = Arc::new(FetchSettings::from_config(&self.cfg));

        let mut set = JoinSet::new();
        for &year in years {
            let task = YearTask::plan(year, &self.cfg);
            let job = YearJob {
                year,
                archive: self.layout.archive_path(year),
                layout: self.layout.clone(),
                map: map.clone(),
                chain: self.chain.clone(),
            };
            let remote = self.remote.clone();
            let resume = resume.clone();
            let sem = fetch_sem.clone();
            let settings = settings.clone();
            let pool = pool.clone();

            set.spawn(async move {
                let start = Instant::now();
                let result = run_year(task, job, remote, resume, sem, settings, pool).await;
                info!(year, elapsed = ?start.elapsed(), "year finished");
                (year, result)
            });
        }

        let mut reports = Vec::with_capacity(years.len());
        let mut notices = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (year, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "year task aborted");
                    continue;
                }
            };
            reports.push(match result {
                YearResult::Done(product) => {
                    for n in &product.notices {
                        warn!(year, %n, "notice");
                    }
                    notices.extend(product.notices.iter().cloned());
                    YearReport::brfss(year, YearStatus::Succeeded, product.decoder, product.rows as u64)
                }
                YearResult::Skipped => YearReport::brfss(year, YearStatus::Skipped, "artifact present", 0),
                YearResult::Failed(err) => {
                    error!(year, kind = err.kind(), error = %err, "year failed");
                    YearReport::failed("brfss", year, &err)
                }
            });
        }

        // tasks that panicked still get a row
        let seen: BTreeSet<u16> = reports.iter().map(|r| r.year).collect();
        for &year in years.iter().filter(|y| !seen.contains(y)) {
            let err = YearError::Io(io::Error::other("year task aborted"));
            reports.push(YearReport::failed("brfss", year, &err));
        }
        reports.sort_by_key(|r| r.year);
        (reports, notices)
    }

    async fn run_labor(&self, years: &[u16]) -> LaborReport {
        let source = self.cfg.labor.source.clone();
        match self.load_labor(source.as_deref(), years).await {
            Ok(rows) => {
                info!(aggregates = rows.len(), "labor series aggregated");
                LaborReport {
                    status: YearStatus::Succeeded,
                    source,
                    error: None,
                    aggregates: rows.len(),
                    rows,
                }
            }
            Err(e) => {
                error!(error = %e, "labor series failed");
                LaborReport {
                    status: YearStatus::Failed,
                    source,
                    error: Some(e.to_string()),
                    aggregates: 0,
                    rows: Vec::new(),
                }
            }
        }
    }

    async fn load_labor(&self, source: Option<&str>, years: &[u16]) -> Result<Vec<LaborYearAggregate>, YearError> {
        let source = source.ok_or_else(|| YearError::Labor("no labor source configured".into()))?;
        let settings = FetchSettings::from_config(&self.cfg);
        let path = labor::resolve_source(source, &self.layout.labor(), self.remote.as_ref(), &settings)
            .await
            .map_err(|e| YearError::Labor(e.to_string()))?;

        let seasonal = self.cfg.labor.seasonal;
        let states = self.cfg.states.clone();
        let years = years.to_vec();
        let out = self.layout.aggregates().join(LABOR_FILE);
        tokio::task::spawn_blocking(move || {
            let records =
                labor::load(&path, seasonal).map_err(|e| YearError::Labor(e.to_string()))?;
            let rows = labor::aggregate(&records, &states, &years);
            labor::write_aggregates(&out, &rows).map_err(|e| YearError::write(&out, e))?;
            Ok(rows)
        })
        .await
        .map_err(|e| YearError::Labor(e.to_string()))?
    }

    /// Read back every usable year's artifact and roll it up.
    async fn aggregate(&self, years: Vec<u16>) -> Result<Rollup> {
        let layout = self.layout.clone();
        let metrics = self.cfg.metrics.clone();
        let weighting = self.cfg.weighting.clone();
        let states = self.cfg.states.clone();
        tokio::task::spawn_blocking(move || {
            roll_up(&layout, Aggregator::new(metrics, policy_for(&weighting), &states), &years)
        })
        .await?
    }

    fn record(&self, summary: &RunSummary) -> Result<()> {
        write_report(&self.layout.reports().join(REPORT_FILE), summary)?;
        let ledger = TableHistory::new_outcomes(self.layout.history())?;
        for r in &summary.years {
            ledger.add(&OutcomeRow {
                run_id: summary.run_id.clone(),
                dataset: r.dataset.to_string(),
                year: r.year,
                status: r.status,
                detail: r.error.clone().unwrap_or_else(|| r.detail.clone()),
                rows: r.rows,
                recorded_at: summary.finished_at,
            })?;
        }
        let folded = ledger.vacuum()?;
        debug!(folded, "ledger partitions compacted");
        Ok(())
    }
}

/// One survey year end to end.
async fn run_year(
    task: YearTask,
    job: YearJob,
    remote: Arc<dyn RemoteSource>,
    resume: Arc<ResumeIndex>,
    sem: Arc<Semaphore>,
    settings: Arc<FetchSettings>,
    pool: Arc<ThreadPool>,
) -> YearResult {
    let year = task.year;
    if resume.artifact_ready(year) {
        return YearResult::Skipped;
    }

    // 1) fetch, holding a network permit
    let fetched = {
        let Ok(_permit) = sem.acquire().await else {
            return YearResult::Failed(YearError::Io(io::Error::other("fetch semaphore closed")));
        };
        fetch_year_archive(remote.as_ref(), &task, &settings, &job.layout, &resume).await
    };
    if let Err(e) = fetched {
        return YearResult::Failed(e);
    }

    // 2) cpu stages on the pool
    let (tx, rx) = oneshot::channel();
    let worker_job = job.clone();
    pool.spawn(move || {
        let _ = tx.send(process_year(&worker_job));
    });
    let result = match rx.await {
        Ok(r) => r,
        Err(_) => Err(YearError::Io(io::Error::other("cpu worker dropped the year"))),
    };

    match result {
        Ok(product) => {
            resume.record_artifact(year);
            if product.notices.iter().any(|n| matches!(n, Notice::WriteConflict { .. })) {
                YearResult::Skipped
            } else {
                YearResult::Done(product)
            }
        }
        Err(err @ YearError::CorruptArchive { .. }) => {
            // refetch on the next run
            if let Err(e) = fs::remove_file(&job.archive) {
                warn!(year, error = %e, "corrupt archive not removed");
            }
            resume.forget_archive(year);
            YearResult::Failed(err)
        }
        Err(err) => YearResult::Failed(err),
    }
}

struct Rollup {
    states: Vec<StateYearAggregate>,
    /// Years whose artifact could not be read; left out of the aggregates.
    unreadable: Vec<(u16, YearError)>,
}

/// Aggregate the artifacts of `years` and write both aggregate tables. An
/// artifact that does not read back is deleted so the next run regenerates
/// it; the other years still aggregate.
fn roll_up(layout: &DataLayout, mut agg: Aggregator, years: &[u16]) -> Result<Rollup> {
    let mut unreadable = Vec::new();
    for &year in years {
        let path = layout.artifact_path(year);
        match read_year_table(&path) {
            Ok(records) => agg.add(&records),
            Err(e) => {
                error!(year, error = format!("{e:#}"), "artifact unreadable, left out of aggregates");
                if let Err(rm) = fs::remove_file(&path) {
                    warn!(year, error = %rm, "unreadable artifact not removed");
                }
                let reason = format!("reading {}: {e:#}", path.display());
                unreadable.push((year, YearError::Io(io::Error::other(reason))));
            }
        }
    }
    let names = agg.metric_names();
    let states = agg.state_year();
    let counties = agg.county_year();
    aggregate::write_state_year(&layout.aggregates().join(STATE_YEAR_FILE), &names, &states)?;
    aggregate::write_county_year(&layout.aggregates().join(COUNTY_YEAR_FILE), &names, &counties)?;
    info!(state_years = states.len(), county_years = counties.len(), "aggregates written");
    Ok(Rollup { states, unreadable })
}

/// Labor outcome restated per requested year for the ledger.
fn labor_year_reports(report: &LaborReport, years: &[u16]) -> Vec<YearReport> {
    years
        .iter()
        .map(|&year| {
            let rows = report.rows.iter().filter(|r| r.year == year).count() as u64;
            YearReport {
                dataset: "labor",
                year,
                status: report.status,
                error: report.error.as_ref().map(|_| "labor".to_string()),
                detail: report.error.clone().unwrap_or_default(),
                rows,
            }
        })
        .collect()
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, serde_json::to_vec_pretty(summary)?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming {}", tmp.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaborConfig;
    use crate::fetch::source::memory::MemorySource;
    use crate::process::tests::{init_test_logging, zipped};
    use crate::xport::{fixtures::XportFixture, Value};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    const BASE: &str = "http://remote.test/{yyyy}/";
    const MAP: &str = "version: 1\nvariables:\n  state_fips: [_state]\n  general_health: [genhlth]\n  smoked_100_cigs: [smoke100]\n";
    const TIDY: &str = "state,year,month,unemployment_rate,labor_force_size,employment_ratio\n\
MI,1990,1,7.0,4600000,60.0\n\
MI,1990,2,8.0,4600000,60.0\n\
MI,1991,1,9.0,4500000,58.0\n";

    fn survey(health: &[i64]) -> Vec<u8> {
        let mut fx = XportFixture::new("BRFSS")
            .numeric("_STATE", "STATE")
            .numeric("GENHLTH", "GENERAL HEALTH")
            .numeric("SMOKE100", "SMOKED 100");
        for (i, &h) in health.iter().enumerate() {
            let state = if i % 4 == 3 { 39 } else { 26 };
            fx = fx.row(vec![Value::Integer(state), Value::Integer(h), Value::Integer(1 + (i as i64 % 2))]);
        }
        zipped("CDBRFS.XPT", &fx.build())
    }

    fn archive_url(year: u16) -> String {
        format!("http://remote.test/{year}/CDBRFS{:02}XPT.ZIP", year % 100)
    }

    struct Env {
        dir: TempDir,
        cfg: PipelineConfig,
    }

    fn env(years: &[u16]) -> Env {
        let dir = tempdir().unwrap();
        let map_path = dir.path().join("canonical_map.yaml");
        fs::write(&map_path, MAP).unwrap();
        let labor_path = dir.path().join("labor.csv");
        fs::write(&labor_path, TIDY).unwrap();
        let cfg = PipelineConfig {
            data_dir: dir.path().join("data"),
            years: years.to_vec(),
            states: vec!["MI".into()],
            base_url: BASE.into(),
            min_archive_bytes: 64,
            concurrency: 2,
            cpu_workers: 2,
            fetch_timeout_secs: 5,
            retry_delay_ms: 1,
            canonical_map: Some(map_path),
            labor: LaborConfig {
                source: Some(labor_path.display().to_string()),
                seasonal: 'U',
            },
            ..PipelineConfig::default()
        };
        Env { dir, cfg }
    }

    fn pipeline(cfg: &PipelineConfig, dataset: Dataset, remote: Arc<MemorySource>) -> Pipeline {
        Pipeline::new(cfg.clone(), dataset, remote).unwrap()
    }

    fn status(summary: &RunSummary, dataset: &str, year: u16) -> YearStatus {
        summary
            .years
            .iter()
            .find(|r| r.dataset == dataset && r.year == year)
            .map(|r| r.status)
            .unwrap()
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn unavailable_year_does_not_stop_the_batch() {
        init_test_logging();
        let env = env(&[1990, 1991, 2010]);
        let remote = Arc::new(
            MemorySource::default()
                .with(&archive_url(1990), survey(&[1, 4, 5]))
                .with(&archive_url(2010), survey(&[2, 2, 3, 5])),
        );
        let summary = pipeline(&env.cfg, Dataset::All, remote).run().await.unwrap();

        assert_eq!(status(&summary, "brfss", 1990), YearStatus::Succeeded);
        assert_eq!(status(&summary, "brfss", 2010), YearStatus::Succeeded);
        assert_eq!(status(&summary, "brfss", 1991), YearStatus::Failed);
        let failed: Vec<_> = summary.failed().filter(|r| r.dataset == "brfss").collect();
        assert_eq!(failed[0].error.as_deref(), Some("fetch_unavailable"));
        assert_eq!(summary.exit_code(), 0);

        let layout = env.cfg.layout();
        let states = read(layout.aggregates().join(STATE_YEAR_FILE));
        assert!(states.contains("MI,1990,3,"));
        assert!(states.contains("MI,2010,3,"));
        assert!(!states.contains("MI,1991"));
        assert!(!states.contains("OH"), "only target states are aggregated");

        let merged = read(layout.merged().join(MERGED_FILE));
        let rows: Vec<&str> = merged.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("MI,1990,true,true,3,"));
        assert!(rows[1].starts_with("MI,1991,false,true,,"));
        assert!(rows[2].starts_with("MI,2010,true,false,3,"));

        let report = read(layout.reports().join(REPORT_FILE));
        assert!(report.contains("fetch_unavailable"));
        let latest = TableHistory::new_outcomes(layout.history()).unwrap().latest().unwrap();
        assert_eq!(latest[&("brfss".to_string(), 1991)].status, YearStatus::Failed);
        let ledger_files = format!("{}/outcomes/date=*/*.parquet", layout.history().display());
        let files: Vec<_> = glob::glob(&ledger_files).unwrap().filter_map(Result::ok).collect();
        assert_eq!(files.len(), 1, "one compacted file per day");
        assert_eq!(latest[&("labor".to_string(), 1991)].status, YearStatus::Succeeded);
    }

    #[tokio::test]
    async fn second_run_is_byte_identical_and_fetches_nothing() {
        let env = env(&[1990]);
        let remote = Arc::new(MemorySource::default().with(&archive_url(1990), survey(&[1, 4, 5, 2])));
        let layout = env.cfg.layout();

        let first = pipeline(&env.cfg, Dataset::Brfss, remote.clone()).run().await.unwrap();
        assert_eq!(status(&first, "brfss", 1990), YearStatus::Succeeded);
        let artifact = fs::read(layout.artifact_path(1990)).unwrap();
        let aggregates = fs::read(layout.aggregates().join(STATE_YEAR_FILE)).unwrap();
        let hits = remote.hits().len();

        let second = pipeline(&env.cfg, Dataset::Brfss, remote.clone()).run().await.unwrap();
        assert_eq!(status(&second, "brfss", 1990), YearStatus::Skipped);
        assert_eq!(remote.hits().len(), hits);
        assert_eq!(fs::read(layout.artifact_path(1990)).unwrap(), artifact);
        assert_eq!(fs::read(layout.aggregates().join(STATE_YEAR_FILE)).unwrap(), aggregates);

        fs::remove_file(layout.artifact_path(1990)).unwrap();
        pipeline(&env.cfg, Dataset::Brfss, remote).run().await.unwrap();
        assert_eq!(fs::read(layout.artifact_path(1990)).unwrap(), artifact);
    }

    #[tokio::test]
    async fn deleted_artifact_regenerates_only_that_year() {
        let env = env(&[1990, 1991]);
        let remote = Arc::new(
            MemorySource::default()
                .with(&archive_url(1990), survey(&[1, 2]))
                .with(&archive_url(1991), survey(&[3, 4])),
        );
        let layout = env.cfg.layout();
        pipeline(&env.cfg, Dataset::Brfss, remote.clone()).run().await.unwrap();
        let kept = fs::read(layout.artifact_path(1990)).unwrap();
        let hits = remote.hits().len();

        fs::remove_file(layout.artifact_path(1991)).unwrap();
        let summary = pipeline(&env.cfg, Dataset::Brfss, remote.clone()).run().await.unwrap();
        assert_eq!(status(&summary, "brfss", 1990), YearStatus::Skipped);
        assert_eq!(status(&summary, "brfss", 1991), YearStatus::Succeeded);
        assert_eq!(remote.hits().len(), hits, "archive on disk is reused");
        assert_eq!(fs::read(layout.artifact_path(1990)).unwrap(), kept);
        assert!(layout.artifact_path(1991).exists());
    }

    #[tokio::test]
    async fn interrupted_write_is_discarded_and_redone() {
        let env = env(&[1995]);
        let remote = Arc::new(MemorySource::default().with(&archive_url(1995), survey(&[1, 5])));
        let layout = env.cfg.layout();
        layout.ensure().unwrap();
        let partial = tmp_path(&layout.artifact_path(1995));
        fs::write(&partial, b"PAR1 half written").unwrap();

        let summary = pipeline(&env.cfg, Dataset::Brfss, remote).run().await.unwrap();
        assert_eq!(status(&summary, "brfss", 1995), YearStatus::Succeeded);
        assert!(!partial.exists());
        assert_eq!(read_year_table(&layout.artifact_path(1995)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_artifact_is_regenerated_without_stopping_the_batch() {
        let env = env(&[1990, 1995]);
        let remote = Arc::new(
            MemorySource::default()
                .with(&archive_url(1990), survey(&[1, 2]))
                .with(&archive_url(1995), survey(&[4, 5, 3])),
        );
        let layout = env.cfg.layout();
        layout.ensure().unwrap();
        fs::write(layout.artifact_path(1995), b"").unwrap();

        let summary = pipeline(&env.cfg, Dataset::All, remote).run().await.unwrap();
        assert_eq!(status(&summary, "brfss", 1990), YearStatus::Succeeded);
        assert_eq!(status(&summary, "brfss", 1995), YearStatus::Succeeded);
        assert_eq!(read_year_table(&layout.artifact_path(1995)).unwrap().len(), 3);
        assert!(read(layout.aggregates().join(STATE_YEAR_FILE)).contains("MI,1995,"));
        assert!(layout.merged().join(MERGED_FILE).exists());
        assert!(layout.reports().join(REPORT_FILE).exists());
    }

    #[test]
    fn unreadable_artifact_fails_only_its_year() {
        let env = env(&[1990, 1991]);
        let layout = env.cfg.layout();
        layout.ensure().unwrap();
        let records = vec![crate::schema::NormalizedRecord {
            year: 1990,
            state_fips: Some("26".into()),
            county_fips: None,
            values: std::collections::BTreeMap::from([(
                "general_health".to_string(),
                Value::Integer(5),
            )]),
        }];
        crate::schema::write_year_table(
            &layout.artifact_path(1990),
            &crate::schema::NormalizedYear {
                year: 1990,
                records,
                columns: vec!["general_health".into()],
                notices: vec![],
            },
        )
        .unwrap();
        fs::write(layout.artifact_path(1991), b"PAR1 torn").unwrap();

        let agg = Aggregator::new(env.cfg.metrics.clone(), policy_for(&env.cfg.weighting), &env.cfg.states);
        let rollup = roll_up(&layout, agg, &[1990, 1991]).unwrap();
        assert_eq!(rollup.states.len(), 1);
        assert_eq!(rollup.states[0].year, 1990);
        assert_eq!(rollup.unreadable.len(), 1);
        assert_eq!(rollup.unreadable[0].0, 1991);
        assert_eq!(rollup.unreadable[0].1.kind(), "io");
        assert!(!layout.artifact_path(1991).exists());
        assert!(layout.aggregates().join(COUNTY_YEAR_FILE).exists());
    }

    #[tokio::test]
    async fn corrupt_archive_is_removed_for_refetch() {
        let env = env(&[1992]);
        let remote = Arc::new(MemorySource::default().with(&archive_url(1992), vec![b'x'; 256]));
        let layout = env.cfg.layout();

        let summary = pipeline(&env.cfg, Dataset::Brfss, remote).run().await.unwrap();
        let report = &summary.years[0];
        assert_eq!(report.error.as_deref(), Some("corrupt_archive"));
        assert!(!layout.archive_path(1992).exists());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn labor_failure_leaves_survey_outputs() {
        let mut env = env(&[1990]);
        env.cfg.labor.source = Some(env.dir.path().join("missing.csv").display().to_string());
        let remote = Arc::new(MemorySource::default().with(&archive_url(1990), survey(&[1])));

        let summary = pipeline(&env.cfg, Dataset::All, remote).run().await.unwrap();
        assert!(!summary.labor_succeeded());
        assert_eq!(status(&summary, "brfss", 1990), YearStatus::Succeeded);
        let merged = read(env.cfg.layout().merged().join(MERGED_FILE));
        assert!(merged.lines().nth(1).unwrap().starts_with("MI,1990,true,false,"));
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn missing_canonical_map_is_a_configuration_fault() {
        let mut env = env(&[1990]);
        env.cfg.canonical_map = None;
        let remote: Arc<dyn RemoteSource> = Arc::new(MemorySource::default());
        assert!(matches!(
            Pipeline::new(env.cfg.clone(), Dataset::Brfss, remote.clone()),
            Err(ConfigError::MissingCanonicalMap)
        ));
        assert!(Pipeline::new(env.cfg, Dataset::Labor, remote).is_ok());
    }
}
