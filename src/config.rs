// src/config.rs

//! Pipeline configuration: YAML on disk, every field defaulted, CLI flags
//! layered on top by `main`.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::schema::canonical::CanonicalMapError;
use crate::schema::geo;

/// Latest survey year whose methodology the pipeline understands.
pub const LAST_SUPPORTED_YEAR: u16 = 2010;
/// First year BRFSS published annual files.
pub const FIRST_SUPPORTED_YEAR: u16 = 1984;

/// Fixed columns of the aggregate and merged tables; metric names may not
/// reuse them.
const RESERVED_COLUMNS: &[&str] = &[
    "state",
    "year",
    "county_fips",
    "respondents",
    "health_present",
    "labor_present",
    "months_observed",
    "unemployment_rate",
    "labor_force_size",
    "employment_ratio",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("year {0} is outside {FIRST_SUPPORTED_YEAR}..={LAST_SUPPORTED_YEAR}")]
    UnsupportedYear(u16),
    #[error("no years requested")]
    NoYears,
    #[error("unknown state code {0:?}")]
    UnknownState(String),
    #[error("no canonical variable map configured")]
    MissingCanonicalMap,
    #[error(transparent)]
    CanonicalMap(#[from] CanonicalMapError),
    #[error("{0}")]
    Invalid(String),
}

/// Which series a run touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Brfss,
    Labor,
    All,
}

impl Dataset {
    pub fn includes_brfss(self) -> bool {
        matches!(self, Dataset::Brfss | Dataset::All)
    }

    pub fn includes_labor(self) -> bool {
        matches!(self, Dataset::Labor | Dataset::All)
    }
}

/// A remote archive file name pattern. `{yy}` and `{yyyy}` are replaced by
/// the two- and four-digit year; `from`/`to` bound the years it applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveTemplate {
    pub pattern: String,
    #[serde(default)]
    pub from: Option<u16>,
    #[serde(default)]
    pub to: Option<u16>,
}

impl ArchiveTemplate {
    pub fn new(pattern: &str, from: u16, to: u16) -> Self {
        Self {
            pattern: pattern.to_string(),
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn applies(&self, year: u16) -> bool {
        self.from.map_or(true, |f| year >= f) && self.to.map_or(true, |t| year <= t)
    }

    pub fn render(&self, year: u16) -> String {
        self.pattern
            .replace("{yyyy}", &format!("{year:04}"))
            .replace("{yy}", &format!("{:02}", year % 100))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricKind {
    /// Share of valid responses (`denominator` codes) that are `numerator` codes.
    Rate {
        numerator: Vec<i64>,
        denominator: Vec<i64>,
    },
    /// Mean over `min..=max`, with `zero_codes` counted as 0 (BRFSS 88 = "none").
    Mean {
        min: f64,
        max: f64,
        #[serde(default)]
        zero_codes: Vec<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    /// Canonical variable the metric reads.
    pub variable: String,
    #[serde(flatten)]
    pub kind: MetricKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    Unweighted,
    SurveyWeight { variable: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaborConfig {
    /// Local path or http(s) URL of the monthly series.
    pub source: Option<String>,
    /// LAUS seasonal-adjustment code to keep: `U` or `S`.
    pub seasonal: char,
}

impl Default for LaborConfig {
    fn default() -> Self {
        Self {
            source: None,
            seasonal: 'U',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub years: Vec<u16>,
    /// Target states as postal codes.
    pub states: Vec<String>,
    /// Directory URL with `{yyyy}` substituted.
    pub base_url: String,
    pub archive_templates: Vec<ArchiveTemplate>,
    pub min_archive_bytes: u64,
    /// Simultaneous network fetches.
    pub concurrency: usize,
    /// Threads for extract/parse/normalize/write.
    pub cpu_workers: usize,
    pub fetch_timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub canonical_map: Option<PathBuf>,
    pub labor: LaborConfig,
    pub metrics: Vec<MetricSpec>,
    pub weighting: Weighting,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            years: (1990..=LAST_SUPPORTED_YEAR).collect(),
            states: vec!["MI".into(), "OH".into()],
            base_url: "https://www.cdc.gov/brfss/annual_data/{yyyy}/files/".into(),
            archive_templates: vec![
                ArchiveTemplate::new("CDBRFS{yy}XPT.ZIP", 1984, 2010),
                ArchiveTemplate::new("CDBRFS{yyyy}XPT.ZIP", 2000, 2010),
                ArchiveTemplate::new("cdbrfs{yy}xpt.zip", 1984, 2010),
            ],
            min_archive_bytes: 1024,
            concurrency: 3,
            cpu_workers: std::thread::available_parallelism().map_or(2, |n| n.get()),
            fetch_timeout_secs: 300,
            retry_delay_ms: 2_000,
            canonical_map: None,
            labor: LaborConfig::default(),
            metrics: default_metrics(),
            weighting: Weighting::Unweighted,
        }
    }
}

fn default_metrics() -> Vec<MetricSpec> {
    vec![
        MetricSpec {
            name: "fair_poor_health_rate".into(),
            variable: "general_health".into(),
            kind: MetricKind::Rate {
                numerator: vec![4, 5],
                denominator: vec![1, 2, 3, 4, 5],
            },
        },
        MetricSpec {
            name: "ever_smoked_rate".into(),
            variable: "smoked_100_cigs".into(),
            kind: MetricKind::Rate {
                numerator: vec![1],
                denominator: vec![1, 2],
            },
        },
        MetricSpec {
            name: "poor_physical_health_days".into(),
            variable: "physical_health_days".into(),
            kind: MetricKind::Mean {
                min: 1.0,
                max: 30.0,
                zero_codes: vec![88],
            },
        },
    ]
}

impl PipelineConfig {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject year ranges, state codes and limits the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.years.is_empty() {
            return Err(ConfigError::NoYears);
        }
        if let Some(&bad) = self
            .years
            .iter()
            .find(|&&y| !(FIRST_SUPPORTED_YEAR..=LAST_SUPPORTED_YEAR).contains(&y))
        {
            return Err(ConfigError::UnsupportedYear(bad));
        }
        if let Some(bad) = self
            .states
            .iter()
            .find(|s| geo::fips_for_postal(s).is_none())
        {
            return Err(ConfigError::UnknownState(bad.clone()));
        }
        if self.concurrency == 0 || self.cpu_workers == 0 {
            return Err(ConfigError::Invalid(
                "concurrency and cpu_workers must be at least 1".into(),
            ));
        }
        let mut names = std::collections::BTreeSet::new();
        for metric in &self.metrics {
            let name = metric.name.trim();
            if name.is_empty() || RESERVED_COLUMNS.contains(&name) {
                return Err(ConfigError::Invalid(format!(
                    "metric name {:?} clashes with an output column",
                    metric.name
                )));
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "metric {:?} is defined twice",
                    metric.name
                )));
            }
        }
        if !matches!(self.labor.seasonal, 'U' | 'S') {
            return Err(ConfigError::Invalid(format!(
                "labor.seasonal must be U or S, got {:?}",
                self.labor.seasonal
            )));
        }
        Ok(())
    }

    pub fn sorted_years(&self) -> Vec<u16> {
        let mut years = self.years.clone();
        years.sort_unstable();
        years.dedup();
        years
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }
}

/// Where every artifact of a run lives under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archives(&self) -> PathBuf {
        self.root.join("archives")
    }

    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    pub fn normalized(&self) -> PathBuf {
        self.root.join("normalized")
    }

    pub fn metadata(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn aggregates(&self) -> PathBuf {
        self.root.join("aggregates")
    }

    pub fn merged(&self) -> PathBuf {
        self.root.join("merged")
    }

    pub fn reports(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn history(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn labor(&self) -> PathBuf {
        self.root.join("labor")
    }

    pub fn archive_path(&self, year: u16) -> PathBuf {
        self.archives().join(format!("brfss_{year}.zip"))
    }

    pub fn transport_path(&self, year: u16) -> PathBuf {
        self.scratch().join(format!("brfss_{year}.xpt"))
    }

    pub fn artifact_path(&self, year: u16) -> PathBuf {
        self.normalized().join(format!("brfss_{year}.parquet"))
    }

    pub fn vars_path(&self, year: u16) -> PathBuf {
        self.metadata().join(format!("vars_{year}.csv"))
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.archives(),
            self.scratch(),
            self.normalized(),
            self.metadata(),
            self.aggregates(),
            self.merged(),
            self.reports(),
            self.history(),
            self.labor(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_render_both_year_widths() {
        let t = ArchiveTemplate::new("CDBRFS{yy}XPT.ZIP", 1984, 2010);
        assert_eq!(t.render(1990), "CDBRFS90XPT.ZIP");
        assert_eq!(t.render(2005), "CDBRFS05XPT.ZIP");
        let t = ArchiveTemplate::new("CDBRFS{yyyy}XPT.ZIP", 2000, 2010);
        assert_eq!(t.render(2010), "CDBRFS2010XPT.ZIP");
        assert!(!t.applies(1999));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg: PipelineConfig = serde_yaml::from_str(
            "years: [1990, 1991]\nstates: [MI]\nweighting:\n  policy: survey_weight\n  variable: weight_final\n",
        )
        .unwrap();
        assert_eq!(cfg.years, vec![1990, 1991]);
        assert_eq!(cfg.concurrency, 3);
        assert_eq!(
            cfg.weighting,
            Weighting::SurveyWeight {
                variable: "weight_final".into()
            }
        );
        assert_eq!(cfg.archive_templates.len(), 3);
    }

    #[test]
    fn metric_specs_read_from_yaml() {
        let specs: Vec<MetricSpec> = serde_yaml::from_str(
            "- name: days\n  variable: physical_health_days\n  kind: mean\n  min: 1\n  max: 30\n  zero_codes: [88]\n",
        )
        .unwrap();
        assert_eq!(
            specs[0].kind,
            MetricKind::Mean {
                min: 1.0,
                max: 30.0,
                zero_codes: vec![88]
            }
        );
    }

    #[test]
    fn metric_names_must_be_unique_and_unreserved() {
        let mut cfg = PipelineConfig {
            years: vec![1990],
            ..PipelineConfig::default()
        };
        cfg.validate().unwrap();

        let mut twice = cfg.metrics.clone();
        twice.push(cfg.metrics[0].clone());
        let dup = PipelineConfig {
            metrics: twice,
            ..cfg.clone()
        };
        assert!(matches!(dup.validate(), Err(ConfigError::Invalid(m)) if m.contains("twice")));

        cfg.metrics[1].name = "unemployment_rate".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(m)) if m.contains("clashes")));
    }

    #[test]
    fn years_past_2010_are_rejected() {
        let cfg = PipelineConfig {
            years: vec![2009, 2011],
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedYear(2011))
        ));
    }

    #[test]
    fn shipped_config_files_load() {
        let cfg = PipelineConfig::load(Some(Path::new("config/pipeline.yaml"))).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.metrics, default_metrics());
        assert_eq!(cfg.labor.seasonal, 'U');
        let map = crate::schema::CanonicalMap::load(cfg.canonical_map.as_deref().unwrap()).unwrap();
        assert_eq!(map.resolve("genhlth").map(|(c, _)| c), Some("general_health"));
    }

    #[test]
    fn unknown_states_are_rejected() {
        let cfg = PipelineConfig {
            states: vec!["XX".into()],
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownState(_))));
    }
}
