// src/labor/mod.rs

//! Monthly labor-force statistics rolled up to state-year.
//!
//! Two inputs are understood: a tidy CSV
//! (`state,year,month,unemployment_rate,labor_force_size,employment_ratio`)
//! and the BLS LAUS flat file (`series_id year period value footnote_codes`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

use crate::fetch::source::{FetchResponse, RemoteSource};
use crate::fetch::zips::{get_with_retry, FetchSettings};
use crate::schema::geo;
use crate::schema::write::{tmp_path, write_csv_rows};

pub const LABOR_FILE: &str = "labor_state_year.csv";

/// Statewide LAUS series: seasonal code, state FIPS, measure code.
static LAUS_SERIES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^LA([US])ST(\d{2})0{11}(\d{2})$").expect("LAUS series pattern should be valid")
});

#[derive(Debug, Error)]
pub enum LaborError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unrecognized labor file header {0:?}")]
    UnknownFormat(String),
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("{state} {year}: month {month} is outside 1-12")]
    Month { state: String, year: u16, month: i64 },
    #[error("duplicate observation for {state} {year}-{month:02}")]
    Duplicate { state: String, year: u16, month: u8 },
    #[error("unknown state {0:?}")]
    UnknownState(String),
    #[error("downloading {url}: {reason}")]
    Download { url: String, reason: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaborRecord {
    pub state: String,
    pub year: u16,
    pub month: u8,
    pub unemployment_rate: Option<f64>,
    pub labor_force_size: Option<f64>,
    pub employment_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaborYearAggregate {
    pub state: String,
    pub year: u16,
    pub months_observed: u8,
    pub unemployment_rate: Option<f64>,
    pub labor_force_size: Option<f64>,
    pub employment_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaborFormat {
    Tidy,
    Laus,
}

/// Decide the format from the first non-empty line.
pub fn detect_format(text: &str) -> Result<LaborFormat, LaborError> {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let lower = header.trim().to_ascii_lowercase();
    if lower.starts_with("series_id") {
        return Ok(LaborFormat::Laus);
    }
    let cols: Vec<&str> = lower.split(',').map(str::trim).collect();
    if ["state", "year", "month"].iter().all(|c| cols.contains(c)) {
        return Ok(LaborFormat::Tidy);
    }
    Err(LaborError::UnknownFormat(header.chars().take(80).collect()))
}

#[derive(Debug, Deserialize)]
struct TidyRow {
    state: String,
    year: u16,
    month: i64,
    unemployment_rate: Option<f64>,
    labor_force_size: Option<f64>,
    employment_ratio: Option<f64>,
}

fn checked_month(state: &str, year: u16, month: i64) -> Result<u8, LaborError> {
    if (1..=12).contains(&month) {
        Ok(month as u8)
    } else {
        Err(LaborError::Month {
            state: state.to_string(),
            year,
            month,
        })
    }
}

pub fn parse_tidy(text: &str) -> Result<Vec<LaborRecord>, LaborError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let mut out: BTreeMap<(String, u16, u8), LaborRecord> = BTreeMap::new();
    for row in rdr.deserialize::<TidyRow>() {
        let row = row?;
        let state = geo::parse_state(&row.state)
            .ok_or_else(|| LaborError::UnknownState(row.state.clone()))?
            .to_string();
        let month = checked_month(&state, row.year, row.month)?;
        let key = (state.clone(), row.year, month);
        if out.contains_key(&key) {
            return Err(LaborError::Duplicate {
                state,
                year: row.year,
                month,
            });
        }
        out.insert(
            key,
            LaborRecord {
                state,
                year: row.year,
                month,
                unemployment_rate: row.unemployment_rate,
                labor_force_size: row.labor_force_size,
                employment_ratio: row.employment_ratio,
            },
        );
    }
    Ok(out.into_values().collect())
}

/// Statewide monthly series for the given seasonal code. Sub-state areas,
/// annual averages (`M13`) and unpublished values are skipped.
pub fn parse_laus(text: &str, seasonal: char) -> Result<Vec<LaborRecord>, LaborError> {
    let mut out: BTreeMap<(String, u16, u8), LaborRecord> = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0].eq_ignore_ascii_case("series_id") {
            continue;
        }
        if fields.len() < 4 {
            return Err(LaborError::Malformed {
                line: line_no,
                reason: format!("expected at least 4 fields, found {}", fields.len()),
            });
        }
        let Some(caps) = LAUS_SERIES.captures(fields[0]) else {
            continue;
        };
        if !caps[1].starts_with(seasonal) {
            continue;
        }
        let Some(state) = geo::postal_for_fips(&caps[2]) else {
            debug!(series = fields[0], "series for an unlisted state");
            continue;
        };
        let measure = &caps[3];
        if !matches!(measure, "03" | "06" | "07") {
            continue;
        }
        let Some(month) = fields[2]
            .strip_prefix('M')
            .and_then(|m| m.parse::<i64>().ok())
            .filter(|m| (1..=12).contains(m))
        else {
            continue;
        };
        let year: u16 = fields[1].parse().map_err(|_| LaborError::Malformed {
            line: line_no,
            reason: format!("year {:?}", fields[1]),
        })?;
        let Ok(value) = fields[3].parse::<f64>() else {
            debug!(line = line_no, value = fields[3], "unpublished value skipped");
            continue;
        };

        let month = month as u8;
        let record = out
            .entry((state.to_string(), year, month))
            .or_insert_with(|| LaborRecord {
                state: state.to_string(),
                year,
                month,
                unemployment_rate: None,
                labor_force_size: None,
                employment_ratio: None,
            });
        let slot = match measure {
            "03" => &mut record.unemployment_rate,
            "06" => &mut record.labor_force_size,
            _ => &mut record.employment_ratio,
        };
        if slot.is_some() {
            return Err(LaborError::Duplicate {
                state: state.to_string(),
                year,
                month,
            });
        }
        *slot = Some(value);
    }
    Ok(out.into_values().collect())
}

#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load(path: &Path, seasonal: char) -> Result<Vec<LaborRecord>, LaborError> {
    let raw = fs::read(path).map_err(|source| LaborError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&raw);
    let records = match detect_format(&text)? {
        LaborFormat::Tidy => parse_tidy(&text)?,
        LaborFormat::Laus => parse_laus(&text, seasonal)?,
    };
    info!(records = records.len(), "labor series loaded");
    Ok(records)
}

/// Local path as-is; an http(s) URL is downloaded once into `labor_dir`.
pub async fn resolve_source(
    source: &str,
    labor_dir: &Path,
    remote: &dyn RemoteSource,
    settings: &FetchSettings,
) -> Result<PathBuf, LaborError> {
    if !(source.starts_with("http://") || source.starts_with("https://")) {
        return Ok(PathBuf::from(source));
    }
    let download_err = |reason: String| LaborError::Download {
        url: source.to_string(),
        reason,
    };
    let url = Url::parse(source).map_err(|e| download_err(e.to_string()))?;
    let name = url
        .path_segments()
        .and_then(|mut s| s.next_back())
        .filter(|n| !n.is_empty())
        .unwrap_or("labor_series.txt");
    let dest = labor_dir.join(name);
    if dest.exists() {
        debug!(path = %dest.display(), "labor series already downloaded");
        return Ok(dest);
    }

    let bytes = match get_with_retry(remote, &url, settings).await {
        Ok(FetchResponse::Found(bytes)) => bytes,
        Ok(FetchResponse::NotFound(status)) => return Err(download_err(format!("HTTP {status}"))),
        Err(e) => return Err(download_err(e.to_string())),
    };

    let read_err = |source| LaborError::Read {
        path: dest.clone(),
        source,
    };
    fs::create_dir_all(labor_dir).map_err(read_err)?;
    let tmp = tmp_path(&dest);
    fs::write(&tmp, &bytes).map_err(read_err)?;
    fs::rename(&tmp, &dest).map_err(read_err)?;
    info!(%url, bytes = bytes.len(), "labor series downloaded");
    Ok(dest)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0u32), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// One aggregate per (state, year) among the targets, months averaged.
pub fn aggregate(records: &[LaborRecord], states: &[String], years: &[u16]) -> Vec<LaborYearAggregate> {
    let states: BTreeSet<&str> = states.iter().filter_map(|s| geo::parse_state(s)).collect();
    let years: BTreeSet<u16> = years.iter().copied().collect();
    let mut groups: BTreeMap<(&str, u16), Vec<&LaborRecord>> = BTreeMap::new();
    for r in records {
        if states.contains(r.state.as_str()) && years.contains(&r.year) {
            groups.entry((r.state.as_str(), r.year)).or_default().push(r);
        }
    }
    groups
        .into_iter()
        .map(|((state, year), months)| LaborYearAggregate {
            state: state.to_string(),
            year,
            months_observed: months.len() as u8,
            unemployment_rate: mean(months.iter().filter_map(|r| r.unemployment_rate)),
            labor_force_size: mean(months.iter().filter_map(|r| r.labor_force_size)),
            employment_ratio: mean(months.iter().filter_map(|r| r.employment_ratio)),
        })
        .collect()
}

pub fn write_aggregates(path: &Path, rows: &[LaborYearAggregate]) -> anyhow::Result<()> {
    write_csv_rows(path, rows)
}
