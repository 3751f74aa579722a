// src/process/mod.rs

//! CPU side of one survey year: extract → decode → normalize → write.

pub mod extract;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, instrument};

use crate::config::DataLayout;
use crate::error::{Notice, YearError};
use crate::schema::{
    normalize,
    write::{write_variable_metadata, write_year_table, WriteOutcome},
    CanonicalMap,
};
use crate::xport::DecoderChain;

pub use extract::{choose_entry, extract_transport, Extracted};

/// Everything a worker thread needs to turn an archive into an artifact.
#[derive(Clone)]
pub struct YearJob {
    pub year: u16,
    pub archive: PathBuf,
    pub layout: DataLayout,
    pub map: Arc<CanonicalMap>,
    pub chain: Arc<DecoderChain>,
}

#[derive(Debug)]
pub struct YearProduct {
    pub year: u16,
    pub artifact: PathBuf,
    pub rows: usize,
    pub decoder: &'static str,
    pub notices: Vec<Notice>,
}

#[instrument(level = "info", skip_all, fields(year = job.year))]
pub fn process_year(job: &YearJob) -> Result<YearProduct, YearError> {
    let year = job.year;
    let mut notices = Vec::new();

    // 1) extract the transport entry to scratch
    let extracted = extract_transport(&job.archive, &job.layout.transport_path(year))?;
    notices.extend(extracted.notice.clone());

    // 2) the scratch copy goes whether or not the rest succeeds
    let outcome = decode_and_write(job, &extracted.path, &mut notices);
    if let Err(e) = fs::remove_file(&extracted.path) {
        debug!(error = %e, "scratch transport file not removed");
    }
    let (artifact, rows, decoder) = outcome?;
    info!(rows, decoder, "year normalized");

    Ok(YearProduct {
        year,
        artifact,
        rows,
        decoder,
        notices,
    })
}

/// Decode the scratch transport file, then write variable metadata and the
/// normalized artifact.
fn decode_and_write(
    job: &YearJob,
    transport: &Path,
    notices: &mut Vec<Notice>,
) -> Result<(PathBuf, usize, &'static str), YearError> {
    let year = job.year;
    let bytes = fs::read(transport)?;
    let parsed = job
        .chain
        .decode(&bytes)
        .map_err(|attempts| YearError::DecodeFailure {
            attempts: attempts.iter().map(ToString::to_string).collect(),
        })?;
    drop(bytes);

    let vars_path = job.layout.vars_path(year);
    write_variable_metadata(&vars_path, year, &parsed).map_err(|e| YearError::write(&vars_path, e))?;

    let table = normalize(&parsed, year, &job.map);
    notices.extend(table.notices.iter().cloned());
    let artifact = job.layout.artifact_path(year);
    let rows = match write_year_table(&artifact, &table).map_err(|e| YearError::write(&artifact, e))? {
        WriteOutcome::Written { rows, .. } => rows,
        WriteOutcome::Exists(path) => {
            notices.push(Notice::WriteConflict {
                path: path.display().to_string(),
            });
            0
        }
    };
    Ok((artifact, rows, parsed.decoder))
}
