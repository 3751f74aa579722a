// src/history/resume.rs

use anyhow::{Context, Result};
use glob::glob;
use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, info, warn};

use crate::config::DataLayout;
use crate::schema::write::check_year_table;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct YearEntry {
    archive_bytes: Option<u64>,
    artifact: bool,
}

/// What is already on disk, per survey year. Built once at start-up and
/// handed to every worker; each year's entry is only written by that year's
/// task.
#[derive(Debug)]
pub struct ResumeIndex {
    min_archive_bytes: u64,
    entries: RwLock<BTreeMap<u16, YearEntry>>,
}

/// `brfss_<year>.<ext>` → year
fn year_of(path: &Path) -> Option<u16> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("brfss_")?
        .parse()
        .ok()
}

/// Remove leftovers of an interrupted run: `*.part` downloads and `*.tmp`
/// writes anywhere under the data directory.
pub fn discard_partials(root: &Path) -> Result<usize> {
    let mut removed = 0;
    for pattern in ["**/*.part", "**/*.tmp"] {
        for path in glob(&format!("{}/{}", root.display(), pattern))?.filter_map(Result::ok) {
            if path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("removing partial {}", path.display()))?;
                debug!(path = %path.display(), "discarded partial file");
                removed += 1;
            }
        }
    }
    Ok(removed)
}

impl ResumeIndex {
    pub fn empty(min_archive_bytes: u64) -> Self {
        Self {
            min_archive_bytes,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Discard partial files, then record every complete archive and every
    /// artifact whose footer reads back. Unreadable artifacts are deleted.
    pub fn scan(layout: &DataLayout, min_archive_bytes: u64) -> Result<Self> {
        let removed = discard_partials(layout.root())?;
        let index = Self::empty(min_archive_bytes);
        {
            let mut entries = index.write();
            let archives = format!("{}/brfss_*.zip", layout.archives().display());
            for path in glob(&archives)?.filter_map(Result::ok) {
                if let Some(year) = year_of(&path) {
                    let bytes = fs::metadata(&path)?.len();
                    entries.entry(year).or_default().archive_bytes = Some(bytes);
                }
            }
            let artifacts = format!("{}/brfss_*.parquet", layout.normalized().display());
            for path in glob(&artifacts)?.filter_map(Result::ok) {
                let Some(year) = year_of(&path) else { continue };
                match check_year_table(&path) {
                    Ok(()) => entries.entry(year).or_default().artifact = true,
                    Err(e) => {
                        // regenerated from the archive by this run
                        warn!(year, error = format!("{e:#}"), "discarding unreadable artifact");
                        fs::remove_file(&path)
                            .with_context(|| format!("removing {}", path.display()))?;
                    }
                }
            }
            info!(
                years = entries.len(),
                discarded = removed,
                "resume index loaded"
            );
        }
        Ok(index)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<u16, YearEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<u16, YearEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A complete archive of at least the minimum size is on disk.
    pub fn archive_ready(&self, year: u16) -> bool {
        self.read()
            .get(&year)
            .and_then(|e| e.archive_bytes)
            .is_some_and(|b| b >= self.min_archive_bytes)
    }

    pub fn artifact_ready(&self, year: u16) -> bool {
        self.read().get(&year).is_some_and(|e| e.artifact)
    }

    pub fn record_archive(&self, year: u16, bytes: u64) {
        self.write().entry(year).or_default().archive_bytes = Some(bytes);
    }

    pub fn forget_archive(&self, year: u16) {
        if let Some(e) = self.write().get_mut(&year) {
            e.archive_bytes = None;
        }
    }

    pub fn record_artifact(&self, year: u16) {
        self.write().entry(year).or_default().artifact = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{write_year_table, NormalizedRecord, NormalizedYear};
    use crate::xport::Value;
    use tempfile::tempdir;

    fn year_table(year: u16) -> NormalizedYear {
        NormalizedYear {
            year,
            records: vec![NormalizedRecord {
                year,
                state_fips: Some("26".into()),
                county_fips: None,
                values: BTreeMap::from([("general_health".to_string(), Value::Integer(2))]),
            }],
            columns: vec!["general_health".into()],
            notices: vec![],
        }
    }

    #[test]
    fn scan_finds_complete_files_and_drops_partials() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure().unwrap();
        fs::write(layout.archive_path(1990), vec![0u8; 2048]).unwrap();
        fs::write(layout.archive_path(1991), vec![0u8; 10]).unwrap();
        fs::write(layout.archives().join("brfss_1992.zip.part"), b"half").unwrap();
        write_year_table(&layout.artifact_path(1993), &year_table(1993)).unwrap();
        fs::write(layout.normalized().join("brfss_1995.parquet.tmp"), b"junk").unwrap();

        let index = ResumeIndex::scan(&layout, 1024).unwrap();
        assert!(index.archive_ready(1990));
        assert!(!index.archive_ready(1991), "undersized archive is not ready");
        assert!(!index.archive_ready(1992));
        assert!(index.artifact_ready(1993));
        assert!(!index.artifact_ready(1995));
        assert!(!layout.archives().join("brfss_1992.zip.part").exists());
        assert!(!layout.normalized().join("brfss_1995.parquet.tmp").exists());
    }

    #[test]
    fn forgetting_an_archive_makes_it_fetchable_again() {
        let index = ResumeIndex::empty(1);
        index.record_archive(2001, 100);
        assert!(index.archive_ready(2001));
        index.forget_archive(2001);
        assert!(!index.archive_ready(2001));
    }

    #[test]
    fn unreadable_artifact_is_removed_and_not_ready() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure().unwrap();
        fs::write(layout.artifact_path(1995), b"").unwrap();
        fs::write(layout.artifact_path(1996), b"PAR1 torn").unwrap();
        write_year_table(&layout.artifact_path(1997), &year_table(1997)).unwrap();

        let index = ResumeIndex::scan(&layout, 1024).unwrap();
        assert!(!index.artifact_ready(1995));
        assert!(!index.artifact_ready(1996));
        assert!(index.artifact_ready(1997));
        assert!(!layout.artifact_path(1995).exists());
        assert!(!layout.artifact_path(1996).exists());
    }
}
