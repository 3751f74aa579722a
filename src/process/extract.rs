// src/process/extract.rs
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};
use zip::ZipArchive;

use crate::error::{Notice, YearError};
use crate::schema::write::tmp_path;

/// The transport file pulled out of an archive.
#[derive(Debug)]
pub struct Extracted {
    pub path: PathBuf,
    /// Entry name as listed in the archive.
    pub entry: String,
    pub bytes: u64,
    pub notice: Option<Notice>,
}

fn is_transport(name: &str) -> bool {
    name.trim().to_ascii_lowercase().ends_with(".xpt")
}

/// Pick the transport entry among `names` (archive listing order). Several
/// candidates resolve to the shortest trimmed name, then the first listed,
/// and produce an `AmbiguousTransportFile` notice.
pub fn choose_entry(names: &[String]) -> Option<(usize, Option<Notice>)> {
    let candidates: Vec<(usize, &str)> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| is_transport(n))
        .map(|(i, n)| (i, n.as_str()))
        .collect();

    // min_by_key keeps the first of equal keys
    let &(chosen, name) = candidates.iter().min_by_key(|(_, n)| n.trim().len())?;
    let notice = (candidates.len() > 1).then(|| Notice::AmbiguousTransportFile {
        candidates: candidates.iter().map(|(_, n)| n.trim().to_string()).collect(),
        chosen: name.trim().to_string(),
    });
    Some((chosen, notice))
}

/// Stream the transport entry of `archive` to `dest` (through `<dest>.tmp`).
#[instrument(level = "info", skip_all, fields(archive = %archive.display()))]
pub fn extract_transport(archive: &Path, dest: &Path) -> Result<Extracted, YearError> {
    let corrupt = |reason: String| YearError::CorruptArchive {
        archive: archive.to_path_buf(),
        reason,
    };

    // 1) open and list
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i).map_err(|e| corrupt(e.to_string()))?;
        names.push(if entry.is_file() {
            entry.name().to_string()
        } else {
            String::new()
        });
    }

    // 2) choose
    let Some((index, notice)) = choose_entry(&names) else {
        return Err(YearError::MissingTransportFile {
            archive: archive.to_path_buf(),
        });
    };
    if let Some(n) = &notice {
        warn!(%n, "several transport entries");
    }

    // 3) stream out, then rename into place
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(dest);
    let mut entry = zip.by_index(index).map_err(|e| corrupt(e.to_string()))?;
    let bytes = {
        let mut out = BufWriter::new(File::create(&tmp).map_err(|e| YearError::write(&tmp, e))?);
        let n = io::copy(&mut entry, &mut out).map_err(|e| corrupt(e.to_string()))?;
        out.flush().map_err(|e| YearError::write(&tmp, e))?;
        n
    };
    fs::rename(&tmp, dest).map_err(|e| YearError::write(dest, e))?;
    debug!(entry = %names[index], bytes, "transport file extracted");

    Ok(Extracted {
        path: dest.to_path_buf(),
        entry: names[index].clone(),
        bytes,
        notice,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;
    use zip::{write::FileOptions, CompressionMethod};

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options: FileOptions<'_, ()> =
                FileOptions::default().compression_method(CompressionMethod::Stored);
            for (name, body) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(body).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn trailing_whitespace_in_entry_name_is_tolerated() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("brfss_2010.zip");
        fs::write(
            &zip_path,
            archive(&[("README.TXT", b"notes"), ("LLCP2019.XPT ", b"payload")]),
        )
        .unwrap();
        let dest = dir.path().join("scratch").join("brfss_2010.xpt");

        let out = extract_transport(&zip_path, &dest).unwrap();
        assert_eq!(out.entry, "LLCP2019.XPT ");
        assert_eq!(out.bytes, 7);
        assert!(out.notice.is_none());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!tmp_path(&dest).exists());
    }

    #[test]
    fn shortest_name_wins_then_listing_order() {
        let names: Vec<String> = ["CDBRFS95_FULL.XPT", "b.xpt", "a.XPT", "notes.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (index, notice) = choose_entry(&names).unwrap();
        assert_eq!(index, 1);
        assert_eq!(
            notice,
            Some(Notice::AmbiguousTransportFile {
                candidates: vec!["CDBRFS95_FULL.XPT".into(), "b.xpt".into(), "a.XPT".into()],
                chosen: "b.xpt".into(),
            })
        );
    }

    #[test]
    fn archive_without_transport_entry() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("brfss_1990.zip");
        fs::write(&zip_path, archive(&[("codebook.pdf", b"%PDF")])).unwrap();
        let err = extract_transport(&zip_path, &dir.path().join("x.xpt")).unwrap_err();
        assert_eq!(err.kind(), "missing_transport_file");
    }

    #[test]
    fn unreadable_archive_is_corrupt() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("brfss_1990.zip");
        fs::write(&zip_path, b"<html>not found</html>").unwrap();
        let err = extract_transport(&zip_path, &dir.path().join("x.xpt")).unwrap_err();
        assert!(matches!(err, YearError::CorruptArchive { .. }));
    }
}
