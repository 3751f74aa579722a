// src/schema/index.rs

//! Cross-year variable index and canonical-map suggestions.
//!
//! Every processed year leaves `metadata/vars_<year>.csv`. The index combines
//! them into one Parquet table plus a JSON summary; suggestions match seed
//! concepts against the index by exact name, then by label terms.

use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, AsArray, Int32Array, StringArray, UInt32Array},
    datatypes::{DataType, Field, Int32Type, Schema, UInt32Type},
    record_batch::RecordBatch,
};
use glob::glob;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::BufWriter,
    path::Path,
    sync::Arc,
};
use tracing::{info, warn};

use super::write::{tmp_path, write_csv_rows};

/// One variable as seen in one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarEntry {
    pub year: u16,
    pub var_name: String,
    pub var_label: String,
    pub var_type: String,
    pub length: u32,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub files_indexed: usize,
    pub per_year_var_counts: BTreeMap<u16, usize>,
    pub unique_vars: usize,
}

pub const INDEX_FILE: &str = "var_index.parquet";
pub const SUMMARY_FILE: &str = "var_index_summary.json";

fn index_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("year", DataType::Int32, false),
        Field::new("var_name", DataType::Utf8, false),
        Field::new("var_label", DataType::Utf8, false),
        Field::new("var_type", DataType::Utf8, false),
        Field::new("length", DataType::UInt32, false),
        Field::new("format", DataType::Utf8, false),
        Field::new("var_name_lc", DataType::Utf8, false),
        Field::new("var_label_lc", DataType::Utf8, false),
    ]))
}

pub fn read_year_vars(path: &Path) -> Result<Vec<VarEntry>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    rdr.deserialize()
        .collect::<Result<Vec<VarEntry>, _>>()
        .with_context(|| format!("parsing {}", path.display()))
}

/// Combine every `vars_<year>.csv` under `metadata_dir` into the index.
pub fn build_var_index(metadata_dir: &Path) -> Result<IndexSummary> {
    let pattern = format!("{}/vars_*.csv", metadata_dir.display());
    let mut files: Vec<_> = glob(&pattern)?.filter_map(Result::ok).collect();
    files.sort();

    let mut entries = Vec::new();
    let mut per_year = BTreeMap::new();
    let mut indexed = 0;
    for file in &files {
        match read_year_vars(file) {
            Ok(vars) => {
                if let Some(first) = vars.first() {
                    per_year.insert(first.year, vars.len());
                }
                entries.extend(vars);
                indexed += 1;
            }
            Err(e) => warn!(file = %file.display(), error = %e, "skipping unreadable metadata"),
        }
    }
    entries.sort_by(|a, b| {
        (a.year, a.var_name.to_lowercase()).cmp(&(b.year, b.var_name.to_lowercase()))
    });

    write_index(&metadata_dir.join(INDEX_FILE), &entries)?;
    let summary = IndexSummary {
        files_indexed: indexed,
        per_year_var_counts: per_year,
        unique_vars: entries
            .iter()
            .map(|e| e.var_name.to_lowercase())
            .collect::<BTreeSet<_>>()
            .len(),
    };
    let summary_path = metadata_dir.join(SUMMARY_FILE);
    let tmp = tmp_path(&summary_path);
    fs::write(&tmp, serde_json::to_string_pretty(&summary)?)?;
    fs::rename(&tmp, &summary_path)?;
    info!(
        files = summary.files_indexed,
        unique = summary.unique_vars,
        "variable index written"
    );
    Ok(summary)
}

fn write_index(path: &Path, entries: &[VarEntry]) -> Result<()> {
    let schema = index_schema();
    let strings = |f: fn(&VarEntry) -> String| -> ArrayRef {
        Arc::new(StringArray::from_iter_values(entries.iter().map(f)))
    };
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from_iter_values(
            entries.iter().map(|e| i32::from(e.year)),
        )),
        strings(|e| e.var_name.clone()),
        strings(|e| e.var_label.clone()),
        strings(|e| e.var_type.clone()),
        Arc::new(UInt32Array::from_iter_values(entries.iter().map(|e| e.length))),
        strings(|e| e.format.clone()),
        strings(|e| e.var_name.to_lowercase()),
        strings(|e| e.var_label.to_lowercase()),
    ];
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let tmp = tmp_path(path);
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_var_index(path: &Path) -> Result<Vec<VarEntry>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let text = |idx: usize| {
            batch
                .column(idx)
                .as_string_opt::<i32>()
                .with_context(|| format!("index column {idx} is not Utf8"))
        };
        let years = batch
            .column(0)
            .as_primitive_opt::<Int32Type>()
            .context("index year column")?;
        let lengths = batch
            .column(4)
            .as_primitive_opt::<UInt32Type>()
            .context("index length column")?;
        let (names, labels, types, formats) = (text(1)?, text(2)?, text(3)?, text(5)?);
        for row in 0..batch.num_rows() {
            out.push(VarEntry {
                year: u16::try_from(years.value(row))?,
                var_name: names.value(row).to_string(),
                var_label: labels.value(row).to_string(),
                var_type: types.value(row).to_string(),
                length: lengths.value(row),
                format: formats.value(row).to_string(),
            });
        }
    }
    Ok(out)
}

/// A concept to look for: exact variable names plus words expected in labels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedConcept {
    #[serde(default)]
    pub aliases_exact: Vec<String>,
    #[serde(default)]
    pub label_terms: Vec<String>,
}

pub fn load_seed(path: &Path) -> Result<BTreeMap<String, SeedConcept>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading seed {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing seed {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub canonical: String,
    pub alias_var: String,
    pub alias_label: String,
    pub years: String,
    pub via: String,
}

/// Match each seed concept against the index. Exact names come first in
/// seed order, then label-term hits in name order; each variable is listed
/// once per concept.
pub fn suggest_map(
    entries: &[VarEntry],
    seed: &BTreeMap<String, SeedConcept>,
) -> Vec<Suggestion> {
    // (name_lc, label_lc) → years
    let mut pairs: BTreeMap<(String, String), BTreeSet<u16>> = BTreeMap::new();
    for e in entries {
        pairs
            .entry((e.var_name.to_lowercase(), e.var_label.to_lowercase()))
            .or_default()
            .insert(e.year);
    }
    let years_of = |set: &BTreeSet<u16>| {
        set.iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",")
    };

    let mut out = Vec::new();
    for (canonical, concept) in seed {
        let mut seen = BTreeSet::new();
        let mut push = |name: &str, label: &str, years: &BTreeSet<u16>, via: String| {
            if seen.insert(name.to_string()) {
                out.push(Suggestion {
                    canonical: canonical.clone(),
                    alias_var: name.to_string(),
                    alias_label: label.to_string(),
                    years: years_of(years),
                    via,
                });
            }
        };

        for alias in &concept.aliases_exact {
            let alias = alias.to_lowercase();
            for ((name, label), years) in pairs.iter().filter(|((n, _), _)| *n == alias) {
                push(name, label, years, "exact_name".into());
            }
        }
        for term in &concept.label_terms {
            let term = term.to_lowercase();
            for ((name, label), years) in pairs.iter().filter(|((_, l), _)| l.contains(&term)) {
                push(name, label, years, format!("label_term:{term}"));
            }
        }
    }
    out
}

#[derive(Serialize)]
struct SuggestedMap<'a> {
    version: u32,
    variables: BTreeMap<&'a str, Vec<&'a str>>,
}

/// Write suggestions as a loadable canonical map plus a coverage CSV.
pub fn write_suggestions(suggestions: &[Suggestion], yaml_path: &Path, csv_path: &Path) -> Result<()> {
    let mut variables: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for s in suggestions {
        variables
            .entry(s.canonical.as_str())
            .or_default()
            .push(s.alias_var.as_str());
    }
    let map = SuggestedMap {
        version: 1,
        variables,
    };
    if let Some(parent) = yaml_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(yaml_path);
    fs::write(&tmp, serde_yaml::to_string(&map)?)?;
    fs::rename(&tmp, yaml_path)?;
    write_csv_rows(csv_path, suggestions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::canonical::CanonicalMap;
    use tempfile::tempdir;

    fn entry(year: u16, name: &str, label: &str) -> VarEntry {
        VarEntry {
            year,
            var_name: name.into(),
            var_label: label.into(),
            var_type: "numeric".into(),
            length: 8,
            format: String::new(),
        }
    }

    #[test]
    fn index_combines_per_year_files() {
        let dir = tempdir().unwrap();
        write_csv_rows(
            &dir.path().join("vars_1990.csv"),
            &[entry(1990, "_STATE", "STATE"), entry(1990, "GENHLTH", "GENERAL HEALTH")],
        )
        .unwrap();
        write_csv_rows(
            &dir.path().join("vars_1991.csv"),
            &[entry(1991, "_STATE", "STATE")],
        )
        .unwrap();

        let summary = build_var_index(dir.path()).unwrap();
        assert_eq!(summary.files_indexed, 2);
        assert_eq!(summary.unique_vars, 2);
        assert_eq!(summary.per_year_var_counts[&1990], 2);

        let back = read_var_index(&dir.path().join(INDEX_FILE)).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0], entry(1990, "_STATE", "STATE"));
        assert_eq!(back[2].year, 1991);
    }

    #[test]
    fn suggestions_prefer_exact_names_then_labels() {
        let entries = vec![
            entry(1990, "GENHLTH", "GENERAL HEALTH"),
            entry(1991, "GENHLTH", "GENERAL HEALTH"),
            entry(2001, "HLTHSTAT", "self-rated general health"),
            entry(1990, "SEX", "RESPONDENT SEX"),
        ];
        let seed = BTreeMap::from([(
            "general_health".to_string(),
            SeedConcept {
                aliases_exact: vec!["GENHLTH".into()],
                label_terms: vec!["general health".into()],
            },
        )]);
        let out = suggest_map(&entries, &seed);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].alias_var, "genhlth");
        assert_eq!(out[0].years, "1990,1991");
        assert_eq!(out[0].via, "exact_name");
        assert_eq!(out[1].alias_var, "hlthstat");
        assert_eq!(out[1].via, "label_term:general health");
    }

    #[test]
    fn suggested_yaml_loads_as_a_canonical_map() {
        let dir = tempdir().unwrap();
        let yaml = dir.path().join("suggested.yaml");
        let suggestions = vec![Suggestion {
            canonical: "general_health".into(),
            alias_var: "genhlth".into(),
            alias_label: "general health".into(),
            years: "1990".into(),
            via: "exact_name".into(),
        }];
        write_suggestions(&suggestions, &yaml, &dir.path().join("coverage.csv")).unwrap();
        let map = CanonicalMap::load(&yaml).unwrap();
        assert_eq!(map.resolve("genhlth"), Some(("general_health", 0)));
    }
}
