// src/schema/write.rs

use anyhow::{bail, Context, Result};
use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int32Array, Int64Array, StringArray},
    datatypes::{Float64Type, Int32Type, Int64Type},
    record_batch::RecordBatch,
};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, instrument};

use super::arrow::{build_arrow_schema, column_type_of, infer_column_type, ColumnType};
use super::canonical::{COUNTY_FIPS, STATE_FIPS, YEAR};
use super::index::VarEntry;
use super::normalize::{NormalizedRecord, NormalizedYear};
use crate::xport::{ParsedTransport, Value, VariableKind};

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written { path: PathBuf, rows: usize },
    /// The artifact was already there; nothing was touched.
    Exists(PathBuf),
}

/// `<path>.tmp` next to the final file.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn value_array(records: &[NormalizedRecord], name: &str, ty: ColumnType) -> ArrayRef {
    let cells = records.iter().map(|r| r.values.get(name));
    match ty {
        ColumnType::Int64 => Arc::new(Int64Array::from_iter(
            cells.map(|v| v.and_then(Value::as_i64)),
        )),
        ColumnType::Float64 => Arc::new(Float64Array::from_iter(
            cells.map(|v| v.and_then(Value::as_f64)),
        )),
        ColumnType::Utf8 => Arc::new(StringArray::from_iter(cells.map(|v| {
            v.filter(|v| !v.is_missing()).map(ToString::to_string)
        }))),
    }
}

/// Write one year's records as `path`, via `<path>.tmp` + rename. An
/// existing artifact is never overwritten.
#[instrument(level = "info", skip(path, table), fields(year = table.year, rows = table.records.len()))]
pub fn write_year_table(path: &Path, table: &NormalizedYear) -> Result<WriteOutcome> {
    if path.exists() {
        return Ok(WriteOutcome::Exists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // 1) type each value column from what is actually present
    let typed: Vec<(String, ColumnType)> = table
        .columns
        .iter()
        .map(|name| {
            let ty = infer_column_type(table.records.iter().filter_map(|r| r.values.get(name)));
            (name.clone(), ty)
        })
        .collect();
    let schema = build_arrow_schema(&typed);

    // 2) build arrays in schema order
    let records = &table.records;
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(typed.len() + 3);
    arrays.push(Arc::new(Int32Array::from_iter_values(
        records.iter().map(|r| i32::from(r.year)),
    )));
    arrays.push(Arc::new(StringArray::from_iter(
        records.iter().map(|r| r.state_fips.as_deref()),
    )));
    arrays.push(Arc::new(StringArray::from_iter(
        records.iter().map(|r| r.county_fips.as_deref()),
    )));
    for (name, ty) in &typed {
        arrays.push(value_array(records, name, *ty));
    }
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building year batch")?;

    // 3) tmp → rename
    let tmp = tmp_path(path);
    let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(file), schema, Some(props))?;
    writer.write(&batch)?;
    // footer written and on disk before the final name appears
    let file = writer
        .into_inner()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    file.sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    debug!(path = %path.display(), "wrote year table");

    Ok(WriteOutcome::Written {
        path: path.to_path_buf(),
        rows: records.len(),
    })
}

enum ColumnReader<'a> {
    Int(&'a arrow::array::PrimitiveArray<Int64Type>),
    Float(&'a arrow::array::PrimitiveArray<Float64Type>),
    Text(&'a arrow::array::StringArray),
}

impl ColumnReader<'_> {
    fn value(&self, row: usize) -> Value {
        match self {
            ColumnReader::Int(a) if a.is_valid(row) => Value::Integer(a.value(row)),
            ColumnReader::Float(a) if a.is_valid(row) => Value::Float(a.value(row)),
            ColumnReader::Text(a) if a.is_valid(row) => Value::Text(a.value(row).to_string()),
            _ => Value::Missing,
        }
    }
}

/// Open the artifact's footer and check it carries the key columns.
pub fn check_year_table(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading footer of {}", path.display()))?;
    let names: Vec<&str> = builder
        .schema()
        .fields()
        .iter()
        .take(3)
        .map(|f| f.name().as_str())
        .collect();
    if names != [YEAR, STATE_FIPS, COUNTY_FIPS] {
        bail!("{} lacks the key columns", path.display());
    }
    Ok(())
}

/// Stream a per-year artifact back into records.
pub fn read_year_table(path: &Path) -> Result<Vec<NormalizedRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(8192)
        .build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch?;
        let schema = batch.schema();
        if batch.num_columns() < 3 {
            bail!("{} lacks the key columns", path.display());
        }
        let years = batch
            .column(0)
            .as_primitive_opt::<Int32Type>()
            .context("year column is not Int32")?;
        let states = batch
            .column(1)
            .as_string_opt::<i32>()
            .context("state_fips column is not Utf8")?;
        let counties = batch
            .column(2)
            .as_string_opt::<i32>()
            .context("county_fips column is not Utf8")?;

        let mut readers = Vec::with_capacity(batch.num_columns() - 3);
        for (idx, field) in schema.fields().iter().enumerate().skip(3) {
            let col = batch.column(idx);
            let reader = match column_type_of(field.data_type()) {
                Some(ColumnType::Int64) => col.as_primitive_opt::<Int64Type>().map(ColumnReader::Int),
                Some(ColumnType::Float64) => {
                    col.as_primitive_opt::<Float64Type>().map(ColumnReader::Float)
                }
                Some(ColumnType::Utf8) => col.as_string_opt::<i32>().map(ColumnReader::Text),
                None => None,
            }
            .with_context(|| format!("column {} has type {}", field.name(), field.data_type()))?;
            readers.push((field.name().clone(), reader));
        }

        for row in 0..batch.num_rows() {
            let text = |a: &StringArray| a.is_valid(row).then(|| a.value(row).to_string());
            out.push(NormalizedRecord {
                year: u16::try_from(years.value(row)).context("year out of range")?,
                state_fips: text(states),
                county_fips: text(counties),
                values: readers
                    .iter()
                    .map(|(name, reader)| (name.clone(), reader.value(row)))
                    .collect::<BTreeMap<_, _>>(),
            });
        }
    }
    Ok(out)
}

/// Write a CSV with `header` and `rows` to `path` atomically.
pub fn write_csv_table(path: &Path, header: &[String], rows: &[Vec<String>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut wtr = csv::Writer::from_path(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        wtr.write_record(header)?;
        for row in rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Serialize `rows` as CSV to `path` atomically.
pub fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut wtr = csv::Writer::from_path(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        for row in rows {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Per-year variable list, `metadata/vars_<year>.csv`.
pub fn write_variable_metadata(path: &Path, year: u16, parsed: &ParsedTransport) -> Result<()> {
    let rows: Vec<VarEntry> = parsed
        .variables
        .iter()
        .map(|v| VarEntry {
            year,
            var_name: v.name.clone(),
            var_label: v.label.clone(),
            var_type: match v.kind {
                VariableKind::Numeric => "numeric".into(),
                VariableKind::Char => "char".into(),
            },
            length: v.length as u32,
            format: v.format.clone(),
        })
        .collect();
    write_csv_rows(path, &rows)
}
