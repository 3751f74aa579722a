use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, StringArray},
    datatypes::Schema as ArrowSchema,
    record_batch::RecordBatch,
};
use chrono::{NaiveDate, Utc};
use glob::glob;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    marker::PhantomData,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

const CONSOLIDATED: &str = "consolidated.parquet";

/// Trait representing a row in a history table.
/// - Defines schema, to_arrays, unique_key for writes.
/// - Provides column indices and a small extractor for dedupe scanning.
pub trait HistoryRow: Sized {
    /// Partition date (UTC naive) for hive partitioning
    fn partition_date(&self) -> NaiveDate;
    /// Arrow schema for this row type
    fn schema() -> ArrowSchema;
    /// Convert this row into column arrays matching the schema
    fn to_arrays(&self) -> Vec<ArrayRef>;
    /// Unique dedupe key for this row (used when writing, and as file stem)
    fn unique_key(&self) -> String;
    /// Rebuild rows from a batch read back from disk
    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>>;
    /// Column index for key in schema
    const KEY_COLUMN: usize;
    /// Extract the dedupe key from an existing batch row (for scanning).
    /// Must agree with `unique_key`.
    fn extract_key(batch: &RecordBatch, row: usize) -> Option<String> {
        let key = batch
            .column(Self::KEY_COLUMN)
            .as_any()
            .downcast_ref::<StringArray>()?;
        (!key.is_null(row)).then(|| key.value(row).to_string())
    }
}

/// Generic hive-partitioned, append-only history table:
/// `<base>/<table>/date=YYYYMMDD/<key>---<ts>.parquet`.
pub struct TableHistory<R: HistoryRow> {
    base_dir: PathBuf,
    table: String,
    schema: Arc<ArrowSchema>,
    seen: Mutex<HashSet<String>>,
    _marker: PhantomData<R>,
}

impl<R: HistoryRow> TableHistory<R> {
    fn files(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!(
            "{}/date=*/*.parquet",
            self.base_dir.join(&self.table).display()
        );
        let mut files: Vec<_> = glob(&pattern)?.filter_map(Result::ok).collect();
        files.sort();
        Ok(files)
    }

    fn batches(&self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for path in self.files()? {
            let file =
                File::open(&path).with_context(|| format!("failed to open `{}`", path.display()))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
                .with_batch_size(1024)
                .build()?;
            for batch in reader {
                out.push(batch?);
            }
        }
        Ok(out)
    }

    /// Create the table directory and scan existing dedupe keys into `seen`.
    pub fn new(base_dir: impl Into<PathBuf>, table: &str) -> Result<Self> {
        let base_dir = base_dir.into();
        let table_dir = base_dir.join(table);
        fs::create_dir_all(&table_dir)
            .with_context(|| format!("could not create `{}`", table_dir.display()))?;

        let mut hist = Self {
            base_dir,
            table: table.to_string(),
            schema: Arc::new(R::schema()),
            seen: Mutex::new(HashSet::new()),
            _marker: PhantomData,
        };
        let mut seen = HashSet::new();
        for batch in hist.batches()? {
            for i in 0..batch.num_rows() {
                if let Some(key) = R::extract_key(&batch, i) {
                    seen.insert(key);
                }
            }
        }
        hist.seen = Mutex::new(seen);
        Ok(hist)
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a row; a row whose key was already written is ignored.
    pub fn add(&self, row: &R) -> Result<()> {
        let key = row.unique_key();
        if !self.seen().insert(key.clone()) {
            return Ok(());
        }

        let date = row.partition_date();
        let partition = format!("date={}", date.format("%Y%m%d"));
        let dir = self.base_dir.join(&self.table).join(partition);
        fs::create_dir_all(&dir)?;

        let ts = Utc::now().timestamp_micros();
        let fname = format!("{}---{}.parquet", key, ts);
        let tmp = dir.join(format!("{}.tmp", fname));
        let final_path = dir.join(&fname);

        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
        let batch = RecordBatch::try_new(self.schema.clone(), row.to_arrays())?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    /// Every row in the table, in file order.
    pub fn rows(&self) -> Result<Vec<R>> {
        let mut out = Vec::new();
        for batch in self.batches()? {
            out.extend(R::from_batch(&batch)?);
        }
        Ok(out)
    }

    /// Fold every partition holding more than one file into a single
    /// `consolidated.parquet`.
    pub fn vacuum(&self) -> Result<usize> {
        let table_dir = self.base_dir.join(&self.table);
        let mut folded = 0;
        for part in fs::read_dir(&table_dir)? {
            let part = part?;
            if !part.file_type()?.is_dir() {
                continue;
            }
            let dir = part.path();
            let mut files: Vec<_> = glob(&format!("{}/*.parquet", dir.display()))?
                .filter_map(Result::ok)
                .collect();
            if files.len() < 2 {
                continue;
            }
            files.sort();

            let tmp = dir.join(format!("{CONSOLIDATED}.tmp"));
            let file = File::create(&tmp)?;
            let mut writer = ArrowWriter::try_new(BufWriter::new(file), self.schema.clone(), None)?;
            for p in &files {
                let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(p)?)?
                    .with_batch_size(1024)
                    .build()?;
                for batch in reader {
                    writer.write(&batch?)?;
                }
            }
            writer.close()?;
            let consolidated = dir.join(CONSOLIDATED);
            fs::rename(&tmp, &consolidated)?;

            for p in files.into_iter().filter(|p| *p != consolidated) {
                fs::remove_file(p)?;
            }
            folded += 1;
        }
        Ok(folded)
    }
}
