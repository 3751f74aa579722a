use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, StringArray, TimestampMicrosecondArray, UInt16Array, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use super::state::YearStatus;
use super::table_history::{HistoryRow, TableHistory};

/// One (dataset, year) result of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub run_id: String,
    pub dataset: String,
    pub year: u16,
    pub status: YearStatus,
    /// Error kind for failures, decoder name for successes.
    pub detail: String,
    pub rows: u64,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRow for OutcomeRow {
    const KEY_COLUMN: usize = 0;

    fn partition_date(&self) -> NaiveDate {
        self.recorded_at.date_naive()
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("run_id", ArrowDataType::Utf8, false),
            Field::new("dataset", ArrowDataType::Utf8, false),
            Field::new("year", ArrowDataType::UInt16, false),
            Field::new("status", ArrowDataType::Utf8, false),
            Field::new("detail", ArrowDataType::Utf8, false),
            Field::new("rows", ArrowDataType::UInt64, false),
            Field::new(
                "recorded_at",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ])
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        vec![
            Arc::new(StringArray::from(vec![self.run_id.clone()])),
            Arc::new(StringArray::from(vec![self.dataset.clone()])),
            Arc::new(UInt16Array::from(vec![self.year])),
            Arc::new(StringArray::from(vec![self.status.as_str()])),
            Arc::new(StringArray::from(vec![self.detail.clone()])),
            Arc::new(UInt64Array::from(vec![self.rows])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .recorded_at
                .timestamp_micros()])),
        ]
    }

    fn unique_key(&self) -> String {
        format!("{}-{}-{}", self.run_id, self.dataset, self.year)
    }

    fn extract_key(batch: &RecordBatch, row: usize) -> Option<String> {
        let text = |idx: usize| {
            batch
                .column(idx)
                .as_any()
                .downcast_ref::<StringArray>()
                .map(|a| a.value(row).to_string())
        };
        let year = batch
            .column(2)
            .as_any()
            .downcast_ref::<UInt16Array>()?
            .value(row);
        Some(format!("{}-{}-{}", text(0)?, text(1)?, year))
    }

    fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        fn col<'a, T: 'static>(batch: &'a RecordBatch, idx: usize) -> Result<&'a T> {
            batch
                .column(idx)
                .as_any()
                .downcast_ref::<T>()
                .with_context(|| format!("outcome column {idx} has an unexpected type"))
        }
        let run_ids = col::<StringArray>(batch, 0)?;
        let datasets = col::<StringArray>(batch, 1)?;
        let years = col::<UInt16Array>(batch, 2)?;
        let statuses = col::<StringArray>(batch, 3)?;
        let details = col::<StringArray>(batch, 4)?;
        let rows = col::<UInt64Array>(batch, 5)?;
        let times = col::<TimestampMicrosecondArray>(batch, 6)?;

        (0..batch.num_rows())
            .map(|i| {
                Ok(OutcomeRow {
                    run_id: run_ids.value(i).to_string(),
                    dataset: datasets.value(i).to_string(),
                    year: years.value(i),
                    status: YearStatus::from_str(statuses.value(i))
                        .with_context(|| format!("unknown status {:?}", statuses.value(i)))?,
                    detail: details.value(i).to_string(),
                    rows: rows.value(i),
                    recorded_at: Utc
                        .timestamp_micros(times.value(i))
                        .single()
                        .context("recorded_at out of range")?,
                })
            })
            .collect()
    }
}

impl TableHistory<OutcomeRow> {
    pub fn new_outcomes(base: impl Into<PathBuf>) -> Result<Self> {
        TableHistory::new(base, "outcomes")
    }

    /// Most recent outcome per (dataset, year).
    pub fn latest(&self) -> Result<BTreeMap<(String, u16), OutcomeRow>> {
        let mut latest: BTreeMap<(String, u16), OutcomeRow> = BTreeMap::new();
        for row in self.rows()? {
            let key = (row.dataset.clone(), row.year);
            match latest.get(&key) {
                Some(existing) if existing.recorded_at >= row.recorded_at => {}
                _ => {
                    latest.insert(key, row);
                }
            }
        }
        Ok(latest)
    }
}
