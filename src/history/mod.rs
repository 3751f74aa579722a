// src/history/mod.rs

//! Run bookkeeping: the on-disk resume index and the append-only Parquet
//! ledger of per-year outcomes.

pub mod outcomes;
pub mod resume;
pub mod state;
pub mod table_history;

pub use outcomes::OutcomeRow;
pub use resume::ResumeIndex;
pub use state::YearStatus;
pub use table_history::{HistoryRow, TableHistory};
