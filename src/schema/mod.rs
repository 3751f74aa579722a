pub mod arrow;
pub mod canonical;
pub mod geo;
pub mod index;
pub mod normalize;
pub mod write;

pub use canonical::CanonicalMap;
pub use normalize::{normalize, NormalizedRecord, NormalizedYear};
pub use write::{read_year_table, write_year_table, WriteOutcome};
