// src/schema/arrow.rs

use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema};
use std::sync::Arc;

use super::canonical::{COUNTY_FIPS, STATE_FIPS, YEAR};
use crate::xport::Value;

/// Storage type of a value column in the per-year artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
}

/// Pick the narrowest type that holds every present value:
/// - all integers                 → Int64
/// - integers and floats          → Float64
/// - any text, or nothing present → Utf8
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
    let mut seen_any = false;
    let mut all_int = true;
    for value in values {
        match value {
            Value::Missing => continue,
            Value::Text(_) => return ColumnType::Utf8,
            Value::Integer(_) => {}
            Value::Float(_) => all_int = false,
        }
        seen_any = true;
    }
    match (seen_any, all_int) {
        (false, _) => ColumnType::Utf8,
        (true, true) => ColumnType::Int64,
        (true, false) => ColumnType::Float64,
    }
}

pub fn map_to_arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
    }
}

pub fn column_type_of(dt: &DataType) -> Option<ColumnType> {
    match dt {
        DataType::Int64 => Some(ColumnType::Int64),
        DataType::Float64 => Some(ColumnType::Float64),
        DataType::Utf8 => Some(ColumnType::Utf8),
        _ => None,
    }
}

/// `year`, `state_fips`, `county_fips`, then the value columns in the order
/// given. Every field is nullable except `year`.
pub fn build_arrow_schema(columns: &[(String, ColumnType)]) -> Arc<ArrowSchema> {
    let mut fields = vec![
        ArrowField::new(YEAR, DataType::Int32, false),
        ArrowField::new(STATE_FIPS, DataType::Utf8, true),
        ArrowField::new(COUNTY_FIPS, DataType::Utf8, true),
    ];
    fields.extend(
        columns
            .iter()
            .map(|(name, ty)| ArrowField::new(name, map_to_arrow_type(*ty), true)),
    );
    Arc::new(ArrowSchema::new(fields))
}
