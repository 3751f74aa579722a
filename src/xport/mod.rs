// src/xport/mod.rs

//! SAS XPORT (v5) transport files: typed rows plus variable metadata.
//!
//! Decoding goes through a [`DecoderChain`], an ordered list of
//! [`TransportDecoder`] strategies. The first strategy that succeeds wins;
//! when every strategy fails the caller gets each attempt's typed error.

use chrono::NaiveDateTime;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
pub(crate) mod fixtures;
pub mod header;
pub mod ibm;
pub mod lenient;
pub mod strict;

pub use lenient::LenientDecoder;
pub use strict::StrictDecoder;

/// Largest magnitude below which an `f64` still represents every integer.
const EXACT_INT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// One decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Missing,
}

impl Value {
    /// Integral numbers become `Integer`, the rest stay `Float`.
    pub fn from_number(v: f64) -> Self {
        if v.is_finite() && v.fract() == 0.0 && v.abs() < EXACT_INT_LIMIT {
            Value::Integer(v as i64)
        } else {
            Value::Float(v)
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Missing => None,
        }
    }

    /// Integer view; numeric text such as `"026"` is accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < EXACT_INT_LIMIT => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
            Value::Missing => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Numeric,
    Char,
}

/// A column as described by its NAMESTR record.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub label: String,
    pub kind: VariableKind,
    /// Stored width in bytes.
    pub length: usize,
    /// Byte offset inside an observation.
    pub position: usize,
    pub format: String,
}

/// One observation, aligned with [`ParsedTransport::variables`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct ParsedTransport {
    pub dataset: String,
    pub label: String,
    pub created: Option<NaiveDateTime>,
    pub variables: Vec<Variable>,
    pub records: Vec<RawRecord>,
    /// Name of the strategy that produced this result.
    pub decoder: &'static str,
}

impl ParsedTransport {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("file is {len} bytes, needs at least {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("expected {expected} at byte {offset}")]
    BadHeader {
        expected: &'static str,
        offset: usize,
    },
    #[error("file length {0} is not a multiple of 80")]
    Misaligned(usize),
    #[error("unsupported NAMESTR length {0}")]
    NamestrLength(usize),
    #[error("variable #{index}: {reason}")]
    Variable { index: usize, reason: String },
    #[error("{field} is not valid UTF-8")]
    InvalidText { field: String },
    #[error("header timestamp {0:?} is not ddMMMyy:hh:mm:ss")]
    Timestamp(String),
    #[error("{0} bytes after the last observation are not blank padding")]
    TrailingBytes(usize),
    #[error("{0}")]
    Layout(String),
}

pub trait TransportDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, bytes: &[u8]) -> Result<ParsedTransport, DecodeError>;
}

/// A failed strategy and why it failed.
#[derive(Debug)]
pub struct DecodeAttempt {
    pub decoder: &'static str,
    pub error: DecodeError,
}

impl fmt::Display for DecodeAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.decoder, self.error)
    }
}

pub struct DecoderChain {
    decoders: Vec<Box<dyn TransportDecoder>>,
}

impl Default for DecoderChain {
    /// Strict layout first, then the tolerant scanner.
    fn default() -> Self {
        Self::new(vec![Box::new(StrictDecoder), Box::new(LenientDecoder)])
    }
}

impl DecoderChain {
    pub fn new(decoders: Vec<Box<dyn TransportDecoder>>) -> Self {
        Self { decoders }
    }

    /// Try each strategy in order; on total failure return every attempt.
    pub fn decode(&self, bytes: &[u8]) -> Result<ParsedTransport, Vec<DecodeAttempt>> {
        let mut attempts = Vec::new();
        for decoder in &self.decoders {
            match decoder.decode(bytes) {
                Ok(parsed) => {
                    if !attempts.is_empty() {
                        warn!(
                            decoder = decoder.name(),
                            failed = attempts.len(),
                            "recovered with fallback decoder"
                        );
                    }
                    debug!(
                        decoder = decoder.name(),
                        vars = parsed.variables.len(),
                        rows = parsed.records.len(),
                        "decoded transport file"
                    );
                    return Ok(parsed);
                }
                Err(error) => {
                    debug!(decoder = decoder.name(), %error, "decoder failed");
                    attempts.push(DecodeAttempt {
                        decoder: decoder.name(),
                        error,
                    });
                }
            }
        }
        Err(attempts)
    }
}
