// src/xport/header.rs

//! Record-level layout shared by the decoders: the fixed 80-byte header
//! records, NAMESTR descriptors and the observation block.

use chrono::NaiveDateTime;

use super::{ibm, DecodeError, RawRecord, Value, Variable, VariableKind};

pub const RECORD_LEN: usize = 80;

pub const LIBRARY: &[u8] = b"HEADER RECORD*******LIBRARY HEADER RECORD!!!!!!!";
pub const MEMBER: &[u8] = b"HEADER RECORD*******MEMBER  HEADER RECORD!!!!!!!";
pub const DESCRIPTOR: &[u8] = b"HEADER RECORD*******DSCRPTR HEADER RECORD!!!!!!!";
pub const NAMESTR: &[u8] = b"HEADER RECORD*******NAMESTR HEADER RECORD!!!!!!!";
pub const OBS: &[u8] = b"HEADER RECORD*******OBS     HEADER RECORD!!!!!!!";

pub const SAS_LIBRARY_TAG: &[u8] = b"SAS     SAS     SASLIB  ";
pub const SAS_MEMBER_TAG: &[u8] = b"SAS     ";

/// Bytes of a NAMESTR entry that carry fields we read; the rest is reserved.
pub const NAMESTR_USED: usize = 88;

/// How character data is turned into `String`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextMode {
    /// Reject anything that is not UTF-8 (ASCII in well-formed files).
    Utf8,
    /// Map every byte to the code point of the same value.
    Latin1,
}

/// The 80-byte record at `index`, if the file is long enough.
pub fn record(bytes: &[u8], index: usize) -> Option<&[u8]> {
    bytes.get(index * RECORD_LEN..(index + 1) * RECORD_LEN)
}

/// Byte offset of the first occurrence of `needle` at or after `from`.
pub fn find(bytes: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Parse the run of ASCII digits in `rec[start..end]`.
pub fn header_number(rec: &[u8], start: usize, end: usize) -> Option<usize> {
    let digits = rec.get(start..end)?;
    std::str::from_utf8(digits).ok()?.trim().parse().ok()
}

/// `ddMMMyy:hh:mm:ss`, e.g. `13APR89:10:20:06`.
pub fn parse_timestamp(raw: &[u8]) -> Option<NaiveDateTime> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    NaiveDateTime::parse_from_str(text, "%d%b%y:%H:%M:%S").ok()
}

fn trim_padding(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    &raw[..end]
}

/// Decode a blank-padded text field.
pub fn text(raw: &[u8], mode: TextMode, field: &str) -> Result<String, DecodeError> {
    let trimmed = trim_padding(raw);
    match mode {
        TextMode::Utf8 => std::str::from_utf8(trimmed)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidText {
                field: field.to_string(),
            }),
        TextMode::Latin1 => Ok(trimmed.iter().map(|&b| char::from(b)).collect()),
    }
}

fn be_i16(raw: &[u8]) -> i16 {
    i16::from_be_bytes([raw[0], raw[1]])
}

fn be_i32(raw: &[u8]) -> i32 {
    i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Parse one NAMESTR entry (at least `NAMESTR_USED` bytes).
pub fn parse_namestr(raw: &[u8], index: usize, mode: TextMode) -> Result<Variable, DecodeError> {
    if raw.len() < NAMESTR_USED {
        return Err(DecodeError::Variable {
            index,
            reason: format!("descriptor is {} bytes", raw.len()),
        });
    }
    let bad = |reason: String| DecodeError::Variable { index, reason };

    let kind = match be_i16(&raw[0..2]) {
        1 => VariableKind::Numeric,
        2 => VariableKind::Char,
        other => return Err(bad(format!("unknown type code {other}"))),
    };
    let length = be_i16(&raw[4..6]);
    let name = text(&raw[8..16], mode, "variable name")?;
    if name.is_empty() {
        return Err(bad("empty name".into()));
    }
    match kind {
        VariableKind::Numeric if !(2..=8).contains(&length) => {
            return Err(bad(format!("numeric {name} has width {length}")))
        }
        VariableKind::Char if length < 1 => {
            return Err(bad(format!("character {name} has width {length}")))
        }
        _ => {}
    }
    let label = text(&raw[16..56], mode, &format!("label of {name}"))?;
    let format_name = text(&raw[56..64], mode, &format!("format of {name}"))?;
    let format_width = be_i16(&raw[64..66]);
    let format_decimals = be_i16(&raw[66..68]);
    let position = be_i32(&raw[84..88]);

    let format = match (format_name.is_empty(), format_width, format_decimals) {
        (true, 0, _) => String::new(),
        (_, w, 0) => format!("{format_name}{w}."),
        (_, w, d) => format!("{format_name}{w}.{d}"),
    };

    Ok(Variable {
        name,
        label,
        kind,
        length: length as usize,
        position: position.max(0) as usize,
        format,
    })
}

/// Cut the observation block at a following member header, if any: only the
/// first member of a library is read.
pub fn first_member(data: &[u8]) -> &[u8] {
    match data
        .chunks(RECORD_LEN)
        .position(|rec| rec.starts_with(MEMBER))
    {
        Some(idx) => &data[..idx * RECORD_LEN],
        None => data,
    }
}

fn decode_cell(raw: &[u8], var: &Variable, mode: TextMode) -> Result<Value, DecodeError> {
    match var.kind {
        VariableKind::Numeric => Ok(match ibm::decode(raw) {
            None => Value::Missing,
            Some(v) => Value::from_number(v),
        }),
        VariableKind::Char => {
            let s = text(raw, mode, &var.name)?;
            Ok(if s.is_empty() {
                Value::Missing
            } else {
                Value::Text(s)
            })
        }
    }
}

/// Decode the observation block. Returns the rows plus the count of bytes
/// that were neither consumed as rows nor blank padding.
///
/// Only whole 80-byte records are read; blank filler inside the final record
/// is padding rather than an all-blank row.
pub fn decode_rows(
    data: &[u8],
    vars: &[Variable],
    mode: TextMode,
) -> Result<(Vec<RawRecord>, usize), DecodeError> {
    let row_len = vars
        .iter()
        .map(|v| v.position + v.length)
        .max()
        .unwrap_or(0);
    if row_len == 0 {
        return Err(DecodeError::Layout("dataset declares no variables".into()));
    }

    let aligned = data.len() - data.len() % RECORD_LEN;
    let (body, excess) = data.split_at(aligned);
    let blank = |raw: &[u8]| raw.iter().all(|&b| b == b' ');

    let mut records = Vec::with_capacity(body.len() / row_len);
    let mut offset = 0;
    while offset + row_len <= body.len() {
        let rest = &body[offset..];
        if rest.len() < RECORD_LEN && blank(rest) {
            offset = body.len();
            break;
        }
        let row = &rest[..row_len];
        let values = vars
            .iter()
            .map(|v| decode_cell(&row[v.position..v.position + v.length], v, mode))
            .collect::<Result<Vec<_>, _>>()?;
        records.push(RawRecord { values });
        offset += row_len;
    }

    let mut leftover = 0;
    for tail in [&body[offset..], excess] {
        if !blank(tail) {
            leftover += tail.len();
        }
    }
    Ok((records, leftover))
}
