// src/xport/strict.rs

use super::header::{self, TextMode, RECORD_LEN};
use super::{DecodeError, ParsedTransport, TransportDecoder};

const STANDARD_NAMESTR: usize = 140;
/// Library header, two real-header records, member, descriptor, two member
/// records and the NAMESTR header.
const FIXED_RECORDS: usize = 8;

/// Reads files laid out exactly as the v5 specification describes.
pub struct StrictDecoder;

fn expect(
    bytes: &[u8],
    index: usize,
    marker: &'static [u8],
    expected: &'static str,
) -> Result<(), DecodeError> {
    match header::record(bytes, index) {
        Some(rec) if rec.starts_with(marker) => Ok(()),
        _ => Err(DecodeError::BadHeader {
            expected,
            offset: index * RECORD_LEN,
        }),
    }
}

fn stamp(rec: &[u8]) -> Result<chrono::NaiveDateTime, DecodeError> {
    header::parse_timestamp(rec)
        .ok_or_else(|| DecodeError::Timestamp(String::from_utf8_lossy(rec).into_owned()))
}

impl TransportDecoder for StrictDecoder {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn decode(&self, bytes: &[u8]) -> Result<ParsedTransport, DecodeError> {
        let needed = FIXED_RECORDS * RECORD_LEN;
        if bytes.len() < needed {
            return Err(DecodeError::Truncated {
                len: bytes.len(),
                needed,
            });
        }
        if bytes.len() % RECORD_LEN != 0 {
            return Err(DecodeError::Misaligned(bytes.len()));
        }

        // 1) library header + the two real-header records
        expect(bytes, 0, header::LIBRARY, "library header")?;
        expect(bytes, 1, header::SAS_LIBRARY_TAG, "library real header")?;
        let real = &bytes[RECORD_LEN..2 * RECORD_LEN];
        let created = stamp(&real[64..80])?;
        stamp(&bytes[2 * RECORD_LEN..2 * RECORD_LEN + 16])?;

        // 2) member + descriptor headers
        expect(bytes, 3, header::MEMBER, "member header")?;
        let member = &bytes[3 * RECORD_LEN..4 * RECORD_LEN];
        let namestr_len = header::header_number(member, 74, 78).unwrap_or(0);
        if namestr_len != STANDARD_NAMESTR {
            return Err(DecodeError::NamestrLength(namestr_len));
        }
        expect(bytes, 4, header::DESCRIPTOR, "descriptor header")?;
        expect(bytes, 5, header::SAS_MEMBER_TAG, "member record")?;
        let member_rec = &bytes[5 * RECORD_LEN..6 * RECORD_LEN];
        let dataset = header::text(&member_rec[8..16], TextMode::Utf8, "dataset name")?;
        let second = &bytes[6 * RECORD_LEN..7 * RECORD_LEN];
        stamp(&second[0..16])?;
        let label = header::text(&second[32..72], TextMode::Utf8, "dataset label")?;

        // 3) NAMESTR block
        expect(bytes, 7, header::NAMESTR, "namestr header")?;
        let nvars = header::header_number(&bytes[7 * RECORD_LEN..8 * RECORD_LEN], 54, 58)
            .ok_or(DecodeError::BadHeader {
                expected: "variable count",
                offset: 7 * RECORD_LEN + 54,
            })?;
        let block_start = FIXED_RECORDS * RECORD_LEN;
        let block_len = (nvars * STANDARD_NAMESTR).div_ceil(RECORD_LEN) * RECORD_LEN;
        let obs_at = block_start + block_len;
        if bytes.len() < obs_at + RECORD_LEN {
            return Err(DecodeError::Truncated {
                len: bytes.len(),
                needed: obs_at + RECORD_LEN,
            });
        }

        let mut variables = Vec::with_capacity(nvars);
        let mut expected_pos = 0;
        for i in 0..nvars {
            let start = block_start + i * STANDARD_NAMESTR;
            let var = header::parse_namestr(
                &bytes[start..start + STANDARD_NAMESTR],
                i,
                TextMode::Utf8,
            )?;
            if var.position != expected_pos {
                return Err(DecodeError::Variable {
                    index: i,
                    reason: format!(
                        "{} starts at byte {} but preceding widths sum to {}",
                        var.name, var.position, expected_pos
                    ),
                });
            }
            expected_pos += var.length;
            variables.push(var);
        }

        // 4) observations
        if !bytes[obs_at..].starts_with(header::OBS) {
            return Err(DecodeError::BadHeader {
                expected: "observation header",
                offset: obs_at,
            });
        }
        let data = header::first_member(&bytes[obs_at + RECORD_LEN..]);
        let (records, leftover) = header::decode_rows(data, &variables, TextMode::Utf8)?;
        if leftover > 0 {
            return Err(DecodeError::TrailingBytes(leftover));
        }

        Ok(ParsedTransport {
            dataset,
            label,
            created: Some(created),
            variables,
            records,
            decoder: self.name(),
        })
    }
}
