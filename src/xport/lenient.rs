// src/xport/lenient.rs

use tracing::warn;

use super::header::{self, TextMode, RECORD_LEN};
use super::{DecodeError, ParsedTransport, TransportDecoder};

/// Tolerant scanner for files the strict layout rejects.
///
/// Headers are located by searching for their markers instead of assuming
/// fixed record numbers, VAX-style 136-byte NAMESTR entries are accepted,
/// text is read as Latin-1, variable offsets are recomputed from the widths
/// and trailing garbage after the last full row is dropped.
pub struct LenientDecoder;

fn locate(
    bytes: &[u8],
    marker: &[u8],
    from: usize,
    expected: &'static str,
) -> Result<usize, DecodeError> {
    header::find(bytes, marker, from).ok_or(DecodeError::BadHeader {
        expected,
        offset: from,
    })
}

fn record_at<'a>(bytes: &'a [u8], at: usize, expected: &'static str) -> Result<&'a [u8], DecodeError> {
    bytes
        .get(at..at + RECORD_LEN)
        .ok_or(DecodeError::BadHeader { expected, offset: at })
}

impl TransportDecoder for LenientDecoder {
    fn name(&self) -> &'static str {
        "lenient"
    }

    fn decode(&self, bytes: &[u8]) -> Result<ParsedTransport, DecodeError> {
        // 1) creation stamp is informational only
        let created = header::find(bytes, header::SAS_LIBRARY_TAG, 0)
            .and_then(|at| bytes.get(at + 64..at + 80))
            .and_then(header::parse_timestamp);

        // 2) member header and its two descriptor records
        let member_at = locate(bytes, header::MEMBER, 0, "member header")?;
        let member = record_at(bytes, member_at, "member header")?;
        let namestr_len = match header::header_number(member, 74, 78) {
            Some(n @ (136 | 140)) => n,
            Some(other) => return Err(DecodeError::NamestrLength(other)),
            None => 140,
        };
        let descriptor_at = locate(bytes, header::DESCRIPTOR, member_at, "descriptor header")?;
        let member_rec = record_at(bytes, descriptor_at + RECORD_LEN, "member record")?;
        let dataset = header::text(&member_rec[8..16], TextMode::Latin1, "dataset name")?;
        let second = record_at(bytes, descriptor_at + 2 * RECORD_LEN, "member record")?;
        let label = header::text(&second[32..72], TextMode::Latin1, "dataset label")?;

        // 3) variables, positions rebuilt from the declared widths
        let namestr_at = locate(bytes, header::NAMESTR, descriptor_at, "namestr header")?;
        let nvars = header::header_number(record_at(bytes, namestr_at, "namestr header")?, 54, 58)
            .ok_or(DecodeError::BadHeader {
                expected: "variable count",
                offset: namestr_at + 54,
            })?;
        let block_start = namestr_at + RECORD_LEN;
        let block_end = block_start + nvars * namestr_len;
        if bytes.len() < block_end {
            return Err(DecodeError::Truncated {
                len: bytes.len(),
                needed: block_end,
            });
        }
        let mut variables = Vec::with_capacity(nvars);
        let mut offset = 0;
        for i in 0..nvars {
            let start = block_start + i * namestr_len;
            let mut var = header::parse_namestr(
                &bytes[start..start + namestr_len],
                i,
                TextMode::Latin1,
            )?;
            var.position = offset;
            offset += var.length;
            variables.push(var);
        }

        // 4) observations
        let obs_at = locate(bytes, header::OBS, block_end, "observation header")?;
        let data = header::first_member(bytes.get(obs_at + RECORD_LEN..).unwrap_or_default());
        let (records, leftover) = header::decode_rows(data, &variables, TextMode::Latin1)?;
        if leftover > 0 {
            warn!(leftover, dataset = %dataset, "ignoring trailing bytes after last observation");
        }

        Ok(ParsedTransport {
            dataset,
            label,
            created,
            variables,
            records,
            decoder: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xport::fixtures::XportFixture;
    use crate::xport::Value;

    #[test]
    fn accepts_vax_namestr_width() {
        let bytes = XportFixture::new("VAXSET")
            .numeric("_STATE", "STATE")
            .character("SEX", "SEX", 1)
            .row(vec![Value::Integer(26), Value::Text("F".into())])
            .namestr_len(136)
            .build();
        let parsed = LenientDecoder.decode(&bytes).expect("decodes");
        assert_eq!(parsed.dataset, "VAXSET");
        assert_eq!(parsed.variables[1].position, 8);
        assert_eq!(
            parsed.records[0].values,
            vec![Value::Integer(26), Value::Text("F".into())]
        );
    }

    #[test]
    fn tolerates_missing_stamp_and_trailing_garbage() {
        let mut bytes = XportFixture::new("D")
            .numeric("X", "")
            .row(vec![Value::Integer(3)])
            .created("??????????????? ")
            .build();
        bytes.extend_from_slice(b"\x01\x02\x03");
        let parsed = LenientDecoder.decode(&bytes).expect("decodes");
        assert!(parsed.created.is_none());
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].values[0], Value::Integer(3));
    }

    #[test]
    fn missing_member_header_is_reported() {
        assert!(matches!(
            LenientDecoder.decode(&[b' '; 400]),
            Err(DecodeError::BadHeader { expected: "member header", .. })
        ));
    }
}
