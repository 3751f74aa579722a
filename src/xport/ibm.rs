// src/xport/ibm.rs

//! IBM System/360 hexadecimal floating point, the numeric encoding of XPORT v5.
//!
//! A value is a sign bit, a 7-bit base-16 exponent biased by 64 and a 56-bit
//! fraction. Stored widths of 2..=8 bytes drop low-order fraction bytes.

/// Missing-value sentinels occupy the first byte with every other byte zero.
fn is_missing_tag(b: u8) -> bool {
    b == b'.' || b == b'_' || b.is_ascii_uppercase()
}

/// Decode a stored numeric; `None` means a SAS missing value (`.`, `._`, `.A`–`.Z`).
pub fn decode(raw: &[u8]) -> Option<f64> {
    let mut buf = [0u8; 8];
    let width = raw.len().min(8);
    buf[..width].copy_from_slice(&raw[..width]);

    if buf[1..].iter().all(|&b| b == 0) {
        if buf[0] == 0 {
            return Some(0.0);
        }
        if is_missing_tag(buf[0]) {
            return None;
        }
    }

    let sign = if buf[0] & 0x80 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from(buf[0] & 0x7f) - 64;
    let fraction = buf[1..]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

    let value = sign * (fraction as f64 / 2f64.powi(56)) * 16f64.powi(exponent);
    // collapse -0.0 so identical inputs always print identically
    Some(if value == 0.0 { 0.0 } else { value })
}

/// Encode `value` as an 8-byte IBM float. Only fixtures need the writer side.
#[cfg(test)]
pub(crate) fn encode(value: f64) -> [u8; 8] {
    if value == 0.0 {
        return [0u8; 8];
    }
    let sign = if value < 0.0 { 0x80u8 } else { 0 };
    let mut frac = value.abs();
    let mut exponent = 0i32;
    while frac >= 1.0 {
        frac /= 16.0;
        exponent += 1;
    }
    while frac < 1.0 / 16.0 {
        frac *= 16.0;
        exponent -= 1;
    }
    let fraction = (frac * 2f64.powi(56)) as u64;
    let mut out = [0u8; 8];
    out[0] = sign | (((exponent + 64) as u8) & 0x7f);
    for (i, byte) in out[1..].iter_mut().enumerate() {
        *byte = (fraction >> (8 * (6 - i))) as u8;
    }
    out
}

/// The standard `.` missing value.
#[cfg(test)]
pub(crate) const MISSING: [u8; 8] = [b'.', 0, 0, 0, 0, 0, 0, 0];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_bit_patterns() {
        // 1.0 = 0x41 10 00 00 00 00 00 00
        assert_eq!(decode(&[0x41, 0x10, 0, 0, 0, 0, 0, 0]), Some(1.0));
        // -118.625 = 0xC2 76 A0 00 00 00 00 00
        assert_eq!(decode(&[0xC2, 0x76, 0xA0, 0, 0, 0, 0, 0]), Some(-118.625));
        assert_eq!(decode(&[0u8; 8]), Some(0.0));
    }

    #[test]
    fn sentinels_are_missing() {
        assert_eq!(decode(&MISSING), None);
        assert_eq!(decode(&[b'_', 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(decode(&[b'Z', 0, 0, 0, 0, 0, 0, 0]), None);
        // a tag byte followed by fraction bits is an ordinary number
        assert!(decode(&[b'A', 0x10, 0, 0, 0, 0, 0, 0]).is_some());
    }

    #[test]
    fn short_widths_are_zero_extended() {
        let full = encode(26.0);
        assert_eq!(decode(&full[..3]), Some(26.0));
        assert_eq!(decode(&[b'.', 0]), None);
    }

    #[test]
    fn encoder_agrees_with_decoder_on_survey_values() {
        for v in [1.0, 26.0, 39.0, 777.0, 0.25, -3.5, 1234.5678, 88.0] {
            assert_eq!(decode(&encode(v)), Some(v), "value {v}");
        }
    }
}
