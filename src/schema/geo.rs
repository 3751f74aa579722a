// src/schema/geo.rs

//! State postal codes, FIPS codes and the county-code rules of the survey.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use crate::xport::Value;

static STATES: &[(&str, &str)] = &[
    ("AL", "01"),
    ("AK", "02"),
    ("AZ", "04"),
    ("AR", "05"),
    ("CA", "06"),
    ("CO", "08"),
    ("CT", "09"),
    ("DE", "10"),
    ("DC", "11"),
    ("FL", "12"),
    ("GA", "13"),
    ("HI", "15"),
    ("ID", "16"),
    ("IL", "17"),
    ("IN", "18"),
    ("IA", "19"),
    ("KS", "20"),
    ("KY", "21"),
    ("LA", "22"),
    ("ME", "23"),
    ("MD", "24"),
    ("MA", "25"),
    ("MI", "26"),
    ("MN", "27"),
    ("MS", "28"),
    ("MO", "29"),
    ("MT", "30"),
    ("NE", "31"),
    ("NV", "32"),
    ("NH", "33"),
    ("NJ", "34"),
    ("NM", "35"),
    ("NY", "36"),
    ("NC", "37"),
    ("ND", "38"),
    ("OH", "39"),
    ("OK", "40"),
    ("OR", "41"),
    ("PA", "42"),
    ("RI", "44"),
    ("SC", "45"),
    ("SD", "46"),
    ("TN", "47"),
    ("TX", "48"),
    ("UT", "49"),
    ("VT", "50"),
    ("VA", "51"),
    ("WA", "53"),
    ("WV", "54"),
    ("WI", "55"),
    ("WY", "56"),
    ("AS", "60"),
    ("GU", "66"),
    ("MP", "69"),
    ("PR", "72"),
    ("VI", "78"),
];

static BY_POSTAL: Lazy<BTreeMap<&'static str, &'static str>> =
    Lazy::new(|| STATES.iter().copied().collect());

static BY_FIPS: Lazy<BTreeMap<&'static str, &'static str>> =
    Lazy::new(|| STATES.iter().map(|&(p, f)| (f, p)).collect());

/// County codes meaning "don't know", "refused" or "not asked".
const UNKNOWN_COUNTY: [i64; 3] = [0, 777, 999];

pub fn fips_for_postal(postal: &str) -> Option<&'static str> {
    BY_POSTAL
        .get(postal.trim().to_ascii_uppercase().as_str())
        .copied()
}

pub fn postal_for_fips(fips: &str) -> Option<&'static str> {
    BY_FIPS.get(fips).copied()
}

/// Accept either a postal code (`MI`) or a FIPS code (`26`, `026`) and
/// return the postal code.
pub fn parse_state(code: &str) -> Option<&'static str> {
    let code = code.trim();
    if let Ok(n) = code.parse::<u8>() {
        return postal_for_fips(&format!("{n:02}"));
    }
    let upper = code.to_ascii_uppercase();
    BY_POSTAL.get_key_value(upper.as_str()).map(|(k, _)| *k)
}

/// Two-digit state FIPS from a numeric or digit-text cell. Codes outside
/// 1..=78 are treated as absent.
pub fn state_fips(value: &Value) -> Option<String> {
    let code = value.as_i64()?;
    (1..=78).contains(&code).then(|| format!("{code:02}"))
}

/// Five-digit county FIPS (state + 3-digit county), or `None` when the
/// county code is one of the unknown/refused sentinels or out of range.
pub fn county_fips(state: &str, value: &Value) -> Option<String> {
    let code = value.as_i64()?;
    if UNKNOWN_COUNTY.contains(&code) || !(1..=998).contains(&code) {
        return None;
    }
    Some(format!("{state}{code:03}"))
}
