// src/schema/normalize.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument};

use super::canonical::{CanonicalMap, COUNTY_FIPS, STATE_FIPS, STATE_POSTAL, YEAR};
use super::geo;
use crate::error::Notice;
use crate::xport::{ParsedTransport, Value};

/// Prefix for source columns whose names collide with a normalizer-owned name.
const COLLISION_PREFIX: &str = "src_";

/// One survey response keyed by year and geography. `values` maps the
/// canonical (or passed-through) column name to its cell.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub year: u16,
    pub state_fips: Option<String>,
    pub county_fips: Option<String>,
    pub values: BTreeMap<String, Value>,
}

impl NormalizedRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

#[derive(Debug)]
pub struct NormalizedYear {
    pub year: u16,
    pub records: Vec<NormalizedRecord>,
    /// Value columns in output order (sorted).
    pub columns: Vec<String>,
    pub notices: Vec<Notice>,
}

/// Where each source column lands.
enum Target {
    Value(String),
    StateFips,
    StatePostal,
    CountyFips,
}

struct Plan {
    targets: Vec<Option<Target>>,
    columns: Vec<String>,
    unmapped: Vec<String>,
}

fn plan_columns(parsed: &ParsedTransport, map: &CanonicalMap) -> Plan {
    let names: Vec<String> = parsed
        .column_names()
        .map(|n| n.trim().to_lowercase())
        .collect();

    // 1) per canonical name, the best-ranked alias present (first column wins ties)
    let mut winners: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, name) in names.iter().enumerate() {
        if let Some((canonical, rank)) = map.resolve(name) {
            let entry = winners.entry(canonical).or_insert((rank, idx));
            if rank < entry.0 {
                *entry = (rank, idx);
            }
        }
    }
    let chosen: HashMap<usize, &str> = winners.iter().map(|(c, &(_, idx))| (idx, *c)).collect();

    // 2) claim canonical names before pass-through columns
    let mut taken: BTreeSet<String> = [YEAR, STATE_FIPS, COUNTY_FIPS]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut targets: Vec<Option<Target>> = (0..names.len()).map(|_| None).collect();
    for (&idx, &canonical) in &chosen {
        targets[idx] = Some(match canonical {
            STATE_FIPS => Target::StateFips,
            COUNTY_FIPS => Target::CountyFips,
            STATE_POSTAL => Target::StatePostal,
            other => {
                taken.insert(other.to_string());
                Target::Value(other.to_string())
            }
        });
    }

    // 3) everything else passes through under its own (possibly prefixed) name
    let mut unmapped = Vec::new();
    for (idx, name) in names.iter().enumerate() {
        if targets[idx].is_some() || name.is_empty() {
            continue;
        }
        if map.resolve(name).is_none() {
            unmapped.push(name.clone());
        }
        let mut out = name.clone();
        if taken.contains(&out) {
            out = format!("{COLLISION_PREFIX}{name}");
        }
        if taken.contains(&out) {
            out = format!("{COLLISION_PREFIX}{name}_{idx}");
        }
        taken.insert(out.clone());
        targets[idx] = Some(Target::Value(out));
    }

    let mut columns: Vec<String> = targets
        .iter()
        .filter_map(|t| match t {
            Some(Target::Value(name)) => Some(name.clone()),
            _ => None,
        })
        .collect();
    columns.sort();
    unmapped.sort();
    unmapped.dedup();

    Plan {
        targets,
        columns,
        unmapped,
    }
}

/// Rename, key and stamp every row of one year's transport file.
#[instrument(level = "debug", skip(parsed, map), fields(rows = parsed.records.len()))]
pub fn normalize(parsed: &ParsedTransport, year: u16, map: &CanonicalMap) -> NormalizedYear {
    let plan = plan_columns(parsed, map);

    let records = parsed
        .records
        .iter()
        .map(|raw| {
            let mut state_fips = None;
            let mut postal = None;
            let mut county = None;
            let mut values = BTreeMap::new();
            for (target, value) in plan.targets.iter().zip(&raw.values) {
                match target {
                    Some(Target::Value(name)) => {
                        values.insert(name.clone(), value.clone());
                    }
                    Some(Target::StateFips) => state_fips = geo::state_fips(value),
                    Some(Target::StatePostal) => {
                        postal = value.as_text().and_then(geo::fips_for_postal);
                    }
                    Some(Target::CountyFips) => county = Some(value),
                    None => {}
                }
            }
            let state_fips = state_fips.or_else(|| postal.map(str::to_string));
            let county_fips = match (&state_fips, county) {
                (Some(state), Some(code)) => geo::county_fips(state, code),
                _ => None,
            };
            NormalizedRecord {
                year,
                state_fips,
                county_fips,
                values,
            }
        })
        .collect();

    let mut notices = Vec::new();
    if !plan.unmapped.is_empty() {
        debug!(year, unmapped = plan.unmapped.len(), "columns outside canonical map");
        notices.push(Notice::NormalizationGap {
            year,
            unmapped: plan.unmapped,
        });
    }

    NormalizedYear {
        year,
        records,
        columns: plan.columns,
        notices,
    }
}
