// src/schema/canonical.rs

//! The versioned canonical variable map.
//!
//! ```yaml
//! version: 3
//! variables:
//!   state_fips: [_state]
//!   general_health: [genhlth, genhlth2]
//! ```
//!
//! Aliases are matched against lowercased, trimmed column names. Earlier
//! aliases outrank later ones when several are present in the same year.

use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};
use thiserror::Error;

/// Output names the normalizer owns.
pub const YEAR: &str = "year";
pub const STATE_FIPS: &str = "state_fips";
pub const COUNTY_FIPS: &str = "county_fips";
/// Fallback state key, looked up in the postal table.
pub const STATE_POSTAL: &str = "state_postal";

#[derive(Debug, Error)]
pub enum CanonicalMapError {
    #[error("reading canonical map {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("canonical map is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("canonical map may not define {0:?}")]
    ReservedTarget(String),
    #[error("alias {alias:?} is listed under both {first:?} and {second:?}")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },
    #[error("canonical map defines no variables")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct RawMap {
    version: u32,
    variables: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct CanonicalMap {
    version: u32,
    /// lowercase alias → (canonical name, rank within its alias list)
    aliases: HashMap<String, (String, usize)>,
    names: Vec<String>,
}

impl CanonicalMap {
    pub fn from_yaml(text: &str) -> Result<Self, CanonicalMapError> {
        let raw: RawMap = serde_yaml::from_str(text)?;
        if raw.variables.is_empty() {
            return Err(CanonicalMapError::Empty);
        }
        let mut aliases: HashMap<String, (String, usize)> = HashMap::new();
        let mut names = Vec::with_capacity(raw.variables.len());
        for (canonical, list) in raw.variables {
            let canonical = canonical.trim().to_lowercase();
            if canonical == YEAR {
                return Err(CanonicalMapError::ReservedTarget(canonical));
            }
            for (rank, alias) in list.iter().enumerate() {
                let alias = alias.trim().to_lowercase();
                if let Some((first, _)) = aliases.get(&alias) {
                    if first != &canonical {
                        return Err(CanonicalMapError::DuplicateAlias {
                            alias,
                            first: first.clone(),
                            second: canonical,
                        });
                    }
                    continue;
                }
                aliases.insert(alias, (canonical.clone(), rank));
            }
            names.push(canonical);
        }
        Ok(Self {
            version: raw.version,
            aliases,
            names,
        })
    }

    pub fn load(path: &Path) -> Result<Self, CanonicalMapError> {
        let text = fs::read_to_string(path).map_err(|source| CanonicalMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Canonical names in sorted order.
    pub fn canonical_names(&self) -> &[String] {
        &self.names
    }

    /// Canonical target and alias rank for a normalized column name.
    pub fn resolve(&self, column: &str) -> Option<(&str, usize)> {
        self.aliases
            .get(column)
            .map(|(canonical, rank)| (canonical.as_str(), *rank))
    }
}
