use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalFormula;
use crate::error::ScreenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Mp,
    Nemad,
    Icsd,
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Mp => write!(f, "mp"),
            SourceId::Nemad => write!(f, "nemad"),
            SourceId::Icsd => write!(f, "icsd"),
        }
    }
}

impl FromStr for SourceId {
    type Err = ScreenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "mp" => Ok(SourceId::Mp),
            "nemad" => Ok(SourceId::Nemad),
            "icsd" => Ok(SourceId::Icsd),
            _ => Err(ScreenError::InvalidSource(value.to_string())),
        }
    }
}

/// Property databases exposed by the NEMAD-style service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Magnetic,
    MagneticAnisotropy,
    Thermoelectric,
    Superconductor,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Magnetic => "magnetic",
            DatabaseType::MagneticAnisotropy => "magnetic_anisotropy",
            DatabaseType::Thermoelectric => "thermoelectric",
            DatabaseType::Superconductor => "superconductor",
        }
    }
}

impl FromStr for DatabaseType {
    type Err = ScreenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "magnetic" => Ok(DatabaseType::Magnetic),
            "magnetic_anisotropy" => Ok(DatabaseType::MagneticAnisotropy),
            "thermoelectric" => Ok(DatabaseType::Thermoelectric),
            "superconductor" => Ok(DatabaseType::Superconductor),
            _ => Err(ScreenError::InvalidDatabaseType(value.to_string())),
        }
    }
}

/// A validated chemical element symbol: one uppercase ASCII letter optionally
/// followed by one lowercase letter.
pub fn parse_element_symbol(value: &str) -> Result<String, ScreenError> {
    let trimmed = value.trim();
    let mut chars = trimmed.chars();
    let valid = match (chars.next(), chars.next(), chars.next()) {
        (Some(first), None, _) => first.is_ascii_uppercase(),
        (Some(first), Some(second), None) => {
            first.is_ascii_uppercase() && second.is_ascii_lowercase()
        }
        _ => false,
    };
    if !valid {
        return Err(ScreenError::InvalidElementSymbol(value.to_string()));
    }
    Ok(trimmed.to_string())
}

/// One source-specific request.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Ids(Vec<String>),
    Elements {
        include: Vec<String>,
        exclude: Vec<String>,
        exact: bool,
    },
    Formula(String),
}

/// Cross-source join key. Pure function of the raw formula and space-group
/// strings: equal keys mean "same material".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CanonicalKey {
    pub formula: String,
    pub space_group: String,
}

impl CanonicalKey {
    pub fn new(formula: impl Into<String>, space_group: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            space_group: space_group.into(),
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.formula, self.space_group)
    }
}

/// One normalized record. Populated solely by the schema normalizer and the
/// canonicalizer; nothing downstream needs to know the provider's raw shape.
#[derive(Debug, Clone, Serialize)]
pub struct MaterialRecord {
    pub source: SourceId,
    pub source_id: String,
    pub raw_formula: String,
    pub formula: CanonicalFormula,
    pub elements: BTreeSet<String>,
    pub raw_space_group: Option<String>,
    pub space_group: Option<String>,
    /// Magnetic ordering label as reported by the source (e.g. "FM").
    pub ordering: Option<String>,
    pub properties: BTreeMap<String, f64>,
    pub cross_refs: BTreeMap<String, Vec<String>>,
    pub dois: Vec<String>,
}

impl MaterialRecord {
    /// Join key, available only for records that both canonicalized cleanly
    /// and carry a space group. Fallback-canonicalized records are excluded
    /// from matching.
    pub fn canonical_key(&self) -> Option<CanonicalKey> {
        if !self.formula.is_reduced() {
            return None;
        }
        let space_group = self.space_group.as_deref()?;
        Some(CanonicalKey::new(self.formula.as_str(), space_group))
    }

    pub fn property(&self, name: &str) -> Option<f64> {
        self.properties.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_source_id() {
        assert_eq!("mp".parse::<SourceId>().unwrap(), SourceId::Mp);
        assert_eq!(" NEMAD ".parse::<SourceId>().unwrap(), SourceId::Nemad);
        let err = "aflow".parse::<SourceId>().unwrap_err();
        assert_matches!(err, ScreenError::InvalidSource(_));
    }

    #[test]
    fn parse_element_symbols() {
        assert_eq!(parse_element_symbol("Fe").unwrap(), "Fe");
        assert_eq!(parse_element_symbol(" O ").unwrap(), "O");
        assert_matches!(
            parse_element_symbol("fe").unwrap_err(),
            ScreenError::InvalidElementSymbol(_)
        );
        assert_matches!(
            parse_element_symbol("FeO").unwrap_err(),
            ScreenError::InvalidElementSymbol(_)
        );
    }

    #[test]
    fn database_type_round_trip() {
        let db: DatabaseType = "magnetic_anisotropy".parse().unwrap();
        assert_eq!(db.as_str(), "magnetic_anisotropy");
    }
}
