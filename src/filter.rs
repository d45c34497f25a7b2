use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::MaterialRecord;

/// One end of a numeric threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub value: f64,
    #[serde(default)]
    pub inclusive: bool,
}

impl Bound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    pub fn exclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// Threshold on one numeric property. A record that does not carry the
/// property fails the predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPredicate {
    pub property: String,
    #[serde(default)]
    pub lower: Option<Bound>,
    #[serde(default)]
    pub upper: Option<Bound>,
}

impl ThresholdPredicate {
    pub fn holds(&self, record: &MaterialRecord) -> bool {
        let Some(value) = record.property(&self.property) else {
            return false;
        };
        if let Some(lower) = self.lower {
            let ok = if lower.inclusive {
                value >= lower.value
            } else {
                value > lower.value
            };
            if !ok {
                return false;
            }
        }
        if let Some(upper) = self.upper {
            let ok = if upper.inclusive {
                value <= upper.value
            } else {
                value < upper.value
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Why a record was dropped, for skip-and-log reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Accepted,
    NoAllowedElement,
    BannedElement(String),
    Threshold(String),
    Ordering(String),
}

/// Ordered conjunction of the screening predicates: allow-list membership,
/// then ban-list exclusion, then numeric thresholds, then the optional
/// magnetic-ordering equality. Ban dominates allow: a record matching both
/// lists is excluded.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    pub allow: BTreeSet<String>,
    pub ban: BTreeSet<String>,
    pub thresholds: Vec<ThresholdPredicate>,
    pub ordering: Option<String>,
}

impl FilterSet {
    pub fn evaluate(&self, record: &MaterialRecord) -> FilterVerdict {
        if !self.allow.is_empty()
            && !record
                .elements
                .iter()
                .any(|element| self.allow.contains(element))
        {
            return FilterVerdict::NoAllowedElement;
        }
        if let Some(banned) = record
            .elements
            .iter()
            .find(|element| self.ban.contains(*element))
        {
            return FilterVerdict::BannedElement(banned.clone());
        }
        for predicate in &self.thresholds {
            if !predicate.holds(record) {
                return FilterVerdict::Threshold(predicate.property.clone());
            }
        }
        if let Some(wanted) = &self.ordering {
            if record.ordering.as_deref() != Some(wanted.as_str()) {
                return FilterVerdict::Ordering(record.ordering.clone().unwrap_or_default());
            }
        }
        FilterVerdict::Accepted
    }

    pub fn accepts(&self, record: &MaterialRecord) -> bool {
        self.evaluate(record) == FilterVerdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use crate::canonical::canonicalize_formula;
    use crate::domain::SourceId;

    use super::*;

    fn record(elements: &[&str], properties: &[(&str, f64)]) -> MaterialRecord {
        MaterialRecord {
            source: SourceId::Mp,
            source_id: "mp-1".to_string(),
            raw_formula: elements.join(""),
            formula: canonicalize_formula(&elements.join("")),
            elements: elements.iter().map(|e| e.to_string()).collect(),
            raw_space_group: None,
            space_group: None,
            ordering: None,
            properties: properties
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<BTreeMap<_, _>>(),
            cross_refs: BTreeMap::new(),
            dois: Vec::new(),
        }
    }

    fn filters(allow: &[&str], ban: &[&str]) -> FilterSet {
        FilterSet {
            allow: allow.iter().map(|e| e.to_string()).collect::<BTreeSet<_>>(),
            ban: ban.iter().map(|e| e.to_string()).collect::<BTreeSet<_>>(),
            thresholds: Vec::new(),
            ordering: None,
        }
    }

    #[test]
    fn ban_dominates_allow() {
        let set = filters(&["Fe"], &["Pb"]);
        let verdict = set.evaluate(&record(&["Fe", "Pb"], &[]));
        assert_eq!(verdict, FilterVerdict::BannedElement("Pb".to_string()));
    }

    #[test]
    fn allow_then_clean_ban_passes() {
        let set = filters(&["Fe"], &["Pb"]);
        assert!(set.accepts(&record(&["Fe", "O"], &[])));
    }

    #[test]
    fn no_allowed_element_rejected() {
        let set = filters(&["Fe"], &["Pb"]);
        let verdict = set.evaluate(&record(&["Cu", "O"], &[]));
        assert_eq!(verdict, FilterVerdict::NoAllowedElement);
    }

    #[test]
    fn threshold_bounds() {
        let mut set = filters(&[], &[]);
        set.thresholds.push(ThresholdPredicate {
            property: "formation_energy_per_atom".to_string(),
            lower: None,
            upper: Some(Bound::exclusive(0.0)),
        });
        assert!(set.accepts(&record(&["Fe"], &[("formation_energy_per_atom", -0.5)])));
        assert!(!set.accepts(&record(&["Fe"], &[("formation_energy_per_atom", 0.0)])));
    }

    #[test]
    fn missing_property_fails_threshold() {
        let mut set = filters(&[], &[]);
        set.thresholds.push(ThresholdPredicate {
            property: "total_magnetization".to_string(),
            lower: Some(Bound::exclusive(0.0)),
            upper: None,
        });
        let verdict = set.evaluate(&record(&["Fe"], &[]));
        assert_eq!(
            verdict,
            FilterVerdict::Threshold("total_magnetization".to_string())
        );
    }

    #[test]
    fn inclusive_lower_bound() {
        let mut set = filters(&[], &[]);
        set.thresholds.push(ThresholdPredicate {
            property: "num_unique_magnetic_sites".to_string(),
            lower: Some(Bound::inclusive(2.0)),
            upper: None,
        });
        assert!(set.accepts(&record(&["Fe"], &[("num_unique_magnetic_sites", 2.0)])));
        assert!(!set.accepts(&record(&["Fe"], &[("num_unique_magnetic_sites", 1.0)])));
    }
}
