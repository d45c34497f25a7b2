use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::domain::{CanonicalKey, MaterialRecord, SourceId};

/// Per-formula set of canonical space-group symbols observed in the trusted
/// primary source. Secondary candidates must hit one of these to be merged.
#[derive(Debug, Clone, Default)]
pub struct AllowedKeySet {
    entries: HashMap<String, BTreeSet<String>>,
}

impl AllowedKeySet {
    pub fn from_primary<'a>(records: impl IntoIterator<Item = &'a MaterialRecord>) -> Self {
        let mut entries: HashMap<String, BTreeSet<String>> = HashMap::new();
        for record in records {
            let Some(key) = record.canonical_key() else {
                continue;
            };
            entries.entry(key.formula).or_default().insert(key.space_group);
        }
        Self { entries }
    }

    pub fn allows(&self, key: &CanonicalKey) -> bool {
        self.entries
            .get(&key.formula)
            .is_some_and(|groups| groups.contains(&key.space_group))
    }

    pub fn space_groups(&self, formula: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(formula)
    }

    pub fn formulas(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One reconciled output row: the primary record's identity plus every field
/// unioned in from accepted secondary records.
#[derive(Debug, Clone, Serialize)]
pub struct MergedRecord {
    pub identifier: String,
    pub key: CanonicalKey,
    pub elements: BTreeSet<String>,
    pub sources: BTreeSet<SourceId>,
    pub properties: BTreeMap<String, f64>,
    pub cross_refs: BTreeMap<String, Vec<String>>,
    pub dois: Vec<String>,
}

/// Why a secondary candidate did not merge. These are filtering outcomes,
/// not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Merged,
    /// Record has no canonical key (fallback formula or missing space group).
    Unkeyed,
    /// Primary source never saw this formula.
    UnknownFormula,
    /// Formula is known but this space group is not in its allowed set.
    SpaceGroupMismatch,
    /// Same key and same external id already merged; first one won.
    Duplicate,
}

/// Joins records from multiple sources on the canonical key.
#[derive(Debug, Default)]
pub struct Merger {
    allowed: AllowedKeySet,
    merged: BTreeMap<CanonicalKey, MergedRecord>,
    seen: HashSet<(CanonicalKey, String)>,
}

impl Merger {
    /// Seed the merger from the trusted primary source. Records without a
    /// canonical key are kept out of the join but still counted by the
    /// caller's skip log.
    pub fn from_primary(records: &[MaterialRecord]) -> Self {
        let allowed = AllowedKeySet::from_primary(records.iter());
        let mut merger = Self {
            allowed,
            merged: BTreeMap::new(),
            seen: HashSet::new(),
        };
        for record in records {
            let Some(key) = record.canonical_key() else {
                continue;
            };
            merger.seen.insert((key.clone(), record.source_id.clone()));
            merger
                .merged
                .entry(key.clone())
                .and_modify(|existing| union_fields(existing, record))
                .or_insert_with(|| MergedRecord {
                    identifier: record.source_id.clone(),
                    key,
                    elements: record.elements.clone(),
                    sources: BTreeSet::from([record.source]),
                    properties: record.properties.clone(),
                    cross_refs: record.cross_refs.clone(),
                    dois: record.dois.clone(),
                });
        }
        merger
    }

    pub fn allowed_keys(&self) -> &AllowedKeySet {
        &self.allowed
    }

    /// Formulas the primary source vouches for, for secondary-source lookups.
    pub fn allowed_keys_formulas(&self) -> Vec<String> {
        let mut formulas: Vec<String> = self.allowed.formulas().map(str::to_string).collect();
        formulas.sort();
        formulas
    }

    /// Union of one cross-reference list across every merged row, sorted and
    /// deduplicated.
    pub fn known_cross_refs(&self, name: &str) -> Vec<String> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for record in self.merged.values() {
            if let Some(values) = record.cross_refs.get(name) {
                ids.extend(values.iter().cloned());
            }
        }
        ids.into_iter().collect()
    }

    /// Offer one secondary-source candidate. Accepted records are unioned
    /// into the merged row for their canonical key; conflicting field names
    /// are namespaced by source so nothing is silently overwritten.
    pub fn offer(&mut self, record: &MaterialRecord) -> MatchOutcome {
        let Some(key) = record.canonical_key() else {
            return MatchOutcome::Unkeyed;
        };
        if self.allowed.space_groups(&key.formula).is_none() {
            return MatchOutcome::UnknownFormula;
        }
        if !self.allowed.allows(&key) {
            return MatchOutcome::SpaceGroupMismatch;
        }
        if !self.seen.insert((key.clone(), record.source_id.clone())) {
            return MatchOutcome::Duplicate;
        }
        let merged = self
            .merged
            .get_mut(&key)
            .expect("allowed key always has a merged row");
        merged.sources.insert(record.source);
        union_fields(merged, record);
        MatchOutcome::Merged
    }

    pub fn into_records(self) -> Vec<MergedRecord> {
        self.merged.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }
}

fn union_fields(merged: &mut MergedRecord, record: &MaterialRecord) {
    merged.elements.extend(record.elements.iter().cloned());
    for (name, value) in &record.properties {
        match merged.properties.get(name) {
            None => {
                merged.properties.insert(name.clone(), *value);
            }
            Some(existing) if (existing - value).abs() < f64::EPSILON => {}
            Some(_) => {
                merged
                    .properties
                    .insert(format!("{}_{name}", record.source), *value);
            }
        }
    }
    for (name, values) in &record.cross_refs {
        let slot = merged.cross_refs.entry(name.clone()).or_default();
        for value in values {
            if !slot.contains(value) {
                slot.push(value.clone());
            }
        }
        slot.sort();
        slot.dedup();
    }
    for doi in &record.dois {
        if !merged.dois.contains(doi) {
            merged.dois.push(doi.clone());
        }
    }
    merged.dois.sort();
    merged.dois.dedup();
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::canonical::{canonicalize_formula, canonicalize_space_group};

    use super::*;

    fn record(
        source: SourceId,
        id: &str,
        formula: &str,
        space_group: &str,
        properties: &[(&str, f64)],
    ) -> MaterialRecord {
        MaterialRecord {
            source,
            source_id: id.to_string(),
            raw_formula: formula.to_string(),
            formula: canonicalize_formula(formula),
            elements: crate::canonical::elements_from_formula(formula),
            raw_space_group: Some(space_group.to_string()),
            space_group: Some(canonicalize_space_group(space_group)),
            ordering: None,
            properties: properties
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<BTreeMap<_, _>>(),
            cross_refs: BTreeMap::new(),
            dois: Vec::new(),
        }
    }

    #[test]
    fn allowed_key_set_groups_by_formula() {
        let primary = vec![
            record(SourceId::Mp, "mp-1", "Fe2O3", "R-3c", &[]),
            record(SourceId::Mp, "mp-2", "Fe2O3", "Fm-3m", &[]),
            record(SourceId::Mp, "mp-3", "MnSi", "P213", &[]),
        ];
        let allowed = AllowedKeySet::from_primary(primary.iter());
        assert_eq!(allowed.len(), 2);
        let groups = allowed.space_groups("Fe2O3").unwrap();
        assert!(groups.contains("R-3C"));
        assert!(groups.contains("FM-3M"));
    }

    #[test]
    fn space_group_mismatch_is_rejected() {
        let primary = vec![record(SourceId::Mp, "mp-1", "Fe2O3", "R-3c", &[])];
        let mut merger = Merger::from_primary(&primary);

        let accepted = record(SourceId::Nemad, "nm-1", "Fe2O3", "r - 3 c", &[]);
        let rejected = record(SourceId::Nemad, "nm-2", "Fe2O3", "Fm-3m", &[]);
        assert_eq!(merger.offer(&accepted), MatchOutcome::Merged);
        assert_eq!(merger.offer(&rejected), MatchOutcome::SpaceGroupMismatch);
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn unknown_formula_is_rejected() {
        let primary = vec![record(SourceId::Mp, "mp-1", "Fe2O3", "R-3c", &[])];
        let mut merger = Merger::from_primary(&primary);
        let candidate = record(SourceId::Nemad, "nm-1", "MnSi", "P213", &[]);
        assert_eq!(merger.offer(&candidate), MatchOutcome::UnknownFormula);
    }

    #[test]
    fn duplicate_secondary_keeps_first() {
        let primary = vec![record(SourceId::Mp, "mp-1", "Fe2O3", "R-3c", &[])];
        let mut merger = Merger::from_primary(&primary);
        let first = record(SourceId::Nemad, "nm-1", "Fe2O3", "R-3c", &[("curie_temperature", 950.0)]);
        let second = record(SourceId::Nemad, "nm-1", "Fe2O3", "R-3c", &[("curie_temperature", 10.0)]);
        assert_eq!(merger.offer(&first), MatchOutcome::Merged);
        assert_eq!(merger.offer(&second), MatchOutcome::Duplicate);
        let records = merger.into_records();
        assert_eq!(records[0].properties["curie_temperature"], 950.0);
    }

    #[test]
    fn conflicting_fields_are_namespaced() {
        let primary = vec![record(
            SourceId::Mp,
            "mp-1",
            "Fe2O3",
            "R-3c",
            &[("volume", 100.0)],
        )];
        let mut merger = Merger::from_primary(&primary);
        let secondary = record(
            SourceId::Nemad,
            "nm-1",
            "Fe2O3",
            "R-3c",
            &[("volume", 101.5), ("curie_temperature", 950.0)],
        );
        assert_eq!(merger.offer(&secondary), MatchOutcome::Merged);
        let records = merger.into_records();
        assert_eq!(records[0].properties["volume"], 100.0);
        assert_eq!(records[0].properties["nemad_volume"], 101.5);
        assert_eq!(records[0].properties["curie_temperature"], 950.0);
        assert!(records[0].sources.contains(&SourceId::Nemad));
    }

    #[test]
    fn unkeyed_record_is_excluded() {
        let primary = vec![record(SourceId::Mp, "mp-1", "Fe2O3", "R-3c", &[])];
        let mut merger = Merger::from_primary(&primary);
        let mut candidate = record(SourceId::Nemad, "nm-1", "Fe2O3", "R-3c", &[]);
        candidate.space_group = None;
        assert_eq!(merger.offer(&candidate), MatchOutcome::Unkeyed);
    }
}
