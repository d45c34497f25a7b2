use std::collections::BTreeMap;
use std::collections::BTreeSet;

use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Outcome of formula canonicalization. `Reduced` is the minimal-ratio,
/// alphabetically ordered form; `Fallback` is a whitespace-collapsed copy of
/// an input we could not parse, kept for reporting but excluded from
/// cross-source matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalFormula {
    Reduced(String),
    Fallback(String),
}

impl CanonicalFormula {
    pub fn as_str(&self) -> &str {
        match self {
            CanonicalFormula::Reduced(value) | CanonicalFormula::Fallback(value) => value,
        }
    }

    pub fn is_reduced(&self) -> bool {
        matches!(self, CanonicalFormula::Reduced(_))
    }
}

impl Serialize for CanonicalFormula {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Reduce a formula string to its minimal-ratio, alphabetically ordered form.
/// Total over any input: unparseable strings fall back to a
/// whitespace-collapsed copy tagged [`CanonicalFormula::Fallback`].
pub fn canonicalize_formula(raw: &str) -> CanonicalFormula {
    match parse_composition(raw) {
        Some(composition) if !composition.is_empty() => {
            CanonicalFormula::Reduced(serialize_composition(&reduce_composition(composition)))
        }
        _ => CanonicalFormula::Fallback(collapse_whitespace(raw)),
    }
}

/// Element→count map for a formula, tolerating embedded whitespace and
/// decimal counts. Repeated element tokens accumulate. Returns `None` when
/// any part of the string does not fit the element-count grammar.
pub fn parse_composition(raw: &str) -> Option<BTreeMap<String, f64>> {
    let compact: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let token = Regex::new(r"^([A-Z][a-z]?)(\d+\.?\d*|\.\d+)?").unwrap();
    let mut rest = compact.as_str();
    let mut composition: BTreeMap<String, f64> = BTreeMap::new();
    while !rest.is_empty() {
        let captures = token.captures(rest)?;
        let element = captures.get(1)?.as_str().to_string();
        let count = match captures.get(2) {
            Some(m) => m.as_str().parse::<f64>().ok()?,
            None => 1.0,
        };
        if count <= 0.0 {
            return None;
        }
        *composition.entry(element).or_insert(0.0) += count;
        rest = &rest[captures.get(0)?.end()..];
    }
    Some(composition)
}

/// Constituent element symbols of a formula. Falls back to a naive
/// capital-letter scan when the full grammar does not apply.
pub fn elements_from_formula(raw: &str) -> BTreeSet<String> {
    if let Some(composition) = parse_composition(raw) {
        return composition.into_keys().collect();
    }
    let symbol = Regex::new(r"[A-Z][a-z]?").unwrap();
    symbol
        .find_iter(raw)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Divide all counts by their greatest common ratio. Decimal counts are
/// scaled to integers first, so the reduced counts are always whole.
fn reduce_composition(composition: BTreeMap<String, f64>) -> BTreeMap<String, u64> {
    let scale = composition
        .values()
        .map(|count| decimal_places(*count))
        .max()
        .unwrap_or(0);
    let factor = 10u64.pow(scale.min(6));
    let scaled: BTreeMap<String, u64> = composition
        .into_iter()
        .map(|(element, count)| (element, (count * factor as f64).round() as u64))
        .collect();
    let divisor = scaled.values().copied().fold(0, gcd).max(1);
    scaled
        .into_iter()
        .map(|(element, count)| (element, count / divisor))
        .collect()
}

fn serialize_composition(composition: &BTreeMap<String, u64>) -> String {
    let mut out = String::new();
    for (element, count) in composition {
        out.push_str(element);
        if *count != 1 {
            out.push_str(&count.to_string());
        }
    }
    out
}

fn decimal_places(value: f64) -> u32 {
    let mut scaled = value;
    for places in 0..=6 {
        if (scaled - scaled.round()).abs() < 1e-9 {
            return places;
        }
        scaled *= 10.0;
    }
    6
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

const DASH_GLYPHS: [char; 10] = [
    '\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2015}', '\u{2212}', '\u{FE58}',
    '\u{FE63}', '\u{FF0D}',
];

/// Normalize a space-group symbol: fold every unicode dash glyph to the ASCII
/// hyphen, drop interior whitespace and dots, strip a trailing parenthetical
/// spacegroup-index suffix, collapse repeated hyphens, uppercase. Idempotent.
pub fn canonicalize_space_group(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .map(|ch| if DASH_GLYPHS.contains(&ch) { '-' } else { ch })
        .collect();
    let compact: String = folded
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '.')
        .collect();
    let suffix = Regex::new(r"\(\d+\)$").unwrap();
    let stripped = suffix.replace(&compact, "");
    let mut collapsed = String::with_capacity(stripped.len());
    let mut last_was_hyphen = false;
    for ch in stripped.chars() {
        if ch == '-' {
            if last_was_hyphen {
                continue;
            }
            last_was_hyphen = true;
        } else {
            last_was_hyphen = false;
        }
        collapsed.push(ch);
    }
    collapsed.to_uppercase()
}

/// Candidate field names a provider may use for the space-group symbol, in
/// preference order.
const SPACE_GROUP_FIELDS: [&str; 5] = [
    "spacegroup",
    "space_group",
    "spacegroup_symbol",
    "Crystal_Structure",
    "symbol",
];

/// Pull a raw space-group token out of a record that does not label one
/// canonical field. Tries the known candidate names first, then scans all
/// string-valued fields for something that looks like a space-group symbol.
pub fn extract_space_group(record: &Value) -> Option<String> {
    for field in SPACE_GROUP_FIELDS {
        if let Some(value) = record.get(field).and_then(|v| v.as_str()) {
            if !value.trim().is_empty() {
                return Some(truncate_token(value));
            }
        }
    }
    if let Some(value) = record
        .get("symmetry")
        .and_then(|v| v.get("symbol"))
        .and_then(|v| v.as_str())
    {
        if !value.trim().is_empty() {
            return Some(truncate_token(value));
        }
    }
    let object = record.as_object()?;
    for value in object.values() {
        if let Some(text) = value.as_str() {
            if looks_like_space_group(text) {
                return Some(truncate_token(text));
            }
        }
    }
    None
}

fn looks_like_space_group(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.len() > 32 {
        return false;
    }
    trimmed.chars().any(|ch| ch.is_ascii_digit())
        && trimmed.chars().any(|ch| ch.is_ascii_alphabetic())
        && trimmed.chars().any(|ch| ch == '-' || DASH_GLYPHS.contains(&ch))
}

/// Candidate token is whatever precedes the first parenthesis, colon, or
/// separator keyword.
fn truncate_token(text: &str) -> String {
    let mut token = text;
    for separator in ['(', ':', ';', ','] {
        if let Some(index) = token.find(separator) {
            token = &token[..index];
        }
    }
    if let Some(index) = token.find(" in ") {
        token = &token[..index];
    }
    token.trim().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn formula_reduction() {
        assert_eq!(canonicalize_formula("Fe2O3").as_str(), "Fe2O3");
        assert_eq!(canonicalize_formula("Fe4O6").as_str(), "Fe2O3");
        assert_eq!(canonicalize_formula("O3 Fe2").as_str(), "Fe2O3");
        assert_eq!(canonicalize_formula("Mn Fe2 O4").as_str(), "Fe2MnO4");
    }

    #[test]
    fn formula_decimal_counts() {
        assert_eq!(canonicalize_formula("Fe0.5O1.5").as_str(), "FeO3");
        assert_eq!(canonicalize_formula("Mn0.25Fe0.75").as_str(), "Fe3Mn");
    }

    #[test]
    fn formula_idempotent() {
        let once = canonicalize_formula("Fe2 O3");
        let twice = canonicalize_formula(once.as_str());
        assert_eq!(once.as_str(), twice.as_str());
        assert!(twice.is_reduced());
    }

    #[test]
    fn formula_fallback_is_tagged() {
        let fallback = canonicalize_formula("not  a\tformula!");
        assert!(!fallback.is_reduced());
        assert_eq!(fallback.as_str(), "not a formula!");
    }

    #[test]
    fn space_group_invariance() {
        assert_eq!(canonicalize_space_group("Fm-3m"), "FM-3M");
        assert_eq!(canonicalize_space_group(" f m \u{2212} 3 m "), "FM-3M");
        assert_eq!(canonicalize_space_group("FM-3M (225)"), "FM-3M");
        assert_eq!(canonicalize_space_group("Fm--3m"), "FM-3M");
        assert_eq!(canonicalize_space_group("P 63/m m c"), "P63/MMC");
    }

    #[test]
    fn space_group_idempotent() {
        let once = canonicalize_space_group("R \u{2013} 3 c (167)");
        assert_eq!(once, "R-3C");
        assert_eq!(canonicalize_space_group(&once), once);
    }

    #[test]
    fn space_group_extraction_prefers_labeled_fields() {
        let record = json!({
            "spacegroup": "Fm-3m",
            "comment": "some R-3c note",
        });
        assert_eq!(extract_space_group(&record).as_deref(), Some("Fm-3m"));
    }

    #[test]
    fn space_group_extraction_heuristic_scan() {
        let record = json!({
            "Material_Name": "Fe2O3",
            "Crystal_Structure_Info": "R-3c (167): rhombohedral",
        });
        assert_eq!(extract_space_group(&record).as_deref(), Some("R-3c"));
    }

    #[test]
    fn elements_from_raw_formula() {
        let elements = elements_from_formula("Fe2 O3");
        assert!(elements.contains("Fe"));
        assert!(elements.contains("O"));
        assert_eq!(elements.len(), 2);
    }
}
