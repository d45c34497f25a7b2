use std::collections::HashMap;

use serde_json::Value;

use crate::error::ScreenError;

/// Ordered list of field names a provider may use for one concept across its
/// schema versions. Earlier entries win.
#[derive(Debug, Clone)]
pub struct FieldVariants {
    pub concept: &'static str,
    pub variants: &'static [&'static str],
    pub required: bool,
}

impl FieldVariants {
    pub const fn required(concept: &'static str, variants: &'static [&'static str]) -> Self {
        Self {
            concept,
            variants,
            required: true,
        }
    }

    pub const fn optional(concept: &'static str, variants: &'static [&'static str]) -> Self {
        Self {
            concept,
            variants,
            required: false,
        }
    }
}

/// Which variant a provider actually speaks, probed once per run and reused
/// for every record thereafter.
#[derive(Debug, Clone, Default)]
pub struct VariantCache {
    chosen: HashMap<&'static str, &'static str>,
}

impl VariantCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe which variant the provider accepts by issuing a minimal-field
    /// request per candidate; the first that succeeds is cached. Returns the
    /// cached answer on every later call.
    pub fn detect<F>(
        &mut self,
        field: &FieldVariants,
        mut probe: F,
    ) -> Result<&'static str, ScreenError>
    where
        F: FnMut(&str) -> Result<bool, ScreenError>,
    {
        if let Some(variant) = self.chosen.get(field.concept) {
            return Ok(variant);
        }
        for variant in field.variants {
            if probe(variant)? {
                self.chosen.insert(field.concept, variant);
                return Ok(variant);
            }
        }
        Err(ScreenError::SchemaVariantExhausted(
            field.concept.to_string(),
        ))
    }

    pub fn chosen(&self, concept: &str) -> Option<&'static str> {
        self.chosen.get(concept).copied()
    }
}

/// First present value among the variants, or `None` when the record carries
/// none of them. Presence means the key exists and is not JSON null.
pub fn first_present<'a>(record: &'a Value, field: &FieldVariants) -> Option<&'a Value> {
    for variant in field.variants {
        match lookup_path(record, variant) {
            Some(Value::Null) | None => continue,
            Some(value) => return Some(value),
        }
    }
    None
}

/// Like [`first_present`] but enforces the required flag: a required field
/// with no matching variant is a record-level failure the caller logs and
/// skips.
pub fn extract<'a>(record: &'a Value, field: &FieldVariants) -> Result<Option<&'a Value>, ScreenError> {
    match first_present(record, field) {
        Some(value) => Ok(Some(value)),
        None if field.required => Err(ScreenError::SchemaVariantExhausted(
            field.concept.to_string(),
        )),
        None => Ok(None),
    }
}

/// String form of a field, trimming whitespace and treating empty as absent.
pub fn extract_string(record: &Value, field: &FieldVariants) -> Result<Option<String>, ScreenError> {
    let value = extract(record, field)?;
    Ok(value.and_then(value_to_string))
}

pub fn extract_number(record: &Value, field: &FieldVariants) -> Result<Option<f64>, ScreenError> {
    let value = extract(record, field)?;
    Ok(value.and_then(|v| match v {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }))
}

/// Flatten every `leaf` value found under `list_field[*].sublist[*]`,
/// discarding empty entries, deduplicating, and returning a sorted list.
/// Mirrors how bibliographic references are buried in provider "origin"
/// objects.
pub fn flatten_nested_strings(
    record: &Value,
    list_field: &str,
    sublist: &str,
    leaf: &str,
) -> Vec<String> {
    let mut values = Vec::new();
    let Some(outer) = record.get(list_field).and_then(|v| v.as_array()) else {
        return values;
    };
    for item in outer {
        let Some(inner) = item.get(sublist).and_then(|v| v.as_array()) else {
            continue;
        };
        for entry in inner {
            if let Some(text) = entry.get(leaf).and_then(|v| v.as_str()) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    values.push(trimmed.to_string());
                }
            }
        }
    }
    values.sort();
    values.dedup();
    values
}

/// Collect string items from a list field under any of its name variants,
/// splitting `;`-joined provider values along the way.
pub fn extract_string_list(record: &Value, field: &FieldVariants) -> Vec<String> {
    let Some(value) = first_present(record, field) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    match value {
        Value::Array(entries) => {
            for entry in entries {
                if let Some(text) = value_to_string(entry) {
                    items.push(text);
                }
            }
        }
        Value::String(text) => {
            for part in text.split(';') {
                let trimmed = part.trim();
                if !trimmed.is_empty() {
                    items.push(trimmed.to_string());
                }
            }
        }
        other => {
            if let Some(text) = value_to_string(other) {
                items.push(text);
            }
        }
    }
    items.sort();
    items.dedup();
    items
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Dotted paths address nested objects, e.g. `symmetry.symbol`.
fn lookup_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}
