use std::collections::BTreeSet;
use std::fs;

use camino::Utf8Path;

use crate::error::ScreenError;

/// One row of the join seed: a known material identifier with its formula
/// and, when the campaign is space-group constrained, its space group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRow {
    pub id: String,
    pub formula: String,
    pub space_group: Option<String>,
}

/// Column name variants accepted for the formula, in preference order.
const FORMULA_COLUMNS: [&str; 3] = ["compound", "pretty_formula", "formula"];
const SPACE_GROUP_COLUMNS: [&str; 2] = ["spacegroup", "space_group"];

/// Read the seed table. Requires an `ID` column and one of the formula
/// column variants; rows with a blank id or formula are skipped.
pub fn read_seed_table(path: &Utf8Path) -> Result<Vec<SeedRow>, ScreenError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())
        .map_err(|err| ScreenError::SeedRead(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| ScreenError::SeedRead(err.to_string()))?
        .clone();

    let id_index = column_index(&headers, &["ID", "id"])
        .ok_or_else(|| ScreenError::SeedColumn("ID".to_string()))?;
    let formula_index = column_index(&headers, &FORMULA_COLUMNS)
        .ok_or_else(|| ScreenError::SeedColumn("compound/pretty_formula".to_string()))?;
    let space_group_index = column_index(&headers, &SPACE_GROUP_COLUMNS);

    let mut rows = Vec::new();
    let mut seen = BTreeSet::new();
    for result in reader.records() {
        let record = result.map_err(|err| ScreenError::SeedRead(err.to_string()))?;
        let id = record.get(id_index).unwrap_or("").trim().to_string();
        let formula = record.get(formula_index).unwrap_or("").trim().to_string();
        if id.is_empty() || formula.is_empty() {
            continue;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let space_group = space_group_index
            .and_then(|index| record.get(index))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        rows.push(SeedRow {
            id,
            formula,
            space_group,
        });
    }
    Ok(rows)
}

fn column_index(headers: &csv::StringRecord, candidates: &[&str]) -> Option<usize> {
    for candidate in candidates {
        if let Some(index) = headers.iter().position(|header| header.trim() == *candidate) {
            return Some(index);
        }
    }
    None
}

/// Collect every value from the first matching column, splitting `;`-joined
/// cells. Used to pull the structure-database id column out of a previous
/// run's data table.
pub fn read_table_column(path: &Utf8Path, candidates: &[&str]) -> Result<Vec<String>, ScreenError> {
    let mut reader = csv::Reader::from_path(path.as_std_path())
        .map_err(|err| ScreenError::SeedRead(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| ScreenError::SeedRead(err.to_string()))?
        .clone();
    let index = column_index(&headers, candidates)
        .ok_or_else(|| ScreenError::SeedColumn(candidates.join("/")))?;

    let mut values = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|err| ScreenError::SeedRead(err.to_string()))?;
        let Some(cell) = record.get(index) else {
            continue;
        };
        for part in cell.split(';') {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                values.push(trimmed.to_string());
            }
        }
    }
    values.sort();
    values.dedup();
    Ok(values)
}

/// Write the identifier-list handoff file: one id per line, deduplicated and
/// sorted, with a trailing newline when non-empty.
pub fn write_id_list(path: &Utf8Path, ids: impl IntoIterator<Item = String>) -> Result<(), ScreenError> {
    let unique: BTreeSet<String> = ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    let mut content = unique.into_iter().collect::<Vec<_>>().join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(path.as_std_path(), content).map_err(|err| ScreenError::Filesystem(err.to_string()))
}

/// Read an identifier-list file back, ignoring blank lines.
pub fn read_id_list(path: &Utf8Path) -> Result<Vec<String>, ScreenError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ScreenError::Filesystem(err.to_string()))?;
    let mut seen = BTreeSet::new();
    let mut ids = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            ids.push(trimmed.to_string());
        }
    }
    Ok(ids)
}
