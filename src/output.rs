use std::collections::BTreeSet;

use camino::Utf8Path;

use crate::error::ScreenError;
use crate::matcher::MergedRecord;

/// Write the reconciled record set as CSV. Property columns are the sorted
/// union of property names across all records so that every merged field,
/// including source-namespaced conflict columns, gets its own column. The
/// file is written through a temp sibling and persisted into place.
pub fn write_records_csv(path: &Utf8Path, records: &[MergedRecord]) -> Result<(), ScreenError> {
    let property_columns: BTreeSet<String> = records
        .iter()
        .flat_map(|record| record.properties.keys().cloned())
        .collect();
    let cross_ref_columns: BTreeSet<String> = records
        .iter()
        .flat_map(|record| record.cross_refs.keys().cloned())
        .collect();

    let parent = path
        .parent()
        .ok_or_else(|| ScreenError::Filesystem("invalid output path".to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("magscreen")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| ScreenError::Filesystem(err.to_string()))?;
    let mut writer = csv::Writer::from_writer(temp);

    let mut header = vec![
        "ID".to_string(),
        "formula".to_string(),
        "spacegroup".to_string(),
        "species".to_string(),
        "sources".to_string(),
    ];
    header.extend(property_columns.iter().cloned());
    header.extend(cross_ref_columns.iter().cloned());
    header.push("doi".to_string());
    writer
        .write_record(&header)
        .map_err(|err| ScreenError::Output(err.to_string()))?;

    for record in records {
        let mut row = vec![
            record.identifier.clone(),
            record.key.formula.clone(),
            record.key.space_group.clone(),
            record
                .elements
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(";"),
            record
                .sources
                .iter()
                .map(|source| source.to_string())
                .collect::<Vec<_>>()
                .join(";"),
        ];
        for column in &property_columns {
            row.push(
                record
                    .properties
                    .get(column)
                    .map(|value| value.to_string())
                    .unwrap_or_default(),
            );
        }
        for column in &cross_ref_columns {
            row.push(
                record
                    .cross_refs
                    .get(column)
                    .map(|values| values.join(";"))
                    .unwrap_or_default(),
            );
        }
        row.push(record.dois.join(";"));
        writer
            .write_record(&row)
            .map_err(|err| ScreenError::Output(err.to_string()))?;
    }
    let temp = writer
        .into_inner()
        .map_err(|err| ScreenError::Output(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| ScreenError::Filesystem(err.to_string()))?;
    Ok(())
}
