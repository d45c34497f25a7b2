use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::warn;

use crate::canonical::{canonicalize_formula, canonicalize_space_group, elements_from_formula};
use crate::domain::{MaterialRecord, SourceId};
use crate::error::ScreenError;
use crate::schema::{self, FieldVariants};

pub const ENTRY_ID: FieldVariants =
    FieldVariants::required("entry_id", &["idnum", "coll_code", "id"]);
pub const SUM_FORMULA: FieldVariants =
    FieldVariants::required("sum_formula", &["sum_form", "struct_form", "formula"]);
pub const SPACE_GROUP: FieldVariants =
    FieldVariants::optional("space_group", &["sgr_disp", "sgr", "space_group"]);
pub const CELL_VOLUME: FieldVariants =
    FieldVariants::optional("cell_volume", &["c_vol", "cell_volume"]);
pub const SPACE_GROUP_NUMBER: FieldVariants =
    FieldVariants::optional("space_group_number", &["sgr_num"]);

pub const ENTRY_REQUEST_FIELDS: [&str; 6] =
    ["idnum", "coll_code", "sum_form", "sgr_disp", "sgr_num", "c_vol"];

/// Relational structure database adapter. The database itself only speaks
/// SQL inside the campus network; harvesting goes through an HTTP gateway
/// that exposes entry rows by collection-code list.
pub trait IcsdClient: Send + Sync {
    /// Fetch entry rows for an explicit id list, requesting only `fields`.
    /// Gateway-side pagination is exhausted before returning.
    fn fetch_entries(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError>;
}

#[derive(Clone)]
pub struct IcsdHttpClient {
    client: Client,
    base_url: String,
    page_size: usize,
}

impl IcsdHttpClient {
    pub fn new(base_url: String) -> Result<Self, ScreenError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("magscreen/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ScreenError::IcsdHttp(err.to_string()))?,
        );
        match std::env::var("ICSD_GATEWAY_TOKEN") {
            Ok(token) if !token.trim().is_empty() => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                        .map_err(|err| ScreenError::IcsdHttp(err.to_string()))?,
                );
            }
            _ => {
                warn!("ICSD_GATEWAY_TOKEN not set; structure database access may be degraded");
            }
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ScreenError::IcsdHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            page_size: 200,
        })
    }
}

impl IcsdClient for IcsdHttpClient {
    fn fetch_entries(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        let url = format!("{}/v1/entries", self.base_url);
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("ids", ids.join(",")),
                    ("fields", fields.join(",")),
                    ("offset", offset.to_string()),
                    ("limit", self.page_size.to_string()),
                ])
                .send()
                .map_err(|err| ScreenError::IcsdHttp(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "structure database gateway request failed".to_string());
                return Err(ScreenError::IcsdStatus { status, message });
            }
            let envelope: Value = response
                .json()
                .map_err(|err| ScreenError::IcsdHttp(err.to_string()))?;
            let data = envelope
                .get("data")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let count = data.len();
            rows.extend(data);
            if count < self.page_size {
                return Ok(rows);
            }
            offset += count;
        }
    }
}

/// Normalize one gateway entry row.
pub fn extract_record(row: &Value) -> Result<MaterialRecord, ScreenError> {
    let entry_id = schema::extract_string(row, &ENTRY_ID)?
        .ok_or_else(|| ScreenError::SchemaVariantExhausted("entry_id".to_string()))?;
    let raw_formula = schema::extract_string(row, &SUM_FORMULA)?
        .ok_or_else(|| ScreenError::SchemaVariantExhausted("sum_formula".to_string()))?;

    let formula = canonicalize_formula(&raw_formula);
    let elements = elements_from_formula(&raw_formula);

    let raw_space_group = schema::extract_string(row, &SPACE_GROUP)?;
    let space_group = raw_space_group
        .as_deref()
        .map(canonicalize_space_group)
        .filter(|sg| !sg.is_empty());

    let mut properties = BTreeMap::new();
    if let Some(volume) = schema::extract_number(row, &CELL_VOLUME)? {
        properties.insert("volume".to_string(), volume);
    }
    if let Some(number) = schema::extract_number(row, &SPACE_GROUP_NUMBER)? {
        properties.insert("space_group_number".to_string(), number);
    }

    Ok(MaterialRecord {
        source: SourceId::Icsd,
        source_id: entry_id,
        raw_formula,
        formula,
        elements,
        raw_space_group,
        space_group,
        ordering: None,
        properties,
        cross_refs: BTreeMap::new(),
        dois: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_entry_row() {
        // Gateway rows carry text-typed numeric columns.
        let row = json!({
            "idnum": 15840,
            "sum_form": "Fe2 O3",
            "sgr_disp": "R -3 c H",
            "sgr_num": "167",
            "c_vol": "302.72",
        });
        let record = extract_record(&row).unwrap();
        assert_eq!(record.source_id, "15840");
        assert_eq!(record.formula.as_str(), "Fe2O3");
        assert_eq!(record.space_group.as_deref(), Some("R-3CH"));
        assert_eq!(record.properties["volume"], 302.72);
        assert_eq!(record.properties["space_group_number"], 167.0);
    }

    #[test]
    fn missing_formula_is_record_failure() {
        let row = json!({ "idnum": 1 });
        assert!(extract_record(&row).is_err());
    }
}
