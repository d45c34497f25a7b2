use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::warn;

use crate::canonical::{canonicalize_formula, canonicalize_space_group, elements_from_formula};
use crate::domain::{MaterialRecord, Query, SourceId};
use crate::error::ScreenError;
use crate::schema::{self, FieldVariants};

pub const MATERIAL_ID: FieldVariants = FieldVariants::required("material_id", &["material_id"]);
pub const FORMULA: FieldVariants = FieldVariants::required(
    "formula",
    &["formula_pretty", "composition_reduced.formula", "pretty_formula"],
);
pub const SPACE_GROUP: FieldVariants =
    FieldVariants::optional("space_group", &["symmetry.symbol", "spacegroup"]);
pub const DATABASE_IDS: FieldVariants =
    FieldVariants::optional("database_ids", &["database_IDs", "database_Ids"]);
pub const ELEMENTS: FieldVariants = FieldVariants::optional("elements", &["elements"]);
pub const VOLUME: FieldVariants = FieldVariants::optional("volume", &["volume"]);

/// Summary fields to request per batch; the database-id concept is appended
/// after probing which casing the deployment accepts.
pub const SUMMARY_REQUEST_FIELDS: [&str; 6] = [
    "material_id",
    "formula_pretty",
    "composition_reduced",
    "volume",
    "elements",
    "symmetry",
];

pub const THERMO_REQUEST_FIELDS: [&str; 3] = [
    "material_id",
    "formation_energy_per_atom",
    "energy_above_hull",
];

pub const MAGNETISM_REQUEST_FIELDS: [&str; 6] = [
    "material_id",
    "ordering",
    "total_magnetization",
    "num_magnetic_sites",
    "num_unique_magnetic_sites",
    "total_magnetization_normalized_vol",
];

/// Structure repository adapter (Materials Project style REST API with
/// summary, thermo, and magnetism sub-endpoints).
pub trait MpClient: Send + Sync {
    /// Search the summary endpoint. Requests only `fields` and exhausts
    /// server-side pagination before returning.
    fn search_summary(&self, query: &Query, fields: &[&str]) -> Result<Vec<Value>, ScreenError>;

    fn search_thermo(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError>;

    fn search_magnetism(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError>;

    /// Minimal-field request used to detect which schema variant this
    /// deployment speaks. `Ok(false)` means the field name was rejected;
    /// transport failures propagate.
    fn probe_summary_field(&self, field: &str) -> Result<bool, ScreenError>;
}

#[derive(Clone)]
pub struct MpHttpClient {
    client: Client,
    base_url: String,
    per_page: usize,
}

impl MpHttpClient {
    pub fn new() -> Result<Self, ScreenError> {
        Self::with_base_url("https://api.materialsproject.org".to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, ScreenError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("magscreen/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ScreenError::MpHttp(err.to_string()))?,
        );
        match std::env::var("MP_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => {
                headers.insert(
                    "X-API-KEY",
                    HeaderValue::from_str(api_key.trim())
                        .map_err(|err| ScreenError::MpHttp(err.to_string()))?,
                );
            }
            _ => {
                warn!("MP_API_KEY not set; structure repository access may be degraded");
            }
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ScreenError::MpHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url,
            per_page: 500,
        })
    }

    /// Page through one endpoint until a short page signals the end.
    fn search_paged(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        fields: &[&str],
    ) -> Result<Vec<Value>, ScreenError> {
        let url = format!("{}/materials/{endpoint}/", self.base_url);
        let mut records = Vec::new();
        let mut page = 1usize;
        loop {
            let response = self
                .client
                .get(&url)
                .query(params)
                .query(&[("_fields", fields.join(","))])
                .query(&[
                    ("_page", page.to_string()),
                    ("_per_page", self.per_page.to_string()),
                ])
                .send()
                .map_err(|err| ScreenError::MpHttp(err.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response
                    .text()
                    .unwrap_or_else(|_| "structure repository request failed".to_string());
                return Err(ScreenError::MpStatus { status, message });
            }
            let envelope: Value = response
                .json()
                .map_err(|err| ScreenError::MpHttp(err.to_string()))?;
            let data = envelope
                .get("data")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let count = data.len();
            records.extend(data);
            if count < self.per_page {
                return Ok(records);
            }
            page += 1;
        }
    }

    fn id_params(ids: &[String]) -> Vec<(String, String)> {
        vec![("material_ids".to_string(), ids.join(","))]
    }
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    match query {
        Query::Ids(ids) => vec![("material_ids".to_string(), ids.join(","))],
        Query::Elements {
            include,
            exclude,
            exact,
        } => {
            let mut params = vec![("elements".to_string(), include.join(","))];
            if !exclude.is_empty() {
                params.push(("exclude_elements".to_string(), exclude.join(",")));
            }
            if *exact {
                params.push(("num_elements".to_string(), include.len().to_string()));
            }
            params
        }
        Query::Formula(formula) => vec![("formula".to_string(), formula.clone())],
    }
}

impl MpClient for MpHttpClient {
    fn search_summary(&self, query: &Query, fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        self.search_paged("summary", &query_params(query), fields)
    }

    fn search_thermo(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        self.search_paged("thermo", &Self::id_params(ids), fields)
    }

    fn search_magnetism(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        self.search_paged("magnetism", &Self::id_params(ids), fields)
    }

    fn probe_summary_field(&self, field: &str) -> Result<bool, ScreenError> {
        let url = format!("{}/materials/summary/", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("_fields", format!("material_id,{field}")),
                ("_per_page", "1".to_string()),
            ])
            .send()
            .map_err(|err| ScreenError::MpHttp(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        // An unknown field name comes back as a client error; anything else
        // is a provider failure.
        if status.is_client_error() {
            return Ok(false);
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "structure repository request failed".to_string());
        Err(ScreenError::MpStatus {
            status: status.as_u16(),
            message,
        })
    }
}

/// Build a normalized record from one summary document plus the thermo and
/// magnetism documents for the same material id, when present.
pub fn extract_record(
    summary: &Value,
    thermo: Option<&Value>,
    magnetism: Option<&Value>,
) -> Result<MaterialRecord, ScreenError> {
    let material_id = schema::extract_string(summary, &MATERIAL_ID)?
        .ok_or_else(|| ScreenError::SchemaVariantExhausted("material_id".to_string()))?;
    let raw_formula = schema::extract_string(summary, &FORMULA)?
        .ok_or_else(|| ScreenError::SchemaVariantExhausted("formula".to_string()))?;

    let formula = canonicalize_formula(&raw_formula);
    let mut elements = schema::extract_string_list(summary, &ELEMENTS)
        .into_iter()
        .collect::<std::collections::BTreeSet<_>>();
    if elements.is_empty() {
        elements = elements_from_formula(&raw_formula);
    }

    let raw_space_group = schema::extract_string(summary, &SPACE_GROUP)?;
    let space_group = raw_space_group
        .as_deref()
        .map(canonicalize_space_group)
        .filter(|sg| !sg.is_empty());

    let mut properties = BTreeMap::new();
    if let Some(volume) = schema::extract_number(summary, &VOLUME)? {
        properties.insert("volume".to_string(), volume);
    }
    if let Some(thermo) = thermo {
        for name in ["formation_energy_per_atom", "energy_above_hull"] {
            if let Some(value) = thermo.get(name).and_then(|v| v.as_f64()) {
                properties.insert(name.to_string(), value);
            }
        }
    }
    let mut ordering = None;
    if let Some(magnetism) = magnetism {
        for name in [
            "total_magnetization",
            "num_magnetic_sites",
            "num_unique_magnetic_sites",
            "total_magnetization_normalized_vol",
        ] {
            if let Some(value) = magnetism.get(name).and_then(|v| v.as_f64()) {
                properties.insert(name.to_string(), value);
            }
        }
        ordering = magnetism
            .get("ordering")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string());
    }

    let mut cross_refs = BTreeMap::new();
    if let Some(dbids) = schema::first_present(summary, &DATABASE_IDS) {
        if let Some(icsd) = dbids.get("icsd").and_then(|v| v.as_array()) {
            let mut ids: Vec<String> = icsd
                .iter()
                .filter_map(|v| match v {
                    Value::String(text) => {
                        let trimmed = text.trim();
                        (!trimmed.is_empty()).then(|| trimmed.to_string())
                    }
                    Value::Number(number) => Some(number.to_string()),
                    _ => None,
                })
                .collect();
            ids.sort();
            ids.dedup();
            if !ids.is_empty() {
                cross_refs.insert("icsd".to_string(), ids);
            }
        }
    }

    // Summary docs rarely carry a top-level doi; dig them out of the
    // origins[].references[] lists instead.
    let dois = schema::flatten_nested_strings(summary, "origins", "references", "doi");

    Ok(MaterialRecord {
        source: SourceId::Mp,
        source_id: material_id,
        raw_formula,
        formula,
        elements,
        raw_space_group,
        space_group,
        ordering,
        properties,
        cross_refs,
        dois,
    })
}
