use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::warn;

use crate::canonical::{
    canonicalize_formula, canonicalize_space_group, elements_from_formula, extract_space_group,
};
use crate::domain::{DatabaseType, MaterialRecord, SourceId};
use crate::error::ScreenError;
use crate::schema::{self, FieldVariants};

pub const MATERIAL_NAME: FieldVariants =
    FieldVariants::required("material_name", &["Material_Name", "material_name", "Formula"]);
pub const RECORD_ID: FieldVariants = FieldVariants::optional("record_id", &["id", "ID", "_id"]);
pub const DOI: FieldVariants = FieldVariants::optional("doi", &["DOI", "doi"]);
pub const CURIE: FieldVariants =
    FieldVariants::optional("curie_temperature", &["Curie", "Curie_Temperature", "Tc"]);
pub const NEEL: FieldVariants =
    FieldVariants::optional("neel_temperature", &["Neel", "Neel_Temperature", "Tn"]);
pub const MAGNETIC_MOMENT: FieldVariants =
    FieldVariants::optional("magnetic_moment", &["Magnetic_Moment", "Moment"]);

/// Property service adapter (NEMAD style API: per-database element search and
/// exact-formula endpoints).
pub trait NemadClient: Send + Sync {
    fn search_elements(
        &self,
        database: DatabaseType,
        elements: &[String],
        exact: bool,
        limit: i64,
    ) -> Result<Vec<Value>, ScreenError>;

    fn search_formula(
        &self,
        database: DatabaseType,
        formula: &str,
        limit: i64,
    ) -> Result<Vec<Value>, ScreenError>;
}

#[derive(Clone)]
pub struct NemadHttpClient {
    client: Client,
    base_url: String,
}

impl NemadHttpClient {
    pub fn new() -> Result<Self, ScreenError> {
        Self::with_base_url("https://api.nemad.org".to_string())
    }

    pub fn with_base_url(base_url: String) -> Result<Self, ScreenError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("magscreen/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ScreenError::NemadHttp(err.to_string()))?,
        );
        headers.insert("accept", HeaderValue::from_static("application/json"));
        match std::env::var("NEMAD_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => {
                headers.insert(
                    "X-API-Key",
                    HeaderValue::from_str(api_key.trim())
                        .map_err(|err| ScreenError::NemadHttp(err.to_string()))?,
                );
            }
            _ => {
                warn!("NEMAD_API_KEY not set; property service access may be degraded");
            }
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ScreenError::NemadHttp(err.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn get_results(&self, url: &str, params: &[(String, String)]) -> Result<Vec<Value>, ScreenError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .map_err(|err| ScreenError::NemadHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "property service request failed".to_string());
            return Err(ScreenError::NemadStatus { status, message });
        }
        let envelope: Value = response
            .json()
            .map_err(|err| ScreenError::NemadHttp(err.to_string()))?;
        Ok(envelope
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

impl NemadClient for NemadHttpClient {
    fn search_elements(
        &self,
        database: DatabaseType,
        elements: &[String],
        exact: bool,
        limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        let url = format!("{}/api/{}/search", self.base_url, database.as_str());
        let params = vec![
            ("elements".to_string(), elements.join(",")),
            ("exact_match".to_string(), exact.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        self.get_results(&url, &params)
    }

    fn search_formula(
        &self,
        database: DatabaseType,
        formula: &str,
        limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        let url = format!("{}/api/{}/formula", self.base_url, database.as_str());
        let params = vec![
            ("formula".to_string(), formula.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        self.get_results(&url, &params)
    }
}

/// Normalize one property-service result. The service does not label a
/// canonical space-group field, so symbol extraction falls back to the
/// heuristic scan over string-valued fields.
pub fn extract_record(raw: &Value, database: DatabaseType) -> Result<MaterialRecord, ScreenError> {
    let raw_formula = schema::extract_string(raw, &MATERIAL_NAME)?
        .ok_or_else(|| ScreenError::SchemaVariantExhausted("material_name".to_string()))?;
    let source_id = schema::extract_string(raw, &RECORD_ID)?
        .unwrap_or_else(|| format!("{}:{raw_formula}", database.as_str()));

    let formula = canonicalize_formula(&raw_formula);
    let elements = elements_from_formula(&raw_formula);

    let raw_space_group = extract_space_group(raw);
    let space_group = raw_space_group
        .as_deref()
        .map(canonicalize_space_group)
        .filter(|sg| !sg.is_empty());

    let mut properties = BTreeMap::new();
    for (field, name) in [
        (&CURIE, "curie_temperature"),
        (&NEEL, "neel_temperature"),
        (&MAGNETIC_MOMENT, "magnetic_moment"),
    ] {
        if let Some(value) = schema::extract_number(raw, field)? {
            properties.insert(name.to_string(), value);
        }
    }

    let dois = schema::extract_string_list(raw, &DOI);

    let mut cross_refs = BTreeMap::new();
    cross_refs.insert(
        "nemad_database".to_string(),
        vec![database.as_str().to_string()],
    );

    Ok(MaterialRecord {
        source: SourceId::Nemad,
        source_id,
        raw_formula,
        formula,
        elements,
        raw_space_group,
        space_group,
        ordering: None,
        properties,
        cross_refs,
        dois,
    })
}
