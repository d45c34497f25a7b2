use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DatabaseType, SourceId, parse_element_symbol};
use crate::error::ScreenError;
use crate::filter::{Bound, FilterSet, ThresholdPredicate};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub allow_elements: Option<Vec<String>>,
    #[serde(default)]
    pub ban_elements: Option<Vec<String>>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub ban_chunk_chars: Option<usize>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub sleep_ms: Option<u64>,
    #[serde(default)]
    pub exact_match: Option<bool>,
    #[serde(default)]
    pub by_formula: Option<bool>,
    #[serde(default)]
    pub nemad_databases: Option<Vec<String>>,
    #[serde(default)]
    pub nemad_limit: Option<i64>,
    #[serde(default)]
    pub ordering: Option<String>,
    #[serde(default)]
    pub thresholds: Option<Vec<ThresholdPredicate>>,
    #[serde(default)]
    pub icsd_gateway_url: Option<String>,
    #[serde(default)]
    pub output_csv: Option<String>,
    #[serde(default)]
    pub output_ids: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub sources: Vec<SourceId>,
    pub allow_elements: BTreeSet<String>,
    pub ban_elements: BTreeSet<String>,
    pub batch_size: usize,
    pub ban_chunk_chars: usize,
    pub retry: RetryPolicy,
    pub inter_call_delay: Duration,
    pub exact_match: bool,
    pub by_formula: bool,
    pub nemad_databases: Vec<DatabaseType>,
    pub nemad_limit: i64,
    pub ordering: Option<String>,
    pub thresholds: Vec<ThresholdPredicate>,
    pub icsd_gateway_url: String,
    pub output_csv: Utf8PathBuf,
    pub output_ids: Utf8PathBuf,
}

impl ResolvedConfig {
    pub fn filter_set(&self) -> FilterSet {
        FilterSet {
            allow: self.allow_elements.clone(),
            ban: self.ban_elements.clone(),
            thresholds: self.thresholds.clone(),
            ordering: self.ordering.clone(),
        }
    }
}

/// The screening campaign the tool was built for: 3d transition-metal
/// magnets, skipping expensive, hazardous, radioactive, and noble-gas
/// elements.
pub fn default_allow_elements() -> Vec<String> {
    ["Mn", "Fe", "Co", "Ni", "Cr"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

pub fn default_ban_elements() -> Vec<String> {
    [
        "Re", "Os", "Ir", "Pt", "Au", "In", "Tc", "Be", "As", "Cd", "Ba", "Hg", "Tl", "Pb", "Ac",
        "Cs", "Po", "Np", "U", "Pu", "Th", "He", "Ne", "Ar", "Kr", "Xe",
    ]
    .iter()
    .map(|e| e.to_string())
    .collect()
}

pub fn default_thresholds() -> Vec<ThresholdPredicate> {
    vec![
        ThresholdPredicate {
            property: "formation_energy_per_atom".to_string(),
            lower: None,
            upper: Some(Bound::exclusive(0.0)),
        },
        ThresholdPredicate {
            property: "total_magnetization".to_string(),
            lower: Some(Bound::exclusive(0.0)),
            upper: None,
        },
        ThresholdPredicate {
            property: "total_magnetization_normalized_vol".to_string(),
            lower: Some(Bound::exclusive(0.0386)),
            upper: None,
        },
        ThresholdPredicate {
            property: "num_unique_magnetic_sites".to_string(),
            lower: Some(Bound::inclusive(2.0)),
            upper: None,
        },
    ]
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ScreenError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("magscreen.json"),
        };

        if path.is_none() && !config_path.exists() {
            // No config file means defaults; an explicitly named one must
            // exist.
            return Self::resolve_config(Config::empty());
        }
        if !config_path.exists() {
            return Err(ScreenError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ScreenError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| ScreenError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ScreenError> {
        let sources = config
            .sources
            .unwrap_or_else(|| vec!["mp".to_string(), "nemad".to_string(), "icsd".to_string()])
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<SourceId>, _>>()?;

        let allow_elements = config
            .allow_elements
            .unwrap_or_else(default_allow_elements)
            .iter()
            .map(|symbol| parse_element_symbol(symbol))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let ban_elements = config
            .ban_elements
            .unwrap_or_else(default_ban_elements)
            .iter()
            .map(|symbol| parse_element_symbol(symbol))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let nemad_databases = config
            .nemad_databases
            .unwrap_or_else(|| vec!["magnetic".to_string()])
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<DatabaseType>, _>>()?;

        Ok(ResolvedConfig {
            sources,
            allow_elements,
            ban_elements,
            batch_size: config.batch_size.unwrap_or(500),
            ban_chunk_chars: config.ban_chunk_chars.unwrap_or(55),
            retry: RetryPolicy::new(
                config.retries.unwrap_or(3),
                Duration::from_millis(config.retry_delay_ms.unwrap_or(800)),
            ),
            inter_call_delay: Duration::from_millis(config.sleep_ms.unwrap_or(250)),
            exact_match: config.exact_match.unwrap_or(true),
            by_formula: config.by_formula.unwrap_or(false),
            nemad_databases,
            nemad_limit: config.nemad_limit.unwrap_or(50),
            ordering: Some(config.ordering.unwrap_or_else(|| "FM".to_string()))
                .filter(|value| !value.is_empty()),
            thresholds: config.thresholds.unwrap_or_else(default_thresholds),
            icsd_gateway_url: config
                .icsd_gateway_url
                .unwrap_or_else(|| "https://icsd-gateway.science.ru.nl".to_string()),
            output_csv: Utf8PathBuf::from(
                config.output_csv.unwrap_or_else(|| "datalist.csv".to_string()),
            ),
            output_ids: Utf8PathBuf::from(
                config
                    .output_ids
                    .unwrap_or_else(|| "ids_to_download.txt".to_string()),
            ),
        })
    }
}

impl Config {
    pub fn empty() -> Self {
        Self {
            sources: None,
            allow_elements: None,
            ban_elements: None,
            batch_size: None,
            ban_chunk_chars: None,
            retries: None,
            retry_delay_ms: None,
            sleep_ms: None,
            exact_match: None,
            by_formula: None,
            nemad_databases: None,
            nemad_limit: None,
            ordering: None,
            thresholds: None,
            icsd_gateway_url: None,
            output_csv: None,
            output_ids: None,
        }
    }
}
