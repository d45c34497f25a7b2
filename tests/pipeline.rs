use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};

use magscreen::config::{Config, ConfigLoader, ResolvedConfig};
use magscreen::domain::{DatabaseType, Query, SourceId};
use magscreen::error::ScreenError;
use magscreen::icsd::IcsdClient;
use magscreen::mp::MpClient;
use magscreen::nemad::NemadClient;
use magscreen::pipeline::{Harvester, NoopSink, SourceStatus};
use magscreen::seed::SeedRow;

#[derive(Default)]
struct MockMp {
    summaries: Vec<Value>,
    thermo: Vec<Value>,
    magnetism: Vec<Value>,
    element_queries: AtomicUsize,
}

impl MockMp {
    fn with_summaries(summaries: Vec<Value>) -> Self {
        Self {
            summaries,
            ..Self::default()
        }
    }

    fn filter_by_ids(docs: &[Value], ids: &[String]) -> Vec<Value> {
        docs.iter()
            .filter(|doc| {
                doc.get("material_id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|id| ids.iter().any(|wanted| wanted == id))
            })
            .cloned()
            .collect()
    }
}

impl MpClient for MockMp {
    fn search_summary(&self, query: &Query, _fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        match query {
            Query::Elements { .. } => {
                self.element_queries.fetch_add(1, Ordering::SeqCst);
                Ok(self
                    .summaries
                    .iter()
                    .map(|doc| json!({ "material_id": doc["material_id"] }))
                    .collect())
            }
            Query::Ids(ids) => Ok(Self::filter_by_ids(&self.summaries, ids)),
            Query::Formula(_) => Ok(Vec::new()),
        }
    }

    fn search_thermo(&self, ids: &[String], _fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        Ok(Self::filter_by_ids(&self.thermo, ids))
    }

    fn search_magnetism(&self, ids: &[String], _fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        Ok(Self::filter_by_ids(&self.magnetism, ids))
    }

    fn probe_summary_field(&self, field: &str) -> Result<bool, ScreenError> {
        Ok(field == "database_IDs")
    }
}

impl MpClient for &MockMp {
    fn search_summary(&self, query: &Query, fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        <MockMp as MpClient>::search_summary(self, query, fields)
    }

    fn search_thermo(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        <MockMp as MpClient>::search_thermo(self, ids, fields)
    }

    fn search_magnetism(&self, ids: &[String], fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        <MockMp as MpClient>::search_magnetism(self, ids, fields)
    }

    fn probe_summary_field(&self, field: &str) -> Result<bool, ScreenError> {
        <MockMp as MpClient>::probe_summary_field(self, field)
    }
}

#[derive(Default)]
struct MockNemad {
    results: Vec<Value>,
}

impl NemadClient for MockNemad {
    fn search_elements(
        &self,
        _database: DatabaseType,
        _elements: &[String],
        _exact: bool,
        _limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        Ok(self.results.clone())
    }

    fn search_formula(
        &self,
        _database: DatabaseType,
        formula: &str,
        _limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        Ok(self
            .results
            .iter()
            .filter(|doc| {
                doc.get("Material_Name")
                    .and_then(|v| v.as_str())
                    .is_some_and(|name| name == formula)
            })
            .cloned()
            .collect())
    }
}

struct FailingNemad;

impl NemadClient for FailingNemad {
    fn search_elements(
        &self,
        _database: DatabaseType,
        _elements: &[String],
        _exact: bool,
        _limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        Err(ScreenError::NemadHttp("connection refused".to_string()))
    }

    fn search_formula(
        &self,
        _database: DatabaseType,
        _formula: &str,
        _limit: i64,
    ) -> Result<Vec<Value>, ScreenError> {
        Err(ScreenError::NemadHttp("connection refused".to_string()))
    }
}

#[derive(Default)]
struct MockIcsd {
    rows: Vec<Value>,
}

impl IcsdClient for MockIcsd {
    fn fetch_entries(&self, ids: &[String], _fields: &[&str]) -> Result<Vec<Value>, ScreenError> {
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                row.get("idnum")
                    .map(|v| match v {
                        Value::String(text) => ids.iter().any(|id| id == text),
                        Value::Number(number) => ids.iter().any(|id| id == &number.to_string()),
                        _ => false,
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// Fast-running config: element filters only, no delays, single attempt.
fn test_config() -> ResolvedConfig {
    let mut config = Config::empty();
    config.allow_elements = Some(vec!["Fe".to_string()]);
    config.ban_elements = Some(vec!["Pb".to_string()]);
    config.thresholds = Some(Vec::new());
    config.ordering = Some(String::new());
    config.retries = Some(1);
    config.retry_delay_ms = Some(0);
    config.sleep_ms = Some(0);
    ConfigLoader::resolve_config(config).unwrap()
}

fn fe2o3_summary() -> Value {
    json!({
        "material_id": "mp-1",
        "formula_pretty": "Fe2O3",
        "elements": ["Fe", "O"],
        "symmetry": { "symbol": "R-3c" },
        "database_IDs": { "icsd": ["100"] },
    })
}

fn pbo_summary() -> Value {
    json!({
        "material_id": "mp-2",
        "formula_pretty": "PbO",
        "elements": ["Pb", "O"],
        "symmetry": { "symbol": "P4/nmm" },
    })
}

#[test]
fn end_to_end_merges_across_sources() {
    let mp = MockMp::with_summaries(vec![fe2o3_summary(), pbo_summary()]);
    let nemad = MockNemad {
        results: vec![
            json!({
                "Material_Name": "Fe2O3",
                "Curie": "948",
                "Crystal_Structure": "R-3c",
            }),
            // Wrong polymorph: known formula, disallowed space group.
            json!({
                "Material_Name": "Fe2O3",
                "Crystal_Structure": "Fm-3m",
            }),
            // Formula the primary source never produced.
            json!({
                "Material_Name": "MnSi",
                "Crystal_Structure": "P213",
            }),
        ],
    };
    let icsd = MockIcsd {
        rows: vec![json!({
            "idnum": 100,
            "sum_form": "Fe2 O3",
            "sgr_disp": "R -3 c",
            "c_vol": "302.72",
        })],
    };

    let harvester = Harvester::new(mp, nemad, icsd, test_config());
    let report = harvester.run(None, &NoopSink).unwrap();

    assert_eq!(report.records.len(), 1);
    let record = &report.records[0];
    assert_eq!(record.identifier, "mp-1");
    assert_eq!(record.key.formula, "Fe2O3");
    assert_eq!(record.key.space_group, "R-3C");
    assert!(record.sources.contains(&SourceId::Mp));
    assert!(record.sources.contains(&SourceId::Nemad));
    assert!(record.sources.contains(&SourceId::Icsd));
    assert_eq!(record.properties["curie_temperature"], 948.0);
    assert_eq!(record.properties["volume"], 302.72);
    assert_eq!(record.cross_refs["icsd"], vec!["100"]);

    // The Pb compound was banned, the polymorph and the unknown formula
    // were rejected at the matcher.
    assert_eq!(report.filtered_out, 1);
    assert_eq!(report.rejected_candidates, 2);
    assert_eq!(report.statuses[&SourceId::Mp], SourceStatus::Complete);
    assert_eq!(report.statuses[&SourceId::Nemad], SourceStatus::Complete);
    assert_eq!(report.statuses[&SourceId::Icsd], SourceStatus::Complete);
    assert_eq!(report.icsd_ids(), vec!["100"]);
}

#[test]
fn seed_skips_element_discovery() {
    let mp = MockMp::with_summaries(vec![fe2o3_summary(), pbo_summary()]);
    let nemad = MockNemad::default();
    let icsd = MockIcsd::default();

    let seed = vec![SeedRow {
        id: "mp-1".to_string(),
        formula: "Fe2O3".to_string(),
        space_group: Some("R-3c".to_string()),
    }];

    let harvester = Harvester::new(mp, nemad, icsd, test_config());
    let report = harvester.run(Some(&seed), &NoopSink).unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].identifier, "mp-1");
}

#[test]
fn seeded_run_issues_no_element_queries() {
    let mp = MockMp::with_summaries(vec![fe2o3_summary()]);
    let seed = vec![SeedRow {
        id: "mp-1".to_string(),
        formula: "Fe2O3".to_string(),
        space_group: None,
    }];

    let harvester = Harvester::new(&mp, MockNemad::default(), MockIcsd::default(), test_config());
    let report = harvester.run(Some(&seed), &NoopSink).unwrap();
    assert_eq!(report.records.len(), 1);
    assert_eq!(mp.element_queries.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_secondary_source_is_non_fatal() {
    let mp = MockMp::with_summaries(vec![fe2o3_summary()]);
    let icsd = MockIcsd {
        rows: vec![json!({
            "idnum": 100,
            "sum_form": "Fe2O3",
            "sgr_disp": "R-3c",
        })],
    };

    let harvester = Harvester::new(mp, FailingNemad, icsd, test_config());
    let report = harvester.run(None, &NoopSink).unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.statuses[&SourceId::Nemad], SourceStatus::Failed);
    assert_eq!(report.statuses[&SourceId::Icsd], SourceStatus::Complete);
    assert!(report.records[0].sources.contains(&SourceId::Icsd));
    assert!(!report.records[0].sources.contains(&SourceId::Nemad));
}

#[test]
fn ordering_filter_rejects_non_matching_records() {
    let mut config = Config::empty();
    config.allow_elements = Some(vec!["Fe".to_string(), "Mn".to_string()]);
    config.ban_elements = Some(Vec::new());
    config.thresholds = Some(Vec::new());
    config.retries = Some(1);
    config.retry_delay_ms = Some(0);
    config.sleep_ms = Some(0);
    // ordering left at its default: "FM"
    let config = ConfigLoader::resolve_config(config).unwrap();

    let mnsi = json!({
        "material_id": "mp-3",
        "formula_pretty": "MnSi",
        "elements": ["Mn", "Si"],
        "symmetry": { "symbol": "P213" },
    });
    let mp = MockMp {
        summaries: vec![fe2o3_summary(), mnsi],
        magnetism: vec![
            json!({ "material_id": "mp-1", "ordering": "FM", "total_magnetization": 4.2 }),
            json!({ "material_id": "mp-3", "ordering": "AFM" }),
        ],
        ..MockMp::default()
    };

    let harvester = Harvester::new(mp, MockNemad::default(), MockIcsd::default(), config);
    let report = harvester.run(None, &NoopSink).unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].identifier, "mp-1");
    assert_eq!(report.filtered_out, 1);
}

#[test]
fn disabled_source_is_skipped() {
    let mut config = Config::empty();
    config.sources = Some(vec!["mp".to_string()]);
    config.allow_elements = Some(vec!["Fe".to_string()]);
    config.ban_elements = Some(Vec::new());
    config.thresholds = Some(Vec::new());
    config.ordering = Some(String::new());
    config.retries = Some(1);
    config.retry_delay_ms = Some(0);
    config.sleep_ms = Some(0);
    let config = ConfigLoader::resolve_config(config).unwrap();

    let mp = MockMp::with_summaries(vec![fe2o3_summary()]);
    let harvester = Harvester::new(mp, FailingNemad, MockIcsd::default(), config);
    let report = harvester.run(None, &NoopSink).unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.statuses[&SourceId::Nemad], SourceStatus::Skipped);
    assert_eq!(report.statuses[&SourceId::Icsd], SourceStatus::Skipped);
}
