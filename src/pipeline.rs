use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::canonical::elements_from_formula;
use crate::config::ResolvedConfig;
use crate::domain::{MaterialRecord, Query, SourceId};
use crate::error::ScreenError;
use crate::icsd::{self, IcsdClient};
use crate::matcher::{MatchOutcome, MergedRecord, Merger};
use crate::mp::{self, MpClient};
use crate::nemad::{self, NemadClient};
use crate::retry::{BatchLimit, Throttle, chunk_targets};
use crate::schema::VariantCache;
use crate::seed::SeedRow;

/// Pipeline stages, reported through the progress sink as the run advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Harvest(SourceId),
    Normalize,
    Canonicalize,
    Filter,
    Match,
    Aggregate,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Init => write!(f, "Init"),
            Stage::Harvest(source) => write!(f, "Harvest({source})"),
            Stage::Normalize => write!(f, "Normalize"),
            Stage::Canonicalize => write!(f, "Canonicalize"),
            Stage::Filter => write!(f, "Filter"),
            Stage::Match => write!(f, "Match"),
            Stage::Aggregate => write!(f, "Aggregate"),
            Stage::Done => write!(f, "Done"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Sink that discards everything; useful for tests and non-interactive runs.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Outcome of one source's harvest within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Complete,
    /// Some batches or records were lost but the source contributed data.
    Partial,
    Failed,
    Skipped,
}

/// Run-level result: the aggregated record set plus enough bookkeeping to
/// tell partial data from complete data.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub records: Vec<MergedRecord>,
    pub statuses: BTreeMap<SourceId, SourceStatus>,
    pub primary_records: usize,
    pub filtered_out: usize,
    pub skipped_records: usize,
    pub rejected_candidates: usize,
    pub started_at: String,
    pub finished_at: String,
}

impl RunReport {
    /// Every ICSD cross-reference observed in the merged set, for the
    /// id-list handoff to the structure download stage.
    pub fn icsd_ids(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for record in &self.records {
            if let Some(values) = record.cross_refs.get("icsd") {
                ids.extend(values.iter().cloned());
            }
        }
        ids.into_iter().collect()
    }
}

/// Counters shared by the per-source harvest passes.
#[derive(Debug, Default)]
struct HarvestTally {
    batches_failed: usize,
    batches_total: usize,
}

impl HarvestTally {
    fn status(&self) -> SourceStatus {
        if self.batches_total == 0 || self.batches_failed == self.batches_total {
            SourceStatus::Failed
        } else if self.batches_failed > 0 {
            SourceStatus::Partial
        } else {
            SourceStatus::Complete
        }
    }
}

/// One harvesting-and-reconciliation run. Owns the provider clients, the
/// throttle, and the per-run schema variant cache; none of it outlives the
/// run.
pub struct Harvester<M: MpClient, N: NemadClient, I: IcsdClient> {
    mp: M,
    nemad: N,
    icsd: I,
    config: ResolvedConfig,
    throttle: Throttle,
    started: std::time::Instant,
}

impl<M: MpClient, N: NemadClient, I: IcsdClient> Harvester<M, N, I> {
    pub fn new(mp: M, nemad: N, icsd: I, config: ResolvedConfig) -> Self {
        let throttle = Throttle::new(config.retry, config.inter_call_delay);
        Self {
            mp,
            nemad,
            icsd,
            config,
            throttle,
            started: std::time::Instant::now(),
        }
    }

    /// Run the full pipeline. A seed constrains the primary harvest to the
    /// listed ids; without one, candidates are discovered by element search.
    /// One source failing is non-fatal: the report carries a per-source
    /// status and the aggregate reflects whatever succeeded.
    pub fn run(
        &self,
        seed: Option<&[SeedRow]>,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, ScreenError> {
        let started_at = chrono::Utc::now().to_rfc3339();
        self.stage(sink, Stage::Init);

        let mut statuses = BTreeMap::new();
        let mut variants = VariantCache::new();

        // Primary harvest. Without it there is nothing to join against, so
        // a total failure here ends the run with an empty (but honest)
        // report rather than an error.
        self.stage(sink, Stage::Harvest(SourceId::Mp));
        let mut tally = HarvestTally::default();
        let primary_raw = if self.config.sources.contains(&SourceId::Mp) {
            match self.harvest_primary(seed, &mut variants, &mut tally, sink) {
                Ok(raw) => raw,
                Err(err) if err.is_fatal_for_run() => return Err(err),
                Err(err) => {
                    warn!("primary source harvest failed: {err}");
                    tally.batches_failed = tally.batches_total.max(1);
                    tally.batches_total = tally.batches_total.max(1);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        statuses.insert(
            SourceId::Mp,
            if self.config.sources.contains(&SourceId::Mp) {
                tally.status()
            } else {
                SourceStatus::Skipped
            },
        );

        self.stage(sink, Stage::Normalize);
        self.stage(sink, Stage::Canonicalize);
        let mut skipped_records = 0usize;
        let mut primary_records = Vec::new();
        for (summary, thermo, magnetism) in &primary_raw {
            match mp::extract_record(summary, thermo.as_ref(), magnetism.as_ref()) {
                Ok(record) => primary_records.push(record),
                Err(err) => {
                    skipped_records += 1;
                    warn!("dropping malformed primary record: {err}");
                }
            }
        }

        self.stage(sink, Stage::Filter);
        let filter_set = self.config.filter_set();
        let before = primary_records.len();
        let filtered: Vec<MaterialRecord> = primary_records
            .into_iter()
            .filter(|record| filter_set.accepts(record))
            .collect();
        let filtered_out = before - filtered.len();
        self.event(
            sink,
            format!("filter kept {} of {before} primary records", filtered.len()),
        );

        self.stage(sink, Stage::Match);
        let mut merger = Merger::from_primary(&filtered);
        let mut rejected_candidates = 0usize;

        // Secondary sources are keyed off the primary result set.
        if self.config.sources.contains(&SourceId::Nemad) {
            self.stage(sink, Stage::Harvest(SourceId::Nemad));
            let status = self.harvest_nemad(
                &mut merger,
                &mut rejected_candidates,
                &mut skipped_records,
                sink,
            )?;
            statuses.insert(SourceId::Nemad, status);
        } else {
            statuses.insert(SourceId::Nemad, SourceStatus::Skipped);
        }

        if self.config.sources.contains(&SourceId::Icsd) {
            self.stage(sink, Stage::Harvest(SourceId::Icsd));
            let status = self.harvest_icsd(
                &mut merger,
                &mut rejected_candidates,
                &mut skipped_records,
                sink,
            )?;
            statuses.insert(SourceId::Icsd, status);
        } else {
            statuses.insert(SourceId::Icsd, SourceStatus::Skipped);
        }

        self.stage(sink, Stage::Aggregate);
        let records = merger.into_records();
        self.event(sink, format!("aggregated {} merged records", records.len()));
        self.stage(sink, Stage::Done);

        Ok(RunReport {
            records,
            statuses,
            primary_records: filtered.len(),
            filtered_out,
            skipped_records,
            rejected_candidates,
            started_at,
            finished_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Discover candidate ids (or take them from the seed), then pull the
    /// summary, thermo, and magnetism documents batch by batch, joined by
    /// material id.
    fn harvest_primary(
        &self,
        seed: Option<&[SeedRow]>,
        variants: &mut VariantCache,
        tally: &mut HarvestTally,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<(Value, Option<Value>, Option<Value>)>, ScreenError> {
        // Which database-id casing does this deployment speak? Probed once,
        // cached for the rest of the run.
        let dbids_field = variants
            .detect(&mp::DATABASE_IDS, |field| {
                self.throttle.call(|| self.mp.probe_summary_field(field))
            })
            .unwrap_or("database_IDs");

        let ids = match seed {
            Some(rows) => rows.iter().map(|row| row.id.clone()).collect(),
            None => self.discover_primary_ids(tally, sink)?,
        };
        self.event(sink, format!("{} candidate materials", ids.len()));

        let mut summary_fields: Vec<&str> = mp::SUMMARY_REQUEST_FIELDS.to_vec();
        summary_fields.push(dbids_field);
        summary_fields.push("origins");

        let batches = chunk_targets(&ids, BatchLimit::Items(self.config.batch_size))?;
        let mut raw = Vec::new();
        for (index, batch) in batches.iter().enumerate() {
            tally.batches_total += 1;
            let query = Query::Ids(batch.clone());
            let summaries = match self
                .throttle
                .call(|| self.mp.search_summary(&query, &summary_fields))
            {
                Ok(docs) => docs,
                Err(err) => {
                    tally.batches_failed += 1;
                    warn!("summary batch {} failed: {err}", index + 1);
                    continue;
                }
            };
            // Thermo and magnetism are enrichments; losing them degrades
            // the batch instead of dropping it.
            let thermo = self
                .throttle
                .call(|| self.mp.search_thermo(batch, &mp::THERMO_REQUEST_FIELDS))
                .unwrap_or_else(|err| {
                    warn!("thermo batch {} failed: {err}", index + 1);
                    Vec::new()
                });
            let magnetism = self
                .throttle
                .call(|| self.mp.search_magnetism(batch, &mp::MAGNETISM_REQUEST_FIELDS))
                .unwrap_or_else(|err| {
                    warn!("magnetism batch {} failed: {err}", index + 1);
                    Vec::new()
                });

            let thermo_by_id = index_by_material_id(thermo);
            let magnetism_by_id = index_by_material_id(magnetism);
            for summary in summaries {
                let id = summary
                    .get("material_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                raw.push((
                    summary,
                    thermo_by_id.get(&id).cloned(),
                    magnetism_by_id.get(&id).cloned(),
                ));
            }
        }
        Ok(raw)
    }

    /// Server-side element screening: one search per allow-list element per
    /// banned-element chunk, collecting the union of matching ids.
    fn discover_primary_ids(
        &self,
        tally: &mut HarvestTally,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<String>, ScreenError> {
        let ban: Vec<String> = self.config.ban_elements.iter().cloned().collect();
        let ban_chunks = chunk_targets(&ban, BatchLimit::Chars(self.config.ban_chunk_chars))?;
        let mut ids = BTreeSet::new();
        for element in &self.config.allow_elements {
            for chunk in &ban_chunks {
                tally.batches_total += 1;
                let query = Query::Elements {
                    include: vec![element.clone()],
                    exclude: chunk.clone(),
                    exact: false,
                };
                match self
                    .throttle
                    .call(|| self.mp.search_summary(&query, &["material_id"]))
                {
                    Ok(docs) => {
                        for doc in docs {
                            if let Some(id) = doc.get("material_id").and_then(|v| v.as_str()) {
                                ids.insert(id.to_string());
                            }
                        }
                    }
                    Err(err) => {
                        tally.batches_failed += 1;
                        warn!("element search for {element} failed: {err}");
                    }
                }
            }
        }
        self.event(sink, format!("discovery found {} unique ids", ids.len()));
        Ok(ids.into_iter().collect())
    }

    fn harvest_nemad(
        &self,
        merger: &mut Merger,
        rejected: &mut usize,
        skipped: &mut usize,
        sink: &dyn ProgressSink,
    ) -> Result<SourceStatus, ScreenError> {
        let formulas = merger.allowed_keys_formulas();
        if formulas.is_empty() {
            self.event(sink, "no keyed primary records to look up".to_string());
            return Ok(SourceStatus::Skipped);
        }
        let mut tally = HarvestTally::default();
        for database in &self.config.nemad_databases {
            for formula in &formulas {
                tally.batches_total += 1;
                let results = if self.config.by_formula {
                    self.throttle.call(|| {
                        self.nemad
                            .search_formula(*database, formula, self.config.nemad_limit)
                    })
                } else {
                    let elements: Vec<String> =
                        elements_from_formula(formula).into_iter().collect();
                    self.throttle.call(|| {
                        self.nemad.search_elements(
                            *database,
                            &elements,
                            self.config.exact_match,
                            self.config.nemad_limit,
                        )
                    })
                };
                let results = match results {
                    Ok(results) => results,
                    Err(err) => {
                        tally.batches_failed += 1;
                        warn!("property service query for {formula} failed: {err}");
                        continue;
                    }
                };
                for result in results {
                    match nemad::extract_record(&result, *database) {
                        Ok(record) => {
                            if merger.offer(&record) != MatchOutcome::Merged {
                                *rejected += 1;
                            }
                        }
                        Err(err) => {
                            *skipped += 1;
                            warn!("dropping malformed property record: {err}");
                        }
                    }
                }
            }
        }
        self.event(sink, format!("property service: {} queries", tally.batches_total));
        Ok(tally.status())
    }

    fn harvest_icsd(
        &self,
        merger: &mut Merger,
        rejected: &mut usize,
        skipped: &mut usize,
        sink: &dyn ProgressSink,
    ) -> Result<SourceStatus, ScreenError> {
        let ids = merger.known_cross_refs("icsd");
        if ids.is_empty() {
            self.event(sink, "no structure-database cross-references".to_string());
            return Ok(SourceStatus::Skipped);
        }
        let mut tally = HarvestTally::default();
        let batches = chunk_targets(&ids, BatchLimit::Items(self.config.batch_size))?;
        for batch in &batches {
            tally.batches_total += 1;
            let rows = match self
                .throttle
                .call(|| self.icsd.fetch_entries(batch, &icsd::ENTRY_REQUEST_FIELDS))
            {
                Ok(rows) => rows,
                Err(err) => {
                    tally.batches_failed += 1;
                    warn!("structure database batch failed: {err}");
                    continue;
                }
            };
            for row in rows {
                match icsd::extract_record(&row) {
                    Ok(record) => {
                        if merger.offer(&record) != MatchOutcome::Merged {
                            *rejected += 1;
                        }
                    }
                    Err(err) => {
                        *skipped += 1;
                        warn!("dropping malformed structure row: {err}");
                    }
                }
            }
        }
        self.event(
            sink,
            format!("structure database: {} of {} batches ok", tally.batches_total - tally.batches_failed, tally.batches_total),
        );
        Ok(tally.status())
    }

    fn stage(&self, sink: &dyn ProgressSink, stage: Stage) {
        self.event(sink, format!("phase={stage}"));
    }

    fn event(&self, sink: &dyn ProgressSink, message: String) {
        sink.event(ProgressEvent {
            message,
            elapsed: Some(self.started.elapsed()),
        });
    }
}

fn index_by_material_id(docs: Vec<Value>) -> HashMap<String, Value> {
    docs.into_iter()
        .filter_map(|doc| {
            let id = doc.get("material_id")?.as_str()?.to_string();
            Some((id, doc))
        })
        .collect()
}

impl ScreenError {
    /// Only invariant violations abort the whole run; provider failures are
    /// contained at the source level.
    fn is_fatal_for_run(&self) -> bool {
        matches!(self, ScreenError::BatchCapacity(_))
    }
}
