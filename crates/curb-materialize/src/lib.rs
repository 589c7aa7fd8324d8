//! Full-scan consolidation of structured records into one CSV dataset.
//!
//! Every materialize invocation rebuilds the table from scratch: scan every
//! known run, keep the most recent observation per `post_id`, publish the
//! whole table atomically. There is no partial-publish path; any fault mid
//! scan aborts the invocation and leaves the previous table in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use curb_core::{ListingRecord, RunId, CSV_COLUMNS};
use curb_store::{get_text, labeled_run_ids_under, BlobStore};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "curb-materialize";

/// Published dataset object, relative to the structured prefix.
pub const DATASET_FILE: &str = "datasets/listings_master.csv";

/// Outcome payload of one materialize invocation.
#[derive(Debug, Clone, Serialize)]
pub struct MaterializeReport {
    pub ok: bool,
    pub runs_scanned: usize,
    pub unique_listings: usize,
    pub rows_written: usize,
    pub output_csv: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Whole-namespace merge over an injected [`BlobStore`].
pub struct MaterializeJob {
    store: Arc<dyn BlobStore>,
    structured_prefix: String,
}

impl MaterializeJob {
    pub fn new(store: Arc<dyn BlobStore>, structured_prefix: impl Into<String>) -> Self {
        Self {
            store,
            structured_prefix: structured_prefix.into(),
        }
    }

    fn dataset_key(&self) -> String {
        format!("{}/{}", self.structured_prefix, DATASET_FILE)
    }

    pub async fn run(&self) -> Result<MaterializeReport> {
        let runs = labeled_run_ids_under(self.store.as_ref(), &self.structured_prefix)
            .await
            .context("listing structured runs")?;
        if runs.is_empty() {
            return Ok(MaterializeReport {
                ok: true,
                runs_scanned: 0,
                unique_listings: 0,
                rows_written: 0,
                output_csv: self.dataset_key(),
                detail: Some(format!(
                    "no runs found under {}/",
                    self.structured_prefix
                )),
            });
        }

        // Latest observation per post_id, with the resolved run instant
        // cached so ties are decided consistently. Runs are scanned in
        // ascending order and a replacement must be strictly newer, so on
        // equal timestamps the first record seen in sorted run order wins.
        let mut latest: BTreeMap<String, (DateTime<Utc>, ListingRecord)> = BTreeMap::new();

        for run in &runs {
            let run_instant = run.timestamp_or_now();
            for record in self.records_for_run(run).await? {
                let instant = record_instant(&record).unwrap_or(run_instant);
                match latest.get(&record.post_id) {
                    Some((kept, _)) if instant <= *kept => {}
                    _ => {
                        latest.insert(record.post_id.clone(), (instant, record));
                    }
                }
            }
        }

        let rows = write_csv(latest.values().map(|(_, record)| record))?;
        self.store
            .put(self.dataset_key().as_str(), &rows.bytes)
            .await
            .context("publishing dataset")?;

        let report = MaterializeReport {
            ok: true,
            runs_scanned: runs.len(),
            unique_listings: latest.len(),
            rows_written: rows.count,
            output_csv: self.dataset_key(),
            detail: None,
        };
        info!(
            runs = report.runs_scanned,
            listings = report.unique_listings,
            output = %report.output_csv,
            "materialized dataset"
        );
        Ok(report)
    }

    /// Structured records stored under one run. Empty or malformed units are
    /// skipped without surfacing an error; storage faults abort the scan.
    async fn records_for_run(&self, run: &RunId) -> Result<Vec<ListingRecord>> {
        let prefix = format!("{}/run_id={}/jsonl/", self.structured_prefix, run);
        let mut records = Vec::new();
        for key in self
            .store
            .list(&prefix)
            .await
            .with_context(|| format!("listing {prefix}"))?
        {
            if !key.ends_with(".jsonl") {
                continue;
            }
            let text = get_text(self.store.as_ref(), &key)
                .await
                .with_context(|| format!("reading {key}"))?;
            let line = text.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ListingRecord>(line) {
                Ok(mut record) => {
                    if record.post_id.is_empty() {
                        debug!(%key, "skipping record without post_id");
                        continue;
                    }
                    if record.run_id.is_empty() {
                        record.run_id = run.as_str().to_string();
                    }
                    records.push(record);
                }
                Err(err) => debug!(%key, %err, "skipping malformed record"),
            }
        }
        Ok(records)
    }
}

/// The run recency of a record, taken from its own run_id field.
fn record_instant(record: &ListingRecord) -> Option<DateTime<Utc>> {
    match RunId::parse(&record.run_id) {
        Ok(run) => run.timestamp(),
        Err(_) => {
            warn!(
                post_id = %record.post_id,
                run_id = %record.run_id,
                "record carries an unparsable run_id"
            );
            None
        }
    }
}

struct CsvRows {
    bytes: Vec<u8>,
    count: usize,
}

fn write_csv<'a>(records: impl Iterator<Item = &'a ListingRecord>) -> Result<CsvRows> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_COLUMNS)
        .context("writing csv header")?;

    let mut count = 0usize;
    for record in records {
        let fields = &record.fields;
        let price = opt_cell(fields.price);
        let year = opt_cell(fields.year);
        let mileage = opt_cell(fields.mileage);
        writer
            .write_record([
                record.post_id.as_str(),
                record.run_id.as_str(),
                record.scraped_at.as_str(),
                price.as_str(),
                year.as_str(),
                fields.make.as_deref().unwrap_or(""),
                fields.model.as_deref().unwrap_or(""),
                mileage.as_str(),
                record.source_txt.as_str(),
            ])
            .context("writing csv row")?;
        count += 1;
    }

    let bytes = writer
        .into_inner()
        .context("finalizing csv buffer")?;
    Ok(CsvRows { bytes, count })
}

fn opt_cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
