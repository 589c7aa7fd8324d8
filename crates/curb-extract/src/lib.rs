//! Listing field extraction and the per-run extract batch.
//!
//! [`parse_listing`] is a pure function from raw listing text to optional
//! structured fields. [`ExtractJob`] drives one batch: locate the run's text
//! objects, extract each one, and write one JSON record per input.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use curb_core::{ListingFields, ListingRecord, RunId};
use curb_store::{get_text, run_ids_under, BlobStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "curb-extract";

/// Revision tag stamped into every extract report.
pub const EXTRACTOR_VERSION: &str = concat!("curb-extract/", env!("CARGO_PKG_VERSION"));

fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\s?([0-9,]+)").expect("valid price regex"))
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("valid year regex"))
}

fn make_model_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z][a-z]+)\s+([A-Z][A-Za-z0-9]+)").expect("valid make/model regex")
    })
}

fn mileage_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:mileage|odometer)\s*[:\-]?\s*([\d,]+)")
            .expect("valid labeled mileage regex")
    })
}

fn mileage_k_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*k\s*(?:mi|mile|miles)\b")
            .expect("valid k-mileage regex")
    })
}

fn mileage_plain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,3}(?:[,\d]{3})*)\s*(?:mi|mile|miles)\b")
            .expect("valid plain mileage regex")
    })
}

fn parse_grouped_int(digits: &str) -> Option<i64> {
    digits.replace(',', "").parse().ok()
}

/// First mileage strategy that yields a number wins: an explicit
/// mileage/odometer label, then `30k mi`, then `45,000 miles`. A strategy
/// whose match does not parse falls through to the next one.
fn extract_mileage(text: &str) -> Option<i64> {
    if let Some(m) = mileage_label_re().captures(text) {
        if let Some(value) = parse_grouped_int(&m[1]) {
            return Some(value);
        }
    }
    if let Some(m) = mileage_k_re().captures(text) {
        if let Ok(thousands) = m[1].parse::<f64>() {
            return Some((thousands * 1000.0) as i64);
        }
    }
    if let Some(m) = mileage_plain_re().captures(text) {
        let digits: String = m[1].chars().filter(char::is_ascii_digit).collect();
        if let Ok(value) = digits.parse() {
            return Some(value);
        }
    }
    None
}

/// Heuristic field extraction over a raw listing body. Pure, never fails;
/// whatever does not match or parse is simply left out.
pub fn parse_listing(text: &str) -> ListingFields {
    let mut fields = ListingFields::default();

    if let Some(m) = price_re().captures(text) {
        fields.price = parse_grouped_int(&m[1]);
    }

    if let Some(m) = year_re().find(text) {
        fields.year = m.as_str().parse().ok();
    }

    if let Some(m) = make_model_re().captures(text) {
        fields.make = Some(m[1].to_string());
        fields.model = Some(m[2].to_string());
    }

    fields.mileage = extract_mileage(text);
    fields
}

/// Caller-supplied knobs for one extract invocation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtractParams {
    /// Run to process; the latest known run when absent.
    pub run_id: Option<String>,
    /// Cap on files processed this invocation, 0 = unlimited.
    pub max_files: usize,
    /// Rewrite records that already exist instead of skipping them.
    pub overwrite: bool,
}

/// Outcome payload of one extract invocation. Per-file failures are counted
/// in `errors` while the invocation as a whole still reports `ok`.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub ok: bool,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub processed_txt: usize,
    pub written_jsonl: usize,
    pub skipped_existing: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExtractReport {
    fn no_data(run_id: Option<&RunId>, detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            version: EXTRACTOR_VERSION,
            run_id: run_id.map(|r| r.as_str().to_string()),
            processed_txt: 0,
            written_jsonl: 0,
            skipped_existing: 0,
            errors: 0,
            detail: Some(detail.into()),
        }
    }
}

/// One-run extract batch over an injected [`BlobStore`].
pub struct ExtractJob {
    store: Arc<dyn BlobStore>,
    scrapes_prefix: String,
    structured_prefix: String,
}

impl ExtractJob {
    pub fn new(
        store: Arc<dyn BlobStore>,
        scrapes_prefix: impl Into<String>,
        structured_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            scrapes_prefix: scrapes_prefix.into(),
            structured_prefix: structured_prefix.into(),
        }
    }

    pub async fn run(&self, params: &ExtractParams) -> Result<ExtractReport> {
        let run_id = match &params.run_id {
            Some(raw) => RunId::parse(raw).context("invalid run_id parameter")?,
            None => {
                let runs = run_ids_under(self.store.as_ref(), &self.scrapes_prefix)
                    .await
                    .context("listing run ids")?;
                match runs.into_iter().next_back() {
                    Some(run) => run,
                    None => {
                        return Ok(ExtractReport::no_data(
                            None,
                            format!("no run ids found under {}/", self.scrapes_prefix),
                        ))
                    }
                }
            }
        };

        let scraped_at = run_id.scraped_at_iso();

        let mut txt_keys = self.txt_keys_for_run(&run_id).await?;
        if txt_keys.is_empty() {
            return Ok(ExtractReport::no_data(
                Some(&run_id),
                "no .txt files found for run",
            ));
        }
        if params.max_files > 0 {
            txt_keys.truncate(params.max_files);
        }

        let mut written = 0usize;
        let mut skipped = 0usize;
        let mut errors = 0usize;
        let mut processed = 0usize;

        for key in &txt_keys {
            if let Err(err) = self
                .extract_one(key, &run_id, &scraped_at, params.overwrite, &mut written, &mut skipped)
                .await
            {
                errors += 1;
                warn!(%key, %err, "failed to extract listing");
            }
            processed += 1;
        }

        let report = ExtractReport {
            ok: true,
            version: EXTRACTOR_VERSION,
            run_id: Some(run_id.as_str().to_string()),
            processed_txt: processed,
            written_jsonl: written,
            skipped_existing: skipped,
            errors,
            detail: None,
        };
        info!(
            run_id = %run_id,
            processed, written, skipped, errors,
            "extract batch finished"
        );
        Ok(report)
    }

    /// Historical layouts stored text under four shapes; the first candidate
    /// prefix that yields any `.txt` objects wins.
    async fn txt_keys_for_run(&self, run_id: &RunId) -> Result<Vec<String>> {
        let candidates = [
            format!("{}/run_id={}/txt/", self.scrapes_prefix, run_id),
            format!("{}/run_id={}/", self.scrapes_prefix, run_id),
            format!("{}/{}/txt/", self.scrapes_prefix, run_id),
            format!("{}/{}/", self.scrapes_prefix, run_id),
        ];
        for prefix in candidates {
            let keys: Vec<String> = self
                .store
                .list(&prefix)
                .await
                .with_context(|| format!("listing {prefix}"))?
                .into_iter()
                .filter(|key| key.ends_with(".txt"))
                .collect();
            if !keys.is_empty() {
                return Ok(keys);
            }
        }
        Ok(Vec::new())
    }

    async fn extract_one(
        &self,
        key: &str,
        run_id: &RunId,
        scraped_at: &str,
        overwrite: bool,
        written: &mut usize,
        skipped: &mut usize,
    ) -> Result<()> {
        let text = get_text(self.store.as_ref(), key).await?;
        let fields = parse_listing(&text);

        let post_id = Path::new(key)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string());

        let out_key = format!(
            "{}/run_id={}/jsonl/{}.jsonl",
            self.structured_prefix, run_id, post_id
        );

        if !overwrite && self.store.exists(&out_key).await? {
            *skipped += 1;
            return Ok(());
        }

        let record = ListingRecord {
            post_id,
            run_id: run_id.as_str().to_string(),
            scraped_at: scraped_at.to_string(),
            source_txt: key.to_string(),
            fields,
        };
        let mut line = serde_json::to_string(&record).context("encoding record")?;
        line.push('\n');
        self.store.put(&out_key, line.as_bytes()).await?;
        *written += 1;
        Ok(())
    }
}
