//! Two phase import of the vendor feed
//!
//! Phase 1 downloads and parses the feed and caches it under a fresh key.
//! Phase 2 is called repeatedly with an advancing offset, each call handles
//! exactly one batch of rows and records its outcome in a per-offset ledger.
//! The call handling the last batch runs the deactivation sweep and cleans up.

use crate::cache::{CacheError, ChunkedCache, KvStore, KvStoreExt};
use crate::catalog::{CatalogError, CatalogStore};
use crate::config_file::ConfigError;
use crate::data::feed::{self, decode_row, FeedFormat, ParseError};
use crate::data::history::{HistoryEntry, ImportHistory, ImportStatus};
use crate::data::index::ExistingRecordIndex;
use crate::data::reconcile::{Outcome, Reconciler};
use crate::data::row::FeedRow;
use crate::data::run_state::{progress_percent, ImportRunState, RunLock};
use crate::data::script::{RowScript, ScriptOutcome};
use crate::data::sweep::DeactivationSweep;
use crate::data::validate::{Rejection, RowValidator};
use crate::fetch::{FetchError, RemoteFetcher, SftpTarget};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to download the feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Failed to parse the feed: {0}")]
    Parse(#[from] ParseError),
    #[error("Cache expired or not found for '{0}'. Please fetch the feed again.")]
    CacheExpired(String),
    #[error(transparent)]
    Cache(CacheError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Another import is in progress (cache key '{0}'). Finish or discard it first.")]
    RunLocked(String),
    #[error("Offset {offset} is outside of the {total_rows} cached rows")]
    InvalidOffset { offset: usize, total_rows: usize },
    #[error("Rows starting at offset {0} were never processed, refusing to deactivate records")]
    IncompleteRun(usize),
}

impl From<CacheError> for ImportError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Expired(key) => ImportError::CacheExpired(key),
            other => ImportError::Cache(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub imported: usize,
    pub updated: usize,
    pub skipped_no_image: usize,
    pub skipped_hidden_category: usize,
    /// Column count mismatch, missing key or rejected by the row script
    pub skipped_defective: usize,
    pub deactivated: usize,
}

impl OutcomeCounters {
    pub fn skipped(&self) -> usize {
        self.skipped_no_image + self.skipped_hidden_category + self.skipped_defective
    }
}

impl AddAssign for OutcomeCounters {
    fn add_assign(&mut self, other: Self) {
        self.imported += other.imported;
        self.updated += other.updated;
        self.skipped_no_image += other.skipped_no_image;
        self.skipped_hidden_category += other.skipped_hidden_category;
        self.skipped_defective += other.skipped_defective;
        self.deactivated += other.deactivated;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchSummary {
    pub cache_key: String,
    pub total_rows: usize,
    pub header: Vec<String>,
    pub file_size_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub cache_key: String,
    pub offset: usize,
    pub next_offset: usize,
    pub total_rows: usize,
    pub progress: f64,
    pub done: bool,
    /// Outcome of this batch alone
    pub batch: OutcomeCounters,
    /// Outcome of the run so far
    pub totals: OutcomeCounters,
    pub log: Vec<String>,
}

/// Ledger record of one processed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerEntry {
    rows: usize,
    counters: OutcomeCounters,
}

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub batch_size: usize,
    pub cache_ttl: Duration,
    pub format: FeedFormat,
    pub delimiter: u8,
    /// Feeds serializing to more than this are cached in chunks
    pub chunk_threshold_bytes: usize,
    pub chunk_rows: usize,
}

/// Cached feeds, batch ledgers, saved progress and the run lock.
///
/// Needs no catalog, so a run can be inspected or abandoned offline.
pub struct RunStore {
    store: Arc<dyn KvStore>,
    cache: ChunkedCache,
}

impl RunStore {
    /// `cache` has to write to `store`
    pub fn new(store: Arc<dyn KvStore>, cache: ChunkedCache) -> Self {
        Self { store, cache }
    }

    pub fn is_cached(&self, cache_key: &str) -> Result<bool, ImportError> {
        Ok(self.cache.contains(cache_key)?)
    }

    fn ledger_index_key(cache_key: &str) -> String {
        format!("{cache_key}_batches")
    }

    fn ledger_keys_key(cache_key: &str, offset: usize) -> String {
        format!("{cache_key}_batch_{offset}")
    }

    fn in_flight_key(cache_key: &str) -> String {
        format!("{cache_key}_inflight")
    }

    /// Cached feed, ledger and index of a run
    fn purge_run(&self, cache_key: &str) -> Result<(), ImportError> {
        let store = self.store.as_ref();
        self.cache.purge(cache_key)?;

        let index_key = Self::ledger_index_key(cache_key);
        let ledger: BTreeMap<usize, LedgerEntry> = store.get_json(&index_key)?.unwrap_or_default();
        for offset in ledger.keys() {
            store.delete(&Self::ledger_keys_key(cache_key, *offset))?;
        }
        store.delete(&index_key)?;
        store.delete(&ExistingRecordIndex::storage_key(cache_key))?;
        store.delete(&Self::in_flight_key(cache_key))?;

        debug!(cache_key, batches = ledger.len(), "purged run data");
        Ok(())
    }

    /// The saved run state, if its cached feed can still be read.
    ///
    /// A saved state whose feed expired is dropped. The run lock is left
    /// alone: a live lock makes the next fetch fail with [`ImportError::RunLocked`],
    /// a stale one is released by that fetch.
    pub fn resumable_run(&self) -> Result<Option<ImportRunState>, ImportError> {
        let store = self.store.as_ref();
        match ImportRunState::load(store)? {
            Some(state) if self.is_cached(&state.cache_key)? => Ok(Some(state)),
            Some(state) => {
                warn!(cache_key = %state.cache_key, "dropping progress of a run whose cache expired");
                ImportRunState::clear(store)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn run_state(&self) -> Result<Option<ImportRunState>, ImportError> {
        Ok(ImportRunState::load(self.store.as_ref())?)
    }

    /// Forget the saved progress and release the lock, the cache is left to expire
    pub fn clear_run_state(&self) -> Result<Option<String>, ImportError> {
        let store = self.store.as_ref();
        let cache_key = self.active_cache_key()?;
        ImportRunState::clear(store)?;
        if let Some(cache_key) = &cache_key {
            RunLock::release(store, cache_key)?;
        }
        Ok(cache_key)
    }

    /// Abandon the active run: purge its cache and clear its state
    pub fn discard(&self) -> Result<Option<String>, ImportError> {
        let cache_key = self.active_cache_key()?;
        if let Some(cache_key) = &cache_key {
            self.purge_run(cache_key)?;
            info!(%cache_key, "discarded import run");
        }
        self.clear_run_state()?;
        Ok(cache_key)
    }

    fn active_cache_key(&self) -> Result<Option<String>, ImportError> {
        let store = self.store.as_ref();
        if let Some(state) = ImportRunState::load(store)? {
            return Ok(Some(state.cache_key));
        }
        Ok(RunLock::current(store)?.map(|lock| lock.cache_key))
    }
}

pub struct Orchestrator {
    runs: RunStore,
    catalog: Arc<dyn CatalogStore>,
    validator: RowValidator,
    script: Option<RowScript>,
    history: Option<ImportHistory>,
    settings: ImportSettings,
}

/// Log lines of a single batch, mirrored to tracing
#[derive(Debug, Default)]
struct BatchLog {
    lines: Vec<String>,
}

impl BatchLog {
    fn info(&mut self, line: String) {
        info!("{line}");
        self.lines.push(line);
    }

    fn skip(&mut self, line: String) {
        debug!("{line}");
        self.lines.push(line);
    }

    fn failure(&mut self, line: String) {
        warn!("{line}");
        self.lines.push(line);
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn KvStore>,
        catalog: Arc<dyn CatalogStore>,
        validator: RowValidator,
        settings: ImportSettings,
    ) -> Self {
        assert!(settings.batch_size > 0, "batch size must be positive");
        let cache = ChunkedCache::with_limits(
            Arc::clone(&store),
            settings.cache_ttl,
            settings.chunk_threshold_bytes,
            settings.chunk_rows,
        );
        Self {
            runs: RunStore::new(store, cache),
            catalog,
            validator,
            script: None,
            history: None,
            settings,
        }
    }

    pub fn with_script(mut self, script: Option<RowScript>) -> Self {
        self.script = script;
        self
    }

    pub fn with_history(mut self, history: ImportHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Phase 1 over the remote transport
    pub fn start_fetch(
        &self,
        fetcher: &RemoteFetcher,
        target: &SftpTarget,
    ) -> Result<FetchSummary, ImportError> {
        self.ensure_no_active_run()?;
        let bytes = fetcher.fetch(target).map_err(|e| {
            let e = ImportError::from(e);
            self.record_failure(&e);
            e
        })?;
        self.start_from_bytes(bytes)
    }

    /// Phase 1 for an already downloaded feed
    pub fn start_from_bytes(&self, bytes: Vec<u8>) -> Result<FetchSummary, ImportError> {
        self.ensure_no_active_run()?;

        let removed = self.runs.store.purge_expired()?;
        if removed > 0 {
            info!(removed, "removed expired cache entries of abandoned runs");
        }

        let file_size_bytes = bytes.len();
        let parsed = feed::parse(&bytes, self.settings.format, self.settings.delimiter)
            .map_err(|e| {
                let e = ImportError::from(e);
                self.record_failure(&e);
                e
            })?;
        drop(bytes);

        let cache_key = format!("feed_{}", uuid::Uuid::new_v4().simple());
        let total_rows = parsed.rows.len();
        let header = parsed.header.clone();
        let layout = self
            .runs
            .cache
            .store(&cache_key, parsed.header, parsed.rows, total_rows)?;

        // a previous run that is no longer resumable
        ImportRunState::clear(self.runs.store.as_ref())?;
        RunLock::acquire(self.runs.store.as_ref(), &cache_key, self.settings.cache_ttl)?;

        info!(%cache_key, total_rows, file_size_bytes, ?layout, "feed downloaded and cached");
        Ok(FetchSummary {
            cache_key,
            total_rows,
            header,
            file_size_bytes,
        })
    }

    fn ensure_no_active_run(&self) -> Result<(), ImportError> {
        let Some(lock) = RunLock::current(self.runs.store.as_ref())? else {
            return Ok(());
        };

        if self.runs.is_cached(&lock.cache_key)? {
            return Err(ImportError::RunLocked(lock.cache_key));
        }

        warn!(cache_key = %lock.cache_key, "ignoring run lock of a run whose cache expired");
        RunLock::release(self.runs.store.as_ref(), &lock.cache_key)?;
        Ok(())
    }

    /// Phase 2: process the rows `offset..offset + batch_size` of the cached feed
    pub fn process_batch(&self, cache_key: &str, offset: usize) -> Result<BatchReport, ImportError> {
        let window = self
            .runs
            .cache
            .read_window(cache_key, offset, self.settings.batch_size)?;
        let total_rows = window.total_rows;
        debug!(
            cache_key,
            offset,
            chunked = window.is_chunked,
            downloaded_at = %window.downloaded_at,
            "loaded batch window"
        );
        if offset > 0 && offset >= total_rows {
            return Err(ImportError::InvalidOffset { offset, total_rows });
        }

        let mut log = BatchLog::default();
        let end = (offset + self.settings.batch_size).min(total_rows);
        log.info(format!(
            "Importing rows {} to {} of {}",
            offset + 1,
            end,
            total_rows
        ));

        let mut index = self.existing_index(cache_key, offset, &mut log)?;
        self.runs.store.set_json(
            &RunStore::in_flight_key(cache_key),
            &offset,
            Some(self.settings.cache_ttl),
        )?;

        let mut counters = OutcomeCounters::default();
        let mut processed_keys: Vec<String> = vec![];

        // decode and script first, so the image probes of the batch can run in parallel
        let mut prepared: Vec<(usize, FeedRow)> = Vec::with_capacity(window.rows.len());
        for (i, raw) in window.rows.into_iter().enumerate() {
            let row_number = offset + i + 1;
            let row = match decode_row(&window.header, raw) {
                Ok(row) => row,
                Err(defect) => {
                    counters.skipped_defective += 1;
                    log.skip(format!("Row {row_number} skipped ({defect})"));
                    continue;
                }
            };

            let row = match &self.script {
                None => row,
                Some(script) => {
                    let key = row.business_key();
                    match script.run(row) {
                        Ok(ScriptOutcome::Keep(row)) => row,
                        Ok(ScriptOutcome::Skip(reason)) => {
                            self.count_rejection(
                                &mut counters,
                                &mut processed_keys,
                                &mut log,
                                row_number,
                                key.as_deref(),
                                Rejection::Script(reason),
                            );
                            continue;
                        }
                        Err(e) => {
                            self.count_rejection(
                                &mut counters,
                                &mut processed_keys,
                                &mut log,
                                row_number,
                                key.as_deref(),
                                Rejection::Script(e.to_string()),
                            );
                            continue;
                        }
                    }
                }
            };

            prepared.push((row_number, row));
        }

        let probed = self.validator.warm(prepared.iter().map(|(_, row)| row));
        if probed > 0 {
            debug!(probed, "image probes done for batch");
        }

        let reconciler = Reconciler::new(self.catalog.as_ref());
        for (row_number, row) in &prepared {
            let row_number = *row_number;
            if let Err(rejection) = self.validator.validate(row) {
                self.count_rejection(
                    &mut counters,
                    &mut processed_keys,
                    &mut log,
                    row_number,
                    row.business_key().as_deref(),
                    rejection,
                );
                continue;
            }

            // validated rows always carry a key
            let business_key = row.business_key().unwrap_or_default();
            processed_keys.push(business_key.clone());
            match reconciler.reconcile(row, &mut index) {
                Ok(Outcome::Created(_)) => counters.imported += 1,
                Ok(Outcome::Updated(_)) => counters.updated += 1,
                Err(e) => {
                    log.failure(format!(
                        "Row {row_number}: failed to write record for {business_key}: {e}"
                    ));
                    continue;
                }
            }

            if row_number % 10 == 0 {
                log.info(format!("Processed {business_key} ({row_number}/{total_rows})"));
            }
        }

        index.save(self.runs.store.as_ref(), cache_key)?;
        let totals = self.record_batch(cache_key, offset, end - offset, counters, &processed_keys)?;
        self.runs.store.delete(&RunStore::in_flight_key(cache_key))?;

        log.info(format!(
            "Batch done: {} imported, {} updated, {} skipped",
            counters.imported,
            counters.updated,
            counters.skipped()
        ));

        let done = end >= total_rows;
        let report = if done {
            self.finish_run(cache_key, offset, total_rows, counters, totals, log)?
        } else {
            let mut state = match ImportRunState::load(self.runs.store.as_ref())? {
                Some(state) if state.cache_key == cache_key => state,
                _ => ImportRunState::new(cache_key, total_rows),
            };
            state.offset = end;
            state.total_rows = total_rows;
            state.counters = totals;
            state.push_log(log.lines.iter().cloned());
            state.save(self.runs.store.as_ref(), self.settings.cache_ttl)?;

            BatchReport {
                cache_key: cache_key.to_owned(),
                offset,
                next_offset: end,
                total_rows,
                progress: progress_percent(end, total_rows),
                done: false,
                batch: counters,
                totals,
                log: log.lines,
            }
        };

        Ok(report)
    }

    fn existing_index(
        &self,
        cache_key: &str,
        offset: usize,
        log: &mut BatchLog,
    ) -> Result<ExistingRecordIndex, ImportError> {
        let store = self.runs.store.as_ref();
        // an interrupted attempt may have created records the cached index misses
        let interrupted = store.get(&RunStore::in_flight_key(cache_key))?.is_some();
        if offset > 0 && !interrupted {
            if let Some(index) = ExistingRecordIndex::load(store, cache_key)? {
                return Ok(index);
            }
        }

        let index = ExistingRecordIndex::build(self.catalog.as_ref())?;
        index.save(store, cache_key)?;
        log.info(format!(
            "Built existing part number map ({} existing parts)",
            index.len()
        ));
        Ok(index)
    }

    fn count_rejection(
        &self,
        counters: &mut OutcomeCounters,
        processed_keys: &mut Vec<String>,
        log: &mut BatchLog,
        row_number: usize,
        business_key: Option<&str>,
        rejection: Rejection,
    ) {
        match &rejection {
            Rejection::InvalidImage { .. } => counters.skipped_no_image += 1,
            Rejection::HiddenCategory { .. } => counters.skipped_hidden_category += 1,
            Rejection::MissingKey | Rejection::Script(_) => counters.skipped_defective += 1,
        }

        // a skipped row still protects its record from the deactivation sweep
        let business_key = business_key.map(str::trim).filter(|k| !k.is_empty());
        if let Some(key) = business_key {
            processed_keys.push(key.to_owned());
        }

        let detail = match &rejection {
            Rejection::InvalidImage { url } if !url.is_empty() => format!(" {url}"),
            Rejection::HiddenCategory { category } => format!(" {category}"),
            _ => String::new(),
        };
        match business_key {
            Some(key) => log.skip(format!("Row {row_number} skipped {key} ({rejection}{detail})")),
            None => log.skip(format!("Row {row_number} skipped ({rejection}{detail})")),
        }
    }

    /// Store the batch in the ledger and return the run totals.
    ///
    /// Re-running an offset overwrites its entry, so the totals never count a window twice.
    fn record_batch(
        &self,
        cache_key: &str,
        offset: usize,
        rows: usize,
        counters: OutcomeCounters,
        processed_keys: &[String],
    ) -> Result<OutcomeCounters, ImportError> {
        let store = self.runs.store.as_ref();
        let ttl = Some(self.settings.cache_ttl);

        store.set_json(&RunStore::ledger_keys_key(cache_key, offset), &processed_keys, ttl)?;

        let index_key = RunStore::ledger_index_key(cache_key);
        let mut ledger: BTreeMap<usize, LedgerEntry> =
            store.get_json(&index_key)?.unwrap_or_default();
        ledger.insert(offset, LedgerEntry { rows, counters });
        store.set_json(&index_key, &ledger, ttl)?;

        let mut totals = OutcomeCounters::default();
        for entry in ledger.values() {
            totals += entry.counters;
        }
        Ok(totals)
    }

    fn finish_run(
        &self,
        cache_key: &str,
        offset: usize,
        total_rows: usize,
        batch: OutcomeCounters,
        mut totals: OutcomeCounters,
        mut log: BatchLog,
    ) -> Result<BatchReport, ImportError> {
        let store = self.runs.store.as_ref();
        let ledger: BTreeMap<usize, LedgerEntry> = store
            .get_json(&RunStore::ledger_index_key(cache_key))?
            .unwrap_or_default();

        // every row has to be covered, a skipped window would deactivate its records
        let mut covered = 0;
        for (offset, entry) in &ledger {
            if *offset > covered {
                break;
            }
            covered = covered.max(offset + entry.rows);
        }
        if covered < total_rows {
            return Err(ImportError::IncompleteRun(covered));
        }

        let mut processed_keys = HashSet::new();
        for offset in ledger.keys() {
            let keys: Vec<String> = store
                .get_json(&RunStore::ledger_keys_key(cache_key, *offset))?
                .ok_or_else(|| CacheError::Expired(RunStore::ledger_keys_key(cache_key, *offset)))?;
            processed_keys.extend(keys);
        }

        let deactivated = DeactivationSweep::new(self.catalog.as_ref()).sweep(&processed_keys)?;
        totals.deactivated = deactivated;
        let mut batch = batch;
        batch.deactivated = deactivated;
        if deactivated > 0 {
            log.info(format!(
                "Deactivated {deactivated} records no longer present in the feed"
            ));
        }

        self.runs.purge_run(cache_key)?;
        ImportRunState::clear(store)?;
        RunLock::release(store, cache_key)?;

        let message = format!(
            "Import completed! Imported: {}, Updated: {}, Skipped: {}, Deactivated: {}",
            totals.imported,
            totals.updated,
            totals.skipped(),
            totals.deactivated
        );
        log.info(message.clone());

        if let Some(history) = &self.history {
            let entry = HistoryEntry {
                created_at: Utc::now(),
                file_type: self.settings.format,
                imported: totals.imported,
                updated: totals.updated,
                deactivated: totals.deactivated,
                skipped: totals.skipped(),
                status: ImportStatus::Success,
                message,
            };
            if let Err(e) = history.append(&entry) {
                warn!(error = %e, "could not write import history");
            }
        }

        Ok(BatchReport {
            cache_key: cache_key.to_owned(),
            offset,
            next_offset: total_rows,
            total_rows,
            progress: 100.0,
            done: true,
            batch,
            totals,
            log: log.lines,
        })
    }

    fn record_failure(&self, e: &ImportError) {
        error!(error = %e, "import failed");
        if let Some(history) = &self.history {
            let entry = HistoryEntry::error(self.settings.format, e.to_string());
            if let Err(e) = history.append(&entry) {
                warn!(error = %e, "could not write import history");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryKvStore;
    use crate::catalog::memory::MemoryCatalog;
    use crate::catalog::RecordStatus;
    use crate::data::validate::tests::FixedProbe;
    use crate::data::validate::ImportPolicy;

    const TTL: Duration = Duration::from_secs(6 * 60 * 60);
    const OK_IMAGE: &str = "https://img.example.com/ok.jpg";

    struct Harness {
        store: Arc<MemoryKvStore>,
        catalog: Arc<MemoryCatalog>,
        orchestrator: Orchestrator,
    }

    fn harness(batch_size: usize, validate_images: bool) -> Harness {
        harness_with(Arc::new(MemoryCatalog::new()), batch_size, validate_images)
    }

    fn harness_with(catalog: Arc<MemoryCatalog>, batch_size: usize, validate_images: bool) -> Harness {
        harness_with_settings(catalog, settings(batch_size), validate_images)
    }

    fn settings(batch_size: usize) -> ImportSettings {
        ImportSettings {
            batch_size,
            cache_ttl: TTL,
            format: FeedFormat::Csv,
            delimiter: b',',
            chunk_threshold_bytes: ChunkedCache::THRESHOLD_BYTES,
            chunk_rows: ChunkedCache::CHUNK_SIZE,
        }
    }

    fn harness_with_settings(
        catalog: Arc<MemoryCatalog>,
        settings: ImportSettings,
        validate_images: bool,
    ) -> Harness {
        let store = Arc::new(MemoryKvStore::new());
        let policy = ImportPolicy::new(["Moto Metal"], "Brand", validate_images);
        let validator = RowValidator::new(
            policy,
            Arc::new(FixedProbe::reachable([OK_IMAGE])),
            store.clone(),
            2,
        )
        .unwrap();
        let orchestrator = Orchestrator::new(store.clone(), catalog.clone(), validator, settings);

        Harness {
            store,
            catalog,
            orchestrator,
        }
    }

    /// `PartNumber,PartDescription,Brand,ImageURL` rows
    fn feed(rows: &[[&str; 4]]) -> Vec<u8> {
        let mut csv = String::from("PartNumber,PartDescription,Brand,ImageURL\n");
        for row in rows {
            csv.push_str(&row.join(","));
            csv.push('\n');
        }
        csv.into_bytes()
    }

    fn numbered_feed(count: usize) -> Vec<u8> {
        let rows: Vec<[String; 4]> = (0..count)
            .map(|i| {
                [
                    format!("P{i:03}"),
                    format!("wheel {i}"),
                    "Fuel".to_string(),
                    OK_IMAGE.to_string(),
                ]
            })
            .collect();
        let rows: Vec<[&str; 4]> = rows
            .iter()
            .map(|[a, b, c, d]| [a.as_str(), b.as_str(), c.as_str(), d.as_str()])
            .collect();
        feed(&rows)
    }

    /// Drive phase 2 until the run is done, returns the last report
    fn run_to_end(orchestrator: &Orchestrator, cache_key: &str) -> BatchReport {
        let mut offset = 0;
        loop {
            let report = orchestrator.process_batch(cache_key, offset).unwrap();
            if report.done {
                return report;
            }
            assert!(report.next_offset > offset);
            offset = report.next_offset;
        }
    }

    #[test]
    fn retried_batch_does_not_duplicate() {
        let h = harness(10, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(20)).unwrap();
        assert_eq!(summary.total_rows, 20);

        let first = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert_eq!(first.batch.imported, 10);
        let retry = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert_eq!(retry.batch.imported, 0);
        assert_eq!(retry.batch.updated, 10);
        // the retried window replaced the first attempt in the totals
        assert_eq!(retry.totals.imported + retry.totals.updated, 10);
        assert_eq!(h.catalog.records().len(), 10);
        assert_eq!(h.catalog.count_with_status(RecordStatus::Active), 10);

        let last = h.orchestrator.process_batch(&summary.cache_key, 10).unwrap();
        assert!(last.done);
        assert_eq!(h.catalog.records().len(), 20);
    }

    #[test]
    fn interrupted_batch_rebuilds_the_index() {
        let h = harness(5, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(10)).unwrap();
        h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        // an attempt at offset 5 created P005 and died before finishing
        h.catalog.insert("P005", RecordStatus::Active);
        h.store
            .set_json(&format!("{}_inflight", summary.cache_key), &5, None)
            .unwrap();

        let report = h.orchestrator.process_batch(&summary.cache_key, 5).unwrap();
        assert!(report.done);
        assert_eq!(report.batch.imported, 4);
        assert_eq!(report.batch.updated, 1);
        assert_eq!(h.catalog.by_key("P005").len(), 1);
        assert_eq!(h.catalog.records().len(), 10);
    }

    #[test]
    fn three_row_scenario() {
        let h = harness(25, false);
        let summary = h
            .orchestrator
            .start_from_bytes(feed(&[
                ["A100", "first", "Fuel", OK_IMAGE],
                ["A100", "second", "Fuel", OK_IMAGE],
                ["", "no key", "Fuel", OK_IMAGE],
            ]))
            .unwrap();

        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert!(report.done);
        assert_eq!(report.totals.imported, 1);
        assert_eq!(report.totals.updated, 1);
        assert_eq!(report.totals.skipped(), 1);
        assert!(report.log.iter().any(|l| l == "Row 3 skipped (missing key)"));

        let records = h.catalog.by_key("A100");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Active);
        assert_eq!(
            records[0].attributes.get("part_description").map(String::as_str),
            Some("second")
        );
    }

    #[test]
    fn column_mismatch_is_skipped() {
        let h = harness(25, false);
        let mut bytes = feed(&[["A100", "ok", "Fuel", OK_IMAGE]]);
        bytes.extend_from_slice(b"A200,short\nA300,ok,Fuel,x\n");
        let summary = h.orchestrator.start_from_bytes(bytes).unwrap();

        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert!(report.done);
        assert_eq!(report.totals.imported, 2);
        assert_eq!(report.totals.skipped_defective, 1);
        assert!(report
            .log
            .iter()
            .any(|l| l == "Row 2 skipped (column count mismatch)"));
        assert!(h.catalog.by_key("A200").is_empty());
    }

    #[test]
    fn deactivation_and_reactivation() {
        let catalog = Arc::new(MemoryCatalog::new());
        let gone = catalog.insert("X900", RecordStatus::Active);
        let h = harness_with(catalog, 2, false);

        let summary = h
            .orchestrator
            .start_from_bytes(feed(&[
                ["A100", "a", "Fuel", OK_IMAGE],
                ["B200", "b", "Fuel", OK_IMAGE],
                ["C300", "c", "Fuel", OK_IMAGE],
            ]))
            .unwrap();
        let report = run_to_end(&h.orchestrator, &summary.cache_key);
        assert_eq!(report.totals.imported, 3);
        assert_eq!(report.totals.deactivated, 1);
        assert_eq!(h.catalog.by_key("X900")[0].status, RecordStatus::Inactive);

        // X900 is back in the next feed
        let summary = h
            .orchestrator
            .start_from_bytes(feed(&[
                ["A100", "a", "Fuel", OK_IMAGE],
                ["X900", "back again", "Fuel", OK_IMAGE],
            ]))
            .unwrap();
        let report = run_to_end(&h.orchestrator, &summary.cache_key);
        assert_eq!(report.totals.updated, 2);
        assert_eq!(report.totals.deactivated, 2);

        let records = h.catalog.by_key("X900");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, gone);
        assert_eq!(records[0].status, RecordStatus::Active);
        assert_eq!(
            records[0].attributes.get("part_description").map(String::as_str),
            Some("back again")
        );
        assert_eq!(h.catalog.by_key("B200")[0].status, RecordStatus::Inactive);
    }

    #[test]
    fn part_number_with_inner_whitespace_stays_active() {
        let h = harness(25, false);
        let bytes = feed(&[
            ["A  100", "x", "Fuel", OK_IMAGE],
            ["B200", "y", "Fuel", OK_IMAGE],
        ]);

        let summary = h.orchestrator.start_from_bytes(bytes.clone()).unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert_eq!(report.totals.imported, 2);
        assert_eq!(report.totals.deactivated, 0);
        assert_eq!(h.catalog.by_key("A 100")[0].status, RecordStatus::Active);

        // the next run finds the stored key again
        let summary = h.orchestrator.start_from_bytes(bytes).unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert_eq!(report.totals.updated, 2);
        assert_eq!(report.totals.deactivated, 0);
        assert_eq!(h.catalog.records().len(), 2);
        assert_eq!(h.catalog.count_with_status(RecordStatus::Active), 2);
    }

    #[test]
    fn skipped_rows_protect_their_records() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("H100", RecordStatus::Active);
        catalog.insert("I100", RecordStatus::Active);
        let h = harness_with(catalog, 25, true);

        let summary = h
            .orchestrator
            .start_from_bytes(feed(&[
                ["H100", "hidden", "Moto Metal", OK_IMAGE],
                ["I100", "bad image", "Fuel", "https://img.example.com/404.jpg"],
                ["A100", "fine", "Fuel", OK_IMAGE],
            ]))
            .unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        assert!(report.done);
        assert_eq!(report.totals.skipped_hidden_category, 1);
        assert_eq!(report.totals.skipped_no_image, 1);
        assert_eq!(report.totals.imported, 1);
        assert_eq!(report.totals.deactivated, 0);
        assert_eq!(h.catalog.by_key("H100")[0].status, RecordStatus::Active);
        assert_eq!(h.catalog.by_key("I100")[0].status, RecordStatus::Active);
        // skipped rows are not written
        assert_eq!(
            h.catalog.by_key("H100")[0].attributes.get("part_description"),
            None
        );
        assert!(report
            .log
            .iter()
            .any(|l| l == "Row 1 skipped H100 (hidden category Moto Metal)"));
    }

    #[test]
    fn write_failure_skips_the_row() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.reject_creates_for("B200");
        let h = harness_with(catalog, 25, false);

        let summary = h
            .orchestrator
            .start_from_bytes(feed(&[
                ["A100", "a", "Fuel", OK_IMAGE],
                ["B200", "b", "Fuel", OK_IMAGE],
            ]))
            .unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        assert!(report.done);
        assert_eq!(report.totals.imported, 1);
        assert_eq!(report.totals.skipped(), 0);
        assert!(report
            .log
            .iter()
            .any(|l| l.starts_with("Row 2: failed to write record for B200")));
        assert_eq!(h.catalog.records().len(), 1);
    }

    #[test]
    fn progress_is_saved_between_batches() {
        let h = harness(4, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(10)).unwrap();
        assert_eq!(h.orchestrator.runs().run_state().unwrap(), None);

        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert!(!report.done);
        assert_eq!(report.next_offset, 4);
        assert_eq!(report.progress, 40.0);

        let state = h.orchestrator.runs().resumable_run().unwrap().unwrap();
        assert_eq!(state.cache_key, summary.cache_key);
        assert_eq!(state.offset, 4);
        assert_eq!(state.counters.imported, 4);
        assert_eq!(state.log.first().map(String::as_str), Some("Importing rows 1 to 4 of 10"));

        h.orchestrator.process_batch(&summary.cache_key, 4).unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 8).unwrap();
        assert!(report.done);
        assert_eq!(report.totals.imported, 10);
        assert_eq!(h.orchestrator.runs().run_state().unwrap(), None);

        // nothing of the run is left behind
        assert_eq!(h.store.keys(), Vec::<String>::new());
    }

    #[test]
    fn expired_cache_is_an_error() {
        let h = harness(25, false);
        let result = h.orchestrator.process_batch("feed_unknown", 0);
        assert!(matches!(result, Err(ImportError::CacheExpired(_))));

        let summary = h.orchestrator.start_from_bytes(numbered_feed(3)).unwrap();
        let result = h.orchestrator.process_batch(&summary.cache_key, 50);
        assert!(matches!(result, Err(ImportError::InvalidOffset { .. })));
    }

    #[test]
    fn skipped_window_blocks_the_sweep() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert("P000", RecordStatus::Active);
        let h = harness_with(catalog, 5, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(10)).unwrap();

        let result = h.orchestrator.process_batch(&summary.cache_key, 5);
        assert!(matches!(result, Err(ImportError::IncompleteRun(0))));
        assert_eq!(h.catalog.by_key("P000")[0].status, RecordStatus::Active);

        h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        let report = h.orchestrator.process_batch(&summary.cache_key, 5).unwrap();
        assert!(report.done);
        // the early window created P005..P009, the retry updates them
        assert_eq!(report.totals.imported, 4);
        assert_eq!(report.totals.updated, 6);
        assert_eq!(h.catalog.records().len(), 10);
    }

    #[test]
    fn one_run_at_a_time() {
        let h = harness(25, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(3)).unwrap();

        let result = h.orchestrator.start_from_bytes(numbered_feed(3));
        assert!(matches!(result, Err(ImportError::RunLocked(key)) if key == summary.cache_key));

        assert_eq!(
            h.orchestrator.runs().discard().unwrap(),
            Some(summary.cache_key.clone())
        );
        let result = h.orchestrator.process_batch(&summary.cache_key, 0);
        assert!(matches!(result, Err(ImportError::CacheExpired(_))));

        assert!(h.orchestrator.start_from_bytes(numbered_feed(3)).is_ok());
    }

    #[test]
    fn unfinished_first_batch_keeps_the_lock() {
        let h = harness(25, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(30)).unwrap();

        // no progress saved yet, so a second `run` finds nothing to resume
        assert_eq!(h.orchestrator.runs().resumable_run().unwrap(), None);

        let result = h.orchestrator.start_from_bytes(numbered_feed(3));
        assert!(matches!(result, Err(ImportError::RunLocked(key)) if key == summary.cache_key));
        assert_eq!(
            RunLock::current(h.store.as_ref()).unwrap().map(|lock| lock.cache_key),
            Some(summary.cache_key.clone())
        );

        let report = h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert_eq!(report.next_offset, 25);
    }

    #[test]
    fn expired_progress_is_dropped() {
        let h = harness(2, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(5)).unwrap();
        h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        assert!(h.orchestrator.runs().run_state().unwrap().is_some());

        h.store.expire(&summary.cache_key);
        assert_eq!(h.orchestrator.runs().resumable_run().unwrap(), None);
        assert_eq!(h.orchestrator.runs().run_state().unwrap(), None);

        // the stale lock goes with the next fetch
        assert!(h.orchestrator.start_from_bytes(numbered_feed(3)).is_ok());
    }

    #[test]
    fn batch_window_across_chunks() {
        let settings = ImportSettings {
            chunk_threshold_bytes: 0,
            chunk_rows: 3,
            ..settings(4)
        };
        let h = harness_with_settings(Arc::new(MemoryCatalog::new()), settings, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(10)).unwrap();
        let chunk = |i: usize| format!("{}_chunk_{i}", summary.cache_key);
        assert!(h.store.keys().contains(&chunk(3)));

        h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();
        h.store.clear_reads();
        let report = h.orchestrator.process_batch(&summary.cache_key, 4).unwrap();

        // rows 5 to 8 live in chunks 1 and 2
        let chunk_reads: Vec<String> = h
            .store
            .reads()
            .into_iter()
            .filter(|key| key.contains("_chunk_"))
            .collect();
        assert_eq!(chunk_reads, vec![chunk(1), chunk(2)]);
        assert_eq!(report.totals.imported, 8);
        assert!(report
            .log
            .iter()
            .any(|l| l == "Importing rows 5 to 8 of 10"));

        let report = h.orchestrator.process_batch(&summary.cache_key, 8).unwrap();
        assert!(report.done);
        assert_eq!(report.totals.imported, 10);
        assert_eq!(h.catalog.records().len(), 10);
        assert_eq!(h.store.keys(), Vec::<String>::new());
    }

    #[test]
    fn run_store_works_on_its_own() {
        let h = harness(2, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(5)).unwrap();
        h.orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        // what `status` and `discard` open, no catalog involved
        let cache =
            ChunkedCache::with_limits(h.store.clone(), TTL, ChunkedCache::THRESHOLD_BYTES, 1000);
        let runs = RunStore::new(h.store.clone(), cache);
        assert!(runs.is_cached(&summary.cache_key).unwrap());
        assert_eq!(runs.run_state().unwrap().map(|s| s.offset), Some(2));

        assert_eq!(runs.discard().unwrap(), Some(summary.cache_key.clone()));
        assert!(!runs.is_cached(&summary.cache_key).unwrap());
        assert_eq!(h.store.keys(), Vec::<String>::new());
    }

    #[test]
    fn stale_lock_is_ignored() {
        let h = harness(25, false);
        let summary = h.orchestrator.start_from_bytes(numbered_feed(3)).unwrap();
        h.store.expire(&summary.cache_key);

        assert!(h.orchestrator.start_from_bytes(numbered_feed(3)).is_ok());
    }

    #[test]
    fn row_script_can_reject() {
        let h = harness(25, false);
        let script = RowScript::compile(r#"if row.Brand == "Fuel" { skip = "fuel is sold elsewhere"; }"#)
            .unwrap();
        let orchestrator = h.orchestrator.with_script(script);

        let summary = orchestrator
            .start_from_bytes(feed(&[
                ["A100", "a", "Fuel", OK_IMAGE],
                ["B200", "b", "Method", OK_IMAGE],
            ]))
            .unwrap();
        let report = orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        assert_eq!(report.totals.imported, 1);
        assert_eq!(report.totals.skipped_defective, 1);
        assert!(report.log.iter().any(|l| l
            == "Row 1 skipped A100 (rejected by row script: fuel is sold elsewhere)"));
    }

    #[test]
    fn history_records_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(25, false);
        let orchestrator = h
            .orchestrator
            .with_history(ImportHistory::in_dir(dir.path()));

        let result = orchestrator.start_from_bytes(b"PartNumber\n".to_vec());
        assert!(matches!(result, Err(ImportError::Parse(ParseError::Empty))));

        let summary = orchestrator.start_from_bytes(numbered_feed(2)).unwrap();
        orchestrator.process_batch(&summary.cache_key, 0).unwrap();

        let history = ImportHistory::in_dir(dir.path()).latest(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ImportStatus::Success);
        assert_eq!(history[0].imported, 2);
        assert_eq!(history[1].status, ImportStatus::Error);
        assert!(history[1].message.contains("empty or invalid"));
    }
}
