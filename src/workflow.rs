use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::Utc;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::convert::FormatConverter;
use crate::domain::{InternalId, ModelEntry, Provider, SourceId};
use crate::error::KiraError;
use crate::ledger::{
    CheckpointReport, HoldingsLedger, LedgerDiff, LedgerOptions, PlannedItem, ShardFailure,
};
use crate::providers::{DownloadRef, ModelProvider, StagedItem};
use crate::reorganize::{EntryOutcome, ItemReport, Reorganizer};
use crate::shard::{ShardLayout, ShardPlanner};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub keep_source: bool,
    pub retry_failed: bool,
    pub dry_run: bool,
    pub provider_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            keep_source: false,
            retry_failed: false,
            dry_run: false,
            provider_attempts: 2,
            retry_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub internal_id: InternalId,
    pub source_id: SourceId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub provider: Provider,
    pub dry_run: bool,
    pub listed: usize,
    pub invalid: usize,
    pub new: usize,
    pub changed: usize,
    pub retried: usize,
    pub unchanged: u64,
    pub skipped_failed: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub aborted: usize,
    pub missing: usize,
    pub marked_stale: usize,
    pub revived: usize,
    pub discarded_pending: usize,
    pub failures: Vec<FailureRecord>,
    pub aborted_entries: Vec<FailureRecord>,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ProviderSummary {
    fn from_diff(provider: Provider, listed: usize, diff: &LedgerDiff, options: &RunOptions) -> Self {
        Self {
            provider,
            dry_run: options.dry_run,
            listed,
            invalid: diff.invalid.len(),
            new: diff.new.len(),
            changed: diff.changed.len(),
            retried: diff.retry.len() + if options.retry_failed { diff.failed.len() } else { 0 },
            unchanged: diff.unchanged,
            skipped_failed: if options.retry_failed { 0 } else { diff.failed.len() },
            created: 0,
            updated: 0,
            failed: 0,
            aborted: 0,
            missing: 0,
            marked_stale: 0,
            revived: 0,
            discarded_pending: 0,
            failures: Vec::new(),
            aborted_entries: Vec::new(),
            errors: Vec::new(),
            cancelled: false,
            elapsed_ms: 0,
        }
    }

    fn absorb(&mut self, report: ItemReport) {
        self.cancelled |= report.cancelled;
        for entry in report.entries {
            let record = |reason: String| FailureRecord {
                internal_id: entry.internal_id.clone(),
                source_id: entry.source_id.clone(),
                reason,
            };
            match entry.outcome {
                EntryOutcome::Created => self.created += 1,
                EntryOutcome::Updated => self.updated += 1,
                EntryOutcome::Unchanged => self.unchanged += 1,
                EntryOutcome::Missing => {
                    self.missing += 1;
                    self.aborted_entries
                        .push(record("no model member in staged item".to_string()));
                }
                EntryOutcome::Failed { reason } => {
                    self.failed += 1;
                    self.failures.push(record(reason));
                }
                EntryOutcome::Aborted { reason } => {
                    self.aborted += 1;
                    self.aborted_entries.push(record(reason));
                }
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.aborted == 0 && self.missing == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderRun {
    pub provider: Provider,
    pub attempts: u32,
    pub summary: Option<ProviderSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub providers: Vec<ProviderRun>,
    pub checkpoint: CheckpointReport,
    pub poisoned_shards: Vec<ShardFailure>,
    pub shards_over_threshold: Vec<(String, u64)>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.poisoned_shards.is_empty()
            && self.checkpoint.failed.is_empty()
            && self.providers.iter().all(|run| {
                run.error.is_none() && run.summary.as_ref().is_some_and(ProviderSummary::is_clean)
            })
    }

    pub fn ledger_failed(&self) -> bool {
        !self.poisoned_shards.is_empty() || !self.checkpoint.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocateResult {
    pub entry: ModelEntry,
    pub absolute_path: Utf8PathBuf,
}

pub struct Workflow {
    store: Store,
    planner: ShardPlanner,
    ledger: HoldingsLedger,
    converter: Box<dyn FormatConverter>,
    cancel: Arc<AtomicBool>,
}

impl Workflow {
    pub fn new(
        store: Store,
        planner: ShardPlanner,
        ledger: HoldingsLedger,
        converter: Box<dyn FormatConverter>,
    ) -> Self {
        Self {
            store,
            planner,
            ledger,
            converter,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(
        store: Store,
        layout: ShardLayout,
        ledger_options: LedgerOptions,
        converter: Box<dyn FormatConverter>,
    ) -> Result<Self, KiraError> {
        store.ensure_roots()?;
        let planner = ShardPlanner::new(store.models_root().to_path_buf(), layout)?;
        let ledger = HoldingsLedger::open(
            store.ledger_root().to_path_buf(),
            LedgerOptions {
                shard_layout: layout,
                ..ledger_options
            },
        )?;
        Ok(Self::new(store, planner, ledger, converter))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn planner(&self) -> &ShardPlanner {
        &self.planner
    }

    pub fn ledger(&self) -> &HoldingsLedger {
        &self.ledger
    }

    /// Setting the flag stops the run at the next member boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn diff(&self, provider: &dyn ModelProvider) -> Result<LedgerDiff, KiraError> {
        let listing = provider.list_available()?;
        self.ledger.diff(provider.provider(), listing)
    }

    pub fn locate(&self, provider: Provider, source_id: &str) -> Result<Option<LocateResult>, KiraError> {
        Ok(self
            .ledger
            .lookup_source(provider, source_id)?
            .map(|entry| LocateResult {
                absolute_path: self.planner.absolute_path_for(&entry.internal_id),
                entry,
            }))
    }

    pub fn run(
        &self,
        providers: &[Box<dyn ModelProvider>],
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> RunSummary {
        let mut runs = Vec::with_capacity(providers.len());
        for provider in providers {
            if self.is_cancelled() {
                break;
            }
            let attempts_allowed = options.provider_attempts.max(1);
            let mut attempts = 0;
            let run = loop {
                attempts += 1;
                match self.run_provider(provider.as_ref(), options, sink) {
                    Ok(summary) => {
                        break ProviderRun {
                            provider: provider.provider(),
                            attempts,
                            summary: Some(summary),
                            error: None,
                        };
                    }
                    Err(err @ KiraError::Fetch { .. }) if attempts < attempts_allowed => {
                        warn!(
                            provider = %provider.provider(),
                            attempt = attempts,
                            error = %err,
                            "provider failed; retrying"
                        );
                        std::thread::sleep(options.retry_delay);
                    }
                    Err(err) => {
                        warn!(provider = %provider.provider(), error = %err, "provider run failed");
                        break ProviderRun {
                            provider: provider.provider(),
                            attempts,
                            summary: None,
                            error: Some(err.to_string()),
                        };
                    }
                }
            };
            runs.push(run);
        }

        let checkpoint = self.ledger.checkpoint();
        let shards_over_threshold = match self.ledger.shards_over_threshold() {
            Ok(shards) => shards,
            Err(err) => {
                warn!(error = %err, "cannot inspect ledger shard sizes");
                Vec::new()
            }
        };
        for (shard, entries) in &shards_over_threshold {
            warn!(shard = %shard, entries, "ledger shard exceeds partition threshold");
        }
        RunSummary {
            providers: runs,
            checkpoint,
            poisoned_shards: self.ledger.poisoned_shards(),
            shards_over_threshold,
            cancelled: self.is_cancelled(),
        }
    }

    pub fn run_provider(
        &self,
        provider: &dyn ModelProvider,
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ProviderSummary, KiraError> {
        let started = Instant::now();
        let kind = provider.provider();
        sink.event(ProgressEvent {
            message: format!("phase=List; provider={kind}"),
            elapsed: None,
        });
        let listing = provider.list_available()?;
        let listed = listing.len();
        self.planner.layout().check_capacity(listed as u64)?;

        sink.event(ProgressEvent {
            message: format!("phase=Diff; provider={kind}; listed={listed}"),
            elapsed: Some(started.elapsed()),
        });
        let diff = self.ledger.diff(kind, listing)?;
        let mut summary = ProviderSummary::from_diff(kind, listed, &diff, options);
        if options.dry_run {
            summary.elapsed_ms = elapsed_ms(started);
            return Ok(summary);
        }

        self.reconcile(&diff, &mut summary);

        let mut groups: BTreeMap<DownloadRef, Vec<PlannedItem>> = BTreeMap::new();
        for item in diff.to_process(options.retry_failed) {
            groups
                .entry(item.listing.download_ref.clone())
                .or_default()
                .push(item);
        }
        let groups: Vec<(DownloadRef, Vec<PlannedItem>)> = groups.into_iter().collect();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Reorganize; provider={kind}; items={}; downloads={}",
                groups.iter().map(|(_, items)| items.len()).sum::<usize>(),
                groups.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        let pool = ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .build()
            .map_err(|err| KiraError::Filesystem(format!("worker pool: {err}")))?;
        let reports: Vec<ItemReport> = pool.install(|| {
            groups
                .par_iter()
                .map(|(download_ref, items)| self.process_group(provider, download_ref, items, options))
                .collect()
        });
        for report in reports {
            summary.absorb(report);
        }
        summary.cancelled |= self.is_cancelled();
        summary.elapsed_ms = elapsed_ms(started);

        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; provider={kind}; created={}; updated={}; failed={}; aborted={}",
                summary.created, summary.updated, summary.failed, summary.aborted
            ),
            elapsed: Some(started.elapsed()),
        });
        info!(
            provider = %kind,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            aborted = summary.aborted,
            stale = summary.marked_stale,
            "provider run finished"
        );
        Ok(summary)
    }

    fn reconcile(&self, diff: &LedgerDiff, summary: &mut ProviderSummary) {
        for id in &diff.orphaned_pending {
            match self.discard_orphan(id) {
                Ok(true) => summary.discarded_pending += 1,
                Ok(false) => {}
                Err(err) => summary.errors.push(format!("discard {id}: {err}")),
            }
        }
        match self.ledger.clear_stale(&diff.revived) {
            Ok(count) => summary.revived = count,
            Err(err) => summary.errors.push(format!("clear stale markers: {err}")),
        }
        match self.ledger.mark_stale(&diff.stale, Utc::now()) {
            Ok(count) => summary.marked_stale = count,
            Err(err) => summary.errors.push(format!("mark stale entries: {err}")),
        }
    }

    fn discard_orphan(&self, id: &InternalId) -> Result<bool, KiraError> {
        let _leaf = self.planner.ensure_path(id)?;
        let removed = self.ledger.discard_pending(id)?;
        if removed {
            Store::remove_dir_if_exists(&self.planner.absolute_path_for(id))?;
            info!(internal_id = %id, "discarded unlisted pending entry");
        }
        Ok(removed)
    }

    fn process_group(
        &self,
        provider: &dyn ModelProvider,
        download_ref: &DownloadRef,
        items: &[PlannedItem],
        options: &RunOptions,
    ) -> ItemReport {
        let staged = if self.is_cancelled() {
            Err(KiraError::Cancelled)
        } else {
            let staging = self.store.staging_dir(provider.provider().key());
            fs::create_dir_all(staging.as_std_path())
                .map_err(|err| KiraError::Filesystem(format!("create {staging}: {err}")))
                .and_then(|_| provider.fetch(download_ref, &staging))
        };
        let staged = match staged {
            Ok(staged) => staged,
            Err(err) => {
                warn!(download_ref = %download_ref, error = %err, "fetch failed");
                return ItemReport::aborted(download_ref.clone(), items, &err);
            }
        };

        let report = Reorganizer::new(&self.planner, &self.ledger, self.converter.as_ref())
            .with_cancel(&self.cancel)
            .reorganize(provider.provider(), provider.source_id_rule(), &staged, items);
        let interrupted = report.cancelled
            || report.count(|outcome| matches!(outcome, EntryOutcome::Aborted { .. })) > 0;
        if interrupted && !options.keep_source {
            info!(download_ref = %download_ref, "keeping staged item of an interrupted reorganization");
        } else if !options.keep_source {
            discard_staged(&staged);
        }
        report
    }
}

fn discard_staged(staged: &StagedItem) {
    if !staged.owned {
        return;
    }
    for part in &staged.parts {
        if let Err(err) = fs::remove_file(part.path.as_std_path()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %part.path, error = %err, "cannot remove staged file");
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
