use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{EntryStatus, InternalId, ModelEntry, Provider, SourceId};
use crate::error::KiraError;
use crate::id_map::IdMapper;
use crate::journal::{JournalRecord, SCHEMA_VERSION, ShardFiles, default_schema_version};
use crate::providers::ListingItem;
use crate::shard::ShardLayout;
use crate::store::Store;

pub const MANIFEST_FILE: &str = "holdings-manifest.json";
pub const DEFAULT_PARTITION_THRESHOLD: u64 = 5_000_000;
const PARTITION_STAGING_DIR: &str = ".partition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ShardRouting {
    Single,
    #[default]
    ByProvider,
    ByProviderRange { prefix_len: u8 },
}

impl ShardRouting {
    pub fn validate(&self) -> Result<(), KiraError> {
        if let ShardRouting::ByProviderRange { prefix_len } = self {
            if !(1..=4).contains(prefix_len) {
                return Err(KiraError::LedgerSchema(format!(
                    "range prefix length must be within 1..=4, got {prefix_len}"
                )));
            }
        }
        Ok(())
    }

    pub fn shard_for(&self, id: &InternalId) -> String {
        match self {
            ShardRouting::Single => "all".to_string(),
            ShardRouting::ByProvider => id.provider().key().to_string(),
            ShardRouting::ByProviderRange { prefix_len } => format!(
                "{}-{}",
                id.provider().key(),
                id.digest()[..usize::from(*prefix_len)].to_lowercase()
            ),
        }
    }

    pub fn may_hold(&self, shard: &str, provider: Provider) -> bool {
        match self {
            ShardRouting::Single => shard == "all",
            ShardRouting::ByProvider => shard == provider.key(),
            ShardRouting::ByProviderRange { prefix_len } => shard
                .strip_prefix(provider.key())
                .and_then(|rest| rest.strip_prefix('-'))
                .is_some_and(|digits| {
                    digits.len() == usize::from(*prefix_len)
                        && digits.chars().all(|ch| ch.is_ascii_hexdigit())
                }),
        }
    }
}

fn default_partition_threshold() -> u64 {
    DEFAULT_PARTITION_THRESHOLD
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub routing: ShardRouting,
    #[serde(default = "default_partition_threshold")]
    pub partition_threshold: u64,
    pub shard_layout: ShardLayout,
    #[serde(default)]
    pub shards: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub routing: ShardRouting,
    pub partition_threshold: u64,
    pub shard_layout: ShardLayout,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            routing: ShardRouting::default(),
            partition_threshold: DEFAULT_PARTITION_THRESHOLD,
            shard_layout: ShardLayout::default(),
        }
    }
}

#[derive(Debug)]
struct ShardState {
    files: ShardFiles,
    entries: Option<BTreeMap<InternalId, ModelEntry>>,
    dirty: bool,
    poisoned: Option<String>,
}

impl ShardState {
    fn loaded(&mut self) -> Result<&mut BTreeMap<InternalId, ModelEntry>, KiraError> {
        if self.entries.is_none() {
            let entries = self.files.load()?;
            debug!(shard = self.files.key(), entries = entries.len(), "loaded ledger shard");
            self.entries = Some(entries);
        }
        Ok(self.entries.get_or_insert_with(BTreeMap::new))
    }

    fn ensure_writable(&self) -> Result<(), KiraError> {
        match &self.poisoned {
            Some(message) => Err(KiraError::LedgerWrite {
                shard: self.files.key().to_string(),
                message: format!("shard disabled after earlier failure: {message}"),
            }),
            None => Ok(()),
        }
    }

    fn apply(&mut self, record: JournalRecord, durable: bool) -> Result<(), KiraError> {
        self.ensure_writable()?;
        self.loaded()?;
        if let Err(err) = self.files.append(&record, durable) {
            warn!(shard = self.files.key(), error = %err, "ledger shard write failed");
            self.poisoned = Some(err.to_string());
            return Err(err);
        }
        let entries = self.entries.get_or_insert_with(BTreeMap::new);
        match record {
            JournalRecord::Upsert { entry } => {
                entries.insert(entry.internal_id.clone(), entry);
            }
            JournalRecord::Remove { internal_id } => {
                entries.remove(&internal_id);
            }
        }
        self.dirty = true;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedItem {
    pub internal_id: InternalId,
    pub source_id: SourceId,
    pub listing: ListingItem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidListing {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerDiff {
    pub new: Vec<PlannedItem>,
    pub changed: Vec<PlannedItem>,
    pub retry: Vec<PlannedItem>,
    pub failed: Vec<PlannedItem>,
    pub unchanged: u64,
    pub stale: Vec<InternalId>,
    pub revived: Vec<InternalId>,
    pub orphaned_pending: Vec<InternalId>,
    pub invalid: Vec<InvalidListing>,
}

impl LedgerDiff {
    pub fn to_process(&self, retry_failed: bool) -> Vec<PlannedItem> {
        let mut items: Vec<PlannedItem> = self
            .new
            .iter()
            .chain(&self.changed)
            .chain(&self.retry)
            .cloned()
            .collect();
        if retry_failed {
            items.extend(self.failed.iter().cloned());
        }
        items
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty()
            && self.changed.is_empty()
            && self.retry.is_empty()
            && self.stale.is_empty()
            && self.revived.is_empty()
            && self.orphaned_pending.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointReport {
    pub written: Vec<String>,
    pub failed: Vec<ShardFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardFailure {
    pub shard: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub complete: u64,
    pub failed: u64,
    pub stale: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStatus {
    pub shard: String,
    pub entries: u64,
    pub counts: StatusCounts,
    pub over_threshold: bool,
    pub poisoned: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerStatus {
    pub schema_version: u32,
    pub routing: ShardRouting,
    pub partition_threshold: u64,
    pub shard_layout: ShardLayout,
    pub shards: Vec<ShardStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionReport {
    pub previous: ShardRouting,
    pub routing: ShardRouting,
    pub moved_entries: u64,
    pub shards: BTreeMap<String, u64>,
}

/// Durable, sharded record of every reorganized model.
///
/// Entries are journaled on every change; `checkpoint` folds journals into
/// sorted snapshots. Shards load lazily and fail independently: a shard whose
/// write failed rejects further writes while the others keep working.
#[derive(Debug)]
pub struct HoldingsLedger {
    dir: Utf8PathBuf,
    manifest: RwLock<LedgerManifest>,
    shards: Mutex<HashMap<String, Arc<Mutex<ShardState>>>>,
}

impl HoldingsLedger {
    pub fn open(dir: impl Into<Utf8PathBuf>, options: LedgerOptions) -> Result<Self, KiraError> {
        let dir = dir.into();
        options.routing.validate()?;
        options.shard_layout.validate()?;
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {dir}: {err}")))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.as_std_path().is_file() {
            let content = fs::read_to_string(manifest_path.as_std_path()).map_err(|err| {
                KiraError::LedgerRead {
                    path: manifest_path.to_string(),
                    message: err.to_string(),
                }
            })?;
            let mut manifest: LedgerManifest =
                serde_json::from_str(&content).map_err(|err| KiraError::LedgerRead {
                    path: manifest_path.to_string(),
                    message: err.to_string(),
                })?;
            if manifest.schema_version > SCHEMA_VERSION {
                warn!(
                    schema_version = manifest.schema_version,
                    "ledger written by a newer schema; unknown fields are ignored"
                );
            }
            if manifest.shard_layout != options.shard_layout {
                return Err(KiraError::ShardLayoutMismatch {
                    requested: options.shard_layout.to_string(),
                    recorded: manifest.shard_layout.to_string(),
                });
            }
            manifest.routing.validate()?;
            if manifest.routing != options.routing {
                debug!(
                    recorded = ?manifest.routing,
                    requested = ?options.routing,
                    "keeping recorded shard routing; use partition to change it"
                );
            }
            manifest.partition_threshold = options.partition_threshold;
            manifest
        } else {
            let manifest = LedgerManifest {
                schema_version: SCHEMA_VERSION,
                routing: options.routing,
                partition_threshold: options.partition_threshold,
                shard_layout: options.shard_layout,
                shards: BTreeSet::new(),
            };
            write_manifest(&dir, &manifest)?;
            info!(dir = %dir, "created holdings ledger");
            manifest
        };

        Ok(Self {
            dir,
            manifest: RwLock::new(manifest),
            shards: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn routing(&self) -> ShardRouting {
        self.read_manifest().routing
    }

    pub fn shard_layout(&self) -> ShardLayout {
        self.read_manifest().shard_layout
    }

    pub fn get(&self, id: &InternalId) -> Result<Option<ModelEntry>, KiraError> {
        let key = self.read_manifest().routing.shard_for(id);
        let shard = self.shard(&key);
        let mut state = lock(&shard);
        let entry = state.loaded()?.get(id).cloned();
        Ok(entry)
    }

    pub fn lookup_source(
        &self,
        provider: Provider,
        source_id: &str,
    ) -> Result<Option<ModelEntry>, KiraError> {
        let (_, internal_id) = IdMapper::assign_or_lookup(provider, source_id)?;
        self.get(&internal_id)
    }

    pub fn upsert(&self, entry: ModelEntry) -> Result<(), KiraError> {
        let durable = entry.status == EntryStatus::Complete;
        let id = entry.internal_id.clone();
        self.with_shard_for(&id, |state| {
            state.apply(JournalRecord::Upsert { entry }, durable)
        })
    }

    pub fn discard_pending(&self, id: &InternalId) -> Result<bool, KiraError> {
        self.with_shard_for(id, |state| {
            let pending = state
                .loaded()?
                .get(id)
                .is_some_and(|entry| entry.status == EntryStatus::Pending);
            if pending {
                state.apply(
                    JournalRecord::Remove {
                        internal_id: id.clone(),
                    },
                    true,
                )?;
            }
            Ok(pending)
        })
    }

    pub fn mark_stale(&self, ids: &[InternalId], at: DateTime<Utc>) -> Result<usize, KiraError> {
        self.update_each(ids, |entry| {
            if entry.stale_since.is_some() {
                return false;
            }
            entry.stale_since = Some(at);
            true
        })
    }

    pub fn clear_stale(&self, ids: &[InternalId]) -> Result<usize, KiraError> {
        self.update_each(ids, |entry| entry.stale_since.take().is_some())
    }

    fn update_each<F>(&self, ids: &[InternalId], mut update: F) -> Result<usize, KiraError>
    where
        F: FnMut(&mut ModelEntry) -> bool,
    {
        let mut changed = 0;
        for id in ids {
            let updated = self.with_shard_for(id, |state| {
                let Some(mut entry) = state.loaded()?.get(id).cloned() else {
                    return Ok(false);
                };
                if !update(&mut entry) {
                    return Ok(false);
                }
                state.apply(JournalRecord::Upsert { entry }, true)?;
                Ok(true)
            })?;
            if updated {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn diff<I>(&self, provider: Provider, listing: I) -> Result<LedgerDiff, KiraError>
    where
        I: IntoIterator<Item = ListingItem>,
    {
        let manifest = self.read_manifest().clone();
        let mut diff = LedgerDiff::default();
        let mut buckets: BTreeMap<String, BTreeMap<InternalId, PlannedItem>> = BTreeMap::new();

        for item in listing {
            match IdMapper::assign_or_lookup(provider, &item.source_id) {
                Ok((source_id, internal_id)) => {
                    let key = manifest.routing.shard_for(&internal_id);
                    buckets.entry(key).or_default().insert(
                        internal_id.clone(),
                        PlannedItem {
                            internal_id,
                            source_id,
                            listing: item,
                        },
                    );
                }
                Err(err) => {
                    warn!(provider = %provider, source_id = %item.source_id, error = %err, "skipping invalid listing item");
                    diff.invalid.push(InvalidListing {
                        source_id: item.source_id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut keys: BTreeSet<String> = buckets.keys().cloned().collect();
        keys.extend(
            manifest
                .shards
                .iter()
                .filter(|key| manifest.routing.may_hold(key, provider))
                .cloned(),
        );

        for key in keys {
            let planned = buckets.remove(&key).unwrap_or_default();
            let mut listed = planned.into_values().peekable();
            self.scan_shard(&key, |entry| {
                if entry.provider != provider {
                    return Ok(());
                }
                while let Some(item) = listed.next_if(|item| item.internal_id < entry.internal_id) {
                    diff.new.push(item);
                }
                match listed.next_if(|item| item.internal_id == entry.internal_id) {
                    Some(item) => classify_listed(&mut diff, entry, item),
                    None => classify_unlisted(&mut diff, entry),
                }
                Ok(())
            })?;
            diff.new.extend(listed);
        }

        info!(
            provider = %provider,
            new = diff.new.len(),
            changed = diff.changed.len(),
            retry = diff.retry.len(),
            failed = diff.failed.len(),
            unchanged = diff.unchanged,
            stale = diff.stale.len(),
            revived = diff.revived.len(),
            invalid = diff.invalid.len(),
            "computed holdings diff"
        );
        Ok(diff)
    }

    pub fn scan_shard<F>(&self, key: &str, mut visit: F) -> Result<(), KiraError>
    where
        F: FnMut(&ModelEntry) -> Result<(), KiraError>,
    {
        let shard = self.shard(key);
        let mut state = lock(&shard);
        if state.entries.is_none() && state.files.journal_is_empty() {
            return state.files.for_each_snapshot_entry(|entry| visit(&entry));
        }
        for entry in state.loaded()?.values() {
            visit(entry)?;
        }
        Ok(())
    }

    pub fn scan<F>(&self, mut visit: F) -> Result<(), KiraError>
    where
        F: FnMut(&ModelEntry) -> Result<(), KiraError>,
    {
        let keys = self.read_manifest().shards.clone();
        for key in keys {
            self.scan_shard(&key, &mut visit)?;
        }
        Ok(())
    }

    /// Source ids of Complete AlphaFold models split into several fragments.
    ///
    /// Any fragment other than `F1` marks its model as fragmented, and an
    /// `F2` fragment pulls in its `F1` sibling.
    pub fn fragmented_ids(&self, provider: Provider) -> Result<BTreeSet<String>, KiraError> {
        let mut fragments = BTreeSet::new();
        if !matches!(provider, Provider::AlphaFold | Provider::AlphaFoldCloud) {
            return Ok(fragments);
        }
        let manifest = self.read_manifest().clone();
        for key in manifest
            .shards
            .iter()
            .filter(|key| manifest.routing.may_hold(key, provider))
        {
            self.scan_shard(key, |entry| {
                if entry.provider != provider || !entry.is_complete() {
                    return Ok(());
                }
                let source_id = entry.source_id.as_str();
                if source_id.ends_with("F1") {
                    return Ok(());
                }
                if let Some(stem) = source_id.strip_suffix("F2") {
                    fragments.insert(format!("{stem}F1"));
                }
                fragments.insert(source_id.to_string());
                Ok(())
            })?;
        }
        debug!(provider = %provider, fragmented = fragments.len(), "collected fragmented models");
        Ok(fragments)
    }

    pub fn checkpoint(&self) -> CheckpointReport {
        let mut report = CheckpointReport::default();
        let mut shards: Vec<(String, Arc<Mutex<ShardState>>)> = self
            .lock_shards()
            .iter()
            .map(|(key, shard)| (key.clone(), Arc::clone(shard)))
            .collect();
        shards.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, shard) in shards {
            let mut state = lock(&shard);
            if !state.dirty || state.poisoned.is_some() {
                continue;
            }
            let ShardState {
                files,
                entries,
                dirty,
                poisoned,
            } = &mut *state;
            let Some(entries) = entries.as_ref() else {
                continue;
            };
            match files.write_snapshot(entries) {
                Ok(()) => {
                    *dirty = false;
                    report.written.push(key);
                }
                Err(err) => {
                    warn!(shard = %key, error = %err, "ledger checkpoint failed");
                    *poisoned = Some(err.to_string());
                    report.failed.push(ShardFailure {
                        shard: key,
                        message: err.to_string(),
                    });
                }
            }
        }
        if !report.written.is_empty() {
            info!(shards = report.written.len(), "checkpointed holdings ledger");
        }
        report
    }

    pub fn compact(&self) -> Result<CheckpointReport, KiraError> {
        let keys = self.read_manifest().shards.clone();
        for key in keys {
            let shard = self.shard(&key);
            let mut state = lock(&shard);
            if !state.files.journal_is_empty() {
                state.loaded()?;
                state.dirty = true;
            }
        }
        Ok(self.checkpoint())
    }

    pub fn poisoned_shards(&self) -> Vec<ShardFailure> {
        let mut failures: Vec<ShardFailure> = self
            .lock_shards()
            .iter()
            .filter_map(|(key, shard)| {
                lock(shard).poisoned.clone().map(|message| ShardFailure {
                    shard: key.clone(),
                    message,
                })
            })
            .collect();
        failures.sort_by(|a, b| a.shard.cmp(&b.shard));
        failures
    }

    pub fn status(&self) -> Result<LedgerStatus, KiraError> {
        let manifest = self.read_manifest().clone();
        let mut shards = Vec::with_capacity(manifest.shards.len());
        for key in &manifest.shards {
            let mut counts = StatusCounts::default();
            let mut entries = 0u64;
            self.scan_shard(key, |entry| {
                entries += 1;
                match entry.status {
                    EntryStatus::Pending => counts.pending += 1,
                    EntryStatus::Complete => counts.complete += 1,
                    EntryStatus::Failed => counts.failed += 1,
                }
                if entry.is_stale() {
                    counts.stale += 1;
                }
                Ok(())
            })?;
            let poisoned = lock(&self.shard(key)).poisoned.clone();
            shards.push(ShardStatus {
                shard: key.clone(),
                entries,
                counts,
                over_threshold: entries > manifest.partition_threshold,
                poisoned,
            });
        }
        Ok(LedgerStatus {
            schema_version: manifest.schema_version,
            routing: manifest.routing,
            partition_threshold: manifest.partition_threshold,
            shard_layout: manifest.shard_layout,
            shards,
        })
    }

    pub fn shards_over_threshold(&self) -> Result<Vec<(String, u64)>, KiraError> {
        Ok(self
            .status()?
            .shards
            .into_iter()
            .filter(|shard| shard.over_threshold)
            .map(|shard| (shard.shard, shard.entries))
            .collect())
    }

    /// Re-distributes every entry under a new routing.
    ///
    /// New shard files are built in a side directory and moved into place
    /// before the manifest is switched; the manifest write is the commit
    /// point. Must not run concurrently with a provider run.
    pub fn partition_by(&self, routing: ShardRouting) -> Result<PartitionReport, KiraError> {
        routing.validate()?;
        let previous = self.routing();
        if previous == routing {
            let shards = self
                .status()?
                .shards
                .into_iter()
                .map(|shard| (shard.shard, shard.entries))
                .collect();
            return Ok(PartitionReport {
                previous,
                routing,
                moved_entries: 0,
                shards,
            });
        }

        let checkpoint = self.checkpoint();
        if let Some(failure) = checkpoint.failed.into_iter().next() {
            return Err(KiraError::LedgerWrite {
                shard: failure.shard,
                message: failure.message,
            });
        }
        if let Some(failure) = self.poisoned_shards().into_iter().next() {
            return Err(KiraError::LedgerWrite {
                shard: failure.shard,
                message: failure.message,
            });
        }

        let mut manifest = self
            .manifest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let staging = self.dir.join(PARTITION_STAGING_DIR);
        Store::remove_dir_if_exists(&staging)?;
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {staging}: {err}")))?;

        let mut regrouped: BTreeMap<String, BTreeMap<InternalId, ModelEntry>> = BTreeMap::new();
        let mut moved_entries = 0u64;
        for key in &manifest.shards {
            let mut files = ShardFiles::new(&self.dir, key);
            for (id, entry) in files.load()? {
                regrouped
                    .entry(routing.shard_for(&id))
                    .or_default()
                    .insert(id, entry);
                moved_entries += 1;
            }
        }

        for (key, entries) in &regrouped {
            ShardFiles::new(&staging, key).write_snapshot(entries)?;
        }
        for key in regrouped.keys() {
            let built = ShardFiles::new(&staging, key);
            let target = ShardFiles::new(&self.dir, key);
            fs::rename(
                built.snapshot_path().as_std_path(),
                target.snapshot_path().as_std_path(),
            )
            .map_err(|err| KiraError::LedgerWrite {
                shard: key.clone(),
                message: err.to_string(),
            })?;
        }

        let old_shards = manifest.shards.clone();
        let mut next = manifest.clone();
        next.routing = routing;
        next.shards = regrouped.keys().cloned().collect();
        write_manifest(&self.dir, &next)?;
        *manifest = next;

        for key in old_shards.difference(&manifest.shards) {
            ShardFiles::new(&self.dir, key).remove_files()?;
        }
        self.lock_shards().clear();
        Store::remove_dir_if_exists(&staging)?;

        info!(
            previous = ?previous,
            routing = ?routing,
            shards = regrouped.len(),
            entries = moved_entries,
            "re-partitioned holdings ledger"
        );
        Ok(PartitionReport {
            previous,
            routing,
            moved_entries,
            shards: regrouped
                .into_iter()
                .map(|(key, entries)| (key, entries.len() as u64))
                .collect(),
        })
    }

    fn with_shard_for<T, F>(&self, id: &InternalId, apply: F) -> Result<T, KiraError>
    where
        F: FnOnce(&mut ShardState) -> Result<T, KiraError>,
    {
        loop {
            let manifest = self.read_manifest();
            let key = manifest.routing.shard_for(id);
            if manifest.shards.contains(&key) {
                let shard = self.shard(&key);
                let mut state = lock(&shard);
                let result = apply(&mut state);
                drop(state);
                drop(manifest);
                return result;
            }
            drop(manifest);
            self.register_shard(&key)?;
        }
    }

    fn register_shard(&self, key: &str) -> Result<(), KiraError> {
        let mut manifest = self
            .manifest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if manifest.shards.contains(key) {
            return Ok(());
        }
        let mut next = manifest.clone();
        next.shards.insert(key.to_string());
        write_manifest(&self.dir, &next).map_err(|err| KiraError::LedgerWrite {
            shard: key.to_string(),
            message: err.to_string(),
        })?;
        *manifest = next;
        debug!(shard = key, "registered ledger shard");
        Ok(())
    }

    fn shard(&self, key: &str) -> Arc<Mutex<ShardState>> {
        let mut shards = self.lock_shards();
        Arc::clone(shards.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ShardState {
                files: ShardFiles::new(&self.dir, key),
                entries: None,
                dirty: false,
                poisoned: None,
            }))
        }))
    }

    fn lock_shards(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<ShardState>>>> {
        self.shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_manifest(&self) -> std::sync::RwLockReadGuard<'_, LedgerManifest> {
        self.manifest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn classify_listed(diff: &mut LedgerDiff, entry: &ModelEntry, item: PlannedItem) {
    if entry.is_stale() {
        diff.revived.push(entry.internal_id.clone());
    }
    let newer = item.listing.last_modified > entry.source_last_modified;
    match entry.status {
        EntryStatus::Pending => diff.retry.push(item),
        EntryStatus::Complete | EntryStatus::Failed if newer => diff.changed.push(item),
        EntryStatus::Complete => {
            if item.listing.last_modified < entry.source_last_modified {
                debug!(
                    internal_id = %entry.internal_id,
                    "listing timestamp older than recorded; keeping entry"
                );
            }
            diff.unchanged += 1;
        }
        EntryStatus::Failed => diff.failed.push(item),
    }
}

fn classify_unlisted(diff: &mut LedgerDiff, entry: &ModelEntry) {
    match entry.status {
        EntryStatus::Pending => diff.orphaned_pending.push(entry.internal_id.clone()),
        _ if entry.is_stale() => {}
        _ => diff.stale.push(entry.internal_id.clone()),
    }
}

fn write_manifest(dir: &Utf8Path, manifest: &LedgerManifest) -> Result<(), KiraError> {
    let mut content = serde_json::to_vec_pretty(manifest)
        .map_err(|err| KiraError::LedgerSchema(err.to_string()))?;
    content.push(b'\n');
    Store::write_bytes_atomic(&dir.join(MANIFEST_FILE), &content)
}

fn lock(shard: &Mutex<ShardState>) -> MutexGuard<'_, ShardState> {
    shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
