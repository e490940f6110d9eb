use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::convert::{FormatConverter, GzipPassthrough};
use crate::domain::{EntryMetadata, EntryStatus, InternalId, ModelEntry, Provider, SourceId};
use crate::error::KiraError;
use crate::fs_util::{
    MemberDescriptor, MemberFlow, SourceReader, StagedKind, for_each_member, visit_members,
};
use crate::ledger::{HoldingsLedger, PlannedItem};
use crate::providers::{DownloadRef, MemberRole, SourceIdRule, StagedItem};
use crate::shard::ShardPlanner;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    Created,
    Updated,
    Unchanged,
    Missing,
    Failed { reason: String },
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryReport {
    pub internal_id: InternalId,
    pub source_id: SourceId,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidMember {
    pub member: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub download_ref: DownloadRef,
    pub entries: Vec<EntryReport>,
    pub invalid: Vec<InvalidMember>,
    pub ignored_members: u64,
    pub cancelled: bool,
}

impl ItemReport {
    fn new(download_ref: DownloadRef) -> Self {
        Self {
            download_ref,
            entries: Vec::new(),
            invalid: Vec::new(),
            ignored_members: 0,
            cancelled: false,
        }
    }

    pub(crate) fn aborted(download_ref: DownloadRef, items: &[PlannedItem], err: &KiraError) -> Self {
        let mut report = Self::new(download_ref);
        report.cancelled = matches!(err, KiraError::Cancelled);
        for item in items {
            report.push(item, EntryOutcome::Aborted { reason: err.to_string() });
        }
        report
    }

    pub fn count(&self, matches: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches(&entry.outcome))
            .count()
    }

    fn push(&mut self, item: &PlannedItem, outcome: EntryOutcome) {
        self.entries.push(EntryReport {
            internal_id: item.internal_id.clone(),
            source_id: item.source_id.clone(),
            outcome,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Model,
    Sidecar(String),
}

#[derive(Debug)]
struct Accepted {
    internal_id: InternalId,
    placement: Placement,
}

#[derive(Debug)]
struct EntryWork<'w> {
    item: &'w PlannedItem,
    has_model: bool,
    sidecars: BTreeSet<String>,
    expected: usize,
    seen: usize,
    placed: Vec<String>,
    previous: Option<ModelEntry>,
    started: bool,
    failure: Option<String>,
    outcome: Option<EntryOutcome>,
}

impl<'w> EntryWork<'w> {
    fn new(item: &'w PlannedItem) -> Self {
        Self {
            item,
            has_model: false,
            sidecars: BTreeSet::new(),
            expected: 0,
            seen: 0,
            placed: Vec::new(),
            previous: None,
            started: false,
            failure: None,
            outcome: None,
        }
    }

    fn claim(&mut self, placement: &Placement) -> bool {
        let fresh = match placement {
            Placement::Model => !std::mem::replace(&mut self.has_model, true),
            Placement::Sidecar(suffix) => self.sidecars.insert(suffix.clone()),
        };
        if fresh {
            self.expected += 1;
        }
        fresh
    }
}

#[derive(Debug, Default)]
struct PassState<'w> {
    works: BTreeMap<InternalId, EntryWork<'w>>,
    accepted: HashMap<(usize, u64), Accepted>,
    cancelled: bool,
}

/// Places the models of one staged item into the canonical tree and records
/// them in the ledger.
///
/// Each entry is written Pending before its first file lands and Complete only
/// after every file is in place, so an interrupted run leaves nothing that
/// looks finished.
pub struct Reorganizer<'a> {
    planner: &'a ShardPlanner,
    ledger: &'a HoldingsLedger,
    converter: &'a dyn FormatConverter,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Reorganizer<'a> {
    pub fn new(
        planner: &'a ShardPlanner,
        ledger: &'a HoldingsLedger,
        converter: &'a dyn FormatConverter,
    ) -> Self {
        Self {
            planner,
            ledger,
            converter,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn reorganize(
        &self,
        provider: Provider,
        rule: &SourceIdRule,
        staged: &StagedItem,
        wanted: &[PlannedItem],
    ) -> ItemReport {
        let mut report = ItemReport::new(staged.download_ref.clone());
        let by_source: HashMap<&SourceId, &PlannedItem> =
            wanted.iter().map(|item| (&item.source_id, item)).collect();
        let mut state = PassState::default();
        let mut kinds = Vec::with_capacity(staged.parts.len());

        for (index, part) in staged.parts.iter().enumerate() {
            let scanned = part
                .kind
                .map_or_else(|| StagedKind::detect(part.path.as_std_path()), Ok)
                .and_then(|kind| {
                    kinds.push(kind);
                    visit_members(part.path.as_std_path(), kind, |member| {
                        let (raw, placement) = match rule.classify(&member.name) {
                            MemberRole::Model { source_id } => (source_id, Placement::Model),
                            MemberRole::Sidecar { source_id, suffix } => {
                                (source_id, Placement::Sidecar(suffix))
                            }
                            MemberRole::Ignored => {
                                report.ignored_members += 1;
                                return Ok(MemberFlow::Continue);
                            }
                        };
                        let source_id = match SourceId::parse(provider, &raw) {
                            Ok(source_id) => source_id,
                            Err(err) => {
                                report.invalid.push(InvalidMember {
                                    member: member.name.clone(),
                                    reason: err.to_string(),
                                });
                                return Ok(MemberFlow::Continue);
                            }
                        };
                        let Some(&item) = by_source.get(&source_id) else {
                            report.ignored_members += 1;
                            return Ok(MemberFlow::Continue);
                        };
                        let work = state
                            .works
                            .entry(item.internal_id.clone())
                            .or_insert_with(|| EntryWork::new(item));
                        if !work.claim(&placement) {
                            debug!(member = %member.name, "skipping duplicate member");
                            report.ignored_members += 1;
                            return Ok(MemberFlow::Continue);
                        }
                        state.accepted.insert(
                            (index, member.index),
                            Accepted {
                                internal_id: item.internal_id.clone(),
                                placement,
                            },
                        );
                        Ok(MemberFlow::Continue)
                    })
                });
            if let Err(err) = scanned {
                warn!(part = %part.path, error = %err, "cannot read staged item");
                report.entries.clear();
                for item in wanted {
                    report.push(item, EntryOutcome::Aborted { reason: err.to_string() });
                }
                return report;
            }
        }

        for item in wanted {
            let has_model = state
                .works
                .get(&item.internal_id)
                .is_some_and(|work| work.has_model);
            if !has_model {
                warn!(source_id = %item.source_id, "no model member in staged item");
                state.works.remove(&item.internal_id);
                report.push(item, EntryOutcome::Missing);
                continue;
            }
            match self.ledger.get(&item.internal_id) {
                Ok(Some(previous))
                    if previous.is_complete()
                        && previous.source_last_modified == item.listing.last_modified
                        && self.files_present(&previous) =>
                {
                    state.works.remove(&item.internal_id);
                    report.push(item, EntryOutcome::Unchanged);
                }
                Ok(previous) => {
                    if let Some(work) = state.works.get_mut(&item.internal_id) {
                        work.previous = previous;
                    }
                }
                Err(err) => {
                    state.works.remove(&item.internal_id);
                    report.push(item, EntryOutcome::Aborted { reason: err.to_string() });
                }
            }
        }
        state
            .accepted
            .retain(|_, accepted| state.works.contains_key(&accepted.internal_id));

        let mut stream_error = None;
        for (index, part) in staged.parts.iter().enumerate() {
            if state.cancelled || !state.accepted.keys().any(|(part, _)| *part == index) {
                continue;
            }
            let result = for_each_member(part.path.as_std_path(), kinds[index], |member, reader| {
                Ok(self.on_member(&mut state, index, member, reader))
            });
            if let Err(err) = result {
                warn!(part = %part.path, error = %err, "staged item unreadable mid-stream");
                stream_error = Some(err.to_string());
                break;
            }
        }

        report.cancelled = state.cancelled;
        for (_, work) in state.works {
            let outcome = work.outcome.unwrap_or_else(|| EntryOutcome::Aborted {
                reason: match (&stream_error, state.cancelled) {
                    (Some(err), _) => err.clone(),
                    (None, true) => KiraError::Cancelled.to_string(),
                    (None, false) => "staged item ended before all members were seen".to_string(),
                },
            });
            report.push(work.item, outcome);
        }
        report
            .entries
            .sort_by(|a, b| a.internal_id.cmp(&b.internal_id));

        info!(
            download_ref = %report.download_ref,
            created = report.count(|o| matches!(o, EntryOutcome::Created)),
            updated = report.count(|o| matches!(o, EntryOutcome::Updated)),
            unchanged = report.count(|o| matches!(o, EntryOutcome::Unchanged)),
            failed = report.count(|o| matches!(o, EntryOutcome::Failed { .. })),
            aborted = report.count(|o| matches!(o, EntryOutcome::Aborted { .. })),
            "reorganized staged item"
        );
        report
    }

    fn on_member(
        &self,
        state: &mut PassState<'_>,
        index: usize,
        member: &MemberDescriptor,
        reader: &mut dyn Read,
    ) -> MemberFlow {
        if self.is_cancelled() {
            state.cancelled = true;
            return MemberFlow::Stop;
        }
        let Some(accepted) = state.accepted.remove(&(index, member.index)) else {
            return MemberFlow::Continue;
        };
        let Some(work) = state.works.get_mut(&accepted.internal_id) else {
            return MemberFlow::Continue;
        };
        if work.outcome.is_some() {
            return MemberFlow::Continue;
        }

        if !work.started {
            let pending = self.entry_for(work.item, EntryStatus::Pending, Vec::new(), None);
            if let Err(err) = self.ledger.upsert(pending) {
                work.outcome = Some(EntryOutcome::Aborted { reason: err.to_string() });
                return MemberFlow::Continue;
            }
            work.started = true;
        }

        if work.failure.is_none() {
            match self.place(work.item, &accepted.placement, member, reader) {
                Ok(name) => work.placed.push(name),
                Err(KiraError::ConversionFailure(reason)) => {
                    warn!(internal_id = %work.item.internal_id, member = %member.name, %reason, "conversion failed");
                    work.failure = Some(reason);
                }
                Err(err) => {
                    work.outcome = Some(EntryOutcome::Aborted { reason: err.to_string() });
                    return MemberFlow::Continue;
                }
            }
        }

        work.seen += 1;
        if work.seen == work.expected {
            work.outcome = Some(self.finish(work));
        }
        MemberFlow::Continue
    }

    fn place(
        &self,
        item: &PlannedItem,
        placement: &Placement,
        member: &MemberDescriptor,
        reader: &mut dyn Read,
    ) -> Result<String, KiraError> {
        let id = &item.internal_id;
        let name = match placement {
            Placement::Model => format!(
                "{id}.{}",
                self.converter.output_extension(member.file_name())
            ),
            Placement::Sidecar(suffix) => format!("{id}.{suffix}"),
        };
        let _leaf = self.planner.ensure_path(id)?;
        let dir = self.planner.absolute_path_for(id);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("create {dir}: {err}")))?;
        let dest = dir.join(&name);
        let mut source = SourceReader::new(reader);
        let converted = match placement {
            Placement::Model => self.converter.convert(&mut source, &dest),
            Placement::Sidecar(_) => GzipPassthrough.convert(&mut source, &dest),
        };
        match (converted, source.failure()) {
            (Ok(()), _) => Ok(name),
            (Err(_), Some(failure)) => Err(KiraError::Archive(format!(
                "{}: {failure}",
                member.name
            ))),
            (Err(err), None) => Err(err),
        }
    }

    fn finish(&self, work: &mut EntryWork<'_>) -> EntryOutcome {
        let item = work.item;
        if let Some(reason) = work.failure.take() {
            let failed = self.entry_for(item, EntryStatus::Failed, Vec::new(), Some(reason.clone()));
            return match self.ledger.upsert(failed) {
                Ok(()) => EntryOutcome::Failed { reason },
                Err(err) => EntryOutcome::Aborted { reason: err.to_string() },
            };
        }

        let mut inventory = std::mem::take(&mut work.placed);
        inventory.sort();
        if let Err(err) = self.settle_files(&item.internal_id, &inventory) {
            return EntryOutcome::Aborted { reason: err.to_string() };
        }
        let complete = self.entry_for(item, EntryStatus::Complete, inventory, None);
        match self.ledger.upsert(complete) {
            Ok(()) => match work.previous.as_ref().map(|previous| previous.status) {
                Some(EntryStatus::Complete | EntryStatus::Failed) => EntryOutcome::Updated,
                _ => EntryOutcome::Created,
            },
            Err(err) => EntryOutcome::Aborted { reason: err.to_string() },
        }
    }

    fn settle_files(&self, id: &InternalId, inventory: &[String]) -> Result<(), KiraError> {
        let _leaf = self.planner.ensure_path(id)?;
        let dir = self.planner.absolute_path_for(id);
        if let Some(missing) = inventory
            .iter()
            .find(|name| !dir.join(name).as_std_path().is_file())
        {
            return Err(KiraError::Filesystem(format!("{dir}/{missing} vanished before commit")));
        }
        let removed = Store::remove_extra_files(&dir, inventory)?;
        if !removed.is_empty() {
            debug!(internal_id = %id, removed = ?removed, "removed files of previous version");
        }
        Ok(())
    }

    fn files_present(&self, entry: &ModelEntry) -> bool {
        let dir = self.planner.absolute_path_for(&entry.internal_id);
        !entry.file_inventory.is_empty()
            && entry
                .file_inventory
                .iter()
                .all(|name| dir.join(name).as_std_path().is_file())
    }

    fn entry_for(
        &self,
        item: &PlannedItem,
        status: EntryStatus,
        file_inventory: Vec<String>,
        failure_reason: Option<String>,
    ) -> ModelEntry {
        let provider = item.internal_id.provider();
        ModelEntry {
            internal_id: item.internal_id.clone(),
            source_id: item.source_id.to_string(),
            provider,
            source_last_modified: item.listing.last_modified,
            processed_at: Utc::now(),
            canonical_path: self.planner.canonical_path_for(&item.internal_id).to_string(),
            file_inventory,
            status,
            metadata: EntryMetadata {
                source_url: Some(provider.source_url(&item.source_id)),
                source_file: Some(item.listing.download_ref.to_string()),
                cross_references: item.listing.cross_references.clone(),
                failure_reason,
            },
            stale_since: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .is_some_and(|cancel| cancel.load(Ordering::Relaxed))
    }
}
