use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use kira_csm::convert::{FormatConverter, GzipPassthrough};
use kira_csm::domain::{
    CrossReference, CrossReferenceKind, EntryMetadata, EntryStatus, ModelEntry, Provider,
};
use kira_csm::error::KiraError;
use kira_csm::id_map::IdMapper;
use kira_csm::ledger::LedgerOptions;
use kira_csm::providers::{
    DownloadRef, ListingItem, LocalMirrorProvider, ModelProvider, SourceIdRule, StagedItem,
};
use kira_csm::shard::ShardLayout;
use kira_csm::store::Store;
use kira_csm::workflow::{ProviderSummary, RunOptions, RunSummary, SilentProgress, Workflow};

fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

fn open_workflow(data_root: &Utf8Path) -> Workflow {
    Workflow::open(
        Store::with_data_root(data_root),
        ShardLayout::default(),
        LedgerOptions::default(),
        Box::new(GzipPassthrough),
    )
    .unwrap()
}

fn options() -> RunOptions {
    RunOptions {
        workers: 2,
        retry_delay: Duration::ZERO,
        ..RunOptions::default()
    }
}

/// Writes `listing.json` with one row per (source id, day, download ref).
fn write_listing(mirror: &Utf8Path, rows: &[(&str, u32, &str)]) {
    let items: Vec<ListingItem> = rows
        .iter()
        .map(|(source_id, day, download_ref)| ListingItem {
            source_id: source_id.to_string(),
            last_modified: Utc.with_ymd_and_hms(2024, 6, *day, 0, 0, 0).unwrap(),
            download_ref: DownloadRef::new(*download_ref),
            cross_references: Vec::new(),
        })
        .collect();
    fs::create_dir_all(mirror.as_std_path()).unwrap();
    fs::write(
        mirror.join("listing.json").as_std_path(),
        serde_json::to_vec(&items).unwrap(),
    )
    .unwrap();
}

fn append_members<W: Write>(builder: &mut tar::Builder<W>, members: &[(String, Vec<u8>)]) {
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data.as_slice()).unwrap();
    }
}

fn write_tar(path: &Utf8Path, members: &[(String, Vec<u8>)], gzip: bool) {
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    let file = fs::File::create(path.as_std_path()).unwrap();
    if gzip {
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        append_members(&mut builder, members);
        builder.into_inner().unwrap().finish().unwrap();
    } else {
        let mut builder = tar::Builder::new(file);
        append_members(&mut builder, members);
        builder.finish().unwrap();
    }
}

fn mirror_provider(provider: Provider, mirror: &Utf8Path) -> Vec<Box<dyn ModelProvider>> {
    vec![Box::new(LocalMirrorProvider::new(provider, mirror.to_path_buf()))]
}

fn only_summary(summary: &RunSummary) -> &ProviderSummary {
    assert_eq!(summary.providers.len(), 1);
    summary.providers[0]
        .summary
        .as_ref()
        .unwrap_or_else(|| panic!("provider failed: {:?}", summary.providers[0].error))
}

fn entry_files(workflow: &Workflow, provider: Provider, source_id: &str) -> BTreeSet<String> {
    let (_, id) = IdMapper::assign_or_lookup(provider, source_id).unwrap();
    let dir = workflow.planner().absolute_path_for(&id);
    fs::read_dir(dir.as_std_path())
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn ledger_bytes(data_root: &Utf8Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(data_root.join("holdings").as_std_path())
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().to_string(),
                fs::read(entry.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

fn model_archive_mirror(mirror: &Utf8Path) {
    for n in 1..=3 {
        fs::create_dir_all(mirror.as_std_path()).unwrap();
        fs::write(
            mirror.join(format!("ma-test-000{n}.cif")).as_std_path(),
            format!("data_ma-test-000{n}\n"),
        )
        .unwrap();
    }
}

#[test]
fn rerun_is_a_no_op_and_updates_only_changed_models() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    write_listing(
        &mirror,
        &[
            ("ma-test-0001", 1, "ma-test-0001.cif"),
            ("ma-test-0002", 1, "ma-test-0002.cif"),
            ("ma-test-0003", 1, "ma-test-0003.cif"),
        ],
    );
    let providers = mirror_provider(Provider::ModelArchive, &mirror);

    let workflow = open_workflow(&root);
    let first = workflow.run(&providers, &options(), &SilentProgress);
    assert!(first.is_success());
    let done = only_summary(&first);
    assert_eq!((done.new, done.created), (3, 3));
    let (_, id) = IdMapper::assign_or_lookup(Provider::ModelArchive, "ma-test-0002").unwrap();
    assert_eq!(
        entry_files(&workflow, Provider::ModelArchive, "ma-test-0002"),
        BTreeSet::from([format!("{id}.cif.gz")])
    );
    let recorded = workflow.ledger().get(&id).unwrap().unwrap();
    assert_eq!(recorded.status, EntryStatus::Complete);
    assert_eq!(recorded.file_inventory, vec![format!("{id}.cif.gz")]);
    drop(workflow);
    let before = ledger_bytes(&root);

    let workflow = open_workflow(&root);
    let second = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&second);
    assert_eq!(done.unchanged, 3);
    assert_eq!(done.created + done.updated, 0);
    assert!(second.checkpoint.written.is_empty());
    drop(workflow);
    assert_eq!(ledger_bytes(&root), before);

    write_listing(
        &mirror,
        &[
            ("ma-test-0001", 1, "ma-test-0001.cif"),
            ("ma-test-0002", 5, "ma-test-0002.cif"),
            ("ma-test-0003", 1, "ma-test-0003.cif"),
        ],
    );
    let workflow = open_workflow(&root);
    let third = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&third);
    assert_eq!(done.updated, 1);
    assert_eq!(done.unchanged, 2);
    assert_eq!(done.created, 0);
    let recorded = workflow.ledger().get(&id).unwrap().unwrap();
    assert_eq!(
        recorded.source_last_modified,
        Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap()
    );
}

/// Counts fetches so tests can check a bulk archive is fetched once.
struct CountingProvider {
    inner: LocalMirrorProvider,
    fetches: Arc<AtomicUsize>,
}

impl ModelProvider for CountingProvider {
    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn list_available(&self) -> Result<Vec<ListingItem>, KiraError> {
        self.inner.list_available()
    }

    fn fetch(&self, download_ref: &DownloadRef, staging_dir: &Utf8Path) -> Result<StagedItem, KiraError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(download_ref, staging_dir)
    }

    fn source_id_rule(&self) -> &SourceIdRule {
        self.inner.source_id_rule()
    }
}

#[test]
fn bulk_archive_lands_in_unique_paths() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/alphafold-cloud");
    let mut members = Vec::new();
    for i in 0..500 {
        let accession = format!("A{i:05}");
        members.push((
            format!("proteome/AF-{accession}-F1-model_v4.cif"),
            format!("data_AF-{accession}-F1\n").into_bytes(),
        ));
        members.push((
            format!("proteome/AF-{accession}-F1-predicted_aligned_error_v4.json"),
            b"[{\"max_predicted_aligned_error\":31.75}]".to_vec(),
        ));
    }
    members.push(("proteome/README.txt".to_string(), b"bulk export".to_vec()));
    write_tar(&mirror.join("proteome-tax_id-9606.tar.gz"), &members, true);

    let fetches = Arc::new(AtomicUsize::new(0));
    let providers: Vec<Box<dyn ModelProvider>> = vec![Box::new(CountingProvider {
        inner: LocalMirrorProvider::new(Provider::AlphaFoldCloud, mirror.clone())
            .with_copy_to_staging(true),
        fetches: Arc::clone(&fetches),
    })];
    let workflow = open_workflow(&root);
    let summary = workflow.run(&providers, &options(), &SilentProgress);
    assert!(summary.is_success());
    let done = only_summary(&summary);
    assert_eq!(done.listed, 500);
    assert_eq!(done.created, 500);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let mut paths = BTreeSet::new();
    for i in [0, 1, 250, 499] {
        let source = format!("AF-A{i:05}-F1");
        let located = workflow
            .locate(Provider::AlphaFoldCloud, &source)
            .unwrap()
            .unwrap();
        let id = located.entry.internal_id.clone();
        assert!(id.as_str().starts_with("AC_"));
        assert_eq!(
            entry_files(&workflow, Provider::AlphaFoldCloud, &source),
            BTreeSet::from([format!("{id}.cif.gz"), format!("{id}.pae.json.gz")])
        );
    }
    workflow
        .ledger()
        .scan(|entry| {
            assert!(paths.insert(entry.canonical_path.clone()));
            Ok(())
        })
        .unwrap();
    assert_eq!(paths.len(), 500);

    let staging = workflow.store().staging_dir("alphafold-cloud");
    assert_eq!(fs::read_dir(staging.as_std_path()).unwrap().count(), 0);
}

fn pending_entry(provider: Provider, source: &str, day: u32) -> ModelEntry {
    let (source_id, internal_id) = IdMapper::assign_or_lookup(provider, source).unwrap();
    ModelEntry {
        canonical_path: ShardLayout::default()
            .canonical_path_for(&internal_id)
            .to_string(),
        internal_id,
        source_id: source_id.to_string(),
        provider,
        source_last_modified: Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap(),
        processed_at: Utc::now(),
        file_inventory: Vec::new(),
        status: EntryStatus::Pending,
        metadata: EntryMetadata::default(),
        stale_since: None,
    }
}

#[test]
fn interrupted_entries_are_redone_or_discarded() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    write_listing(&mirror, &[("ma-test-0001", 1, "ma-test-0001.cif")]);

    let workflow = open_workflow(&root);
    let interrupted = pending_entry(Provider::ModelArchive, "ma-test-0001", 1);
    let orphan = pending_entry(Provider::ModelArchive, "ma-gone-0009", 1);
    for entry in [&interrupted, &orphan] {
        workflow.ledger().upsert(entry.clone()).unwrap();
        let dir = workflow.planner().absolute_path_for(&entry.internal_id);
        fs::create_dir_all(dir.as_std_path()).unwrap();
        fs::write(dir.join("partial.cif.gz").as_std_path(), b"trunc").unwrap();
    }
    drop(workflow);

    let workflow = open_workflow(&root);
    let summary = workflow.run(
        &mirror_provider(Provider::ModelArchive, &mirror),
        &options(),
        &SilentProgress,
    );
    let done = only_summary(&summary);
    assert_eq!(done.retried, 1);
    assert_eq!(done.created, 1);
    assert_eq!(done.discarded_pending, 1);

    let id = &interrupted.internal_id;
    let redone = workflow.ledger().get(id).unwrap().unwrap();
    assert_eq!(redone.status, EntryStatus::Complete);
    assert_eq!(
        entry_files(&workflow, Provider::ModelArchive, "ma-test-0001"),
        BTreeSet::from([format!("{id}.cif.gz")])
    );
    assert_eq!(workflow.ledger().get(&orphan.internal_id).unwrap(), None);
    assert!(
        !workflow
            .planner()
            .absolute_path_for(&orphan.internal_id)
            .as_std_path()
            .exists()
    );
}

#[test]
fn failed_conversion_waits_for_retry_flag() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    fs::write(mirror.join("ma-test-0002.cif").as_std_path(), b"").unwrap();
    write_listing(
        &mirror,
        &[
            ("ma-test-0001", 1, "ma-test-0001.cif"),
            ("ma-test-0002", 1, "ma-test-0002.cif"),
        ],
    );
    let providers = mirror_provider(Provider::ModelArchive, &mirror);
    let workflow = open_workflow(&root);

    let first = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&first);
    assert_eq!(done.created, 1);
    assert_eq!(done.failed, 1);
    assert_eq!(done.failures.len(), 1);
    assert_eq!(done.failures[0].source_id.as_str(), "ma-test-0002");
    let failed = workflow
        .ledger()
        .lookup_source(Provider::ModelArchive, "ma-test-0002")
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, EntryStatus::Failed);
    assert!(failed.metadata.failure_reason.is_some());

    let second = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&second);
    assert_eq!(done.skipped_failed, 1);
    assert_eq!(done.failed + done.updated + done.created, 0);

    fs::write(mirror.join("ma-test-0002.cif").as_std_path(), b"data_fixed\n").unwrap();
    let retry = RunOptions {
        retry_failed: true,
        ..options()
    };
    let third = workflow.run(&providers, &retry, &SilentProgress);
    let done = only_summary(&third);
    assert_eq!(done.updated, 1);
    assert_eq!(
        workflow
            .ledger()
            .lookup_source(Provider::ModelArchive, "ma-test-0002")
            .unwrap()
            .unwrap()
            .status,
        EntryStatus::Complete
    );
}

#[test]
fn new_version_replaces_previous_files() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modbase");
    let hash = "0123456789abcdef0123456789abcdef";
    write_tar(
        &mirror.join("models-v1.tar"),
        &[
            (format!("{hash}.pdb"), b"ATOM      1  N   MET A   1\n".to_vec()),
            (format!("{hash}.xml"), b"<alignment/>".to_vec()),
        ],
        false,
    );
    write_tar(
        &mirror.join("models-v2.tar"),
        &[(format!("{hash}.pdb"), b"ATOM      1  N   MET A   2\n".to_vec())],
        false,
    );
    let providers = mirror_provider(Provider::ModBase, &mirror);
    let workflow = open_workflow(&root);
    let (_, id) = IdMapper::assign_or_lookup(Provider::ModBase, hash).unwrap();

    write_listing(&mirror, &[(hash, 1, "models-v1.tar")]);
    let first = workflow.run(&providers, &options(), &SilentProgress);
    assert_eq!(only_summary(&first).created, 1);
    assert_eq!(
        entry_files(&workflow, Provider::ModBase, hash),
        BTreeSet::from([format!("{id}.alignment.xml.gz"), format!("{id}.pdb.gz")])
    );

    write_listing(&mirror, &[(hash, 2, "models-v2.tar")]);
    let second = workflow.run(&providers, &options(), &SilentProgress);
    assert_eq!(only_summary(&second).updated, 1);
    assert_eq!(
        entry_files(&workflow, Provider::ModBase, hash),
        BTreeSet::from([format!("{id}.pdb.gz")])
    );
    let recorded = workflow.ledger().get(&id).unwrap().unwrap();
    assert_eq!(recorded.file_inventory, vec![format!("{id}.pdb.gz")]);
    assert_eq!(recorded.metadata.source_file.as_deref(), Some("models-v2.tar"));
}

#[test]
fn unlisted_models_go_stale_and_come_back() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    let all = [
        ("ma-test-0001", 1, "ma-test-0001.cif"),
        ("ma-test-0002", 1, "ma-test-0002.cif"),
        ("bogus id!", 1, "ma-test-0003.cif"),
    ];
    write_listing(&mirror, &all);
    let providers = mirror_provider(Provider::ModelArchive, &mirror);
    let workflow = open_workflow(&root);

    let first = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&first);
    assert_eq!(done.created, 2);
    assert_eq!(done.invalid, 1);

    write_listing(&mirror, &all[..1]);
    let second = workflow.run(&providers, &options(), &SilentProgress);
    assert_eq!(only_summary(&second).marked_stale, 1);
    let stale = workflow
        .ledger()
        .lookup_source(Provider::ModelArchive, "ma-test-0002")
        .unwrap()
        .unwrap();
    assert!(stale.is_stale());
    assert_eq!(stale.status, EntryStatus::Complete);
    assert_eq!(entry_files(&workflow, Provider::ModelArchive, "ma-test-0002").len(), 1);

    write_listing(&mirror, &all);
    let third = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&third);
    assert_eq!(done.revived, 1);
    assert_eq!(done.unchanged, 2);
    assert!(
        !workflow
            .ledger()
            .lookup_source(Provider::ModelArchive, "ma-test-0002")
            .unwrap()
            .unwrap()
            .is_stale()
    );
}

#[test]
fn dry_run_touches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    write_listing(&mirror, &[("ma-test-0001", 1, "ma-test-0001.cif")]);
    let workflow = open_workflow(&root);

    let dry = RunOptions {
        dry_run: true,
        ..options()
    };
    let summary = workflow.run(
        &mirror_provider(Provider::ModelArchive, &mirror),
        &dry,
        &SilentProgress,
    );
    let done = only_summary(&summary);
    assert!(done.dry_run);
    assert_eq!((done.new, done.created), (1, 0));
    assert_eq!(
        workflow
            .ledger()
            .lookup_source(Provider::ModelArchive, "ma-test-0001")
            .unwrap(),
        None
    );
    assert!(entry_files(&workflow, Provider::ModelArchive, "ma-test-0001").is_empty());
}

/// Fails the first listing call with a fetch error.
struct FlakyProvider {
    inner: LocalMirrorProvider,
    calls: AtomicUsize,
}

impl ModelProvider for FlakyProvider {
    fn provider(&self) -> Provider {
        self.inner.provider()
    }

    fn list_available(&self) -> Result<Vec<ListingItem>, KiraError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(KiraError::Fetch {
                provider: self.inner.provider().to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.inner.list_available()
    }

    fn fetch(&self, download_ref: &DownloadRef, staging_dir: &Utf8Path) -> Result<StagedItem, KiraError> {
        self.inner.fetch(download_ref, staging_dir)
    }

    fn source_id_rule(&self) -> &SourceIdRule {
        self.inner.source_id_rule()
    }
}

#[test]
fn provider_is_retried_after_fetch_error() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    write_listing(&mirror, &[("ma-test-0001", 1, "ma-test-0001.cif")]);
    let workflow = open_workflow(&root);
    let providers: Vec<Box<dyn ModelProvider>> = vec![Box::new(FlakyProvider {
        inner: LocalMirrorProvider::new(Provider::ModelArchive, mirror.clone()),
        calls: AtomicUsize::new(0),
    })];

    let summary = workflow.run(&providers, &options(), &SilentProgress);
    assert_eq!(summary.providers[0].attempts, 2);
    assert_eq!(only_summary(&summary).created, 1);

    let once = RunOptions {
        provider_attempts: 1,
        ..options()
    };
    let missing = mirror_provider(Provider::ModelArchive, &root.join("mirror/absent"));
    let summary = workflow.run(&missing, &once, &SilentProgress);
    assert_eq!(summary.providers[0].attempts, 1);
    assert!(summary.providers[0].error.is_some());
    assert!(!summary.is_success());
}

#[test]
fn cancelled_run_processes_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    write_listing(&mirror, &[("ma-test-0001", 1, "ma-test-0001.cif")]);
    let workflow = open_workflow(&root);

    workflow.cancel_handle().store(true, Ordering::SeqCst);
    let summary = workflow.run(
        &mirror_provider(Provider::ModelArchive, &mirror),
        &options(),
        &SilentProgress,
    );
    assert!(summary.cancelled);
    assert!(summary.providers.is_empty());
    assert!(!summary.is_success());
    assert_eq!(
        workflow
            .ledger()
            .lookup_source(Provider::ModelArchive, "ma-test-0001")
            .unwrap(),
        None
    );
}

fn write_zip(path: &Utf8Path, members: &[(&str, &[u8])]) {
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    let mut writer = zip::ZipWriter::new(fs::File::create(path.as_std_path()).unwrap());
    let stored =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in members {
        writer.start_file(*name, stored).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

fn staged_count(workflow: &Workflow, provider: Provider) -> usize {
    let staging = workflow.store().staging_dir(provider.key());
    fs::read_dir(staging.as_std_path())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
fn damaged_zip_member_is_aborted_not_failed() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    let bundle = mirror.join("bundle.zip");
    let members: [(&str, &[u8]); 2] = [
        ("ma-test-0001.cif", b"data_ma-test-0001\n"),
        ("ma-test-0002.cif", b"data_ma-test-0002\n"),
    ];
    write_zip(&bundle, &members);
    let intact = fs::read(bundle.as_std_path()).unwrap();
    let payload = intact
        .windows(b"data_ma-test-0001".len())
        .position(|window| window == b"data_ma-test-0001")
        .unwrap();
    let mut damaged = intact.clone();
    damaged[payload] = b'D';
    fs::write(bundle.as_std_path(), &damaged).unwrap();
    write_listing(
        &mirror,
        &[("ma-test-0001", 1, "bundle.zip"), ("ma-test-0002", 1, "bundle.zip")],
    );

    let providers: Vec<Box<dyn ModelProvider>> = vec![Box::new(
        LocalMirrorProvider::new(Provider::ModelArchive, mirror.clone()).with_copy_to_staging(true),
    )];
    let workflow = open_workflow(&root);
    let first = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&first);
    assert_eq!(done.aborted, 1);
    assert_eq!(done.failed, 0);
    assert_eq!(done.created, 1);
    assert_eq!(done.aborted_entries[0].source_id.as_str(), "ma-test-0001");
    let interrupted = workflow
        .ledger()
        .lookup_source(Provider::ModelArchive, "ma-test-0001")
        .unwrap()
        .unwrap();
    assert_eq!(interrupted.status, EntryStatus::Pending);
    assert_eq!(staged_count(&workflow, Provider::ModelArchive), 1);

    fs::write(bundle.as_std_path(), &intact).unwrap();
    let second = workflow.run(&providers, &options(), &SilentProgress);
    let done = only_summary(&second);
    assert_eq!(done.retried, 1);
    assert_eq!(done.created, 1);
    assert_eq!(done.aborted, 0);
    let (_, id) = IdMapper::assign_or_lookup(Provider::ModelArchive, "ma-test-0001").unwrap();
    assert_eq!(
        workflow.ledger().get(&id).unwrap().unwrap().status,
        EntryStatus::Complete
    );
    assert_eq!(
        entry_files(&workflow, Provider::ModelArchive, "ma-test-0001"),
        BTreeSet::from([format!("{id}.cif.gz")])
    );
    assert_eq!(staged_count(&workflow, Provider::ModelArchive), 0);
}

/// Raises the cancellation flag once the given number of models is converted.
struct CancelAfter {
    limit: usize,
    converted: AtomicUsize,
    cancel: Arc<OnceLock<Arc<AtomicBool>>>,
}

impl FormatConverter for CancelAfter {
    fn output_extension(&self, member_name: &str) -> String {
        GzipPassthrough.output_extension(member_name)
    }

    fn convert(&self, raw: &mut dyn std::io::Read, destination: &Utf8Path) -> Result<(), KiraError> {
        GzipPassthrough.convert(raw, destination)?;
        if self.converted.fetch_add(1, Ordering::SeqCst) + 1 == self.limit {
            if let Some(cancel) = self.cancel.get() {
                cancel.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[test]
fn cancel_inside_archive_resumes_without_duplicates() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    let sources: Vec<String> = (1..=6).map(|n| format!("ma-test-000{n}")).collect();
    let members: Vec<(String, Vec<u8>)> = sources
        .iter()
        .map(|source| (format!("{source}.cif"), format!("data_{source}\n").into_bytes()))
        .collect();
    write_tar(&mirror.join("bundle.tar"), &members, false);
    let rows: Vec<(&str, u32, &str)> = sources
        .iter()
        .map(|source| (source.as_str(), 1, "bundle.tar"))
        .collect();
    write_listing(&mirror, &rows);

    let cancel = Arc::new(OnceLock::new());
    let workflow = Workflow::open(
        Store::with_data_root(&root),
        ShardLayout::default(),
        LedgerOptions::default(),
        Box::new(CancelAfter {
            limit: 2,
            converted: AtomicUsize::new(0),
            cancel: Arc::clone(&cancel),
        }),
    )
    .unwrap();
    cancel.set(workflow.cancel_handle()).unwrap();
    let providers: Vec<Box<dyn ModelProvider>> = vec![Box::new(
        LocalMirrorProvider::new(Provider::ModelArchive, mirror.clone()).with_copy_to_staging(true),
    )];
    let serial = RunOptions {
        workers: 1,
        ..options()
    };

    let first = workflow.run(&providers, &serial, &SilentProgress);
    assert!(first.cancelled);
    let done = only_summary(&first);
    assert!(done.cancelled);
    assert_eq!(done.created, 2);
    assert_eq!(done.aborted, 4);
    for source in &sources[2..] {
        assert_eq!(
            workflow
                .ledger()
                .lookup_source(Provider::ModelArchive, source)
                .unwrap(),
            None
        );
    }
    assert_eq!(staged_count(&workflow, Provider::ModelArchive), 1);

    workflow.cancel_handle().store(false, Ordering::SeqCst);
    let second = workflow.run(&providers, &serial, &SilentProgress);
    assert!(second.is_success());
    let done = only_summary(&second);
    assert_eq!(done.created, 4);
    assert_eq!(done.unchanged, 2);
    assert_eq!(done.updated + done.failed + done.aborted, 0);
    for source in &sources {
        let entry = workflow
            .ledger()
            .lookup_source(Provider::ModelArchive, source)
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Complete);
        assert_eq!(entry.file_inventory.len(), 1);
    }
    assert_eq!(staged_count(&workflow, Provider::ModelArchive), 0);
}

#[test]
fn listing_cross_references_reach_the_ledger() {
    let temp = tempfile::tempdir().unwrap();
    let root = utf8(temp.path());
    let mirror = root.join("mirror/modelarchive");
    model_archive_mirror(&mirror);
    fs::write(
        mirror.join("listing.json").as_std_path(),
        br#"[{
            "sourceId": "ma-test-0001",
            "lastModified": "2024-06-01T00:00:00Z",
            "downloadRef": "ma-test-0001.cif",
            "crossReferences": [{"kind": "deposited", "database": "PDB", "accession": "1ABC"}]
        }]"#,
    )
    .unwrap();

    let workflow = open_workflow(&root);
    let summary = workflow.run(
        &mirror_provider(Provider::ModelArchive, &mirror),
        &options(),
        &SilentProgress,
    );
    assert_eq!(only_summary(&summary).created, 1);
    let entry = workflow
        .ledger()
        .lookup_source(Provider::ModelArchive, "ma-test-0001")
        .unwrap()
        .unwrap();
    assert_eq!(
        entry.metadata.cross_references,
        vec![CrossReference {
            kind: CrossReferenceKind::Deposited,
            database: "PDB".to_string(),
            accession: "1ABC".to_string(),
        }]
    );
}
