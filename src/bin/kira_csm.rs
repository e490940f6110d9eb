use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_csm::config::{ConfigLoader, ResolvedConfig};
use kira_csm::domain::Provider;
use kira_csm::error::KiraError;
use kira_csm::ledger::{LedgerDiff, ShardRouting};
use kira_csm::output::{JsonOutput, OutputMode, StderrProgress};
use kira_csm::workflow::{ProgressSink, RunSummary, Workflow};

#[derive(Parser)]
#[command(name = "kira-csm")]
#[command(about = "Incremental reorganization and holdings ledger for computed structure models")]
#[command(version, author)]
struct Cli {
    /// Config file (default: ./kira-csm.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List, diff, fetch and reorganize configured providers")]
    Run(RunArgs),
    #[command(about = "Show what a run would change")]
    Diff(ProviderArgs),
    #[command(about = "Resolve a provider source id to its canonical entry")]
    Locate(LocateArgs),
    #[command(about = "Inspect or maintain the holdings ledger")]
    Ledger(LedgerArgs),
}

#[derive(Args)]
struct ProviderArgs {
    /// Restrict to one configured provider
    #[arg(long)]
    provider: Option<Provider>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    target: ProviderArgs,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    retry_failed: bool,

    #[arg(long)]
    keep_source: bool,

    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct LocateArgs {
    provider: Provider,
    source_id: String,
}

#[derive(Args)]
struct LedgerArgs {
    #[command(subcommand)]
    command: LedgerCommand,
}

#[derive(Subcommand)]
enum LedgerCommand {
    #[command(about = "Per-shard entry counts")]
    Status,
    #[command(about = "Fold shard journals into snapshots")]
    Checkpoint,
    #[command(about = "Re-distribute entries under a new shard routing")]
    Partition(PartitionArgs),
    #[command(about = "List AlphaFold models held as several fragments")]
    Fragments(FragmentsArgs),
}

#[derive(Args)]
struct FragmentsArgs {
    #[arg(long, default_value = "alphafold")]
    provider: Provider,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoutingArg {
    Single,
    ByProvider,
    ByProviderRange,
}

#[derive(Args)]
struct PartitionArgs {
    #[arg(long, value_enum)]
    routing: RoutingArg,

    /// Leading digest digits per shard, for by-provider-range
    #[arg(long, default_value_t = 2)]
    prefix_len: u8,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(kira) = report.downcast_ref::<KiraError>() {
                return ExitCode::from(map_exit_code(kira));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidSourceId { .. }
        | KiraError::InvalidInternalId(_)
        | KiraError::UnknownProvider(_)
        | KiraError::InvalidRule(_)
        | KiraError::ShardLayoutMismatch { .. }
        | KiraError::ShardCapacity(_) => 2,
        KiraError::LedgerWrite { .. } | KiraError::LedgerRead { .. } | KiraError::LedgerSchema(_) => 3,
        KiraError::Fetch { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let workflow = Workflow::open(
        config.store.clone(),
        config.shard_layout,
        config.ledger.clone(),
        config.converter(),
    )?;

    match cli.command {
        Commands::Run(args) => run_providers(args, &config, &workflow, output_mode),
        Commands::Diff(args) => run_diff(args, &config, &workflow, output_mode),
        Commands::Locate(args) => {
            let located = workflow.locate(args.provider, &args.source_id)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_locate(&located).into_diagnostic()?,
                OutputMode::Human => match &located {
                    Some(found) => {
                        println!("{} {} ({})", found.entry.internal_id, found.absolute_path, found.entry.status);
                        for file in &found.entry.file_inventory {
                            println!("  {file}");
                        }
                    }
                    None => println!("{} {} is not in the holdings", args.provider, args.source_id),
                },
            }
            Ok(if located.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Commands::Ledger(args) => run_ledger(args, &workflow, output_mode),
    }
}

fn run_providers(
    args: RunArgs,
    config: &ResolvedConfig,
    workflow: &Workflow,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let mut options = config.run.clone();
    options.dry_run |= args.dry_run;
    options.retry_failed |= args.retry_failed;
    options.keep_source |= args.keep_source;
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }
    let providers = config.clients_for(args.target.provider)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &StderrProgress,
    };
    let summary = workflow.run(&providers, &options, sink);

    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&summary).into_diagnostic()?,
        OutputMode::Human => print_run_summary(&summary),
    }
    Ok(exit_code_for(&summary))
}

fn exit_code_for(summary: &RunSummary) -> ExitCode {
    if summary.is_success() {
        ExitCode::SUCCESS
    } else if summary.ledger_failed() {
        ExitCode::from(3)
    } else if summary.providers.iter().any(|run| run.error.is_some()) {
        ExitCode::from(4)
    } else {
        ExitCode::from(1)
    }
}

fn print_run_summary(summary: &RunSummary) {
    println!("kira-csm run summary");
    for run in &summary.providers {
        match (&run.summary, &run.error) {
            (Some(done), _) => {
                println!(
                    "{}: listed {}, new {}, changed {}, created {}, updated {}, unchanged {}, failed {}, aborted {}, invalid {}, stale {}{}",
                    run.provider,
                    done.listed,
                    done.new,
                    done.changed,
                    done.created,
                    done.updated,
                    done.unchanged,
                    done.failed,
                    done.aborted,
                    done.invalid,
                    done.marked_stale,
                    if done.dry_run { " (dry run)" } else { "" }
                );
                for failure in done.failures.iter().chain(&done.aborted_entries) {
                    println!("  {} {}: {}", failure.internal_id, failure.source_id, failure.reason);
                }
            }
            (None, Some(error)) => {
                println!("{}: failed after {} attempt(s): {error}", run.provider, run.attempts);
            }
            (None, None) => {}
        }
    }
    for shard in &summary.poisoned_shards {
        println!("ledger shard {} disabled: {}", shard.shard, shard.message);
    }
    for (shard, entries) in &summary.shards_over_threshold {
        println!("ledger shard {shard} holds {entries} entries; consider `kira-csm ledger partition`");
    }
    if summary.cancelled {
        println!("run cancelled");
    }
}

fn run_diff(
    args: ProviderArgs,
    config: &ResolvedConfig,
    workflow: &Workflow,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    for provider in config.clients_for(args.provider)? {
        let diff = workflow.diff(provider.as_ref())?;
        match output_mode {
            OutputMode::Json => JsonOutput::print_diff(&diff).into_diagnostic()?,
            OutputMode::Human => print_diff(provider.provider(), &diff),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_diff(provider: Provider, diff: &LedgerDiff) {
    println!(
        "{provider}: new {}, changed {}, retry {}, failed {}, unchanged {}, stale {}, revived {}, orphaned pending {}, invalid {}",
        diff.new.len(),
        diff.changed.len(),
        diff.retry.len(),
        diff.failed.len(),
        diff.unchanged,
        diff.stale.len(),
        diff.revived.len(),
        diff.orphaned_pending.len(),
        diff.invalid.len()
    );
    for invalid in &diff.invalid {
        println!("  invalid {:?}: {}", invalid.source_id, invalid.reason);
    }
}

fn run_ledger(args: LedgerArgs, workflow: &Workflow, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let ledger = workflow.ledger();
    match args.command {
        LedgerCommand::Status => {
            let status = ledger.status()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&status).into_diagnostic()?,
                OutputMode::Human => {
                    println!(
                        "schema {} routing {:?} layout {} threshold {}",
                        status.schema_version,
                        status.routing,
                        status.shard_layout,
                        status.partition_threshold
                    );
                    for shard in &status.shards {
                        println!(
                            "{}: {} entries (complete {}, pending {}, failed {}, stale {}){}",
                            shard.shard,
                            shard.entries,
                            shard.counts.complete,
                            shard.counts.pending,
                            shard.counts.failed,
                            shard.counts.stale,
                            if shard.over_threshold { " over threshold" } else { "" }
                        );
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        LedgerCommand::Checkpoint => {
            let report = ledger.compact()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_checkpoint(&report).into_diagnostic()?,
                OutputMode::Human => {
                    println!("checkpointed {} shard(s)", report.written.len());
                    for failure in &report.failed {
                        println!("  {} failed: {}", failure.shard, failure.message);
                    }
                }
            }
            Ok(if report.failed.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(3)
            })
        }
        LedgerCommand::Partition(args) => {
            let routing = match args.routing {
                RoutingArg::Single => ShardRouting::Single,
                RoutingArg::ByProvider => ShardRouting::ByProvider,
                RoutingArg::ByProviderRange => ShardRouting::ByProviderRange {
                    prefix_len: args.prefix_len,
                },
            };
            let report = ledger.partition_by(routing)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_partition(&report).into_diagnostic()?,
                OutputMode::Human => {
                    println!(
                        "moved {} entries into {} shard(s)",
                        report.moved_entries,
                        report.shards.len()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        LedgerCommand::Fragments(args) => {
            let fragments = ledger.fragmented_ids(args.provider)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_fragments(&fragments).into_diagnostic()?,
                OutputMode::Human => {
                    for source_id in &fragments {
                        println!("{source_id}");
                    }
                    eprintln!("{} fragmented model(s)", fragments.len());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
