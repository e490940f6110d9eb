use std::collections::BTreeSet;
use std::io::{self, Write};

use serde::Serialize;

use crate::ledger::{CheckpointReport, LedgerDiff, LedgerStatus, PartitionReport};
use crate::workflow::{LocateResult, ProgressEvent, ProgressSink, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_diff(result: &LedgerDiff) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_locate(result: &Option<LocateResult>) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &LedgerStatus) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_checkpoint(result: &CheckpointReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_partition(result: &PartitionReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fragments(result: &BTreeSet<String>) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
