use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{InternalId, ModelEntry};
use crate::error::KiraError;
use crate::store::{Store, sync_dir};

pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub shard: String,
    #[serde(default)]
    pub entry_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalRecord {
    Upsert { entry: ModelEntry },
    Remove { internal_id: InternalId },
}

#[derive(Debug)]
pub struct ShardFiles {
    key: String,
    snapshot: Utf8PathBuf,
    journal: Utf8PathBuf,
    writer: Option<File>,
}

impl ShardFiles {
    pub fn new(dir: &Utf8Path, key: &str) -> Self {
        Self {
            key: key.to_string(),
            snapshot: dir.join(format!("holdings-{key}.jsonl.gz")),
            journal: dir.join(format!("holdings-{key}.journal.jsonl")),
            writer: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot_path(&self) -> &Utf8Path {
        &self.snapshot
    }

    pub fn journal_is_empty(&self) -> bool {
        fs::metadata(self.journal.as_std_path())
            .map(|meta| meta.len() == 0)
            .unwrap_or(true)
    }

    pub fn read_header(&self) -> Result<Option<SnapshotHeader>, KiraError> {
        if !self.snapshot.as_std_path().exists() {
            return Ok(None);
        }
        let mut lines = self.snapshot_lines()?;
        match lines.next() {
            Some(line) => {
                let line = line.map_err(|err| self.read_error(&self.snapshot, err))?;
                self.parse_header(&line).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn for_each_snapshot_entry<F>(&self, mut visit: F) -> Result<(), KiraError>
    where
        F: FnMut(ModelEntry) -> Result<(), KiraError>,
    {
        if !self.snapshot.as_std_path().exists() {
            return Ok(());
        }
        let mut lines = self.snapshot_lines()?;
        if let Some(header) = lines.next() {
            let header = header.map_err(|err| self.read_error(&self.snapshot, err))?;
            self.parse_header(&header)?;
        }
        for line in lines {
            let line = line.map_err(|err| self.read_error(&self.snapshot, err))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ModelEntry =
                serde_json::from_str(&line).map_err(|err| self.read_error(&self.snapshot, err))?;
            visit(entry)?;
        }
        Ok(())
    }

    pub fn load(&mut self) -> Result<BTreeMap<InternalId, ModelEntry>, KiraError> {
        let mut entries = BTreeMap::new();
        self.for_each_snapshot_entry(|entry| {
            entries.insert(entry.internal_id.clone(), entry);
            Ok(())
        })?;

        if !self.journal.as_std_path().exists() {
            return Ok(entries);
        }
        let bytes = fs::read(self.journal.as_std_path())
            .map_err(|err| self.read_error(&self.journal, err))?;
        let complete_len = bytes
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let mut records = Vec::new();
        let mut keep_len = complete_len;
        let mut start = 0;
        while start < complete_len {
            let end = bytes[start..complete_len]
                .iter()
                .position(|byte| *byte == b'\n')
                .map_or(complete_len, |pos| start + pos);
            let next = end + 1;
            let line = &bytes[start..end];
            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<JournalRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(_) if bytes[next.min(complete_len)..complete_len]
                        .iter()
                        .all(u8::is_ascii_whitespace) =>
                    {
                        keep_len = start;
                        break;
                    }
                    Err(err) => return Err(self.read_error(&self.journal, err)),
                }
            }
            start = next;
        }

        if keep_len < bytes.len() {
            warn!(
                shard = %self.key,
                dropped = bytes.len() - keep_len,
                "dropping torn journal tail"
            );
            self.writer = None;
            let file = OpenOptions::new()
                .write(true)
                .open(self.journal.as_std_path())
                .map_err(|err| self.read_error(&self.journal, err))?;
            file.set_len(keep_len as u64)
                .and_then(|_| file.sync_all())
                .map_err(|err| self.read_error(&self.journal, err))?;
        }

        for record in records {
            match record {
                JournalRecord::Upsert { entry } => {
                    entries.insert(entry.internal_id.clone(), entry);
                }
                JournalRecord::Remove { internal_id } => {
                    entries.remove(&internal_id);
                }
            }
        }
        Ok(entries)
    }

    pub fn append(&mut self, record: &JournalRecord, durable: bool) -> Result<(), KiraError> {
        let mut line =
            serde_json::to_vec(record).map_err(|err| self.write_error(err.to_string()))?;
        line.push(b'\n');
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.journal.as_std_path())
                .map_err(|err| self.write_error(err.to_string()))?;
            self.writer = Some(file);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ledger_write(&self.key, "journal not open"))?;
        writer
            .write_all(&line)
            .map_err(|err| ledger_write(&self.key, err))?;
        if durable {
            self.sync_journal()?;
        }
        Ok(())
    }

    pub fn sync_journal(&mut self) -> Result<(), KiraError> {
        if let Some(writer) = self.writer.as_ref() {
            writer
                .sync_data()
                .map_err(|err| self.write_error(err.to_string()))?;
        }
        Ok(())
    }

    pub fn write_snapshot(
        &mut self,
        entries: &BTreeMap<InternalId, ModelEntry>,
    ) -> Result<(), KiraError> {
        let temp = Store::temp_beside(&self.snapshot).map_err(|err| self.write_error(err.to_string()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(temp), Compression::default());
        let header = SnapshotHeader {
            schema_version: SCHEMA_VERSION,
            shard: self.key.clone(),
            entry_count: entries.len() as u64,
        };
        write_json_line(&mut encoder, &header).map_err(|err| ledger_write(&self.key, err))?;
        for entry in entries.values() {
            write_json_line(&mut encoder, entry).map_err(|err| ledger_write(&self.key, err))?;
        }
        let temp = encoder
            .finish()
            .map_err(|err| self.write_error(err.to_string()))?
            .into_inner()
            .map_err(|err| self.write_error(err.to_string()))?;
        Store::persist(temp, &self.snapshot).map_err(|err| self.write_error(err.to_string()))?;

        self.writer = None;
        if self.journal.as_std_path().exists() {
            fs::remove_file(self.journal.as_std_path())
                .map_err(|err| self.write_error(err.to_string()))?;
            if let Some(parent) = self.journal.parent() {
                sync_dir(parent.as_std_path()).map_err(|err| self.write_error(err.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn remove_files(&mut self) -> Result<(), KiraError> {
        self.writer = None;
        for path in [&self.snapshot, &self.journal] {
            if path.as_std_path().exists() {
                fs::remove_file(path.as_std_path())
                    .map_err(|err| self.write_error(err.to_string()))?;
            }
        }
        Ok(())
    }

    fn snapshot_lines(&self) -> Result<std::io::Lines<BufReader<GzDecoder<BufReader<File>>>>, KiraError> {
        let file = File::open(self.snapshot.as_std_path())
            .map_err(|err| self.read_error(&self.snapshot, err))?;
        Ok(BufReader::new(GzDecoder::new(BufReader::new(file))).lines())
    }

    fn parse_header(&self, line: &str) -> Result<SnapshotHeader, KiraError> {
        let header: SnapshotHeader =
            serde_json::from_str(line).map_err(|err| self.read_error(&self.snapshot, err))?;
        if header.schema_version > SCHEMA_VERSION {
            warn!(
                shard = %self.key,
                schema_version = header.schema_version,
                "ledger shard written by a newer schema; unknown fields are ignored"
            );
        }
        Ok(header)
    }

    fn read_error(&self, path: &Utf8Path, err: impl ToString) -> KiraError {
        KiraError::LedgerRead {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    fn write_error(&self, message: String) -> KiraError {
        ledger_write(&self.key, message)
    }
}

fn ledger_write(shard: &str, message: impl ToString) -> KiraError {
    KiraError::LedgerWrite {
        shard: shard.to_string(),
        message: message.to_string(),
    }
}

fn write_json_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")
}
