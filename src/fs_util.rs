use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zip::ZipArchive;

use crate::error::KiraError;

const TAR_MAGIC_OFFSET: usize = 257;
const TAR_BLOCK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagedKind {
    File,
    Tar,
    TarGz,
    Zip,
}

impl StagedKind {
    pub fn is_archive(&self) -> bool {
        !matches!(self, StagedKind::File)
    }

    pub fn detect(path: &Path) -> Result<Self, KiraError> {
        let mut head = Vec::with_capacity(TAR_BLOCK);
        open(path)?
            .take(TAR_BLOCK as u64)
            .read_to_end(&mut head)
            .map_err(|err| KiraError::Archive(format!("read {}: {err}", path.display())))?;

        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            return Ok(StagedKind::Zip);
        }
        if is_tar_header(&head) {
            return Ok(StagedKind::Tar);
        }
        if head.starts_with(&[0x1f, 0x8b]) {
            let mut inner = Vec::with_capacity(TAR_BLOCK);
            let decoder = GzDecoder::new(open(path)?);
            // A gzip payload shorter than one block is a plain compressed file.
            let _ = decoder.take(TAR_BLOCK as u64).read_to_end(&mut inner);
            if is_tar_header(&inner) {
                return Ok(StagedKind::TarGz);
            }
        }
        Ok(StagedKind::File)
    }
}

fn is_tar_header(block: &[u8]) -> bool {
    block.len() >= TAR_MAGIC_OFFSET + 5
        && &block[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDescriptor {
    pub index: u64,
    pub name: String,
    pub size: u64,
}

impl MemberDescriptor {
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberFlow {
    Continue,
    Stop,
}

pub fn visit_members<F>(path: &Path, kind: StagedKind, mut visit: F) -> Result<(), KiraError>
where
    F: FnMut(&MemberDescriptor) -> Result<MemberFlow, KiraError>,
{
    for_each_member(path, kind, |member, _| visit(member))
}

pub fn for_each_member<F>(path: &Path, kind: StagedKind, mut visit: F) -> Result<(), KiraError>
where
    F: FnMut(&MemberDescriptor, &mut dyn Read) -> Result<MemberFlow, KiraError>,
{
    let mut index = 0u64;
    match kind {
        StagedKind::File => {
            let mut reader = BufReader::new(open(path)?);
            let size = fs::metadata(path)
                .map_err(|err| KiraError::Archive(format!("stat {}: {err}", path.display())))?
                .len();
            let descriptor = MemberDescriptor {
                index,
                name: file_name(path),
                size,
            };
            visit(&descriptor, &mut reader)?;
        }
        StagedKind::Tar | StagedKind::TarGz => {
            let mut archive = tar::Archive::new(tar_reader(path, kind)?);
            let entries = archive
                .entries()
                .map_err(|err| KiraError::Archive(err.to_string()))?;
            for entry in entries {
                let mut entry = entry.map_err(|err| KiraError::Archive(err.to_string()))?;
                let Some((name, size)) = tar_member(&entry)? else {
                    continue;
                };
                let descriptor = MemberDescriptor { index, name, size };
                index += 1;
                if visit(&descriptor, &mut entry)? == MemberFlow::Stop {
                    break;
                }
            }
        }
        StagedKind::Zip => {
            let mut archive = ZipArchive::new(open(path)?)
                .map_err(|err| KiraError::Archive(err.to_string()))?;
            for i in 0..archive.len() {
                let mut entry = archive
                    .by_index(i)
                    .map_err(|err| KiraError::Archive(err.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let Some(name) = entry.enclosed_name() else {
                    warn!(member = entry.name(), "skipping zip member with unsafe path");
                    continue;
                };
                let descriptor = MemberDescriptor {
                    index,
                    name: name.to_string_lossy().replace('\\', "/"),
                    size: entry.size(),
                };
                index += 1;
                if visit(&descriptor, &mut entry)? == MemberFlow::Stop {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Wraps a member reader and remembers the first read error, so callers can
/// tell a damaged source apart from a failure of whatever consumed it.
pub struct SourceReader<'r> {
    inner: &'r mut dyn Read,
    failure: Option<String>,
}

impl<'r> SourceReader<'r> {
    pub fn new(inner: &'r mut dyn Read) -> Self {
        Self {
            inner,
            failure: None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|err| {
            if self.failure.is_none() && err.kind() != io::ErrorKind::Interrupted {
                self.failure = Some(err.to_string());
            }
        })
    }
}

fn tar_reader(path: &Path, kind: StagedKind) -> Result<Box<dyn Read>, KiraError> {
    let file = BufReader::new(open(path)?);
    Ok(match kind {
        StagedKind::TarGz => Box::new(GzDecoder::new(file)),
        _ => Box::new(file),
    })
}

fn tar_member<R: Read>(entry: &tar::Entry<'_, R>) -> Result<Option<(String, u64)>, KiraError> {
    if !entry.header().entry_type().is_file() {
        return Ok(None);
    }
    let path = entry
        .path()
        .map_err(|err| KiraError::Archive(err.to_string()))?;
    if path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        warn!(member = %path.display(), "skipping tar member with unsafe path");
        return Ok(None);
    }
    Ok(Some((path.to_string_lossy().replace('\\', "/"), entry.size())))
}

fn open(path: &Path) -> Result<fs::File, KiraError> {
    fs::File::open(path)
        .map_err(|err| KiraError::Archive(format!("open {}: {err}", path.display())))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
