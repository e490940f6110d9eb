pub mod mirror;

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{CrossReference, Provider};
use crate::error::KiraError;
use crate::fs_util::StagedKind;

pub use mirror::LocalMirrorProvider;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadRef(String);

impl DownloadRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DownloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingItem {
    pub source_id: String,
    pub last_modified: DateTime<Utc>,
    pub download_ref: DownloadRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_references: Vec<CrossReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPart {
    pub path: Utf8PathBuf,
    pub kind: Option<StagedKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedItem {
    pub download_ref: DownloadRef,
    pub parts: Vec<StagedPart>,
    pub owned: bool,
}

pub trait ModelProvider: Send + Sync {
    fn provider(&self) -> Provider;

    fn list_available(&self) -> Result<Vec<ListingItem>, KiraError>;

    fn fetch(
        &self,
        download_ref: &DownloadRef,
        staging_dir: &camino::Utf8Path,
    ) -> Result<StagedItem, KiraError>;

    fn source_id_rule(&self) -> &SourceIdRule;
}

impl fmt::Debug for dyn ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelProvider")
            .field("provider", &self.provider())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarPattern {
    pub pattern: String,
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberRole {
    Model { source_id: String },
    Sidecar { source_id: String, suffix: String },
    Ignored,
}

#[derive(Debug, Clone)]
struct SidecarRule {
    pattern: Regex,
    suffix: String,
}

#[derive(Debug, Clone)]
pub struct SourceIdRule {
    model: Regex,
    sidecars: Vec<SidecarRule>,
}

impl SourceIdRule {
    pub fn new(model: &str, sidecars: &[SidecarPattern]) -> Result<Self, KiraError> {
        let model = compile_with_id(model)?;
        let sidecars = sidecars
            .iter()
            .map(|sidecar| {
                if sidecar.suffix.is_empty()
                    || !sidecar
                        .suffix
                        .chars()
                        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '.' || ch == '_')
                {
                    return Err(KiraError::InvalidRule(format!(
                        "sidecar suffix {:?} must be lowercase letters, digits, '.' or '_'",
                        sidecar.suffix
                    )));
                }
                Ok(SidecarRule {
                    pattern: compile_with_id(&sidecar.pattern)?,
                    suffix: sidecar.suffix.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { model, sidecars })
    }

    pub fn default_for(provider: Provider) -> Self {
        let (model, sidecars): (&str, Vec<(&str, &str)>) = match provider {
            Provider::AlphaFold | Provider::AlphaFoldCloud => (
                r"^(?P<id>AF-[A-Za-z0-9]+-F[0-9]+)-model_v[0-9]+\.cif(\.gz)?$",
                vec![
                    (
                        r"^(?P<id>AF-[A-Za-z0-9]+-F[0-9]+)-predicted_aligned_error_v[0-9]+\.json(\.gz)?$",
                        "pae.json.gz",
                    ),
                    (
                        r"^(?P<id>AF-[A-Za-z0-9]+-F[0-9]+)-confidence_v[0-9]+\.json(\.gz)?$",
                        "confidence.json.gz",
                    ),
                ],
            ),
            Provider::ModBase => (
                r"^(?P<id>(model_)?[0-9a-fA-F]{32})\.pdb(\.gz)?$",
                vec![(
                    r"^(?P<id>(model_)?[0-9a-fA-F]{32})\.xml(\.gz)?$",
                    "alignment.xml.gz",
                )],
            ),
            Provider::SwissModel => (
                r"^(?P<id>[A-Za-z0-9]{6,10}(_[A-Za-z0-9.]+)*)\.pdb(\.gz)?$",
                Vec::new(),
            ),
            Provider::ModelArchive => (r"^(?P<id>ma-[a-z0-9]+(-[a-z0-9]+)+)\.cif(\.gz)?$", Vec::new()),
        };
        let sidecars = sidecars
            .into_iter()
            .map(|(pattern, suffix)| SidecarPattern {
                pattern: pattern.to_string(),
                suffix: suffix.to_string(),
            })
            .collect::<Vec<_>>();
        Self::new(model, &sidecars).expect("valid built-in rule")
    }

    pub fn classify(&self, member_name: &str) -> MemberRole {
        let file_name = member_name.rsplit('/').next().unwrap_or(member_name);
        if let Some(id) = capture_id(&self.model, file_name) {
            return MemberRole::Model { source_id: id };
        }
        for sidecar in &self.sidecars {
            if let Some(id) = capture_id(&sidecar.pattern, file_name) {
                return MemberRole::Sidecar {
                    source_id: id,
                    suffix: sidecar.suffix.clone(),
                };
            }
        }
        MemberRole::Ignored
    }
}

fn compile_with_id(pattern: &str) -> Result<Regex, KiraError> {
    let regex = Regex::new(pattern)
        .map_err(|err| KiraError::InvalidRule(format!("{pattern}: {err}")))?;
    if !regex.capture_names().any(|name| name == Some("id")) {
        return Err(KiraError::InvalidRule(format!(
            "{pattern}: missing named group `id`"
        )));
    }
    Ok(regex)
}

fn capture_id(regex: &Regex, file_name: &str) -> Option<String> {
    regex
        .captures(file_name)
        .and_then(|caps| caps.name("id"))
        .map(|found| found.as_str().to_string())
}
