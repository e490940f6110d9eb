use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

static ALPHAFOLD_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^AF-[A-Z0-9]{6,10}-F[0-9]+$").expect("valid regex"));
static MODBASE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(model_)?[0-9a-f]{32}$").expect("valid regex"));
static SWISSMODEL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{6,10}(_[A-Z0-9.]+)*$").expect("valid regex"));
static MODELARCHIVE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ma-[a-z0-9]+(-[a-z0-9]+)+$").expect("valid regex"));
static INTERNAL_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}_[0-9A-F]{24}$").expect("valid regex"));

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
pub enum Provider {
    #[serde(rename = "alphafold")]
    #[value(name = "alphafold")]
    AlphaFold,
    #[serde(rename = "modbase")]
    #[value(name = "modbase")]
    ModBase,
    #[serde(rename = "swissmodel")]
    #[value(name = "swissmodel")]
    SwissModel,
    #[serde(rename = "modelarchive")]
    #[value(name = "modelarchive")]
    ModelArchive,
    #[serde(rename = "alphafold-cloud")]
    #[value(name = "alphafold-cloud")]
    AlphaFoldCloud,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::AlphaFold,
        Provider::ModBase,
        Provider::SwissModel,
        Provider::ModelArchive,
        Provider::AlphaFoldCloud,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Provider::AlphaFold => "alphafold",
            Provider::ModBase => "modbase",
            Provider::SwissModel => "swissmodel",
            Provider::ModelArchive => "modelarchive",
            Provider::AlphaFoldCloud => "alphafold-cloud",
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Provider::AlphaFold => "AF",
            Provider::ModBase => "MB",
            Provider::SwissModel => "SM",
            Provider::ModelArchive => "MA",
            Provider::AlphaFoldCloud => "AC",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Provider> {
        Provider::ALL
            .into_iter()
            .find(|provider| provider.prefix() == prefix)
    }

    fn grammar(&self) -> &'static Regex {
        match self {
            Provider::AlphaFold | Provider::AlphaFoldCloud => &ALPHAFOLD_ID,
            Provider::ModBase => &MODBASE_ID,
            Provider::SwissModel => &SWISSMODEL_ID,
            Provider::ModelArchive => &MODELARCHIVE_ID,
        }
    }

    fn grammar_hint(&self) -> &'static str {
        match self {
            Provider::AlphaFold | Provider::AlphaFoldCloud => "expected AF-<accession>-F<n>",
            Provider::ModBase => "expected [model_]<32 hex digits>",
            Provider::SwissModel => "expected <accession>[_<part>...]",
            Provider::ModelArchive => "expected ma-<project>-<id>",
        }
    }

    fn normalize(&self, value: &str) -> String {
        match self {
            Provider::AlphaFold | Provider::AlphaFoldCloud | Provider::SwissModel => {
                value.to_uppercase()
            }
            Provider::ModBase | Provider::ModelArchive => value.to_lowercase(),
        }
    }

    pub fn source_url(&self, id: &SourceId) -> String {
        let value = id.as_str();
        match self {
            Provider::AlphaFold | Provider::AlphaFoldCloud => {
                let accession = value.split('-').nth(1).unwrap_or(value);
                format!("https://alphafold.ebi.ac.uk/entry/{accession}")
            }
            Provider::ModBase => {
                let hash = value.trim_start_matches("model_");
                format!("https://salilab.org/modbase/retrieve/modbase/?modelID={hash}&format=mmcif")
            }
            Provider::SwissModel => {
                let accession = value.split('_').next().unwrap_or(value);
                format!("https://swissmodel.expasy.org/repository/uniprot/{accession}")
            }
            Provider::ModelArchive => {
                format!("https://www.modelarchive.org/doi/10.5452/{value}")
            }
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl FromStr for Provider {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        match normalized.as_str() {
            "alphafold" | "af" => Ok(Provider::AlphaFold),
            "modbase" | "mb" => Ok(Provider::ModBase),
            "swissmodel" | "swiss-model" | "sm" => Ok(Provider::SwissModel),
            "modelarchive" | "model-archive" | "ma" => Ok(Provider::ModelArchive),
            "alphafold-cloud" | "alphafoldcloud" | "ac" => Ok(Provider::AlphaFoldCloud),
            _ => Err(KiraError::UnknownProvider(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn parse(provider: Provider, value: &str) -> Result<Self, KiraError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(KiraError::invalid_source_id(provider, value, "empty"));
        }
        let normalized = provider.normalize(trimmed);
        if !provider.grammar().is_match(&normalized) {
            return Err(KiraError::invalid_source_id(
                provider,
                value,
                provider.grammar_hint(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InternalId(String);

impl InternalId {
    pub(crate) fn from_parts(provider: Provider, digest: &str) -> Self {
        Self(format!("{}_{}", provider.prefix(), digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn provider(&self) -> Provider {
        Provider::from_prefix(&self.0[..2]).unwrap_or(Provider::AlphaFold)
    }

    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }

    pub fn digest(&self) -> &str {
        &self.0[3..]
    }
}

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InternalId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !INTERNAL_ID.is_match(trimmed) || Provider::from_prefix(&trimmed[..2]).is_none() {
            return Err(KiraError::InvalidInternalId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for InternalId {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InternalId> for String {
    fn from(value: InternalId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Complete,
    Failed,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Complete => write!(f, "complete"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossReferenceKind {
    Deposited,
    Assembly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub kind: CrossReferenceKind,
    pub database: String,
    pub accession: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_references: Vec<CrossReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub internal_id: InternalId,
    pub source_id: String,
    pub provider: Provider,
    pub source_last_modified: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub canonical_path: String,
    #[serde(default)]
    pub file_inventory: Vec<String>,
    pub status: EntryStatus,
    #[serde(default)]
    pub metadata: EntryMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
}

impl ModelEntry {
    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Complete
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }
}
