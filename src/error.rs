use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid {provider} source id {source_id:?}: {reason}")]
    InvalidSourceId {
        provider: String,
        source_id: String,
        reason: String,
    },

    #[error("invalid internal model id: {0}")]
    InvalidInternalId(String),

    #[error("unknown model provider: {0}")]
    UnknownProvider(String),

    #[error("invalid source id rule: {0}")]
    InvalidRule(String),

    #[error("conversion failed: {0}")]
    ConversionFailure(String),

    #[error("ledger shard {shard} is not writable: {message}")]
    LedgerWrite { shard: String, message: String },

    #[error("failed to read ledger file {path}: {message}")]
    LedgerRead { path: String, message: String },

    #[error("unsupported ledger schema: {0}")]
    LedgerSchema(String),

    #[error("shard layout {requested} does not match the layout {recorded} recorded in the ledger")]
    #[diagnostic(help("changing the shard layout requires a full re-shard migration"))]
    ShardLayoutMismatch { requested: String, recorded: String },

    #[error("shard layout cannot hold the corpus: {0}")]
    ShardCapacity(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("{provider} fetch failed: {message}")]
    Fetch { provider: String, message: String },

    #[error("missing config file kira-csm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("run cancelled")]
    Cancelled,
}

impl KiraError {
    pub fn invalid_source_id(
        provider: impl ToString,
        source_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        KiraError::InvalidSourceId {
            provider: provider.to_string(),
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}
