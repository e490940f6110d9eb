use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::convert::{CommandConverter, FormatConverter, GzipPassthrough};
use crate::domain::Provider;
use crate::error::KiraError;
use crate::ledger::{DEFAULT_PARTITION_THRESHOLD, LedgerOptions, ShardRouting};
use crate::providers::{LocalMirrorProvider, ModelProvider, SidecarPattern, SourceIdRule};
use crate::shard::ShardLayout;
use crate::store::Store;
use crate::workflow::RunOptions;

pub const CONFIG_FILE: &str = "kira-csm.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub ledger_dir: Option<String>,
    #[serde(default)]
    pub staging_dir: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub keep_source: Option<bool>,
    #[serde(default)]
    pub retry_failed: Option<bool>,
    #[serde(default)]
    pub provider_attempts: Option<u32>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub shard_layout: Option<ShardLayoutEntry>,
    #[serde(default)]
    pub ledger: Option<LedgerEntry>,
    #[serde(default)]
    pub converter: Option<ConverterEntry>,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ShardLayoutEntry {
    #[serde(default)]
    pub segment_width: Option<u8>,
    #[serde(default)]
    pub depth: Option<u8>,
    #[serde(default)]
    pub max_entries_per_dir: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub routing: Option<ShardRouting>,
    #[serde(default)]
    pub partition_threshold: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConverterEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub extension: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ProviderEntry {
    Shorthand(String),
    Detailed(ProviderEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProviderEntryObject {
    pub provider: String,
    #[serde(default)]
    pub mirror: Option<String>,
    #[serde(default)]
    pub model_pattern: Option<String>,
    #[serde(default)]
    pub sidecars: Option<Vec<SidecarPattern>>,
    #[serde(default)]
    pub copy_to_staging: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider: Provider,
    pub mirror: Utf8PathBuf,
    pub rule: SourceIdRule,
    pub copy_to_staging: bool,
}

impl ProviderRequest {
    pub fn client(&self) -> Box<dyn ModelProvider> {
        Box::new(
            LocalMirrorProvider::new(self.provider, self.mirror.clone())
                .with_rule(self.rule.clone())
                .with_copy_to_staging(self.copy_to_staging),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store: Store,
    pub shard_layout: ShardLayout,
    pub ledger: LedgerOptions,
    pub run: RunOptions,
    pub converter: Option<CommandConverter>,
    pub providers: Vec<ProviderRequest>,
}

impl ResolvedConfig {
    pub fn converter(&self) -> Box<dyn FormatConverter> {
        match &self.converter {
            Some(command) => Box::new(command.clone()),
            None => Box::new(GzipPassthrough),
        }
    }

    pub fn provider_clients(&self) -> Vec<Box<dyn ModelProvider>> {
        self.providers.iter().map(ProviderRequest::client).collect()
    }

    pub fn clients_for(&self, only: Option<Provider>) -> Result<Vec<Box<dyn ModelProvider>>, KiraError> {
        match only {
            None => Ok(self.provider_clients()),
            Some(provider) => {
                let request = self
                    .providers
                    .iter()
                    .find(|request| request.provider == provider)
                    .ok_or_else(|| KiraError::UnknownProvider(format!("{provider} is not configured")))?;
                Ok(vec![request.client()])
            }
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let data_root = match config.data_root.as_deref() {
            Some(root) => Utf8PathBuf::from(root),
            None => Store::default_data_root()?,
        };
        let defaults = Store::with_data_root(&data_root);
        let store = Store::new_with_paths(
            config
                .models_dir
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.models_root().to_path_buf()),
            config
                .ledger_dir
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.ledger_root().to_path_buf()),
            config
                .staging_dir
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| defaults.staging_root().to_path_buf()),
        );

        let layout_entry = config.shard_layout.unwrap_or_default();
        let fallback = ShardLayout::default();
        let shard_layout = ShardLayout {
            segment_width: layout_entry.segment_width.unwrap_or(fallback.segment_width),
            depth: layout_entry.depth.unwrap_or(fallback.depth),
            max_entries_per_dir: layout_entry
                .max_entries_per_dir
                .unwrap_or(fallback.max_entries_per_dir),
        };
        shard_layout.validate()?;

        let ledger_entry = config.ledger.unwrap_or_default();
        let ledger = LedgerOptions {
            routing: ledger_entry.routing.unwrap_or_default(),
            partition_threshold: ledger_entry
                .partition_threshold
                .unwrap_or(DEFAULT_PARTITION_THRESHOLD),
            shard_layout,
        };
        ledger.routing.validate()?;

        let run_defaults = RunOptions::default();
        let run = RunOptions {
            workers: config.workers.unwrap_or(run_defaults.workers).max(1),
            keep_source: config.keep_source.unwrap_or(run_defaults.keep_source),
            retry_failed: config.retry_failed.unwrap_or(run_defaults.retry_failed),
            dry_run: false,
            provider_attempts: config
                .provider_attempts
                .unwrap_or(run_defaults.provider_attempts)
                .max(1),
            retry_delay: config
                .retry_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(run_defaults.retry_delay),
        };

        let converter = config.converter.map(|entry| {
            CommandConverter::new(
                entry.command,
                entry.args,
                entry.extension.unwrap_or_else(|| "bcif".to_string()),
            )
        });

        let providers = config
            .providers
            .into_iter()
            .map(|entry| match entry {
                ProviderEntry::Shorthand(value) => {
                    let provider: Provider = value.parse()?;
                    Ok(ProviderRequest {
                        provider,
                        mirror: default_mirror(&data_root, provider),
                        rule: SourceIdRule::default_for(provider),
                        copy_to_staging: false,
                    })
                }
                ProviderEntry::Detailed(obj) => {
                    let provider: Provider = obj.provider.parse()?;
                    let rule = match (obj.model_pattern, obj.sidecars) {
                        (None, None) => SourceIdRule::default_for(provider),
                        (Some(model), sidecars) => {
                            SourceIdRule::new(&model, &sidecars.unwrap_or_default())?
                        }
                        (None, Some(_)) => {
                            return Err(KiraError::InvalidRule(format!(
                                "{provider}: sidecars require model_pattern"
                            )));
                        }
                    };
                    Ok(ProviderRequest {
                        provider,
                        mirror: obj
                            .mirror
                            .map(Utf8PathBuf::from)
                            .unwrap_or_else(|| default_mirror(&data_root, provider)),
                        rule,
                        copy_to_staging: obj.copy_to_staging.unwrap_or(false),
                    })
                }
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            store,
            shard_layout,
            ledger,
            run,
            converter,
            providers,
        })
    }
}

pub fn default_mirror(data_root: &Utf8Path, provider: Provider) -> Utf8PathBuf {
    data_root.join("mirror").join(provider.key())
}
