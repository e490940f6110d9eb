use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::Provider;
use crate::error::KiraError;
use crate::fs_util::{MemberFlow, StagedKind, visit_members};
use crate::providers::{
    DownloadRef, ListingItem, MemberRole, ModelProvider, SourceIdRule, StagedItem, StagedPart,
};
use crate::store::{Store, walk_dir};

pub const LISTING_FILE: &str = "listing.json";

#[derive(Debug)]
pub struct LocalMirrorProvider {
    provider: Provider,
    root: Utf8PathBuf,
    rule: SourceIdRule,
    copy_to_staging: bool,
    sidecars: Mutex<HashMap<DownloadRef, Vec<Utf8PathBuf>>>,
}

impl LocalMirrorProvider {
    pub fn new(provider: Provider, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            provider,
            root: root.into(),
            rule: SourceIdRule::default_for(provider),
            copy_to_staging: false,
            sidecars: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rule(mut self, rule: SourceIdRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_copy_to_staging(mut self, copy: bool) -> Self {
        self.copy_to_staging = copy;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn fetch_error(&self, message: impl Into<String>) -> KiraError {
        KiraError::Fetch {
            provider: self.provider.to_string(),
            message: message.into(),
        }
    }

    fn read_listing_file(&self, path: &Utf8Path) -> Result<Vec<ListingItem>, KiraError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| self.fetch_error(format!("read {path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| self.fetch_error(format!("parse {path}: {err}")))
    }

    fn scan(&self) -> Result<Vec<ListingItem>, KiraError> {
        let mut items = Vec::new();
        let mut loose: BTreeMap<(String, String), LooseGroup> = BTreeMap::new();

        for path in walk_dir(self.root.as_std_path())? {
            if !path.is_file() {
                continue;
            }
            let path = Utf8PathBuf::from_path_buf(path)
                .map_err(|path| self.fetch_error(format!("non UTF-8 path {}", path.display())))?;
            let Some(name) = path.file_name() else {
                continue;
            };
            if name.starts_with('.') || name == LISTING_FILE {
                continue;
            }
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|err| self.fetch_error(err.to_string()))?
                .to_path_buf();
            let modified = modified_at(&path)?;
            let kind = StagedKind::detect(path.as_std_path())?;

            if kind.is_archive() {
                let mut seen = BTreeSet::new();
                visit_members(path.as_std_path(), kind, |member| {
                    if let MemberRole::Model { source_id } = self.rule.classify(&member.name) {
                        if seen.insert(source_id.clone()) {
                            items.push(ListingItem {
                                source_id,
                                last_modified: modified,
                                download_ref: DownloadRef::new(relative.as_str()),
                                cross_references: Vec::new(),
                            });
                        }
                    }
                    Ok(MemberFlow::Continue)
                })?;
                debug!(archive = %relative, models = seen.len(), "scanned mirror archive");
                continue;
            }

            let dir = relative.parent().map(|p| p.to_string()).unwrap_or_default();
            match self.rule.classify(name) {
                MemberRole::Model { source_id } => {
                    let group = loose.entry((dir, source_id)).or_default();
                    group.model = Some(relative);
                    group.modified = group.modified.max(Some(modified));
                }
                MemberRole::Sidecar { source_id, .. } => {
                    let group = loose.entry((dir, source_id)).or_default();
                    group.sidecars.push(relative);
                    group.modified = group.modified.max(Some(modified));
                }
                MemberRole::Ignored => {}
            }
        }

        let mut sidecars = HashMap::new();
        for ((_, source_id), group) in loose {
            let (Some(model), Some(modified)) = (group.model, group.modified) else {
                continue;
            };
            let download_ref = DownloadRef::new(model.as_str());
            if !group.sidecars.is_empty() {
                sidecars.insert(download_ref.clone(), group.sidecars);
            }
            items.push(ListingItem {
                source_id,
                last_modified: modified,
                download_ref,
                cross_references: Vec::new(),
            });
        }
        *self
            .sidecars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sidecars;
        Ok(items)
    }

    fn resolve(&self, relative: &Utf8Path) -> Result<Utf8PathBuf, KiraError> {
        let unsafe_component = relative
            .components()
            .any(|component| !matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir));
        if unsafe_component {
            return Err(self.fetch_error(format!("download reference {relative} escapes the mirror")));
        }
        let path = self.root.join(relative);
        if !path.as_std_path().is_file() {
            return Err(self.fetch_error(format!("{path} not found")));
        }
        Ok(path)
    }
}

#[derive(Debug, Default)]
struct LooseGroup {
    model: Option<Utf8PathBuf>,
    sidecars: Vec<Utf8PathBuf>,
    modified: Option<DateTime<Utc>>,
}

impl ModelProvider for LocalMirrorProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn list_available(&self) -> Result<Vec<ListingItem>, KiraError> {
        let listing = self.root.join(LISTING_FILE);
        let items = if listing.as_std_path().is_file() {
            self.read_listing_file(&listing)?
        } else if self.root.as_std_path().is_dir() {
            self.scan()?
        } else {
            return Err(self.fetch_error(format!("mirror root {} does not exist", self.root)));
        };
        info!(provider = %self.provider, items = items.len(), "listed mirror");
        Ok(items)
    }

    fn fetch(&self, download_ref: &DownloadRef, staging_dir: &Utf8Path) -> Result<StagedItem, KiraError> {
        let mut sources = vec![self.resolve(Utf8Path::new(download_ref.as_str()))?];
        let sidecars = self
            .sidecars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(download_ref)
            .cloned()
            .unwrap_or_default();
        for sidecar in sidecars {
            sources.push(self.resolve(&sidecar)?);
        }

        if !self.copy_to_staging {
            return Ok(StagedItem {
                download_ref: download_ref.clone(),
                parts: sources
                    .into_iter()
                    .map(|path| StagedPart { path, kind: None })
                    .collect(),
                owned: false,
            });
        }

        let mut parts = Vec::with_capacity(sources.len());
        for (index, source) in sources.into_iter().enumerate() {
            let name = source.file_name().unwrap_or("staged");
            let dest = staging_dir.join(format!("{index:03}-{name}"));
            Store::copy_file_atomic(&source, &dest)
                .map_err(|err| self.fetch_error(format!("stage {source}: {err}")))?;
            parts.push(StagedPart {
                path: dest,
                kind: None,
            });
        }
        Ok(StagedItem {
            download_ref: download_ref.clone(),
            parts,
            owned: true,
        })
    }

    fn source_id_rule(&self) -> &SourceIdRule {
        &self.rule
    }
}

fn modified_at(path: &Utf8Path) -> Result<DateTime<Utc>, KiraError> {
    let modified = fs::metadata(path.as_std_path())
        .and_then(|meta| meta.modified())
        .map_err(|err| KiraError::Filesystem(format!("stat {path}: {err}")))?;
    Ok(DateTime::<Utc>::from(modified))
}
