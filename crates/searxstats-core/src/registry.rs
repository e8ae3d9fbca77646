//! Instance registry: loads the target set and hands it out in a stable order.
//!
//! Accepted sources:
//! - a JSON file holding an array of URL strings or of
//!   `{ "url": ..., "capabilities": [...], "last_known_good": ... }` objects
//! - a plain text file, one URL per line, `#` starts a comment
//! - any iterator of URL strings
//!
//! Instances are deduplicated on their normalized URL (first entry wins) and
//! sorted lexicographically so scheduling and reporting are reproducible.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::instance::{Instance, InstanceId, NetworkType};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceEntry {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        capabilities: BTreeSet<String>,
        #[serde(default)]
        last_known_good: Option<DateTime<Utc>>,
    },
}

impl SourceEntry {
    fn into_instance(self) -> ConfigResult<Instance> {
        match self {
            SourceEntry::Url(url) => Instance::parse(&url),
            SourceEntry::Detailed {
                url,
                capabilities,
                last_known_good,
            } => {
                let mut instance = Instance::parse(&url)?.with_capabilities(capabilities);
                instance.last_known_good = last_known_good;
                Ok(instance)
            }
        }
    }
}

/// Ordered, deduplicated set of target instances.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    instances: Vec<Instance>,
}

impl InstanceRegistry {
    /// Build a registry from raw URLs.
    pub fn from_urls<I, S>(urls: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let instances = urls
            .into_iter()
            .map(|u| Instance::parse(u.as_ref()))
            .collect::<ConfigResult<Vec<_>>>()?;
        Self::from_instances(instances)
    }

    /// Build a registry from already parsed instances.
    pub fn from_instances(instances: Vec<Instance>) -> ConfigResult<Self> {
        let mut by_id: BTreeMap<InstanceId, Instance> = BTreeMap::new();
        for instance in instances {
            if by_id.contains_key(&instance.id) {
                debug!(instance = %instance.id, "Dropping duplicate instance");
                continue;
            }
            by_id.insert(instance.id.clone(), instance);
        }
        if by_id.is_empty() {
            return Err(ConfigError::EmptySource);
        }
        Ok(Self {
            instances: by_id.into_values().collect(),
        })
    }

    /// Load a registry from a JSON or plain-text file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::parse_source(path, &content)?;
        info!(
            path = %path.display(),
            instances = registry.len(),
            "Loaded instance registry"
        );
        Ok(registry)
    }

    fn parse_source(path: &Path, content: &str) -> ConfigResult<Self> {
        let trimmed = content.trim_start();
        if trimmed.starts_with('[') {
            let entries: Vec<SourceEntry> =
                serde_json::from_str(content).map_err(|e| ConfigError::MalformedSource {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let instances = entries
                .into_iter()
                .map(SourceEntry::into_instance)
                .collect::<ConfigResult<Vec<_>>>()?;
            return Self::from_instances(instances);
        }
        if trimmed.starts_with('{') {
            return Err(ConfigError::MalformedSource {
                path: path.to_path_buf(),
                reason: "expected a JSON array of instances".to_string(),
            });
        }

        let urls = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty());
        Self::from_urls(urls)
    }

    /// Instances in deterministic (lexicographic URL) order.
    pub fn list_instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Instances reachable on one network class.
    pub fn filter_network(&self, network: NetworkType) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(move |i| i.network == network)
    }

    pub fn get(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances
            .binary_search_by(|i| i.id.cmp(id))
            .ok()
            .map(|idx| &self.instances[idx])
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
