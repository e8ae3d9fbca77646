//! Instance identity and URL normalization.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Stable identifier of an instance: its normalized base URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network an instance is reachable on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Normal,
    Tor,
}

impl NetworkType {
    fn of(url: &Url) -> Self {
        match url.host_str() {
            Some(host) if host.ends_with(".onion") => NetworkType::Tor,
            _ => NetworkType::Normal,
        }
    }
}

/// One monitored deployment of the search service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Normalized base URL, always ending in `/`.
    pub base_url: String,
    /// Engines the instance is expected to offer (hint only).
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_good: Option<DateTime<Utc>>,
    pub network: NetworkType,
}

impl Instance {
    /// Build an instance from a raw URL, normalizing it.
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        let url = normalize_url(raw)?;
        let network = NetworkType::of(&url);
        let base_url = url.to_string();
        Ok(Self {
            id: InstanceId(base_url.clone()),
            base_url,
            capabilities: BTreeSet::new(),
            last_known_good: None,
            network,
        })
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_last_known_good(mut self, at: DateTime<Utc>) -> Self {
        self.last_known_good = Some(at);
        self
    }

    /// Resolve `path` relative to the base URL.
    ///
    /// A leading `/` is ignored so instances hosted under a sub-path keep it.
    /// `None` only when `path` cannot be joined onto the base.
    pub fn endpoint(&self, path: &str) -> Option<Url> {
        let base = Url::parse(&self.base_url).ok()?;
        base.join(path.trim_start_matches('/')).ok()
    }
}

fn normalize_url(raw: &str) -> ConfigResult<Url> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut url = Url::parse(raw.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("unsupported scheme"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials are not allowed"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_host_and_trailing_slash() {
        let instance = Instance::parse("https://Searx.Example.ORG").unwrap();
        assert_eq!(instance.base_url, "https://searx.example.org/");
        assert_eq!(instance.id.as_str(), "https://searx.example.org/");
        assert_eq!(instance.network, NetworkType::Normal);
    }

    #[test]
    fn test_parse_keeps_sub_path() {
        let instance = Instance::parse("https://example.org/searx").unwrap();
        assert_eq!(instance.base_url, "https://example.org/searx/");
        let config = instance.endpoint("/config").unwrap();
        assert_eq!(config.as_str(), "https://example.org/searx/config");
    }

    #[test]
    fn test_onion_is_tor_network() {
        let instance = Instance::parse("http://abcdefghijklmnop.onion/").unwrap();
        assert_eq!(instance.network, NetworkType::Tor);
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(Instance::parse("ftp://example.org/").is_err());
        assert!(Instance::parse("not a url").is_err());
        assert!(Instance::parse("https://example.org/?q=1").is_err());
        assert!(Instance::parse("https://user:pw@example.org/").is_err());
    }

    #[test]
    fn test_endpoint_with_query() {
        let instance = Instance::parse("https://example.org/").unwrap();
        let url = instance.endpoint("search?q=time&format=json").unwrap();
        assert_eq!(url.path(), "/search");
        assert_eq!(url.query(), Some("q=time&format=json"));
    }
}
