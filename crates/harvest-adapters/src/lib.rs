//! Source adapter contracts + one adapter per harvest source kind.
//!
//! An adapter knows how to page through its remote API, where the GUID lives
//! in a record, and how to turn one record into a catalog dataset. Everything
//! else (reconciliation, import, persistence) is generic and lives in
//! `harvest-sync`.

pub mod capabilities;
pub mod config;
pub mod fetch;
pub mod mapping;
pub mod naming;
pub mod orgs;
pub mod sources;

use async_trait::async_trait;
use harvest_catalog::{CatalogError, HostCatalog};
use harvest_core::{HarvestConfig, HarvestSource, HarvestWorkItem, NormalizedDataset, SourceKind};
use harvest_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub use capabilities::CapabilityCache;
pub use config::{validate_source_config, ConfigError};
pub use fetch::FetchMode;

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid record content: {0}")]
    Content(#[from] serde_json::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Everything a single harvest run hands to its adapter. The validated config
/// travels here by reference; adapters keep no per-source state of their own.
pub struct HarvestContext<'a> {
    pub run_id: Uuid,
    pub source: &'a HarvestSource,
    pub config: &'a HarvestConfig,
    pub catalog: &'a dyn HostCatalog,
    pub http: &'a HttpFetcher,
    pub mode: FetchMode,
    pub capabilities: CapabilityCache,
}

impl<'a> HarvestContext<'a> {
    pub fn new(
        run_id: Uuid,
        source: &'a HarvestSource,
        config: &'a HarvestConfig,
        catalog: &'a dyn HostCatalog,
        http: &'a HttpFetcher,
        mode: FetchMode,
    ) -> Self {
        Self {
            run_id,
            source,
            config,
            catalog,
            http,
            mode,
            capabilities: CapabilityCache::default(),
        }
    }

    /// Whether gathering stops after the first page.
    pub fn single_page(&self) -> bool {
        self.config.test || self.mode.is_fixtures()
    }
}

/// One work item about to be imported, with its decoded remote record and
/// the local package it maps to, if any.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub item: &'a HarvestWorkItem,
    pub record: &'a JsonValue,
    pub existing: Option<&'a NormalizedDataset>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Dataset(Box<NormalizedDataset>),
    /// Nothing to write; the item is neither failed nor made current.
    Skip(String),
    /// The record cannot be imported; recorded as an import error.
    Reject(String),
    /// The remote record should no longer be published locally.
    Withdraw { package_id: String, reason: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn default_page_size(&self) -> usize;

    fn page_size(&self, config: &HarvestConfig) -> usize {
        config
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or_else(|| self.default_page_size())
    }

    /// Records of one 1-based page. An empty page ends pagination; fetch and
    /// decode failures are logged and also come back empty.
    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue>;

    fn extract_guid(&self, record: &JsonValue) -> Option<String>;

    /// Feeds that ignore the page parameter serve the same records on every
    /// page. Adapters returning true end pagination when a page carries the
    /// same guid set as the page before it.
    fn stops_on_repeated_page(&self) -> bool {
        false
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError>;

    /// Adapters returning true have their built datasets fingerprinted so an
    /// unchanged record skips the catalog write.
    fn tracks_content_hash(&self) -> bool {
        false
    }
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::DcatJson => Box::new(sources::dcat_json::DcatJsonAdapter),
        SourceKind::Ckan => Box::new(sources::ckan::CkanAdapter),
        SourceKind::Delwp => Box::new(sources::delwp::DelwpAdapter),
        SourceKind::Metashare => Box::new(sources::metashare::MetashareAdapter),
        SourceKind::Ods => Box::new(sources::ods::OdsAdapter),
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).map(str::to_string)
}

/// A string field that may arrive as one string or a list of strings.
pub(crate) fn json_string_list(value: &JsonValue, path: &[&str]) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    match cur {
        JsonValue::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        JsonValue::Array(items) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};

    use harvest_catalog::MemoryCatalog;
    use harvest_core::{HarvestConfig, HarvestSource, SourceKind};
    use harvest_storage::{HttpClientConfig, HttpFetcher};
    use uuid::Uuid;

    use crate::{FetchMode, HarvestContext};

    pub fn fixtures_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    /// Owns everything a `HarvestContext` borrows, wired to the fixture tree.
    pub struct Harness {
        pub source: HarvestSource,
        pub config: HarvestConfig,
        pub catalog: MemoryCatalog,
        pub http: HttpFetcher,
    }

    impl Harness {
        pub fn new(kind: SourceKind, raw_config: &str) -> Self {
            Self {
                source: HarvestSource {
                    id: "source-1".into(),
                    title: "Test Source".into(),
                    kind,
                    url: "https://remote.example.gov".into(),
                    owner_org: "source-org".into(),
                    enabled: true,
                    config: raw_config.into(),
                },
                config: HarvestConfig::default(),
                catalog: MemoryCatalog::new(),
                http: HttpFetcher::new(HttpClientConfig::default()).expect("http client"),
            }
        }

        pub fn with_config(mut self, config: HarvestConfig) -> Self {
            self.config = config;
            self
        }

        pub fn ctx(&self) -> HarvestContext<'_> {
            HarvestContext::new(
                Uuid::nil(),
                &self.source,
                &self.config,
                &self.catalog,
                &self.http,
                FetchMode::Fixtures(fixtures_root()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adapters_cover_every_kind() {
        for kind in [
            SourceKind::DcatJson,
            SourceKind::Ckan,
            SourceKind::Delwp,
            SourceKind::Metashare,
            SourceKind::Ods,
        ] {
            let adapter = adapter_for_kind(kind);
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.stops_on_repeated_page(), kind == SourceKind::DcatJson);
        }
    }

    #[test]
    fn page_size_prefers_config_override() {
        let adapter = adapter_for_kind(SourceKind::Delwp);
        assert_eq!(adapter.page_size(&HarvestConfig::default()), 500);
        let config = HarvestConfig {
            page_size: Some(25),
            ..Default::default()
        };
        assert_eq!(adapter.page_size(&config), 25);
    }

    #[test]
    fn json_helpers_walk_paths() {
        let record = json!({"a": {"b": " x "}, "list": ["p", " ", "q"], "one": "solo"});
        assert_eq!(json_str(&record, &["a", "b"]), Some("x"));
        assert_eq!(json_str(&record, &["a", "missing"]), None);
        assert_eq!(json_string_list(&record, &["list"]), vec!["p", "q"]);
        assert_eq!(json_string_list(&record, &["one"]), vec!["solo"]);
        assert!(json_string_list(&record, &["nope"]).is_empty());
    }
}
