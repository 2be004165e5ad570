//! Harvest run orchestration: source registry, gather/import stages and the
//! optional cron scheduler.

pub mod import;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::{adapter_for_kind, validate_source_config, FetchMode, HarvestContext, SourceAdapter};
use harvest_catalog::{CkanCatalog, HostCatalog};
use harvest_core::HarvestSource;
use harvest_storage::{HarvestObjectStore, HttpClientConfig, HttpFetcher, JsonFileObjectStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use import::{dataset_hash, import_item, ImportOutcome, HASH_FIELD};
pub use reconcile::{classify, gather, guids_to_delete, reconcile, GatherReport, ReconcilePlan};

pub const CRATE_NAME: &str = "harvest-sync";

/// Imported items between object-store flushes.
const IMPORT_FLUSH_BATCH: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<HarvestSource>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &HarvestSource> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_id: &str) -> Option<&HarvestSource> {
        self.sources.iter().find(|s| s.id == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub catalog_url: String,
    pub catalog_api_key: Option<String>,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Serve every source from `fixtures/` and stop after one page.
    pub test_mode: bool,
    pub scheduler_enabled: bool,
    pub cron: String,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl HarvestSettings {
    pub fn from_env() -> Self {
        Self {
            catalog_url: std::env::var("HARVEST_CATALOG_URL")
                .unwrap_or_else(|_| "http://localhost:5000".to_string()),
            catalog_api_key: std::env::var("HARVEST_CATALOG_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            state_dir: std::env::var("HARVEST_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            workspace_root: std::env::var("HARVEST_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("HARVEST_USER_AGENT")
                .unwrap_or_else(|_| "datavic-harvester/0.1".to_string()),
            http_timeout_secs: std::env::var("HARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            test_mode: env_flag("HARVEST_TEST_MODE"),
            scheduler_enabled: env_flag("HARVEST_SCHEDULER_ENABLED"),
            cron: std::env::var("HARVEST_CRON").unwrap_or_else(|_| "0 0 2 * * *".to_string()),
        }
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gather: GatherReport,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl HarvestRunSummary {
    fn new(run_id: Uuid, source_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            source_id: source_id.to_string(),
            started_at,
            finished_at: started_at,
            gather: GatherReport::default(),
            created: 0,
            updated: 0,
            unchanged: 0,
            deleted: 0,
            skipped: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &ImportOutcome) {
        match outcome {
            ImportOutcome::Created(_) => self.created += 1,
            ImportOutcome::Updated(_) => self.updated += 1,
            ImportOutcome::Unchanged(_) => self.unchanged += 1,
            ImportOutcome::Deleted(_) => self.deleted += 1,
            ImportOutcome::Skipped(_) => self.skipped += 1,
            ImportOutcome::Failed(message) => {
                self.failed += 1;
                self.errors.push(message.clone());
            }
        }
    }
}

/// Result of validating one registered source's configuration.
#[derive(Debug, Clone, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub error: Option<String>,
}

pub struct HarvestPipeline {
    settings: HarvestSettings,
    catalog: Arc<dyn HostCatalog>,
    store: Arc<dyn HarvestObjectStore>,
    http: HttpFetcher,
}

impl HarvestPipeline {
    /// Pipeline writing to the CKAN catalog at `catalog_url` and keeping its
    /// harvest objects in `<state_dir>/harvest_objects.json`.
    pub fn new(settings: HarvestSettings) -> Result<Self> {
        let http = build_http(&settings)?;
        let catalog = CkanCatalog::new(
            http.client().clone(),
            settings.catalog_url.clone(),
            settings.catalog_api_key.clone(),
        );
        let store = JsonFileObjectStore::new(settings.state_dir.join("harvest_objects.json"));
        Ok(Self {
            settings,
            catalog: Arc::new(catalog),
            store: Arc::new(store),
            http,
        })
    }

    pub fn with_backends(
        settings: HarvestSettings,
        catalog: Arc<dyn HostCatalog>,
        store: Arc<dyn HarvestObjectStore>,
    ) -> Result<Self> {
        let http = build_http(&settings)?;
        Ok(Self {
            settings,
            catalog,
            store,
            http,
        })
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    pub async fn load_registry(&self) -> Result<SourceRegistry> {
        let path = self.settings.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn run_source(&self, source: &HarvestSource) -> Result<HarvestRunSummary> {
        let adapter = adapter_for_kind(source.kind);
        self.run_source_with(source, adapter.as_ref()).await
    }

    /// One full harvest of `source`: validate its config, gather, then import
    /// every staged item in order.
    pub async fn run_source_with(
        &self,
        source: &HarvestSource,
        adapter: &dyn SourceAdapter,
    ) -> Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("harvest_run", source_id = %source.id, run_id = %run_id);
        async move {
            let started_at = Utc::now();
            let catalog = self.catalog.as_ref();
            let store = self.store.as_ref();

            let config = validate_source_config(source.kind, &source.config, catalog)
                .await
                .with_context(|| format!("invalid configuration for source {}", source.id))?;
            let mode = if self.settings.test_mode || config.test {
                FetchMode::Fixtures(self.settings.fixtures_dir())
            } else {
                FetchMode::Live
            };
            let ctx = HarvestContext::new(run_id, source, &config, catalog, &self.http, mode);

            let mut summary = HarvestRunSummary::new(run_id, &source.id, started_at);
            summary.gather = gather(adapter, &ctx, store)
                .await
                .with_context(|| format!("gathering source {}", source.id))?;
            store.flush().await.context("saving gathered harvest objects")?;

            for (n, item_id) in summary.gather.item_ids.clone().iter().enumerate() {
                let item = store
                    .get(*item_id)
                    .await?
                    .with_context(|| format!("harvest object {item_id} disappeared"))?;
                let outcome = import_item(adapter, &ctx, store, &item).await?;
                summary.record(&outcome);
                if (n + 1) % IMPORT_FLUSH_BATCH == 0 {
                    store.flush().await.context("saving imported harvest objects")?;
                }
            }
            store.flush().await.context("saving imported harvest objects")?;

            summary.finished_at = Utc::now();
            info!(
                created = summary.created,
                updated = summary.updated,
                unchanged = summary.unchanged,
                deleted = summary.deleted,
                skipped = summary.skipped,
                failed = summary.failed,
                "harvest run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Harvest every enabled source in registry order. A source that fails
    /// as a whole is logged and left out of the result.
    pub async fn run_all(&self) -> Result<Vec<HarvestRunSummary>> {
        let registry = self.load_registry().await?;
        let mut summaries = Vec::new();
        for source in registry.enabled() {
            match self.run_source(source).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => error!(source_id = %source.id, error = %format!("{err:#}"), "harvest run failed"),
            }
        }
        Ok(summaries)
    }

    pub async fn validate_all(&self) -> Result<Vec<SourceValidation>> {
        let registry = self.load_registry().await?;
        let mut results = Vec::new();
        for source in &registry.sources {
            let error = validate_source_config(source.kind, &source.config, self.catalog.as_ref())
                .await
                .err()
                .map(|err| err.to_string());
            results.push(SourceValidation {
                source_id: source.id.clone(),
                error,
            });
        }
        Ok(results)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.settings.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.settings.cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_all().await {
                    Ok(summaries) => info!(sources = summaries.len(), "scheduled harvest finished"),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn build_http(settings: &HarvestSettings) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(settings.http_timeout_secs),
        user_agent: Some(settings.user_agent.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_parses_sources_yaml() {
        let yaml = r#"
sources:
  - id: vicroads
    title: VicRoads open data
    kind: dcat-json
    url: https://vicroads-public.example/data.json
    owner_org: vicroads
    config: '{"default_groups": ["transport"]}'
  - id: delwp
    title: DELWP spatial
    kind: delwp
    url: https://delwp.example/api/records
    owner_org: delwp
    enabled: false
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);
        assert_eq!(registry.find("delwp").map(|s| s.kind), Some(harvest_core::SourceKind::Delwp));
        assert!(registry.find("delwp").map(|s| s.config.is_empty()).unwrap_or(false));
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = HarvestRunSummary::new(Uuid::nil(), "s", Utc::now());
        summary.record(&ImportOutcome::Created("a".into()));
        summary.record(&ImportOutcome::Failed("boom".into()));
        summary.record(&ImportOutcome::Unchanged("b".into()));
        assert_eq!((summary.created, summary.failed, summary.unchanged), (1, 1, 1));
        assert_eq!(summary.errors, vec!["boom"]);
    }
}
