use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use harvest_adapters::{AdapterError, BuildOutcome, BuildRequest, HarvestContext, SourceAdapter};
use harvest_catalog::{HostCatalog, MemoryCatalog};
use harvest_core::{Disposition, HarvestSource, NormalizedDataset, SourceKind};
use harvest_storage::{HarvestObjectStore, JsonFileObjectStore, MemoryObjectStore};
use harvest_sync::{HarvestPipeline, HarvestSettings, HASH_FIELD};
use serde_json::{json, Value as JsonValue};

/// Serves fixed pages and builds a dataset straight from `title`/`notes`.
#[derive(Default)]
struct ScriptedAdapter {
    pages: Vec<Vec<JsonValue>>,
    hash: bool,
    stop_on_repeat: bool,
}

impl ScriptedAdapter {
    fn one_page(records: Vec<JsonValue>) -> Self {
        Self::pages(vec![records])
    }

    fn pages(pages: Vec<Vec<JsonValue>>) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::DcatJson
    }

    fn default_page_size(&self) -> usize {
        10
    }

    async fn fetch_page(&self, _ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        self.pages.get(page - 1).cloned().unwrap_or_default()
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        record.get("id").and_then(JsonValue::as_str).map(str::to_string)
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError> {
        let record = request.record;
        if record.get("reject").and_then(JsonValue::as_bool) == Some(true) {
            return Ok(BuildOutcome::Reject(format!(
                "Record {} is not publishable",
                request.item.guid
            )));
        }
        let dataset = NormalizedDataset {
            title: record.get("title").and_then(JsonValue::as_str).map(str::to_string),
            notes: record.get("notes").and_then(JsonValue::as_str).map(str::to_string),
            owner_org: Some(ctx.source.owner_org.clone()),
            ..Default::default()
        };
        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }

    fn stops_on_repeated_page(&self) -> bool {
        self.stop_on_repeat
    }

    fn tracks_content_hash(&self) -> bool {
        self.hash
    }
}

fn settings(root: &Path) -> HarvestSettings {
    HarvestSettings {
        catalog_url: "http://catalog.invalid".into(),
        catalog_api_key: None,
        state_dir: root.join("state"),
        workspace_root: root.to_path_buf(),
        user_agent: "harvest-tests".into(),
        http_timeout_secs: 5,
        test_mode: false,
        scheduler_enabled: false,
        cron: "0 0 2 * * *".into(),
    }
}

fn source(config: &str) -> HarvestSource {
    HarvestSource {
        id: "source-1".into(),
        title: "Scripted".into(),
        kind: SourceKind::DcatJson,
        url: "https://remote.example.gov".into(),
        owner_org: "source-org".into(),
        enabled: true,
        config: config.into(),
    }
}

const CONFIG: &str = r#"{"default_groups": ["spatial"]}"#;

struct Setup {
    catalog: Arc<MemoryCatalog>,
    store: Arc<MemoryObjectStore>,
    pipeline: HarvestPipeline,
}

async fn setup(root: &Path) -> Setup {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_group("g-spatial", "spatial").await;
    let store = Arc::new(MemoryObjectStore::new());
    let pipeline = HarvestPipeline::with_backends(
        settings(root),
        catalog.clone() as Arc<dyn HostCatalog>,
        store.clone() as Arc<dyn HarvestObjectStore>,
    )
    .expect("pipeline");
    Setup {
        catalog,
        store,
        pipeline,
    }
}

fn record(id: &str, title: &str) -> JsonValue {
    json!({"id": id, "title": title, "notes": format!("About {title}.")})
}

#[tokio::test]
async fn first_run_creates_every_remote_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let adapter = ScriptedAdapter::one_page(vec![
        record("A", "Alpha"),
        record("B", "Beta"),
        record("C", "Gamma"),
    ]);

    let summary = s
        .pipeline
        .run_source_with(&source(CONFIG), &adapter)
        .await
        .expect("run");

    assert_eq!(summary.gather.new, 3);
    assert_eq!(summary.gather.deleted, 0);
    assert_eq!(summary.gather.pages, 1);
    assert_eq!(summary.created, 3);
    assert_eq!(s.catalog.active_packages().await.len(), 3);
    let index = s.store.current_index("source-1").await.expect("index");
    assert_eq!(index.len(), 3);
    let names: Vec<_> = s
        .catalog
        .active_packages()
        .await
        .into_iter()
        .filter_map(|p| p.name)
        .collect();
    assert!(names.contains(&"alpha".to_string()));
}

#[tokio::test]
async fn missing_remote_guid_is_deleted_and_present_one_updated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let src = source(CONFIG);

    let first = ScriptedAdapter::one_page(vec![record("A", "Alpha"), record("B", "Beta")]);
    s.pipeline.run_source_with(&src, &first).await.expect("first run");
    let index = s.store.current_index("source-1").await.expect("index");
    let pkg_a = index.package_id("A").expect("A").to_string();
    let pkg_b = index.package_id("B").expect("B").to_string();

    let second = ScriptedAdapter::one_page(vec![record("A", "Alpha")]);
    let summary = s.pipeline.run_source_with(&src, &second).await.expect("second run");
    assert_eq!(summary.gather.changed, 1);
    assert_eq!(summary.gather.deleted, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.deleted, 1);

    let items = s.store.items_for_run(summary.run_id).await.expect("items");
    let a = items.iter().find(|i| i.guid == "A").expect("A item");
    let b = items.iter().find(|i| i.guid == "B").expect("B item");
    assert_eq!(a.disposition, Disposition::Change);
    assert_eq!(a.local_package_id.as_deref(), Some(pkg_a.as_str()));
    assert_eq!(b.disposition, Disposition::Delete);
    assert_eq!(items.iter().filter(|i| i.guid == "B").count(), 1);

    let index = s.store.current_index("source-1").await.expect("index");
    assert_eq!(index.len(), 1);
    assert_eq!(index.package_id("A"), Some(pkg_a.as_str()));
    let active: Vec<_> = s
        .catalog
        .active_packages()
        .await
        .into_iter()
        .filter_map(|p| p.id)
        .collect();
    assert_eq!(active, vec![pkg_a.clone()]);
    assert!(!active.contains(&pkg_b));
}

#[tokio::test]
async fn overlapping_pages_do_not_end_pagination() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let src = source(CONFIG);

    s.pipeline
        .run_source_with(&src, &ScriptedAdapter::one_page(vec![record("B", "Beta")]))
        .await
        .expect("first run");
    let pkg_b = s
        .store
        .current_index("source-1")
        .await
        .expect("index")
        .package_id("B")
        .expect("B")
        .to_string();

    let adapter = ScriptedAdapter::pages(vec![
        vec![record("A", "Alpha")],
        vec![record("A", "Alpha")],
        vec![record("B", "Beta")],
    ]);
    let summary = s.pipeline.run_source_with(&src, &adapter).await.expect("second run");

    assert_eq!(summary.gather.pages, 3);
    assert_eq!(summary.gather.new, 1);
    assert_eq!(summary.gather.changed, 1);
    assert_eq!(summary.gather.deleted, 0);
    assert_eq!(summary.deleted, 0);
    let active: Vec<_> = s
        .catalog
        .active_packages()
        .await
        .into_iter()
        .filter_map(|p| p.id)
        .collect();
    assert_eq!(active.len(), 2);
    assert!(active.contains(&pkg_b));
}

#[tokio::test]
async fn repeated_page_stops_feeds_that_opt_in() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let adapter = ScriptedAdapter {
        stop_on_repeat: true,
        ..ScriptedAdapter::pages(vec![
            vec![record("A", "Alpha"), record("B", "Beta")],
            vec![record("B", "Beta"), record("C", "Gamma")],
            vec![record("C", "Gamma"), record("B", "Beta")],
            vec![record("D", "Delta")],
        ])
    };
    let summary = s
        .pipeline
        .run_source_with(&source(CONFIG), &adapter)
        .await
        .expect("run");
    assert_eq!(summary.gather.pages, 2);
    assert_eq!(summary.gather.new, 3);
    assert_eq!(summary.created, 3);
}

#[tokio::test]
async fn a_failing_record_does_not_stop_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    s.catalog.reject_package_name("beta").await;
    let adapter = ScriptedAdapter::one_page(vec![
        json!({"id": "A", "title": "Alpha", "reject": true}),
        record("B", "Beta"),
        record("C", "Gamma"),
        json!({"title": "No guid"}),
    ]);

    let summary = s
        .pipeline
        .run_source_with(&source(CONFIG), &adapter)
        .await
        .expect("run");

    assert_eq!(summary.gather.records_without_guid, 1);
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.created, 1);
    assert!(summary.errors[0].contains("Record A is not publishable"));
    assert!(summary.errors[1].starts_with("Error importing dataset beta"));

    let items = s.store.items_for_run(summary.run_id).await.expect("items");
    let a = items.iter().find(|i| i.guid == "A").expect("A item");
    assert!(a.has_errors());
    assert!(!a.current);
    let index = s.store.current_index("source-1").await.expect("index");
    assert_eq!(index.len(), 1);
    assert!(index.contains("C"));
}

#[tokio::test]
async fn unchanged_content_skips_the_catalog_write() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let src = source(CONFIG);
    let hashed = |records: Vec<JsonValue>| ScriptedAdapter {
        hash: true,
        ..ScriptedAdapter::one_page(records)
    };

    let first = s
        .pipeline
        .run_source_with(&src, &hashed(vec![record("A", "Alpha")]))
        .await
        .expect("first");
    assert_eq!(first.created, 1);
    let stored = s.catalog.active_packages().await;
    assert!(stored[0].field(HASH_FIELD).is_some());

    let second = s
        .pipeline
        .run_source_with(&src, &hashed(vec![record("A", "Alpha")]))
        .await
        .expect("second");
    assert_eq!(second.unchanged, 1);
    assert_eq!(second.updated, 0);
    let index = s.store.current_index("source-1").await.expect("index");
    assert_eq!(index.len(), 1);

    let third = s
        .pipeline
        .run_source_with(
            &src,
            &hashed(vec![json!({"id": "A", "title": "Alpha", "notes": "Revised."})]),
        )
        .await
        .expect("third");
    assert_eq!(third.updated, 1);
    let stored = s.catalog.active_packages().await;
    assert_eq!(stored[0].notes.as_deref(), Some("Revised."));
    assert_eq!(stored[0].name.as_deref(), Some("alpha"));
}

#[tokio::test]
async fn package_deleted_by_hand_is_restored_on_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let src = source(CONFIG);
    let adapter = ScriptedAdapter::one_page(vec![record("A", "Alpha")]);

    s.pipeline.run_source_with(&src, &adapter).await.expect("first");
    let index = s.store.current_index("source-1").await.expect("index");
    let pkg = index.package_id("A").expect("A").to_string();
    s.catalog.package_delete(&pkg).await.expect("delete");
    assert!(s.catalog.active_packages().await.is_empty());

    let summary = s.pipeline.run_source_with(&src, &adapter).await.expect("second");
    assert_eq!(summary.gather.changed, 1);
    assert_eq!(summary.updated, 1);
    let active = s.catalog.active_packages().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id.as_deref(), Some(pkg.as_str()));
}

#[tokio::test]
async fn missing_default_groups_aborts_before_gathering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let s = setup(dir.path()).await;
    let adapter = ScriptedAdapter::one_page(vec![record("A", "Alpha")]);
    let err = s
        .pipeline
        .run_source_with(&source(r#"{"default_license": {"id": "cc-by", "title": "CC BY"}}"#), &adapter)
        .await
        .expect_err("config must be rejected");
    assert!(format!("{err:#}").contains("default_groups must be set"));
    assert!(s.catalog.packages().await.is_empty());
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn dcat_fixture_source_imports_in_test_mode() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_group("g-transport", "transport").await;
    let mut settings = settings(&workspace_root());
    settings.test_mode = true;
    let pipeline = HarvestPipeline::with_backends(
        settings,
        catalog.clone() as Arc<dyn HostCatalog>,
        Arc::new(MemoryObjectStore::new()) as Arc<dyn HarvestObjectStore>,
    )
    .expect("pipeline");

    let summary = pipeline
        .run_source(&source(r#"{"default_groups": ["transport"]}"#))
        .await
        .expect("run");
    assert_eq!(summary.created, 3, "{:?}", summary.errors);
    let packages = catalog.active_packages().await;
    assert!(packages
        .iter()
        .all(|p| p.category.as_deref() == Some("g-transport")));
    assert!(packages
        .iter()
        .any(|p| p.name.as_deref() == Some("traffic-volumes")));
}

#[tokio::test]
async fn json_ledger_carries_the_index_between_pipelines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_group("g-spatial", "spatial").await;
    let ledger = dir.path().join("state").join("harvest_objects.json");
    let src = source(CONFIG);

    let first = HarvestPipeline::with_backends(
        settings(dir.path()),
        catalog.clone() as Arc<dyn HostCatalog>,
        Arc::new(JsonFileObjectStore::new(&ledger)) as Arc<dyn HarvestObjectStore>,
    )
    .expect("pipeline");
    first
        .run_source_with(&src, &ScriptedAdapter::one_page(vec![record("A", "Alpha")]))
        .await
        .expect("first");

    let second = HarvestPipeline::with_backends(
        settings(dir.path()),
        catalog.clone() as Arc<dyn HostCatalog>,
        Arc::new(JsonFileObjectStore::new(&ledger)) as Arc<dyn HarvestObjectStore>,
    )
    .expect("pipeline");
    let summary = second
        .run_source_with(&src, &ScriptedAdapter::one_page(Vec::new()))
        .await
        .expect("second");
    assert_eq!(summary.gather.deleted, 1);
    assert_eq!(summary.deleted, 1);
    assert!(catalog.active_packages().await.is_empty());
}
