//! Harvest object persistence + HTTP fetch utilities for the harvesters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{ErrorStage, HarvestWorkItem, ItemError, LocalIndex};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable hash of a JSON document. `serde_json` maps keep keys sorted, so the
/// serialization is canonical regardless of how the value was assembled.
pub fn content_hash(value: &JsonValue) -> String {
    sha256_hex(value.to_string().as_bytes())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Single-attempt HTTP client. Callers decide what a failure means; nothing
/// here retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let header_map = build_headers(headers)?;
        let span = info_span!("http_fetch", url);

        async move {
            let resp = self.client.get(url).headers(header_map).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// `Content-Length` reported by a HEAD request, if the server sends one.
    pub async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let span = info_span!("http_head", url);
        async move {
            let resp = self.client.head(url).send().await?;
            if !resp.status().is_success() {
                return Err(FetchError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                });
            }
            Ok(resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()))
        }
        .instrument(span)
        .await
    }
}

fn build_headers(headers: &[(&str, &str)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidHeader((*name).to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Persistence of staged work items, keyed by item id, with a per-guid
/// "current" flag marking the item that last imported successfully.
#[async_trait]
pub trait HarvestObjectStore: Send + Sync {
    /// guid → package id for every current item of the source.
    async fn current_index(&self, source_id: &str) -> anyhow::Result<LocalIndex>;

    async fn insert(&self, item: HarvestWorkItem) -> anyhow::Result<()>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<HarvestWorkItem>>;

    /// Clear the current flag on every item of the guid within the source.
    async fn retire_guid(&self, source_id: &str, guid: &str) -> anyhow::Result<()>;

    /// Make the item the only current one for its guid and bind it to the package.
    async fn promote(&self, id: Uuid, package_id: &str) -> anyhow::Result<()>;

    async fn record_error(&self, id: Uuid, stage: ErrorStage, message: &str)
        -> anyhow::Result<()>;

    async fn items_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<HarvestWorkItem>>;

    /// Persist pending mutations. Stores that write through need nothing here.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    items: Vec<HarvestWorkItem>,
}

impl Ledger {
    fn current_index(&self, source_id: &str) -> LocalIndex {
        self.items
            .iter()
            .filter(|item| item.source_id == source_id && item.current)
            .filter_map(|item| {
                item.local_package_id
                    .as_deref()
                    .map(|pkg| (item.guid.clone(), pkg.to_string()))
            })
            .collect()
    }

    fn retire_guid(&mut self, source_id: &str, guid: &str) {
        for item in self
            .items
            .iter_mut()
            .filter(|item| item.source_id == source_id && item.guid == guid)
        {
            item.current = false;
        }
    }

    fn promote(&mut self, id: Uuid, package_id: &str) -> anyhow::Result<()> {
        let (source_id, guid) = self
            .items
            .iter()
            .find(|item| item.id == id)
            .map(|item| (item.source_id.clone(), item.guid.clone()))
            .with_context(|| format!("harvest object {id} not found"))?;
        self.retire_guid(&source_id, &guid);
        if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
            item.current = true;
            item.local_package_id = Some(package_id.to_string());
        }
        Ok(())
    }

    fn record_error(&mut self, id: Uuid, stage: ErrorStage, message: &str) -> anyhow::Result<()> {
        let item = self
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .with_context(|| format!("harvest object {id} not found"))?;
        item.errors.push(ItemError {
            stage,
            message: message.to_string(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    fn items_for_run(&self, run_id: Uuid) -> Vec<HarvestWorkItem> {
        self.items
            .iter()
            .filter(|item| item.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    ledger: Mutex<Ledger>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with items from an earlier run.
    pub async fn with_items(items: Vec<HarvestWorkItem>) -> Self {
        let store = Self::new();
        store.ledger.lock().await.items = items;
        store
    }
}

#[async_trait]
impl HarvestObjectStore for MemoryObjectStore {
    async fn current_index(&self, source_id: &str) -> anyhow::Result<LocalIndex> {
        Ok(self.ledger.lock().await.current_index(source_id))
    }

    async fn insert(&self, item: HarvestWorkItem) -> anyhow::Result<()> {
        self.ledger.lock().await.items.push(item);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<HarvestWorkItem>> {
        Ok(self
            .ledger
            .lock()
            .await
            .items
            .iter()
            .find(|item| item.id == id)
            .cloned())
    }

    async fn retire_guid(&self, source_id: &str, guid: &str) -> anyhow::Result<()> {
        self.ledger.lock().await.retire_guid(source_id, guid);
        Ok(())
    }

    async fn promote(&self, id: Uuid, package_id: &str) -> anyhow::Result<()> {
        self.ledger.lock().await.promote(id, package_id)
    }

    async fn record_error(
        &self,
        id: Uuid,
        stage: ErrorStage,
        message: &str,
    ) -> anyhow::Result<()> {
        self.ledger.lock().await.record_error(id, stage, message)
    }

    async fn items_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<HarvestWorkItem>> {
        Ok(self.ledger.lock().await.items_for_run(run_id))
    }
}

#[derive(Debug, Default)]
struct CachedLedger {
    ledger: Option<Ledger>,
    dirty: bool,
}

/// Work-item ledger kept in one JSON file. The file is read once, on first
/// use; reads and mutations then work on the in-memory copy and `flush`
/// writes it back through a temp file + rename so a crash never leaves a
/// torn ledger. One store instance per ledger file.
#[derive(Debug)]
pub struct JsonFileObjectStore {
    path: PathBuf,
    state: Mutex<CachedLedger>,
}

impl JsonFileObjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(CachedLedger::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> anyhow::Result<Ledger> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking ledger path {}", self.path.display()))?
        {
            return Ok(Ledger::default());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn save(&self, ledger: &Ledger) -> anyhow::Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating ledger directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(ledger).context("serializing ledger")?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp ledger file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp ledger file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp ledger file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp ledger {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        debug!(path = %self.path.display(), items = ledger.items.len(), "ledger saved");
        Ok(())
    }

    async fn loaded<'a>(&self, state: &'a mut CachedLedger) -> anyhow::Result<&'a mut Ledger> {
        let ledger = match state.ledger.take() {
            Some(ledger) => ledger,
            None => self.load().await?,
        };
        Ok(state.ledger.insert(ledger))
    }

    async fn read<T>(&self, f: impl FnOnce(&Ledger) -> T + Send) -> anyhow::Result<T> {
        let mut state = self.state.lock().await;
        let ledger: &Ledger = self.loaded(&mut state).await?;
        Ok(f(ledger))
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> anyhow::Result<T> + Send,
    ) -> anyhow::Result<T> {
        let mut state = self.state.lock().await;
        let out = f(self.loaded(&mut state).await?)?;
        state.dirty = true;
        Ok(out)
    }
}

#[async_trait]
impl HarvestObjectStore for JsonFileObjectStore {
    async fn current_index(&self, source_id: &str) -> anyhow::Result<LocalIndex> {
        self.read(|ledger| ledger.current_index(source_id)).await
    }

    async fn insert(&self, item: HarvestWorkItem) -> anyhow::Result<()> {
        self.mutate(move |ledger| {
            ledger.items.push(item);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<HarvestWorkItem>> {
        self.read(|ledger| ledger.items.iter().find(|item| item.id == id).cloned())
            .await
    }

    async fn retire_guid(&self, source_id: &str, guid: &str) -> anyhow::Result<()> {
        self.mutate(|ledger| {
            ledger.retire_guid(source_id, guid);
            Ok(())
        })
        .await
    }

    async fn promote(&self, id: Uuid, package_id: &str) -> anyhow::Result<()> {
        self.mutate(|ledger| ledger.promote(id, package_id)).await
    }

    async fn record_error(
        &self,
        id: Uuid,
        stage: ErrorStage,
        message: &str,
    ) -> anyhow::Result<()> {
        self.mutate(|ledger| ledger.record_error(id, stage, message))
            .await
    }

    async fn items_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<HarvestWorkItem>> {
        self.read(|ledger| ledger.items_for_run(run_id)).await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        if let Some(ledger) = &state.ledger {
            self.save(ledger).await?;
        }
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::Disposition;
    use serde_json::json;
    use tempfile::tempdir;

    fn item(run_id: Uuid, guid: &str, disposition: Disposition, pkg: Option<&str>) -> HarvestWorkItem {
        HarvestWorkItem::staged(
            run_id,
            "src-1",
            guid,
            disposition,
            Some(format!("{{\"guid\":\"{guid}\"}}")),
            pkg.map(str::to_string),
        )
    }

    #[test]
    fn content_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": [1, 2], "c": {"y": true, "x": null}});
        let b = json!({"c": {"x": null, "y": true}, "a": [1, 2], "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"b": 2})));
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn invalid_header_names_are_rejected() {
        assert!(matches!(
            build_headers(&[("bad header", "x")]),
            Err(FetchError::InvalidHeader(_))
        ));
        let headers = build_headers(&[("Authorization", "secret")]).expect("headers");
        assert_eq!(headers.get("authorization").map(|v| v.as_bytes()), Some(&b"secret"[..]));
    }

    #[tokio::test]
    async fn promote_moves_current_flag_to_latest_item() {
        let store = MemoryObjectStore::new();
        let first_run = Uuid::new_v4();
        let old = item(first_run, "A", Disposition::New, None);
        let old_id = old.id;
        store.insert(old).await.expect("insert");
        store.promote(old_id, "pkg-1").await.expect("promote");

        let second_run = Uuid::new_v4();
        let newer = item(second_run, "A", Disposition::Change, Some("pkg-1"));
        let newer_id = newer.id;
        store.insert(newer).await.expect("insert");
        store.promote(newer_id, "pkg-1").await.expect("promote");

        let old = store.get(old_id).await.expect("get").expect("old item");
        let newer = store.get(newer_id).await.expect("get").expect("new item");
        assert!(!old.current);
        assert!(newer.current);

        let index = store.current_index("src-1").await.expect("index");
        assert_eq!(index.package_id("A"), Some("pkg-1"));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn retired_guids_leave_the_index() {
        let store = MemoryObjectStore::new();
        let run = Uuid::new_v4();
        let a = item(run, "A", Disposition::New, None);
        let a_id = a.id;
        store.insert(a).await.expect("insert");
        store.promote(a_id, "pkg-a").await.expect("promote");
        store.retire_guid("src-1", "A").await.expect("retire");

        assert!(store.current_index("src-1").await.expect("index").is_empty());
        assert!(store.current_index("other").await.expect("index").is_empty());
    }

    #[tokio::test]
    async fn promote_unknown_item_is_an_error() {
        let store = MemoryObjectStore::new();
        assert!(store.promote(Uuid::new_v4(), "pkg").await.is_err());
    }

    #[tokio::test]
    async fn json_file_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("harvest_objects.json");
        let run = Uuid::new_v4();

        let store = JsonFileObjectStore::new(&path);
        let a = item(run, "A", Disposition::New, None);
        let a_id = a.id;
        store.insert(a).await.expect("insert");
        store.promote(a_id, "pkg-a").await.expect("promote");
        store
            .record_error(a_id, ErrorStage::Import, "boom")
            .await
            .expect("record error");
        store.flush().await.expect("flush");

        let reopened = JsonFileObjectStore::new(&path);
        let index = reopened.current_index("src-1").await.expect("index");
        assert_eq!(index.package_id("A"), Some("pkg-a"));
        let items = reopened.items_for_run(run).await.expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].errors[0].message, "boom");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn json_file_store_writes_only_on_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("harvest_objects.json");
        let run = Uuid::new_v4();

        let store = JsonFileObjectStore::new(&path);
        let a = item(run, "A", Disposition::New, None);
        let a_id = a.id;
        store.insert(a).await.expect("insert");
        store.promote(a_id, "pkg-a").await.expect("promote");
        assert!(!path.exists());
        assert_eq!(
            store.current_index("src-1").await.expect("index").package_id("A"),
            Some("pkg-a")
        );
        assert!(store.get(a_id).await.expect("get").is_some());

        store.flush().await.expect("flush");
        let written = std::fs::read_to_string(&path).expect("ledger file");

        // Reads are served from memory and a clean store does not rewrite.
        store.get(a_id).await.expect("get");
        store.flush().await.expect("flush");
        assert_eq!(std::fs::read_to_string(&path).expect("ledger file"), written);

        let b = item(run, "B", Disposition::New, None);
        store.insert(b).await.expect("insert");
        let reopened = JsonFileObjectStore::new(&path);
        assert_eq!(reopened.items_for_run(run).await.expect("items").len(), 1);
        store.flush().await.expect("flush");
        let reopened = JsonFileObjectStore::new(&path);
        assert_eq!(reopened.items_for_run(run).await.expect("items").len(), 2);
    }
}
