//! Import stage: turn one staged work item into a catalog write.

use anyhow::Result;
use harvest_adapters::naming::unique_package_name;
use harvest_adapters::{BuildOutcome, BuildRequest, HarvestContext, SourceAdapter};
use harvest_catalog::CatalogError;
use harvest_core::{Disposition, ErrorStage, HarvestWorkItem, Lookup, NormalizedDataset};
use harvest_storage::{content_hash, HarvestObjectStore};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info};
use uuid::Uuid;

/// Dataset field holding the fingerprint of the last imported build.
pub const HASH_FIELD: &str = "harvester_data_hash";

const UNIQUE_NAME_ERROR: &str = "Could not generate a unique name from the title or the GUID. Please choose a more unique title.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum ImportOutcome {
    Created(String),
    Updated(String),
    Unchanged(String),
    Deleted(String),
    Skipped(String),
    Failed(String),
}

/// Fingerprint of a built dataset, ignoring the fields assigned at import
/// time and the stored fingerprint itself.
pub fn dataset_hash(dataset: &NormalizedDataset) -> Result<String> {
    let mut value = serde_json::to_value(dataset)?;
    if let JsonValue::Object(map) = &mut value {
        for key in ["id", "name", HASH_FIELD] {
            map.remove(key);
        }
    }
    Ok(content_hash(&value))
}

async fn fail(
    store: &dyn HarvestObjectStore,
    item: &HarvestWorkItem,
    message: String,
) -> Result<ImportOutcome> {
    error!(guid = %item.guid, item_id = %item.id, "{message}");
    store.record_error(item.id, ErrorStage::Import, &message).await?;
    Ok(ImportOutcome::Failed(message))
}

async fn delete_package(
    ctx: &HarvestContext<'_>,
    store: &dyn HarvestObjectStore,
    item: &HarvestWorkItem,
    package_id: &str,
) -> Result<ImportOutcome> {
    match ctx.catalog.package_delete(package_id).await {
        Ok(()) => {
            info!(package_id, guid = %item.guid, "deleted package");
            Ok(ImportOutcome::Deleted(package_id.to_string()))
        }
        Err(CatalogError::NotFound(_)) => {
            info!(package_id, guid = %item.guid, "package already gone");
            Ok(ImportOutcome::Skipped(format!("Package {package_id} not found")))
        }
        Err(err) => {
            fail(
                store,
                item,
                format!("Error deleting package {package_id}: {err}"),
            )
            .await
        }
    }
}

/// Execute one work item against the catalog. Catalog and build failures are
/// recorded on the item and reported as `Failed`; only object-store errors
/// escape as `Err`.
pub async fn import_item(
    adapter: &dyn SourceAdapter,
    ctx: &HarvestContext<'_>,
    store: &dyn HarvestObjectStore,
    item: &HarvestWorkItem,
) -> Result<ImportOutcome> {
    if item.disposition == Disposition::Delete {
        return match item.local_package_id.as_deref() {
            Some(package_id) => delete_package(ctx, store, item, package_id).await,
            None => Ok(ImportOutcome::Skipped(format!(
                "No package recorded for guid {}",
                item.guid
            ))),
        };
    }

    let Some(content) = item.content.as_deref() else {
        return fail(store, item, format!("Empty content for object {}", item.id)).await;
    };
    let record: JsonValue = match serde_json::from_str(content) {
        Ok(record) => record,
        Err(err) => {
            return fail(
                store,
                item,
                format!("Could not decode content for object {}: {err}", item.id),
            )
            .await
        }
    };

    let mut existing = None;
    if item.disposition == Disposition::Change {
        if let Some(package_id) = item.local_package_id.as_deref() {
            match ctx.catalog.package_show(package_id).await {
                Ok(Lookup::Found(package)) => existing = Some(package),
                Ok(Lookup::NotFound) => {
                    info!(package_id, guid = %item.guid, "package is gone, creating it again")
                }
                Err(err) => {
                    return fail(store, item, format!("Error reading package {package_id}: {err}"))
                        .await
                }
            }
        }
    }

    let request = BuildRequest {
        item,
        record: &record,
        existing: existing.as_ref(),
    };
    let mut dataset = match adapter.build_dataset(ctx, &request).await {
        Ok(BuildOutcome::Dataset(dataset)) => *dataset,
        Ok(BuildOutcome::Skip(reason)) => {
            info!(guid = %item.guid, "{reason}");
            return Ok(ImportOutcome::Skipped(reason));
        }
        Ok(BuildOutcome::Reject(message)) => return fail(store, item, message).await,
        Ok(BuildOutcome::Withdraw { package_id, reason }) => {
            info!(guid = %item.guid, package_id = %package_id, "{reason}");
            return delete_package(ctx, store, item, &package_id).await;
        }
        Err(err) => {
            return fail(
                store,
                item,
                format!("Error building dataset for object {}: {err}", item.id),
            )
            .await
        }
    };

    // Sources that carry their own package id may already exist locally.
    if existing.is_none() {
        if let Some(id) = dataset.id.clone().filter(|id| !id.is_empty()) {
            match ctx.catalog.package_show(&id).await {
                Ok(Lookup::Found(package)) => existing = Some(package),
                Ok(Lookup::NotFound) => {}
                Err(err) => {
                    return fail(store, item, format!("Error reading package {id}: {err}")).await
                }
            }
        }
    }

    if dataset.name.as_deref().map_or(true, str::is_empty) {
        let title = dataset.title.clone().unwrap_or_default();
        let kept = existing
            .as_ref()
            .filter(|package| package.title.as_deref() == Some(title.as_str()))
            .and_then(|package| package.name.clone());
        let name = match kept {
            Some(name) => Some(name),
            None => {
                let current = existing.as_ref().and_then(|package| package.name.as_deref());
                match unique_package_name(ctx.catalog, &title, current).await {
                    Ok(name) => name,
                    Err(err) => {
                        return fail(store, item, format!("Error generating package name: {err}"))
                            .await
                    }
                }
            }
        };
        match name {
            Some(name) => dataset.name = Some(name),
            None => return fail(store, item, UNIQUE_NAME_ERROR.to_string()).await,
        }
    }

    let fingerprint = if adapter.tracks_content_hash() {
        Some(dataset_hash(&dataset)?)
    } else {
        None
    };

    match existing {
        Some(package) => {
            let package_id = package.id.clone().unwrap_or_default();
            if let Some(hash) = &fingerprint {
                let previous = package.field(HASH_FIELD).and_then(JsonValue::as_str);
                if previous == Some(hash.as_str()) {
                    info!(package_id = %package_id, "no changes to dataset, skipping");
                    store.promote(item.id, &package_id).await?;
                    return Ok(ImportOutcome::Unchanged(package_id));
                }
                dataset.set_field(HASH_FIELD, hash.clone());
            }
            dataset.id = Some(package_id);
            match ctx.catalog.package_update(&dataset).await {
                Ok(id) => {
                    info!(package_id = %id, guid = %item.guid, "updated dataset");
                    store.promote(item.id, &id).await?;
                    Ok(ImportOutcome::Updated(id))
                }
                Err(err) => import_error(store, item, &dataset, err).await,
            }
        }
        None => {
            if let Some(hash) = fingerprint {
                dataset.set_field(HASH_FIELD, hash);
            }
            if dataset.id.as_deref().map_or(true, str::is_empty) {
                dataset.id = Some(Uuid::new_v4().to_string());
            }
            match ctx.catalog.package_create(&dataset).await {
                Ok(id) => {
                    info!(package_id = %id, guid = %item.guid, "created dataset");
                    store.promote(item.id, &id).await?;
                    Ok(ImportOutcome::Created(id))
                }
                Err(err) => import_error(store, item, &dataset, err).await,
            }
        }
    }
}

async fn import_error(
    store: &dyn HarvestObjectStore,
    item: &HarvestWorkItem,
    dataset: &NormalizedDataset,
    err: CatalogError,
) -> Result<ImportOutcome> {
    let name = dataset.name.as_deref().unwrap_or_default();
    fail(store, item, format!("Error importing dataset {name}: {err}")).await
}
