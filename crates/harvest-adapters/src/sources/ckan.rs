//! CKAN-to-CKAN harvesting: remote packages pass through mostly unchanged,
//! with local group/organisation resolution and Data.Vic clean-ups.

use async_trait::async_trait;
use harvest_core::{
    Group, GroupRef, Lookup, NormalizedDataset, Organization, RemoteMode, SourceKind,
};
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::fetch::fetch_json;
use crate::mapping::page_offset;
use crate::{AdapterError, BuildOutcome, BuildRequest, HarvestContext, SourceAdapter};

/// Keys of a remote group or organisation that must not be sent to the local
/// create call.
const REMOTE_ONLY_KEYS: &[&str] = &[
    "packages",
    "created",
    "users",
    "groups",
    "tags",
    "extras",
    "display_name",
];

pub struct CkanAdapter;

fn api_url(base: &str, action: &str) -> String {
    format!("{}/api/3/action/{action}", base.trim_end_matches('/'))
}

fn auth_headers(ctx: &HarvestContext<'_>) -> Vec<(&'static str, String)> {
    ctx.config
        .api_key
        .as_ref()
        .map(|key| vec![("Authorization", key.clone())])
        .unwrap_or_default()
}

async fn fetch_remote_action(
    ctx: &HarvestContext<'_>,
    action: &str,
    id: &str,
    fixture: &str,
) -> Option<JsonValue> {
    let url = format!("{}?id={id}", api_url(&ctx.source.url, action));
    let headers = auth_headers(ctx);
    let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let mut body = fetch_json(ctx, &url, &headers, fixture).await?;
    if body.get("success").and_then(JsonValue::as_bool) != Some(true) {
        warn!(url, "remote action was not successful");
        return None;
    }
    body.get_mut("result").map(JsonValue::take)
}

fn strip_remote_keys(additional: &mut std::collections::BTreeMap<String, JsonValue>, extra: &[&str]) {
    for key in REMOTE_ONLY_KEYS.iter().chain(extra) {
        additional.remove(*key);
    }
}

/// Fill `{harvest_source_id}`-style placeholders in a default extra.
pub fn fill_placeholders(
    template: &str,
    ctx: &HarvestContext<'_>,
    request: &BuildRequest<'_>,
    dataset_id: &str,
) -> String {
    template
        .replace("{harvest_source_id}", &ctx.source.id)
        .replace("{harvest_source_url}", ctx.source.url.trim_matches('/'))
        .replace("{harvest_source_title}", &ctx.source.title)
        .replace("{harvest_job_id}", &ctx.run_id.to_string())
        .replace("{harvest_object_id}", &request.item.id.to_string())
        .replace("{dataset_id}", dataset_id)
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn extra_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn find_local_group(ctx: &HarvestContext<'_>, group: &GroupRef) -> Result<Option<Group>, AdapterError> {
    for key in [group.id.as_deref(), group.name.as_deref()].into_iter().flatten() {
        if let Lookup::Found(found) = ctx.catalog.group_show(key).await? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

async fn create_group_from_remote(ctx: &HarvestContext<'_>, group: &GroupRef) -> Option<GroupRef> {
    let remote_id = group.name.as_deref().or(group.id.as_deref())?;
    let Some(remote) = fetch_remote_action(ctx, "group_show", remote_id, "remote_group.json").await else {
        error!(group = remote_id, "could not get remote group");
        return None;
    };
    let mut request: Group = match serde_json::from_value(remote) {
        Ok(group) => group,
        Err(err) => {
            error!(group = remote_id, error = %err, "remote group is malformed");
            return None;
        }
    };
    strip_remote_keys(&mut request.additional, &[]);
    match ctx.catalog.group_create(&request).await {
        Ok(created) => {
            info!(group = remote_id, "group has been newly created");
            Some(created.to_ref())
        }
        Err(err) => {
            error!(group = remote_id, error = %err, "could not create group");
            None
        }
    }
}

async fn resolve_groups(
    ctx: &HarvestContext<'_>,
    mode: RemoteMode,
    remote: Vec<GroupRef>,
) -> Result<Vec<GroupRef>, AdapterError> {
    let mut candidates = remote;
    if candidates.len() > 1 {
        // Only the first remote group that already exists locally is kept.
        for group in &candidates {
            if let Some(name) = group.name.as_deref() {
                if ctx.catalog.group_show(name).await?.is_found() {
                    candidates = vec![group.clone()];
                    break;
                }
            }
        }
    }

    let mut validated = Vec::new();
    for group in &candidates {
        if let Some(local) = find_local_group(ctx, group).await? {
            validated.push(local.to_ref());
            continue;
        }
        info!(group = ?group.name, "group is not available");
        if mode == RemoteMode::Create {
            if let Some(created) = create_group_from_remote(ctx, group).await {
                validated.push(created);
            }
        }
    }
    Ok(validated)
}

async fn resolve_remote_org(
    ctx: &HarvestContext<'_>,
    mode: RemoteMode,
    remote_org: &str,
) -> Result<Option<String>, AdapterError> {
    if let Lookup::Found(org) = ctx.catalog.organization_show(remote_org).await? {
        return Ok(Some(org.id));
    }
    info!(remote_org, "organization is not available");
    if mode != RemoteMode::Create {
        return Ok(None);
    }

    let remote = match fetch_remote_action(ctx, "organization_show", remote_org, "remote_organization.json").await {
        Some(org) => Some(org),
        None => fetch_remote_action(ctx, "group_show", remote_org, "remote_group.json").await,
    };
    let Some(remote) = remote else {
        error!(remote_org, "could not get remote org");
        return Ok(None);
    };
    let mut request: Organization = match serde_json::from_value(remote) {
        Ok(org) => org,
        Err(err) => {
            error!(remote_org, error = %err, "remote org is malformed");
            return Ok(None);
        }
    };

    if let Lookup::Found(local) = ctx.catalog.organization_show(&request.name).await? {
        info!(name = %request.name, "found local org matching name");
        return Ok(Some(local.id));
    }

    strip_remote_keys(&mut request.additional, &["type"]);
    match ctx.catalog.organization_create(&request).await {
        Ok(created) => {
            info!(remote_org, "organization has been newly created");
            Ok(Some(created.id))
        }
        Err(err) => {
            error!(remote_org, error = %err, "could not create remote org locally");
            Ok(None)
        }
    }
}

fn apply_default_extras(
    dataset: &mut NormalizedDataset,
    ctx: &HarvestContext<'_>,
    request: &BuildRequest<'_>,
) {
    let dataset_id = dataset.id.clone().unwrap_or_default();
    for (key, value) in &ctx.config.default_extras {
        if dataset.extra(key).is_some() && !ctx.config.override_extras {
            continue;
        }
        let value = match value {
            JsonValue::String(template) => fill_placeholders(template, ctx, request, &dataset_id),
            other => other.to_string(),
        };
        dataset.remove_extra(key);
        dataset.set_extra(key, value);
    }
}

fn clean_resources(dataset: &mut NormalizedDataset) {
    let citation = dataset
        .field("citation")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    for resource in &mut dataset.resources {
        resource.additional.remove("url_type");
        resource.additional.remove("revision_id");
        if let Some(citation) = &citation {
            resource.attribution = Some(citation.clone());
        }
    }
}

fn copy_fields_to_extras(dataset: &mut NormalizedDataset, config: &harvest_core::HarvestConfig) -> Result<(), AdapterError> {
    if config.additional_fields_as_extras.is_empty() && config.additional_fields.is_empty() {
        return Ok(());
    }
    let snapshot = serde_json::to_value(&*dataset)?;
    for key in &config.additional_fields_as_extras {
        if let Some(value) = snapshot.get(key).filter(|v| is_truthy(v)) {
            dataset.set_extra(key, extra_value(value));
        }
    }
    for key in &config.additional_fields {
        if let Some(value) = snapshot.get(key) {
            dataset.set_extra(key, extra_value(value));
        }
    }
    Ok(())
}

#[async_trait]
impl SourceAdapter for CkanAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ckan
    }

    fn default_page_size(&self) -> usize {
        100
    }

    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        let rows = self.page_size(ctx.config);
        let url = format!(
            "{}?rows={rows}&start={}&sort=id+asc",
            api_url(&ctx.source.url, "package_search"),
            page_offset(page, rows)
        );
        let headers = auth_headers(ctx);
        let headers: Vec<(&str, &str)> = headers.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let Some(mut body) = fetch_json(ctx, &url, &headers, "package_search.json").await else {
            return Vec::new();
        };
        match body.pointer_mut("/result/results").map(JsonValue::take) {
            Some(JsonValue::Array(packages)) => packages,
            _ => {
                warn!(url, "package_search response has no results");
                Vec::new()
            }
        }
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        crate::json_string(record, &["id"])
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError> {
        let config = ctx.config;
        let mut dataset: NormalizedDataset = serde_json::from_value(request.record.clone())?;
        let remote_name = dataset.name.clone().unwrap_or_default();

        if config.ignore_private_datasets && dataset.private {
            return Ok(match request.existing {
                Some(local) if local.state.as_deref() != Some("deleted") => {
                    info!(name = %remote_name, "removing now private record");
                    BuildOutcome::Withdraw {
                        package_id: local.id.clone().unwrap_or_else(|| request.item.guid.clone()),
                        reason: format!("remote dataset {remote_name} is now private"),
                    }
                }
                Some(_) => BuildOutcome::Skip(format!("private record {remote_name} already removed")),
                None => BuildOutcome::Skip(format!("ignoring private record {remote_name}")),
            });
        }

        if dataset.dataset_type.as_deref() == Some("harvest") {
            warn!(name = %remote_name, "remote dataset is a harvest source, ignoring");
            return Ok(BuildOutcome::Skip("remote dataset is a harvest source".to_string()));
        }

        for tag in &config.default_tags {
            if !dataset.tags.iter().any(|t| t.name == tag.name) {
                dataset.tags.push(tag.clone());
            }
        }

        dataset.groups = match config.remote_groups {
            None => Vec::new(),
            Some(mode) => resolve_groups(ctx, mode, std::mem::take(&mut dataset.groups)).await?,
        };

        let source_org = ctx.source.owner_org.clone();
        dataset.owner_org = match (config.remote_orgs, dataset.owner_org.take()) {
            (Some(mode), Some(remote_org)) if !remote_org.is_empty() => {
                resolve_remote_org(ctx, mode, &remote_org)
                    .await?
                    .or(Some(source_org))
            }
            _ => Some(source_org),
        };

        dataset.extend_groups(config.default_group_refs());
        apply_default_extras(&mut dataset, ctx, request);
        clean_resources(&mut dataset);
        copy_fields_to_extras(&mut dataset, config)?;

        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }
}
