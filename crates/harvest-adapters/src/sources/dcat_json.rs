//! DCAT-JSON catalogues (`data.json` style feeds).

use async_trait::async_trait;
use harvest_core::{NormalizedDataset, Resource, SourceKind, Tag};
use harvest_storage::sha256_hex;
use serde_json::Value as JsonValue;
use tracing::{error, warn};

use super::{apply_default_groups, apply_required_defaults};
use crate::fetch::{fetch_json, fetch_text};
use crate::mapping::{
    extract_metadata_url, generate_extract, normalize_date, replace_ampersands, sanitize_html,
    scrape_update_frequency, UNKNOWN_FREQUENCY,
};
use crate::{
    json_str, json_string, json_string_list, AdapterError, BuildOutcome, BuildRequest,
    HarvestContext, SourceAdapter,
};

const PLACEHOLDER_MARKER: &str = "default.description";
const PLACEHOLDER_NOTES: &str = "No description has been entered for this dataset.";
const PLACEHOLDER_EXTRACT: &str = "No abstract has been entered for this dataset.";

pub struct DcatJsonAdapter;

pub fn page_url(base: &str, page: usize) -> String {
    let base = base.trim();
    if page <= 1 {
        return base.to_string();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}page={page}")
}

/// Map the DCAT vocabulary onto catalog fields.
pub fn dcat_to_dataset(record: &JsonValue, guid: &str) -> NormalizedDataset {
    let mut dataset = NormalizedDataset {
        title: json_string(record, &["title"]),
        notes: json_string(record, &["description"]),
        url: json_string(record, &["landingPage"]),
        tags: json_string_list(record, &["keyword"])
            .into_iter()
            .map(Tag::new)
            .collect(),
        ..Default::default()
    };

    for key in ["issued", "modified"] {
        if let Some(value) = json_str(record, &[key]) {
            dataset.set_extra(&format!("dcat_{key}"), value);
        }
    }
    dataset.set_extra("guid", guid);

    match record.get("publisher") {
        Some(JsonValue::String(name)) if !name.is_empty() => {
            dataset.set_extra("dcat_publisher_name", name.as_str());
        }
        Some(publisher @ JsonValue::Object(_)) => {
            if let Some(name) = json_str(publisher, &["name"]) {
                dataset.set_extra("dcat_publisher_name", name);
                if let Some(mbox) = json_str(publisher, &["mbox"]) {
                    dataset.set_extra("dcat_publisher_email", mbox);
                }
            }
        }
        _ => {}
    }

    let languages = json_string_list(record, &["language"]);
    if !languages.is_empty() {
        dataset.set_extra("language", languages.join(","));
    }

    dataset.resources = record
        .get("distribution")
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().map(distribution_to_resource).collect())
        .unwrap_or_default();
    dataset
}

fn distribution_to_resource(distribution: &JsonValue) -> Resource {
    let size = match distribution.get("byteSize") {
        Some(JsonValue::Number(n)) => n.as_u64(),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    Resource {
        name: json_string(distribution, &["title"]),
        description: json_string(distribution, &["description"]),
        url: json_string(distribution, &["downloadURL"])
            .or_else(|| json_string(distribution, &["accessURL"]))
            .unwrap_or_default(),
        format: json_string(distribution, &["format"]),
        size,
        ..Default::default()
    }
}

async fn fetch_update_frequency(ctx: &HarvestContext<'_>, metadata_url: &str) -> String {
    match fetch_text(ctx, metadata_url, &[], "full_metadata.html").await {
        Some(page) => scrape_update_frequency(&page),
        None => {
            error!(metadata_url, "could not fetch full metadata page for update frequency");
            UNKNOWN_FREQUENCY.to_string()
        }
    }
}

#[async_trait]
impl SourceAdapter for DcatJsonAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::DcatJson
    }

    fn default_page_size(&self) -> usize {
        100
    }

    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        let url = page_url(&ctx.source.url, page);
        match fetch_json(ctx, &url, &[], "datasets.json").await {
            Some(JsonValue::Array(items)) => items,
            Some(JsonValue::Object(mut body)) => match body.remove("dataset") {
                Some(JsonValue::Array(items)) => items,
                _ => {
                    warn!(url, "DCAT document has no dataset list");
                    Vec::new()
                }
            },
            Some(_) => {
                warn!(url, "unexpected DCAT document shape");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        match record.get("identifier") {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => Some(sha256_hex(record.to_string().as_bytes())),
        }
    }

    fn stops_on_repeated_page(&self) -> bool {
        true
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError> {
        let record = request.record;
        let config = ctx.config;
        let mut dataset = dcat_to_dataset(record, &request.item.guid);
        let title = dataset.title.clone().unwrap_or_default();
        let raw_notes = dataset.notes.clone().unwrap_or_default();

        if raw_notes.contains(PLACEHOLDER_MARKER) {
            dataset.notes = Some(PLACEHOLDER_NOTES.to_string());
            dataset.extract = Some(PLACEHOLDER_EXTRACT.to_string());
        } else {
            dataset.notes = Some(sanitize_html(&raw_notes));
            dataset.extract = Some(generate_extract(&raw_notes));
        }

        let metadata_url = config
            .default_full_metadata_url
            .clone()
            .or_else(|| {
                config
                    .full_metadata_url_pattern
                    .as_deref()
                    .and_then(|pattern| extract_metadata_url(&raw_notes, pattern))
            });
        if let Some(metadata_url) = metadata_url {
            dataset.update_frequency = Some(fetch_update_frequency(ctx, &metadata_url).await);
            dataset.full_metadata_url = Some(metadata_url);
        }

        replace_ampersands(&mut dataset.tags);
        apply_default_groups(&mut dataset, config);
        apply_required_defaults(
            &mut dataset,
            config.default_visibility.as_deref().unwrap_or("current"),
        );

        dataset.date_created_data_asset =
            normalize_date(json_str(record, &["issued"]), "issued", &title, false);
        dataset.date_modified_data_asset =
            normalize_date(json_str(record, &["modified"]), "modified", &title, false);

        if dataset.full_metadata_url.is_none() {
            dataset.full_metadata_url = json_string(record, &["landingPage"]);
        }
        if dataset.license_id.is_none() {
            if let Some(license) = &config.default_license {
                dataset.license_id = Some(license.id.clone());
                dataset.set_field("custom_licence_text", license.title.clone());
            }
        }
        dataset
            .update_frequency
            .get_or_insert_with(|| UNKNOWN_FREQUENCY.to_string());
        dataset.owner_org = Some(ctx.source.owner_org.clone());

        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }
}
