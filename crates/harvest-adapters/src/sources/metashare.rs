//! MetaShare GeoNetwork search results (`q?_content_type=json&fast=index`).

use async_trait::async_trait;
use harvest_core::{NormalizedDataset, Resource, SourceKind, Tag};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{apply_default_groups, apply_required_defaults};
use crate::fetch::fetch_json;
use crate::mapping::{
    get_from_to, map_update_frequency, normalize_date, split_tags, truncated_extract,
    xml_char_refs, UNKNOWN_FREQUENCY,
};
use crate::{
    json_str, json_string, AdapterError, BuildOutcome, BuildRequest, HarvestContext,
    SourceAdapter,
};

const DEFAULT_LICENSE: &str = "cc-by";

pub struct MetashareAdapter;

pub fn page_url(base: &str, page: usize, per_page: usize) -> String {
    let base = base.trim().trim_end_matches('?');
    let (from, to) = get_from_to(page, per_page);
    format!("{base}?from={from}&to={to}&_content_type=json&fast=index")
}

/// `topicCat` arrives as one `;`/`,` separated string or as a list.
fn topic_tags(record: &JsonValue) -> Vec<Tag> {
    match record.get("topicCat") {
        Some(JsonValue::String(value)) => split_tags(value),
        Some(JsonValue::Array(values)) => values
            .iter()
            .filter_map(JsonValue::as_str)
            .flat_map(split_tags)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SourceAdapter for MetashareAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Metashare
    }

    fn default_page_size(&self) -> usize {
        500
    }

    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        let url = page_url(&ctx.source.url, page, self.page_size(ctx.config));
        debug!(url, "getting page of records");
        let headers: Vec<(&str, &str)> = ctx
            .config
            .api_auth
            .as_deref()
            .map(|auth| vec![("Authorization", auth)])
            .unwrap_or_default();

        let Some(mut body) = fetch_json(ctx, &url, &headers, "records.json").await else {
            return Vec::new();
        };
        match body.get_mut("metadata").map(JsonValue::take) {
            Some(JsonValue::Array(records)) => records,
            Some(record @ JsonValue::Object(_)) => vec![record],
            Some(_) => {
                warn!(url, "metadata element is not a list");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        json_string(record, &["geonet:info", "uuid"])
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError> {
        let record = request.record;
        let config = ctx.config;
        let uuid = request.item.guid.as_str();
        let title = json_string(record, &["title"]);
        let log_name = title.clone().unwrap_or_else(|| uuid.to_string());
        let notes = xml_char_refs(
            record
                .get("abstract")
                .and_then(JsonValue::as_str)
                .unwrap_or_default(),
        );

        let mut dataset = NormalizedDataset {
            title,
            extract: Some(truncated_extract(&notes)),
            notes: Some(notes),
            owner_org: Some(ctx.source.owner_org.clone()),
            license_id: Some(
                config
                    .license_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_LICENSE.to_string()),
            ),
            tags: topic_tags(record),
            ..Default::default()
        };
        apply_required_defaults(
            &mut dataset,
            config.default_visibility.as_deref().unwrap_or("all"),
        );

        dataset.set_field("primary_purpose_of_collection", uuid);
        if let Some(owner) = json_str(record, &["resOwner"]).and_then(|o| o.split(';').next()) {
            dataset.set_field("data_owner", owner);
        }
        apply_default_groups(&mut dataset, config);

        let period_start = normalize_date(
            json_str(record, &["tempExtentBegin"]),
            "tempExtentBegin",
            &log_name,
            true,
        );
        dataset.date_created_data_asset = period_start.clone();
        dataset.date_modified_data_asset = normalize_date(
            json_str(record, &["revisionDate"]),
            "revisionDate",
            &log_name,
            true,
        );

        let frequency_label = json_str(record, &["maintenanceAndUpdateFrequency_text"])
            .unwrap_or(UNKNOWN_FREQUENCY);
        let choices = ctx.catalog.field_choices("update_frequency").await?;
        dataset.update_frequency = Some(map_update_frequency(&choices, frequency_label));

        if let Some(prefix) = &config.full_metadata_url_prefix {
            dataset.full_metadata_url = Some(prefix.replace("{UUID}", uuid));
        }

        dataset.resources = vec![Resource {
            name: json_string(record, &["altTitle"]).or_else(|| json_string(record, &["title"])),
            format: json_string(record, &["spatialRepresentationType_text"]),
            url: config
                .resource_url_prefix
                .as_deref()
                .map(|prefix| format!("{prefix}{uuid}"))
                .unwrap_or_default(),
            period_start,
            period_end: normalize_date(
                json_str(record, &["tempExtentEnd"]),
                "tempExtentEnd",
                &log_name,
                true,
            ),
            attribution: config.resource_attribution.clone(),
            ..Default::default()
        }];

        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }
}
