//! DELWP spatial datasets: paged search records whose `fields` dict carries
//! the flattened MetaShare metadata, plus GeoServer WMS/WFS resources.

use async_trait::async_trait;
use harvest_core::{NormalizedDataset, Resource, SourceKind};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{apply_default_groups, apply_required_defaults};
use crate::capabilities::capability_resources;
use crate::fetch::{fetch_json, resource_size};
use crate::mapping::{
    map_update_frequency, normalize_date, page_offset, replace_ampersands, split_tags,
    truncated_extract, UNKNOWN_FREQUENCY,
};
use crate::orgs::resolve_owner_org;
use crate::{
    json_str, json_string, AdapterError, BuildOutcome, BuildRequest, HarvestContext,
    SourceAdapter,
};

const VECTOR_FORMATS: &[&str] = &[
    "dwg",
    "dxf",
    "gdb",
    "shp",
    "mif",
    "tab",
    "extended tab",
    "mapinfo",
];
const RASTER_FORMATS: &[&str] = &[
    "ecw", "geotiff", "jpeg", "jp2", "jpeg 2000", "tiff", "lass", "xyz",
];
const UNCLASSIFIED: &str = "unclassified";
const DEFAULT_LICENSE: &str = "cc-by";
const CLOSED_LICENSE: &str = "other-closed";

const RASTER_ACCESS_NOTES: &str = "Aerial imagery and elevation datasets\n\n\
You can access high-resolution aerial imagery and elevation (LiDAR point cloud) datasets by contacting a business that holds a commercial license.\n\n\
We have two types of commercial licensing:\n\n\
Data Service Providers (DSPs) provide access to the source imagery or elevation data.\n\n\
Value Added Retailers (VARs) use the imagery and elevation data to create new products and services. This includes advisory services and new knowledge products.";

pub struct DelwpAdapter;

pub fn records_url(base: &str, dataset_type: &str, start: usize, rows: usize) -> String {
    let base = base.trim().trim_end_matches('?');
    format!("{base}?dataset={dataset_type}&start={start}&rows={rows}&format=json")
}

fn raster_metadata_url(uuid: &str) -> String {
    format!(
        "https://metashare.maps.vic.gov.au/geonetwork/srv/api/records/{uuid}/formatters/cip-pdf?root=export&output=pdf"
    )
}

fn has_format_in(resources: &[Resource], formats: &[&str]) -> bool {
    resources
        .iter()
        .any(|res| formats.contains(&res.format_lower().as_str()))
}

/// Only unclassified vector data is published openly.
pub fn is_restricted(record: &JsonValue, resources: &[Resource]) -> bool {
    let unclassified = |key: &str| json_str(record, &[key]) == Some(UNCLASSIFIED);
    !(has_format_in(resources, VECTOR_FORMATS)
        && unclassified("mdclassification")
        && unclassified("resclassification"))
}

/// One download resource per entry of the comma separated `available_formats`.
async fn format_resources(
    ctx: &HarvestContext<'_>,
    record: &JsonValue,
    uuid: &str,
    period_start: &Option<String>,
    period_end: &Option<String>,
) -> Vec<Resource> {
    let Some(formats) = record.get("available_formats").and_then(JsonValue::as_str) else {
        return Vec::new();
    };
    let url = ctx
        .config
        .resource_url_prefix
        .as_deref()
        .map(|prefix| format!("{prefix}{uuid}"))
        .unwrap_or_default();
    let base_name = json_str(record, &["alttitle"])
        .or_else(|| json_str(record, &["title"]))
        .unwrap_or_default();

    let mut resources = Vec::new();
    for format in formats.split(',').map(str::trim) {
        let size = resource_size(ctx, &url).await;
        let mut resource = Resource {
            name: Some(format!("{base_name} {format}").replace('_', "")),
            format: Some(format.to_string()),
            url: url.clone(),
            period_start: period_start.clone(),
            period_end: period_end.clone(),
            attribution: ctx.config.resource_attribution.clone(),
            size,
            ..Default::default()
        };
        resource
            .additional
            .insert("filesize".into(), size.map(JsonValue::from).unwrap_or(JsonValue::Null));
        resources.push(resource);
    }
    resources
}

#[async_trait]
impl SourceAdapter for DelwpAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Delwp
    }

    fn default_page_size(&self) -> usize {
        500
    }

    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        let rows = self.page_size(ctx.config);
        let dataset_type = ctx.config.dataset_type.as_deref().unwrap_or_default();
        let url = records_url(&ctx.source.url, dataset_type, page_offset(page, rows), rows);
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
        let records = match body.get_mut("records").map(JsonValue::take) {
            Some(JsonValue::Array(records)) => records,
            Some(record @ JsonValue::Object(_)) => vec![record],
            Some(other) => {
                warn!(url, kind = ?other, "records is not a list");
                return Vec::new();
            }
            None => {
                debug!(url, "empty document, no more records");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter_map(|mut record| match record.get_mut("fields").map(JsonValue::take) {
                Some(fields @ JsonValue::Object(_)) => Some(fields),
                _ => None,
            })
            .collect()
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        json_string(record, &["uuid"])
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
        let name_for_logs = json_str(record, &["name"]).unwrap_or(uuid);
        let notes = record
            .get("abstract")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let resowner = json_str(record, &["resowner"])
            .and_then(|owner| owner.split(';').next())
            .map(str::trim)
            .unwrap_or_default();

        let mut dataset = NormalizedDataset {
            title,
            extract: Some(truncated_extract(&notes)),
            notes: Some(notes),
            ..Default::default()
        };
        apply_required_defaults(&mut dataset, "all");

        if let Some(topics) = json_str(record, &["topiccat"]) {
            dataset.tags = split_tags(topics);
            replace_ampersands(&mut dataset.tags);
        }
        if let Some(changed) = json_str(record, &["geonet_info_changedate"]) {
            dataset.set_field("last_updated", changed);
        }

        let owner = resolve_owner_org(
            ctx.catalog,
            &config.organisation_mapping,
            resowner,
            &ctx.source.owner_org,
        )
        .await;
        dataset.owner_org = Some(owner.into_owner_org()).filter(|org| !org.is_empty());

        dataset.set_field("primary_purpose_of_collection", uuid);
        if !resowner.is_empty() {
            dataset.set_field("data_owner", resowner);
        }
        apply_default_groups(&mut dataset, config);

        dataset.date_created_data_asset = normalize_date(
            json_str(record, &["publicationdate"])
                .or_else(|| json_str(record, &["geonet_info_createdate"])),
            "geonet_info_createdate",
            name_for_logs,
            true,
        );
        dataset.date_modified_data_asset = normalize_date(
            json_str(record, &["revisiondate"])
                .or_else(|| json_str(record, &["geonet_info_changedate"])),
            "geonet_info_changedate",
            name_for_logs,
            true,
        );

        let frequency_label = json_str(record, &["maintenanceandupdatefrequency_text"])
            .unwrap_or(UNKNOWN_FREQUENCY);
        let choices = ctx.catalog.field_choices("update_frequency").await?;
        dataset.update_frequency = Some(map_update_frequency(&choices, frequency_label));

        let period_start = normalize_date(
            json_str(record, &["tempextentbegin"]),
            "tempextentbegin",
            name_for_logs,
            true,
        );
        let period_end = normalize_date(
            json_str(record, &["tempextentend"]),
            "tempextentend",
            name_for_logs,
            true,
        );
        dataset.resources = format_resources(ctx, record, uuid, &period_start, &period_end).await;
        dataset
            .resources
            .extend(capability_resources(ctx, uuid, period_start, period_end).await);

        dataset.private = is_restricted(record, &dataset.resources);
        dataset.license_id = Some(if dataset.private {
            CLOSED_LICENSE.to_string()
        } else {
            config
                .license_id
                .clone()
                .unwrap_or_else(|| DEFAULT_LICENSE.to_string())
        });

        if has_format_in(&dataset.resources, RASTER_FORMATS) {
            dataset.full_metadata_url = Some(raster_metadata_url(uuid));
            dataset.set_field("access_description", RASTER_ACCESS_NOTES);
        } else if let Some(prefix) = &config.full_metadata_url_prefix {
            dataset.full_metadata_url = Some(prefix.replace("{UUID}", uuid));
        }

        dataset.set_extra("harvest_source_id", ctx.source.id.as_str());
        dataset.set_extra("harvest_source_title", ctx.source.title.as_str());
        dataset.set_extra("harvest_source_type", ctx.source.kind.as_str());
        dataset.set_extra("delwp_restricted", dataset.private.to_string());

        let item_id = request.item.id;
        let notes_missing = dataset.notes.as_deref().map_or(true, str::is_empty);
        if notes_missing || dataset.owner_org.is_none() {
            let msg = format!(
                "Description or organization field is missing for object {item_id}, skipping..."
            );
            info!("{msg}");
            return Ok(BuildOutcome::Reject(msg));
        }
        if dataset.private {
            let msg = format!("Dataset is Restricted for object {item_id}, skipping...");
            info!("{msg}");
            return Ok(BuildOutcome::Reject(msg));
        }

        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }

    fn tracks_content_hash(&self) -> bool {
        true
    }
}
