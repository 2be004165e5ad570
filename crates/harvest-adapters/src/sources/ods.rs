//! OpenDataSoft portals via the Explore v2.1 catalog API.

use async_trait::async_trait;
use harvest_core::{NormalizedDataset, Resource, SourceKind, Tag};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::{apply_default_groups, apply_required_defaults};
use crate::fetch::fetch_json;
use crate::mapping::{
    generate_extract, html_to_markdown, map_update_frequency, normalize_date, page_offset,
    replace_ampersands, UNKNOWN_FREQUENCY,
};
use crate::{
    json_str, json_string, json_string_list, AdapterError, BuildOutcome, BuildRequest,
    HarvestContext, SourceAdapter,
};

const FALLBACK_LICENSE: &str = "notspecified";

pub struct OdsAdapter;

fn portal_base(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

pub fn catalog_url(base: &str, limit: usize, offset: usize) -> String {
    format!(
        "{}/api/explore/v2.1/catalog/datasets?limit={limit}&offset={offset}",
        portal_base(base)
    )
}

pub fn dataset_page_url(base: &str, dataset_id: &str) -> String {
    format!("{}/explore/dataset/{dataset_id}/", portal_base(base))
}

fn export_url(base: &str, dataset_id: &str, format: &str) -> String {
    format!(
        "{}/api/explore/v2.1/catalog/datasets/{dataset_id}/exports/{format}",
        portal_base(base)
    )
}

/// Download resources for the dataset's record exports. Datasets that hold
/// no records (file-only or remote datasets) get none.
pub fn export_resources(base: &str, record: &JsonValue, dataset_id: &str) -> Vec<Resource> {
    if record.get("has_records").and_then(JsonValue::as_bool) == Some(false) {
        return Vec::new();
    }
    let title = json_str(record, &["metas", "default", "title"]).unwrap_or(dataset_id);
    let is_geo = json_string_list(record, &["features"])
        .iter()
        .any(|feature| feature == "geo");

    let mut exports = vec![
        ("CSV", format!("{}?delimiter=%2C", export_url(base, dataset_id, "csv"))),
        ("JSON", export_url(base, dataset_id, "json")),
    ];
    if is_geo {
        exports.push(("GeoJSON", export_url(base, dataset_id, "geojson")));
    }

    exports
        .into_iter()
        .map(|(format, url)| Resource {
            name: Some(format!("{title} ({format})")),
            format: Some(format.to_string()),
            url,
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl SourceAdapter for OdsAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Ods
    }

    fn default_page_size(&self) -> usize {
        100
    }

    async fn fetch_page(&self, ctx: &HarvestContext<'_>, page: usize) -> Vec<JsonValue> {
        let limit = self.page_size(ctx.config);
        let url = catalog_url(&ctx.source.url, limit, page_offset(page, limit));
        debug!(url, "getting page of datasets");
        let Some(mut body) = fetch_json(ctx, &url, &[], "datasets.json").await else {
            return Vec::new();
        };
        match body.get_mut("results").map(JsonValue::take) {
            Some(JsonValue::Array(results)) => results,
            _ => {
                warn!(url, "catalog response has no results list");
                Vec::new()
            }
        }
    }

    fn extract_guid(&self, record: &JsonValue) -> Option<String> {
        json_string(record, &["dataset_id"])
    }

    async fn build_dataset(
        &self,
        ctx: &HarvestContext<'_>,
        request: &BuildRequest<'_>,
    ) -> Result<BuildOutcome, AdapterError> {
        let record = request.record;
        let config = ctx.config;
        let dataset_id = request.item.guid.as_str();
        let base = ctx.source.url.as_str();
        let description = json_str(record, &["metas", "default", "description"]).unwrap_or_default();
        let landing_page = dataset_page_url(base, dataset_id);

        let mut dataset = NormalizedDataset {
            title: json_string(record, &["metas", "default", "title"])
                .or_else(|| Some(dataset_id.to_string())),
            notes: Some(html_to_markdown(description)),
            extract: Some(generate_extract(description)),
            url: Some(landing_page.clone()),
            full_metadata_url: Some(landing_page),
            owner_org: Some(ctx.source.owner_org.clone()),
            tags: json_string_list(record, &["metas", "default", "keyword"])
                .into_iter()
                .map(Tag::new)
                .collect(),
            resources: export_resources(base, record, dataset_id),
            ..Default::default()
        };
        replace_ampersands(&mut dataset.tags);

        let title = dataset.title.clone().unwrap_or_default();
        dataset.date_modified_data_asset = normalize_date(
            json_str(record, &["metas", "default", "modified"]),
            "modified",
            &title,
            false,
        );

        let remote_license = json_str(record, &["metas", "default", "license"]);
        if let Some(license) = &config.default_license {
            dataset.license_id = Some(license.id.clone());
            dataset.set_field("custom_licence_text", license.title.clone());
        } else {
            dataset.license_id = Some(
                config
                    .license_id
                    .clone()
                    .unwrap_or_else(|| FALLBACK_LICENSE.to_string()),
            );
            if let Some(license) = remote_license {
                dataset.set_field("custom_licence_text", license);
            }
        }

        if let Some(publisher) = json_str(record, &["metas", "default", "publisher"]) {
            dataset.set_extra("publisher", publisher);
        }
        dataset.set_extra("ods_dataset_id", dataset_id);

        dataset.update_frequency = Some(
            match json_str(record, &["metas", "dcat", "accrualperiodicity"]) {
                Some(label) => {
                    let choices = ctx.catalog.field_choices("update_frequency").await?;
                    map_update_frequency(&choices, label)
                }
                None => UNKNOWN_FREQUENCY.to_string(),
            },
        );

        apply_default_groups(&mut dataset, config);
        apply_required_defaults(
            &mut dataset,
            config.default_visibility.as_deref().unwrap_or("current"),
        );

        Ok(BuildOutcome::Dataset(Box::new(dataset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use harvest_core::{Disposition, FieldChoice, HarvestWorkItem, LicenseRef, HarvestConfig};
    use uuid::Uuid;

    async fn build(harness: &Harness, record: &JsonValue) -> NormalizedDataset {
        let guid = OdsAdapter.extract_guid(record).expect("guid");
        let item = HarvestWorkItem::staged(
            Uuid::nil(),
            "source-1",
            &guid,
            Disposition::New,
            Some(record.to_string()),
            None,
        );
        let request = BuildRequest {
            item: &item,
            record,
            existing: None,
        };
        match OdsAdapter.build_dataset(&harness.ctx(), &request).await.expect("build") {
            BuildOutcome::Dataset(dataset) => *dataset,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn explore_api_urls() {
        assert_eq!(
            catalog_url("https://ods.test/", 100, 200),
            "https://ods.test/api/explore/v2.1/catalog/datasets?limit=100&offset=200"
        );
        assert_eq!(
            dataset_page_url("https://ods.test", "bus-stops"),
            "https://ods.test/explore/dataset/bus-stops/"
        );
    }

    #[tokio::test]
    async fn geo_dataset_maps_with_exports() {
        let harness = Harness::new(SourceKind::Ods, "{}");
        harness
            .catalog
            .set_field_choices(
                "update_frequency",
                vec![FieldChoice {
                    value: "daily".into(),
                    label: "Daily".into(),
                }],
            )
            .await;
        let records = OdsAdapter.fetch_page(&harness.ctx(), 1).await;
        assert_eq!(records.len(), 2);

        let dataset = build(&harness, &records[0]).await;
        assert_eq!(dataset.title.as_deref(), Some("Bus Stops"));
        assert_eq!(
            dataset.notes.as_deref(),
            Some("Locations of **bus stops** in the city.\n\nSee [the network](https://city.test/network).")
        );
        assert_eq!(dataset.extract.as_deref(), Some("Locations of bus stops in the city."));
        assert_eq!(
            dataset.url.as_deref(),
            Some("https://remote.example.gov/explore/dataset/bus-stops/")
        );
        let tags: Vec<_> = dataset.tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tags, vec!["transport", "buses and trams"]);
        assert_eq!(dataset.date_modified_data_asset.as_deref(), Some("2024-02-01T09:30:00"));
        assert_eq!(dataset.update_frequency.as_deref(), Some("daily"));
        assert_eq!(dataset.extra("publisher"), Some("City Transport"));
        assert_eq!(dataset.license_id.as_deref(), Some("notspecified"));

        let formats: Vec<_> = dataset.resources.iter().filter_map(|r| r.format.as_deref()).collect();
        assert_eq!(formats, vec!["CSV", "JSON", "GeoJSON"]);
        assert_eq!(
            dataset.resources[0].url,
            "https://remote.example.gov/api/explore/v2.1/catalog/datasets/bus-stops/exports/csv?delimiter=%2C"
        );
        assert_eq!(dataset.owner_org.as_deref(), Some("source-org"));
    }

    #[tokio::test]
    async fn record_less_dataset_has_no_exports() {
        let config = HarvestConfig {
            default_license: Some(LicenseRef {
                id: "cc-by".into(),
                title: "Creative Commons Attribution 4.0".into(),
            }),
            ..Default::default()
        };
        let harness = Harness::new(SourceKind::Ods, "{}").with_config(config);
        let records = OdsAdapter.fetch_page(&harness.ctx(), 1).await;
        let dataset = build(&harness, &records[1]).await;
        assert!(dataset.resources.is_empty());
        assert_eq!(dataset.title.as_deref(), Some("annual-report-pdfs"));
        assert_eq!(dataset.notes.as_deref(), Some(""));
        assert_eq!(dataset.update_frequency.as_deref(), Some("unknown"));
        assert_eq!(dataset.license_id.as_deref(), Some("cc-by"));
    }
}
