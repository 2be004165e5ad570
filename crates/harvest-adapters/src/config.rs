//! Harvest source configuration: raw JSON text in, typed [`HarvestConfig`] out.
//!
//! Validation runs once per run before anything is fetched. Checks happen in
//! a fixed order and the first failure is reported; no partially valid
//! config is ever returned.

use std::collections::BTreeMap;

use harvest_catalog::{CatalogError, HostCatalog};
use harvest_core::{
    HarvestConfig, LicenseRef, Lookup, OrganisationMapping, RemoteMode, SourceKind, Tag,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

type JsonObject = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No config options set")]
    Empty,
    #[error("{0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

pub async fn validate_source_config(
    kind: SourceKind,
    raw: &str,
    catalog: &dyn HostCatalog,
) -> Result<HarvestConfig, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Empty);
    }
    let parsed: JsonValue = serde_json::from_str(raw)?;
    let JsonValue::Object(obj) = parsed else {
        return Err(invalid("Config must be a JSON object"));
    };

    let default_groups = validate_default_groups(&obj)?;
    let mut default_group_dicts = Vec::with_capacity(default_groups.len());
    for group in &default_groups {
        match catalog.group_show(group).await? {
            Lookup::Found(found) => default_group_dicts.push(found),
            Lookup::NotFound => return Err(invalid(format!("Default group {group} not found"))),
        }
    }
    let default_license = validate_default_license(&obj)?;

    let mut config = HarvestConfig {
        default_groups,
        default_group_dicts,
        default_license,
        ..Default::default()
    };

    parse_common(&obj, &mut config)?;
    match kind {
        SourceKind::Ckan => parse_ckan(&obj, &mut config)?,
        SourceKind::Delwp => validate_delwp(&obj, &mut config, catalog).await?,
        _ => {}
    }

    debug!(%kind, groups = config.default_groups.len(), "config validated");
    Ok(config)
}

fn validate_default_groups(obj: &JsonObject) -> Result<Vec<String>, ConfigError> {
    let Some(groups) = obj.get("default_groups") else {
        return Err(invalid("default_groups must be set"));
    };
    let JsonValue::Array(groups) = groups else {
        return Err(invalid("default_groups must be a *list* of group names/ids"));
    };
    groups
        .iter()
        .map(|g| {
            g.as_str().map(str::to_string).ok_or_else(|| {
                invalid("default_groups must be a list of group names/ids (i.e. strings)")
            })
        })
        .collect()
}

fn validate_default_license(obj: &JsonObject) -> Result<Option<LicenseRef>, ConfigError> {
    let license = match obj.get("default_license") {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::Object(map)) if map.is_empty() => return Ok(None),
        Some(JsonValue::Object(map)) => map,
        Some(_) => return Err(invalid("default_license field must be a dictionary")),
    };
    match (str_field(license, "id"), str_field(license, "title")) {
        (Some(id), Some(title)) => Ok(Some(LicenseRef { id, title })),
        _ => Err(invalid("default_license must contain `id` and `title` fields")),
    }
}

fn str_field(obj: &JsonObject, key: &str) -> Option<String> {
    obj.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

fn bool_field(obj: &JsonObject, key: &str) -> bool {
    match obj.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

fn string_list(obj: &JsonObject, key: &str) -> Result<Vec<String>, ConfigError> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items
            .iter()
            .filter_map(JsonValue::as_str)
            .map(str::to_string)
            .collect()),
        Some(_) => Err(invalid(format!("{key} must be a list"))),
    }
}

fn parse_common(obj: &JsonObject, config: &mut HarvestConfig) -> Result<(), ConfigError> {
    config.default_visibility = match obj.get("default_visibility") {
        Some(JsonValue::Object(map)) => str_field(map, "organization_visibility"),
        Some(JsonValue::String(s)) => Some(s.clone()),
        _ => None,
    };
    config.default_full_metadata_url = str_field(obj, "default_full_metadata_url");
    config.full_metadata_url_pattern = str_field(obj, "full_metadata_url_pattern");
    config.full_metadata_url_prefix = str_field(obj, "full_metadata_url_prefix");
    config.resource_url_prefix = str_field(obj, "resource_url_prefix");
    config.resource_attribution = str_field(obj, "resource_attribution");
    config.license_id = str_field(obj, "license_id");
    config.dataset_type = str_field(obj, "dataset_type");
    config.api_auth = str_field(obj, "api_auth");
    config.api_key = str_field(obj, "api_key");
    config.geoserver_dns = str_field(obj, "geoserver_dns");
    config.test = bool_field(obj, "test");
    config.page_size = match obj.get("page_size") {
        None | Some(JsonValue::Null) => None,
        Some(value) => match value.as_u64() {
            Some(size) if size > 0 => Some(size as usize),
            _ => return Err(invalid("page_size must be a positive integer")),
        },
    };
    Ok(())
}

fn remote_mode(obj: &JsonObject, key: &str) -> Result<Option<RemoteMode>, ConfigError> {
    match obj.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|_| invalid("remote_groups or remote_orgs can only have only_local or create")),
    }
}

fn parse_ckan(obj: &JsonObject, config: &mut HarvestConfig) -> Result<(), ConfigError> {
    config.default_tags = match obj.get("default_tags") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(name) => Some(Tag::new(name.as_str())),
                JsonValue::Object(map) => str_field(map, "name").map(Tag::new),
                _ => None,
            })
            .collect(),
        Some(_) => return Err(invalid("default_tags must be a list")),
    };
    config.default_extras = match obj.get("default_extras") {
        None | Some(JsonValue::Null) => BTreeMap::new(),
        Some(JsonValue::Object(map)) => map.clone().into_iter().collect(),
        Some(_) => return Err(invalid("default_extras must be a dictionary")),
    };
    config.override_extras = bool_field(obj, "override_extras");
    config.ignore_private_datasets = bool_field(obj, "ignore_private_datasets");
    config.remote_groups = remote_mode(obj, "remote_groups")?;
    config.remote_orgs = remote_mode(obj, "remote_orgs")?;
    config.additional_fields = string_list(obj, "additional_fields")?;
    config.additional_fields_as_extras = string_list(obj, "additional_fields_as_extras")?;
    Ok(())
}

async fn validate_delwp(
    obj: &JsonObject,
    config: &mut HarvestConfig,
    catalog: &dyn HostCatalog,
) -> Result<(), ConfigError> {
    let Some(prefix) = obj.get("full_metadata_url_prefix") else {
        return Err(invalid("full_metadata_url_prefix must be set"));
    };
    if !prefix.as_str().unwrap_or_default().contains("{UUID}") {
        return Err(invalid(
            "full_metadata_url_prefix must have the {UUID} identifier in the URL",
        ));
    }
    for key in [
        "resource_url_prefix",
        "license_id",
        "resource_attribution",
        "dataset_type",
        "api_auth",
    ] {
        if !obj.contains_key(key) {
            return Err(invalid(format!("{key} must be set")));
        }
    }

    let Some(mapping) = obj.get("organisation_mapping") else {
        return Ok(());
    };
    let JsonValue::Array(items) = mapping else {
        return Err(invalid("organisation_mapping must be a *list* of organisations"));
    };
    for item in items {
        let JsonValue::Object(entry) = item else {
            return Err(invalid(
                r#"organisation_mapping item must be a *dict*. eg {"resowner": "Organisation A", "org-name": "organisation-a"}"#,
            ));
        };
        let Some(resowner) = str_field(entry, "resowner").filter(|s| !s.is_empty()) else {
            return Err(invalid(
                r#"organisation_mapping item must have property "resowner". eg "resowner": "Organisation A""#,
            ));
        };
        let Some(org_name) = str_field(entry, "org-name").filter(|s| !s.is_empty()) else {
            return Err(invalid(
                r#"organisation_mapping item must have property "org-name". eg "org-name": "organisation-a""#,
            ));
        };
        if !catalog.organization_show(&org_name).await?.is_found() {
            return Err(invalid(format!("Organisation {org_name} not found")));
        }
        config
            .organisation_mapping
            .push(OrganisationMapping { resowner, org_name });
    }
    Ok(())
}
