//! Core domain model for the catalog harvesters: remote records, staged work
//! items, the catalog-shaped dataset and the validated per-source config.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Answer of a catalog read where absence is an expected outcome, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    DcatJson,
    Ckan,
    Delwp,
    Metashare,
    Ods,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::DcatJson => "dcat-json",
            SourceKind::Ckan => "ckan",
            SourceKind::Delwp => "delwp",
            SourceKind::Metashare => "metashare",
            SourceKind::Ods => "ods",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered harvest source. `config` holds the raw JSON configuration
/// text exactly as an operator entered it; it is validated once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestSource {
    pub id: String,
    pub title: String,
    pub kind: SourceKind,
    pub url: String,
    pub owner_org: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: String,
}

fn default_enabled() -> bool {
    true
}

/// Source-native record plus the GUID pulled from its source-specific location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub guid: String,
    pub payload: JsonValue,
}

impl RemoteRecord {
    pub fn new(guid: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            guid: guid.into(),
            payload,
        }
    }

    pub fn content(&self) -> String {
        self.payload.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    New,
    Change,
    Delete,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::New => "new",
            Disposition::Change => "change",
            Disposition::Delete => "delete",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStage {
    Gather,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub stage: ErrorStage,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// One staged reconciliation decision for a guid within a harvest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestWorkItem {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_id: String,
    pub guid: String,
    pub disposition: Disposition,
    /// Serialized remote record; absent for deletions.
    pub content: Option<String>,
    /// Local package the guid maps to; absent for new items until imported.
    pub local_package_id: Option<String>,
    pub current: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl HarvestWorkItem {
    pub fn staged(
        run_id: Uuid,
        source_id: &str,
        guid: &str,
        disposition: Disposition,
        content: Option<String>,
        local_package_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            source_id: source_id.to_string(),
            guid: guid.to_string(),
            disposition,
            content,
            local_package_id,
            current: false,
            created_at: Utc::now(),
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// guid → local package id for one harvest source, as of the previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIndex(BTreeMap<String, String>);

impl LocalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, guid: impl Into<String>, package_id: impl Into<String>) {
        self.0.insert(guid.into(), package_id.into());
    }

    pub fn package_id(&self, guid: &str) -> Option<&str> {
        self.0.get(guid).map(String::as_str)
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.0.contains_key(guid)
    }

    pub fn guids(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(g, p)| (g.as_str(), p.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LocalIndex {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Deserialize `null` as the type's default. Remote CKAN payloads routinely
/// send `null` for list and flag fields.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    })
}

/// Byte sizes arrive as numbers, numeric strings, empty strings or null.
fn lenient_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extra {
    pub key: String,
    #[serde(deserialize_with = "lenient_string")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_size",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub additional: BTreeMap<String, JsonValue>,
}

impl Resource {
    pub fn format_lower(&self) -> String {
        self.format.as_deref().unwrap_or_default().to_lowercase()
    }
}

/// Catalog-shaped dataset handed to `package_create`/`package_update`, and
/// returned by `package_show`. Fields the harvesters do not reason about
/// travel in `additional`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDataset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_org: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub dataset_type: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<Tag>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<GroupRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub resources: Vec<Resource>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extras: Vec<Extra>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_metadata_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_information: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protective_marking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_created_data_asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_modified_data_asset: Option<String>,
    #[serde(flatten)]
    pub additional: BTreeMap<String, JsonValue>,
}

impl NormalizedDataset {
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Set an extra, replacing any existing entry with the same key.
    pub fn set_extra(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.extras.iter_mut().find(|e| e.key == key) {
            Some(existing) => existing.value = value,
            None => self.extras.push(Extra {
                key: key.to_string(),
                value,
            }),
        }
    }

    pub fn remove_extra(&mut self, key: &str) -> Option<Extra> {
        let pos = self.extras.iter().position(|e| e.key == key)?;
        Some(self.extras.remove(pos))
    }

    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.additional.get(key).filter(|v| !v.is_null())
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.additional.insert(key.to_string(), value.into());
    }

    pub fn group_ids(&self) -> Vec<&str> {
        self.groups.iter().filter_map(|g| g.id.as_deref()).collect()
    }

    /// Append groups whose id is not already attached.
    pub fn extend_groups(&mut self, groups: impl IntoIterator<Item = GroupRef>) {
        for group in groups {
            let duplicate = group.id.is_some()
                && self.groups.iter().any(|existing| existing.id == group.id);
            if !duplicate {
                self.groups.push(group);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub additional: BTreeMap<String, JsonValue>,
}

impl Group {
    pub fn to_ref(&self) -> GroupRef {
        GroupRef {
            id: Some(self.id.clone()),
            name: Some(self.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub additional: BTreeMap<String, JsonValue>,
}

/// One controlled-vocabulary option of a schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChoice {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganisationMapping {
    pub resowner: String,
    #[serde(rename = "org-name")]
    pub org_name: String,
}

/// How the CKAN harvester treats groups or organisations named by a remote package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMode {
    OnlyLocal,
    Create,
}

/// Validated harvest source configuration, threaded by reference through
/// every gather and import call of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestConfig {
    pub default_groups: Vec<String>,
    pub default_group_dicts: Vec<Group>,
    pub default_license: Option<LicenseRef>,
    pub default_tags: Vec<Tag>,
    pub default_extras: BTreeMap<String, JsonValue>,
    pub override_extras: bool,
    pub default_visibility: Option<String>,
    pub default_full_metadata_url: Option<String>,
    pub full_metadata_url_pattern: Option<String>,
    pub full_metadata_url_prefix: Option<String>,
    pub resource_url_prefix: Option<String>,
    pub resource_attribution: Option<String>,
    pub license_id: Option<String>,
    pub dataset_type: Option<String>,
    pub api_auth: Option<String>,
    pub api_key: Option<String>,
    pub organisation_mapping: Vec<OrganisationMapping>,
    pub geoserver_dns: Option<String>,
    pub ignore_private_datasets: bool,
    pub remote_groups: Option<RemoteMode>,
    pub remote_orgs: Option<RemoteMode>,
    pub additional_fields: Vec<String>,
    pub additional_fields_as_extras: Vec<String>,
    pub page_size: Option<usize>,
    /// Stop gathering after the first page.
    pub test: bool,
}

impl HarvestConfig {
    pub fn default_group_refs(&self) -> Vec<GroupRef> {
        self.default_group_dicts.iter().map(Group::to_ref).collect()
    }

    /// The first default group doubles as the dataset's single category.
    pub fn category(&self) -> Option<&str> {
        self.default_group_dicts.first().map(|g| g.id.as_str())
    }
}
