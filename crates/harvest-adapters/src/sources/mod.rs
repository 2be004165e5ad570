//! One adapter per harvest source kind.

pub mod ckan;
pub mod dcat_json;
pub mod delwp;
pub mod metashare;
pub mod ods;

use harvest_core::{HarvestConfig, NormalizedDataset};

/// Attach the configured default groups; the first one doubles as category.
pub(crate) fn apply_default_groups(dataset: &mut NormalizedDataset, config: &HarvestConfig) {
    dataset.extend_groups(config.default_group_refs());
    if let Some(category) = config.category() {
        dataset.category = Some(category.to_string());
    }
}

/// Mandatory catalog fields for sources with no equivalent concept.
pub(crate) fn apply_required_defaults(dataset: &mut NormalizedDataset, visibility: &str) {
    dataset
        .personal_information
        .get_or_insert_with(|| "no".to_string());
    dataset.access.get_or_insert_with(|| "yes".to_string());
    dataset
        .protective_marking
        .get_or_insert_with(|| "official".to_string());
    dataset.organization_visibility = Some(visibility.to_string());
    dataset.workflow_status = Some("published".to_string());
}
