//! Host catalog contract used by the harvesters, with a CKAN action API
//! client and an in-process catalog.

mod ckan;
mod memory;

use async_trait::async_trait;
use harvest_core::{FieldChoice, Group, Lookup, NormalizedDataset, Organization};
use thiserror::Error;

pub use ckan::CkanCatalog;
pub use memory::MemoryCatalog;

pub const CRATE_NAME: &str = "harvest-catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{action} failed: {message}")]
    Action { action: String, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Package, group, organization and schema operations of the host catalog.
/// Reads answer `Lookup::NotFound` for absent entities; errors are reserved
/// for failed calls.
#[async_trait]
pub trait HostCatalog: Send + Sync {
    async fn package_show(&self, id_or_name: &str) -> Result<Lookup<NormalizedDataset>, CatalogError>;

    /// Returns the id of the created package.
    async fn package_create(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError>;

    async fn package_update(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError>;

    async fn package_delete(&self, id: &str) -> Result<(), CatalogError>;

    async fn group_show(&self, id_or_name: &str) -> Result<Lookup<Group>, CatalogError>;

    async fn group_create(&self, group: &Group) -> Result<Group, CatalogError>;

    async fn organization_show(&self, id_or_name: &str)
        -> Result<Lookup<Organization>, CatalogError>;

    async fn organization_create(&self, org: &Organization) -> Result<Organization, CatalogError>;

    /// Controlled-vocabulary choices of a dataset schema field.
    async fn field_choices(&self, field_name: &str) -> Result<Vec<FieldChoice>, CatalogError>;
}
