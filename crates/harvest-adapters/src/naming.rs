//! Package names derived from dataset titles, made unique against the catalog.

use harvest_catalog::{CatalogError, HostCatalog};

use crate::mapping::munge_title_to_name;

pub const PACKAGE_NAME_MAX_LENGTH: usize = 100;
const MAX_SUFFIX: u32 = 999;

/// A package name derived from `title` that no other package holds yet.
///
/// Tries the munged title first, then the title with `1`..`999` appended.
/// `current_name` is the name the package already owns, which never counts
/// as taken. `None` when the title munges to nothing or every candidate is
/// in use.
pub async fn unique_package_name(
    catalog: &dyn HostCatalog,
    title: &str,
    current_name: Option<&str>,
) -> Result<Option<String>, CatalogError> {
    let base = munge_title_to_name(title);
    if base.is_empty() {
        return Ok(None);
    }
    if is_available(catalog, &base, current_name).await? {
        return Ok(Some(base));
    }
    for counter in 1..=MAX_SUFFIX {
        let suffix = counter.to_string();
        let keep = base.len().min(PACKAGE_NAME_MAX_LENGTH - suffix.len());
        let candidate = format!("{}{suffix}", &base[..keep]);
        if is_available(catalog, &candidate, current_name).await? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

async fn is_available(
    catalog: &dyn HostCatalog,
    name: &str,
    current_name: Option<&str>,
) -> Result<bool, CatalogError> {
    if current_name == Some(name) {
        return Ok(true);
    }
    Ok(!catalog.package_show(name).await?.is_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_catalog::MemoryCatalog;
    use harvest_core::NormalizedDataset;

    async fn with_names(names: &[&str]) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for name in names {
            catalog
                .add_package(NormalizedDataset {
                    name: Some((*name).to_string()),
                    ..Default::default()
                })
                .await;
        }
        catalog
    }

    #[tokio::test]
    async fn free_title_is_used_as_is() {
        let catalog = with_names(&[]).await;
        let name = unique_package_name(&catalog, "Roads: 2020", None).await.expect("lookup");
        assert_eq!(name.as_deref(), Some("roads-2020"));
    }

    #[tokio::test]
    async fn taken_names_get_a_numeric_suffix() {
        let catalog = with_names(&["roads", "roads1"]).await;
        let name = unique_package_name(&catalog, "Roads", None).await.expect("lookup");
        assert_eq!(name.as_deref(), Some("roads2"));
    }

    #[tokio::test]
    async fn own_name_is_not_a_conflict() {
        let catalog = with_names(&["roads"]).await;
        let name = unique_package_name(&catalog, "Roads", Some("roads"))
            .await
            .expect("lookup");
        assert_eq!(name.as_deref(), Some("roads"));
    }

    #[tokio::test]
    async fn unusable_titles_yield_none() {
        let catalog = with_names(&[]).await;
        assert_eq!(unique_package_name(&catalog, "%%%", None).await.expect("lookup"), None);
    }
}
