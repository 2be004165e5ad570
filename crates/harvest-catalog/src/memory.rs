use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use harvest_core::{FieldChoice, Group, Lookup, NormalizedDataset, Organization};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{CatalogError, HostCatalog};

#[derive(Debug, Default)]
struct CatalogState {
    packages: BTreeMap<String, NormalizedDataset>,
    groups: Vec<Group>,
    organizations: Vec<Organization>,
    choices: BTreeMap<String, Vec<FieldChoice>>,
    rejected_names: BTreeSet<String>,
    reject_org_creation: bool,
}

impl CatalogState {
    fn find_package(&self, id_or_name: &str) -> Option<&NormalizedDataset> {
        self.packages.get(id_or_name).or_else(|| {
            self.packages
                .values()
                .find(|p| p.name.as_deref() == Some(id_or_name))
        })
    }

    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.packages
            .values()
            .any(|p| p.name.as_deref() == Some(name) && p.id.as_deref() != except_id)
    }

    fn check_writable(&self, dataset: &NormalizedDataset) -> Result<(), CatalogError> {
        match dataset.name.as_deref() {
            None | Some("") => Err(CatalogError::Validation("name: Missing value".to_string())),
            Some(name) if self.rejected_names.contains(name) => Err(CatalogError::Validation(
                format!("name: {name} rejected by catalog"),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// In-process catalog with CKAN-like semantics: soft deletes, unique
/// package and organization names, lookup by id or name.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_group(&self, id: &str, name: &str) -> Group {
        let group = Group {
            id: id.to_string(),
            name: name.to_string(),
            title: Some(name.to_string()),
            ..Default::default()
        };
        self.state.lock().await.groups.push(group.clone());
        group
    }

    pub async fn add_organization(&self, id: &str, name: &str, title: &str) -> Organization {
        let org = Organization {
            id: id.to_string(),
            name: name.to_string(),
            title: Some(title.to_string()),
            ..Default::default()
        };
        self.state.lock().await.organizations.push(org.clone());
        org
    }

    pub async fn add_package(&self, dataset: NormalizedDataset) {
        let id = dataset.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        self.state
            .lock()
            .await
            .packages
            .insert(id.clone(), NormalizedDataset { id: Some(id), ..dataset });
    }

    pub async fn set_field_choices(&self, field_name: &str, choices: Vec<FieldChoice>) {
        self.state
            .lock()
            .await
            .choices
            .insert(field_name.to_string(), choices);
    }

    /// Make every create/update of a package with this name fail validation.
    pub async fn reject_package_name(&self, name: &str) {
        self.state.lock().await.rejected_names.insert(name.to_string());
    }

    pub async fn reject_organization_creation(&self) {
        self.state.lock().await.reject_org_creation = true;
    }

    pub async fn packages(&self) -> Vec<NormalizedDataset> {
        self.state.lock().await.packages.values().cloned().collect()
    }

    pub async fn active_packages(&self) -> Vec<NormalizedDataset> {
        self.state
            .lock()
            .await
            .packages
            .values()
            .filter(|p| p.state.as_deref() != Some("deleted"))
            .cloned()
            .collect()
    }

    pub async fn organizations(&self) -> Vec<Organization> {
        self.state.lock().await.organizations.clone()
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.state.lock().await.groups.clone()
    }
}

#[async_trait]
impl HostCatalog for MemoryCatalog {
    async fn package_show(&self, id_or_name: &str) -> Result<Lookup<NormalizedDataset>, CatalogError> {
        Ok(self.state.lock().await.find_package(id_or_name).cloned().into())
    }

    async fn package_create(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError> {
        let mut state = self.state.lock().await;
        state.check_writable(dataset)?;
        let name = dataset.name.clone().unwrap_or_default();
        if state.name_taken(&name, None) {
            return Err(CatalogError::Validation(format!(
                "name: That URL is already in use: {name}"
            )));
        }
        let id = dataset
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.packages.contains_key(&id) {
            return Err(CatalogError::Validation(format!("id: Dataset id already exists: {id}")));
        }
        let mut stored = dataset.clone();
        stored.id = Some(id.clone());
        stored.state = Some("active".to_string());
        state.packages.insert(id.clone(), stored);
        Ok(id)
    }

    async fn package_update(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError> {
        let mut state = self.state.lock().await;
        state.check_writable(dataset)?;
        let id = dataset.id.clone().unwrap_or_default();
        if !state.packages.contains_key(&id) {
            return Err(CatalogError::NotFound(id));
        }
        let name = dataset.name.clone().unwrap_or_default();
        if state.name_taken(&name, Some(&id)) {
            return Err(CatalogError::Validation(format!(
                "name: That URL is already in use: {name}"
            )));
        }
        let mut stored = dataset.clone();
        stored.state = Some("active".to_string());
        state.packages.insert(id.clone(), stored);
        Ok(id)
    }

    async fn package_delete(&self, id: &str) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        let key = state
            .find_package(id)
            .and_then(|p| p.id.clone())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        if let Some(package) = state.packages.get_mut(&key) {
            package.state = Some("deleted".to_string());
        }
        Ok(())
    }

    async fn group_show(&self, id_or_name: &str) -> Result<Lookup<Group>, CatalogError> {
        Ok(self
            .state
            .lock()
            .await
            .groups
            .iter()
            .find(|g| g.id == id_or_name || g.name == id_or_name)
            .cloned()
            .into())
    }

    async fn group_create(&self, group: &Group) -> Result<Group, CatalogError> {
        let mut state = self.state.lock().await;
        if group.name.is_empty() {
            return Err(CatalogError::Validation("name: Missing value".to_string()));
        }
        if state.groups.iter().any(|g| g.name == group.name) {
            return Err(CatalogError::Validation(format!(
                "name: Group name already exists: {}",
                group.name
            )));
        }
        let mut stored = group.clone();
        if stored.id.is_empty() {
            stored.id = Uuid::new_v4().to_string();
        }
        state.groups.push(stored.clone());
        Ok(stored)
    }

    async fn organization_show(
        &self,
        id_or_name: &str,
    ) -> Result<Lookup<Organization>, CatalogError> {
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .iter()
            .find(|o| o.id == id_or_name || o.name == id_or_name)
            .cloned()
            .into())
    }

    async fn organization_create(&self, org: &Organization) -> Result<Organization, CatalogError> {
        let mut state = self.state.lock().await;
        if state.reject_org_creation {
            return Err(CatalogError::Action {
                action: "organization_create".to_string(),
                message: "not authorized to create organizations".to_string(),
            });
        }
        if org.name.is_empty() {
            return Err(CatalogError::Validation("name: Missing value".to_string()));
        }
        if state.organizations.iter().any(|o| o.name == org.name) {
            return Err(CatalogError::Validation(format!(
                "name: Organization name already exists: {}",
                org.name
            )));
        }
        let mut stored = org.clone();
        if stored.id.is_empty() {
            stored.id = Uuid::new_v4().to_string();
        }
        state.organizations.push(stored.clone());
        Ok(stored)
    }

    async fn field_choices(&self, field_name: &str) -> Result<Vec<FieldChoice>, CatalogError> {
        Ok(self
            .state
            .lock()
            .await
            .choices
            .get(field_name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(name: &str) -> NormalizedDataset {
        NormalizedDataset {
            name: Some(name.to_string()),
            title: Some(name.to_uppercase()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_show_and_soft_delete() {
        let catalog = MemoryCatalog::new();
        let id = catalog.package_create(&dataset("roads")).await.expect("create");

        let shown = catalog
            .package_show("roads")
            .await
            .expect("show")
            .found()
            .expect("found by name");
        assert_eq!(shown.id.as_deref(), Some(id.as_str()));

        catalog.package_delete(&id).await.expect("delete");
        assert!(catalog.active_packages().await.is_empty());
        assert_eq!(catalog.packages().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_names_fail_validation() {
        let catalog = MemoryCatalog::new();
        catalog.package_create(&dataset("roads")).await.expect("create");
        let err = catalog.package_create(&dataset("roads")).await.unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
    }

    #[tokio::test]
    async fn update_of_missing_package_is_not_found() {
        let catalog = MemoryCatalog::new();
        let mut missing = dataset("ghost");
        missing.id = Some("nope".into());
        let err = catalog.package_update(&missing).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn organizations_resolve_by_id_or_name() {
        let catalog = MemoryCatalog::new();
        catalog.add_organization("org-1", "dept-y", "Dept Y").await;
        assert!(catalog.organization_show("org-1").await.expect("show").is_found());
        assert!(catalog.organization_show("dept-y").await.expect("show").is_found());
        assert!(!catalog.organization_show("dept-z").await.expect("show").is_found());

        let created = catalog
            .organization_create(&Organization {
                name: "dept-z".into(),
                title: Some("Dept Z".into()),
                ..Default::default()
            })
            .await
            .expect("create");
        assert!(!created.id.is_empty());
    }
}
