//! Owner-organisation resolution for records that name their owner in free
//! text. The chain always ends in an organisation: mapping, then lookup of
//! the munged name, then creation, then the harvest source's own organisation.

use harvest_catalog::HostCatalog;
use harvest_core::{Lookup, OrganisationMapping, Organization};
use tracing::warn;

use crate::mapping::munge_title_to_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrgResolution {
    /// Organisation name taken from the configured mapping table.
    Mapped(String),
    /// Id of an existing organisation whose name is the munged owner.
    Existing(String),
    /// Id of an organisation created for the owner.
    Created(String),
    /// The harvest source's organisation.
    SourceFallback(String),
}

impl OrgResolution {
    /// Value to store in the dataset's `owner_org`.
    pub fn owner_org(&self) -> &str {
        match self {
            OrgResolution::Mapped(v)
            | OrgResolution::Existing(v)
            | OrgResolution::Created(v)
            | OrgResolution::SourceFallback(v) => v,
        }
    }

    pub fn into_owner_org(self) -> String {
        match self {
            OrgResolution::Mapped(v)
            | OrgResolution::Existing(v)
            | OrgResolution::Created(v)
            | OrgResolution::SourceFallback(v) => v,
        }
    }
}

pub fn mapped_org_name<'a>(mapping: &'a [OrganisationMapping], resowner: &str) -> Option<&'a str> {
    mapping
        .iter()
        .find(|m| m.resowner == resowner)
        .map(|m| m.org_name.as_str())
}

pub async fn resolve_owner_org(
    catalog: &dyn HostCatalog,
    mapping: &[OrganisationMapping],
    resowner: &str,
    source_org: &str,
) -> OrgResolution {
    let resowner = resowner.trim();
    if resowner.is_empty() {
        warn!(source_org, "resowner is empty, using source organization");
        return OrgResolution::SourceFallback(source_org.to_string());
    }

    if let Some(org_name) = mapped_org_name(mapping, resowner) {
        return OrgResolution::Mapped(org_name.to_string());
    }
    warn!(resowner, "no organisation mapping found");

    let org_name = munge_title_to_name(resowner);
    if org_name.is_empty() {
        warn!(resowner, source_org, "owner name munges to nothing, using source organization");
        return OrgResolution::SourceFallback(source_org.to_string());
    }

    match catalog.organization_show(&org_name).await {
        Ok(Lookup::Found(org)) => return OrgResolution::Existing(org.id),
        Ok(Lookup::NotFound) => warn!(org_name, "organisation does not exist"),
        Err(err) => {
            warn!(org_name, error = %err, source_org, "organisation lookup failed, using source organization");
            return OrgResolution::SourceFallback(source_org.to_string());
        }
    }

    let request = Organization {
        name: org_name.clone(),
        title: Some(resowner.to_string()),
        ..Default::default()
    };
    match catalog.organization_create(&request).await {
        Ok(created) => OrgResolution::Created(created.id),
        Err(err) => {
            warn!(org_name, error = %err, source_org, "failed to create organisation, using source organization");
            OrgResolution::SourceFallback(source_org.to_string())
        }
    }
}
