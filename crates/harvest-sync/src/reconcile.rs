//! Gather stage: page through a source, diff its guids against the local
//! index and stage one work item per guid.

use std::collections::BTreeSet;

use anyhow::Result;
use harvest_adapters::{HarvestContext, SourceAdapter};
use harvest_core::{Disposition, HarvestWorkItem, LocalIndex};
use harvest_storage::HarvestObjectStore;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Disposition of every guid in `local ∪ remote`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub new: Vec<String>,
    /// `(guid, local package id)`
    pub change: Vec<(String, String)>,
    pub delete: Vec<(String, String)>,
}

pub fn classify(guid: &str, index: &LocalIndex) -> (Disposition, Option<String>) {
    match index.package_id(guid) {
        Some(package_id) => (Disposition::Change, Some(package_id.to_string())),
        None => (Disposition::New, None),
    }
}

/// Local guids that the remote enumeration no longer contains.
pub fn guids_to_delete(index: &LocalIndex, seen: &BTreeSet<String>) -> Vec<(String, String)> {
    index
        .iter()
        .filter(|(guid, _)| !seen.contains(*guid))
        .map(|(guid, package_id)| (guid.to_string(), package_id.to_string()))
        .collect()
}

pub fn reconcile<I>(index: &LocalIndex, remote_guids: I) -> ReconcilePlan
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut plan = ReconcilePlan::default();
    let mut seen = BTreeSet::new();
    for guid in remote_guids {
        let guid = guid.into();
        if !seen.insert(guid.clone()) {
            continue;
        }
        match classify(&guid, index) {
            (Disposition::Change, Some(package_id)) => plan.change.push((guid, package_id)),
            _ => plan.new.push(guid),
        }
    }
    plan.delete = guids_to_delete(index, &seen);
    plan
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GatherReport {
    pub item_ids: Vec<Uuid>,
    pub pages: usize,
    pub new: usize,
    pub changed: usize,
    pub deleted: usize,
    pub records_without_guid: usize,
}

/// Enumerate the remote source page by page and stage work items.
///
/// Pagination ends on an empty page or after the first page in single-page
/// mode. Adapters that opt in also stop on a page whose guid set equals the
/// previous page's. A guid already staged earlier in the run is not staged
/// again. Deletions are staged only after the enumeration has finished.
pub async fn gather(
    adapter: &dyn SourceAdapter,
    ctx: &HarvestContext<'_>,
    store: &dyn HarvestObjectStore,
) -> Result<GatherReport> {
    let source_id = ctx.source.id.as_str();
    let index = store.current_index(source_id).await?;
    info!(source_id, local = index.len(), "gather started");

    let mut report = GatherReport::default();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut previous_page: Option<BTreeSet<String>> = None;
    let mut page = 1;

    loop {
        let records = adapter.fetch_page(ctx, page).await;
        if records.is_empty() {
            debug!(page, "empty page, no more records");
            break;
        }
        let records: Vec<_> = records
            .into_iter()
            .map(|record| (adapter.extract_guid(&record), record))
            .collect();
        let page_guids: BTreeSet<String> =
            records.iter().filter_map(|(guid, _)| guid.clone()).collect();
        if adapter.stops_on_repeated_page() && previous_page.as_ref() == Some(&page_guids) {
            info!(page, "page repeats the previous one, stopping");
            break;
        }
        report.pages += 1;

        for (guid, record) in records {
            let Some(guid) = guid else {
                warn!(page, "record has no guid, skipping");
                report.records_without_guid += 1;
                continue;
            };
            if !seen.insert(guid.clone()) {
                debug!(guid, page, "guid already staged in this run");
                continue;
            }

            let (disposition, package_id) = classify(&guid, &index);
            match disposition {
                Disposition::Change => report.changed += 1,
                _ => report.new += 1,
            }
            let item = HarvestWorkItem::staged(
                ctx.run_id,
                source_id,
                &guid,
                disposition,
                Some(record.to_string()),
                package_id,
            );
            report.item_ids.push(item.id);
            store.insert(item).await?;
        }

        if ctx.single_page() {
            break;
        }
        previous_page = Some(page_guids);
        page += 1;
    }

    for (guid, package_id) in guids_to_delete(&index, &seen) {
        store.retire_guid(source_id, &guid).await?;
        let item = HarvestWorkItem::staged(
            ctx.run_id,
            source_id,
            &guid,
            Disposition::Delete,
            None,
            Some(package_id),
        );
        report.item_ids.push(item.id);
        report.deleted += 1;
        store.insert(item).await?;
    }

    info!(
        source_id,
        pages = report.pages,
        new = report.new,
        changed = report.changed,
        deleted = report.deleted,
        "gather finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn index(pairs: &[(&str, &str)]) -> LocalIndex {
        pairs.iter().map(|(g, p)| (g.to_string(), p.to_string())).collect()
    }

    #[test]
    fn plan_for_partial_overlap() {
        let plan = reconcile(&index(&[("A", "pkg1"), ("B", "pkg2")]), ["A", "C", "A"]);
        assert_eq!(plan.new, vec!["C"]);
        assert_eq!(plan.change, vec![("A".to_string(), "pkg1".to_string())]);
        assert_eq!(plan.delete, vec![("B".to_string(), "pkg2".to_string())]);
    }

    #[test]
    fn empty_remote_deletes_everything() {
        let plan = reconcile(&index(&[("A", "pkg1")]), Vec::<String>::new());
        assert!(plan.new.is_empty());
        assert_eq!(plan.delete.len(), 1);
    }

    proptest! {
        #[test]
        fn dispositions_partition_local_and_remote(
            local in proptest::collection::btree_set("[a-f]{1,2}", 0..12),
            remote in proptest::collection::vec("[a-f]{1,2}", 0..20),
        ) {
            let idx: LocalIndex = local.iter().map(|g| (g.clone(), format!("pkg-{g}"))).collect();
            let plan = reconcile(&idx, remote.clone());
            let remote: BTreeSet<String> = remote.into_iter().collect();

            let new: BTreeSet<String> = plan.new.iter().cloned().collect();
            let change: BTreeSet<String> = plan.change.iter().map(|(g, _)| g.clone()).collect();
            let delete: BTreeSet<String> = plan.delete.iter().map(|(g, _)| g.clone()).collect();

            let expected_new: BTreeSet<String> = remote.difference(&local).cloned().collect();
            let expected_change: BTreeSet<String> = remote.intersection(&local).cloned().collect();
            let expected_delete: BTreeSet<String> = local.difference(&remote).cloned().collect();
            prop_assert_eq!(&new, &expected_new);
            prop_assert_eq!(&change, &expected_change);
            prop_assert_eq!(&delete, &expected_delete);
            prop_assert_eq!(new.len() + change.len() + delete.len(), local.union(&remote).count());
            prop_assert_eq!(plan.new.len(), new.len());
        }
    }
}
