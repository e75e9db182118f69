//! Domain model and reconciliation logic for filelink.
//!
//! Everything in this crate is pure: no I/O, no clocks. The storage and
//! transport crates supply the collaborators, and `filelink-sync` drives them.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "filelink-core";

/// Store-generated primary key.
pub type RecordId = i64;

/// Authoritative entity identified by a human-readable number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: RecordId,
    pub number: String,
}

/// Parent of a domain record; supplies the item number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: RecordId,
    pub number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    pub internal_id: RecordId,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainItemRef {
    pub identifier: String,
    pub internal_id: RecordId,
    pub item_number: String,
}

/// Binary payload waiting to be persisted. `title` is the join key for linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtifact {
    pub title: String,
    pub description: String,
    pub content: Vec<u8>,
}

/// Persisted binary artifact. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub id: RecordId,
    pub title: String,
    pub description: String,
    pub content: Vec<u8>,
}

/// Generated artifact id paired with the title it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: RecordId,
    pub title: String,
}

/// Discriminator values written on every association row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationKinds {
    pub source_type: String,
    pub target_type: String,
    pub purpose: String,
}

impl Default for AssociationKinds {
    fn default() -> Self {
        Self {
            source_type: "DOMAIN".to_string(),
            target_type: "ARTIFACT".to_string(),
            purpose: "S".to_string(),
        }
    }
}

/// Association row as built by the caller. `created_at` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAssociation {
    pub source_id: RecordId,
    pub source_type: String,
    pub target_id: RecordId,
    pub target_type: String,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub id: RecordId,
    pub source_id: RecordId,
    pub source_type: String,
    pub target_id: RecordId,
    pub target_type: String,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

/// Row actually written by an association batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertedAssociation {
    pub id: RecordId,
    pub source_id: RecordId,
}

/// Prefix before the first `.`, or `None` when the name has no separator.
pub fn split_identifier(filename: &str) -> Option<&str> {
    filename.split_once('.').map(|(prefix, _)| prefix)
}

/// Same as [`resolve_identifier`] without the diagnostic, for repeat lookups.
pub fn identifier_of(filename: &str) -> &str {
    split_identifier(filename).unwrap_or(filename)
}

/// Derive the domain identifier from a remote filename.
///
/// Names without an extension separator fall back to the whole filename and
/// emit a warning; this never fails.
pub fn resolve_identifier(filename: &str) -> &str {
    match split_identifier(filename) {
        Some(identifier) => identifier,
        None => {
            warn!(filename, "filename without extension, using it verbatim as identifier");
            filename
        }
    }
}

/// Keep the remote filenames whose identifier is a known domain number.
/// Output follows the listing order.
pub fn match_known(remote_filenames: &[String], known: &HashSet<String>) -> Vec<String> {
    remote_filenames
        .iter()
        .filter(|filename| known.contains(resolve_identifier(filename)))
        .cloned()
        .collect()
}

/// Distinct identifiers of a set of filenames.
pub fn unique_identifiers(filenames: &[String]) -> BTreeSet<String> {
    filenames
        .iter()
        .map(|filename| identifier_of(filename).to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DomainEntry {
    internal_id: RecordId,
    item_number: Option<String>,
}

/// Identifier -> domain record lookup.
///
/// An identifier shared by several records resolves to the lowest internal id.
#[derive(Debug, Clone, Default)]
pub struct DomainIndex {
    entries: BTreeMap<String, DomainEntry>,
}

impl DomainIndex {
    pub fn from_refs(refs: &[DomainRef]) -> Self {
        let mut index = Self::default();
        for r in refs {
            index.insert(&r.identifier, r.internal_id, None);
        }
        index
    }

    pub fn from_hierarchy(rows: &[DomainItemRef]) -> Self {
        let mut index = Self::default();
        for row in rows {
            index.insert(&row.identifier, row.internal_id, Some(row.item_number.clone()));
        }
        index
    }

    fn insert(&mut self, identifier: &str, internal_id: RecordId, item_number: Option<String>) {
        match self.entries.get_mut(identifier) {
            Some(existing) => {
                warn!(
                    identifier,
                    kept = existing.internal_id.min(internal_id),
                    other = existing.internal_id.max(internal_id),
                    "identifier matches several domain records, using the lowest id"
                );
                if internal_id < existing.internal_id {
                    *existing = DomainEntry {
                        internal_id,
                        item_number,
                    };
                }
            }
            None => {
                self.entries.insert(
                    identifier.to_string(),
                    DomainEntry {
                        internal_id,
                        item_number,
                    },
                );
            }
        }
    }

    pub fn internal_id(&self, identifier: &str) -> Option<RecordId> {
        self.entries.get(identifier).map(|e| e.internal_id)
    }

    pub fn item_number(&self, identifier: &str) -> Option<&str> {
        self.entries
            .get(identifier)
            .and_then(|e| e.item_number.as_deref())
    }

    pub fn internal_ids(&self) -> BTreeSet<RecordId> {
        self.entries.values().map(|e| e.internal_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of the diff step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffPlan {
    /// One filename per identifier still lacking an association, ordered by identifier.
    pub pending: Vec<String>,
    /// Extra filenames that resolved to an identifier already chosen above.
    pub skipped_duplicates: Vec<String>,
}

/// Select the matched filenames whose domain record has no association yet.
///
/// When several filenames share an identifier the lexicographically smallest
/// one is kept and the others are reported as duplicates.
pub fn plan_pending(
    matched: &[String],
    domains: &DomainIndex,
    existing_source_ids: &HashSet<RecordId>,
) -> DiffPlan {
    let mut by_identifier: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for filename in matched {
        by_identifier
            .entry(identifier_of(filename))
            .or_default()
            .push(filename.as_str());
    }

    let mut plan = DiffPlan::default();
    for (identifier, mut filenames) in by_identifier {
        let Some(internal_id) = domains.internal_id(identifier) else {
            debug!(identifier, "no domain record resolved, skipping");
            continue;
        };
        if existing_source_ids.contains(&internal_id) {
            debug!(identifier, internal_id, "already associated");
            continue;
        }

        filenames.sort_unstable();
        let mut filenames = filenames.into_iter();
        if let Some(chosen) = filenames.next() {
            plan.pending.push(chosen.to_string());
        }
        for duplicate in filenames {
            warn!(identifier, filename = duplicate, "skipping duplicate file for identifier");
            plan.skipped_duplicates.push(duplicate.to_string());
        }
    }
    plan
}

/// Association to write, plus the hierarchy details it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedLink {
    pub identifier: String,
    pub item_number: Option<String>,
    pub association: NewAssociation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkPlan {
    pub links: Vec<PlannedLink>,
    /// Stored artifacts that could not be tied to a domain record.
    pub orphans: Vec<ArtifactRef>,
}

/// Join stored artifacts back to the domain hierarchy by title.
pub fn build_links(
    artifacts: &[ArtifactRef],
    hierarchy: &DomainIndex,
    kinds: &AssociationKinds,
) -> LinkPlan {
    let mut plan = LinkPlan::default();
    let mut claimed: HashSet<RecordId> = HashSet::with_capacity(artifacts.len());

    for artifact in artifacts {
        let Some(source_id) = hierarchy.internal_id(&artifact.title) else {
            warn!(
                artifact_id = artifact.id,
                identifier = %artifact.title,
                "domain record vanished before linking, leaving orphan artifact"
            );
            plan.orphans.push(artifact.clone());
            continue;
        };
        if !claimed.insert(source_id) {
            warn!(
                artifact_id = artifact.id,
                identifier = %artifact.title,
                source_id,
                "domain record already linked in this batch, leaving orphan artifact"
            );
            plan.orphans.push(artifact.clone());
            continue;
        }

        plan.links.push(PlannedLink {
            identifier: artifact.title.clone(),
            item_number: hierarchy.item_number(&artifact.title).map(str::to_string),
            association: NewAssociation {
                source_id,
                source_type: kinds.source_type.clone(),
                target_id: artifact.id,
                target_type: kinds.target_type.clone(),
                purpose: kinds.purpose.clone(),
            },
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn known(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn refs(items: &[(&str, RecordId)]) -> DomainIndex {
        DomainIndex::from_refs(
            &items
                .iter()
                .map(|(identifier, id)| DomainRef {
                    internal_id: *id,
                    identifier: identifier.to_string(),
                })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn identifier_is_prefix_before_first_dot() {
        assert_eq!(resolve_identifier("1001.pdf"), "1001");
        assert_eq!(resolve_identifier("1001.scan.pdf"), "1001");
        assert_eq!(resolve_identifier(".hidden"), "");
        assert_eq!(resolve_identifier("trailing."), "trailing");
    }

    #[test]
    fn identifier_falls_back_to_whole_name() {
        assert_eq!(split_identifier("abc"), None);
        assert_eq!(resolve_identifier("abc"), "abc");
        assert_eq!(identifier_of(""), "");
    }

    #[test]
    fn match_keeps_listing_order_and_drops_unknown() {
        let remote = names(&["1002.pdf", "9999.pdf", "abc", "1001.pdf"]);
        let matched = match_known(&remote, &known(&["1001", "1002", "abc"]));
        assert_eq!(matched, names(&["1002.pdf", "abc", "1001.pdf"]));

        assert!(match_known(&names(&["9999.pdf"]), &known(&["1001"])).is_empty());
    }

    #[test]
    fn diff_excludes_already_associated_records() {
        let matched = names(&["1001.pdf", "1002.pdf", "1003.pdf"]);
        let index = refs(&[("1001", 11), ("1002", 12), ("1003", 13)]);
        let existing: HashSet<RecordId> = [12].into_iter().collect();

        let plan = plan_pending(&matched, &index, &existing);
        assert_eq!(plan.pending, names(&["1001.pdf", "1003.pdf"]));
        assert!(plan.skipped_duplicates.is_empty());
    }

    #[test]
    fn diff_picks_smallest_filename_per_identifier() {
        let matched = names(&["1001.tif", "1001.pdf", "1001", "1002.pdf"]);
        let index = refs(&[("1001", 11), ("1002", 12)]);

        let plan = plan_pending(&matched, &index, &HashSet::new());
        assert_eq!(plan.pending, names(&["1001", "1002.pdf"]));
        assert_eq!(plan.skipped_duplicates, names(&["1001.pdf", "1001.tif"]));
    }

    #[test]
    fn diff_skips_identifiers_without_domain_record() {
        let plan = plan_pending(&names(&["1001.pdf"]), &refs(&[]), &HashSet::new());
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn ambiguous_identifier_uses_lowest_id() {
        let index = refs(&[("1001", 30), ("1001", 7), ("1001", 19)]);
        assert_eq!(index.internal_id("1001"), Some(7));
        assert_eq!(index.len(), 1);

        let existing: HashSet<RecordId> = [7].into_iter().collect();
        let plan = plan_pending(&names(&["1001.pdf"]), &index, &existing);
        assert!(plan.pending.is_empty());
    }

    #[test]
    fn links_carry_hierarchy_and_kinds() {
        let hierarchy = DomainIndex::from_hierarchy(&[
            DomainItemRef {
                identifier: "1001".into(),
                internal_id: 11,
                item_number: "ITEM-A".into(),
            },
            DomainItemRef {
                identifier: "1002".into(),
                internal_id: 12,
                item_number: "ITEM-B".into(),
            },
        ]);
        let artifacts = vec![
            ArtifactRef { id: 501, title: "1001".into() },
            ArtifactRef { id: 502, title: "1002".into() },
        ];

        let plan = build_links(&artifacts, &hierarchy, &AssociationKinds::default());
        assert!(plan.orphans.is_empty());
        assert_eq!(plan.links.len(), 2);
        assert_eq!(plan.links[0].item_number.as_deref(), Some("ITEM-A"));
        assert_eq!(
            plan.links[1].association,
            NewAssociation {
                source_id: 12,
                source_type: "DOMAIN".into(),
                target_id: 502,
                target_type: "ARTIFACT".into(),
                purpose: "S".into(),
            }
        );
    }

    #[test]
    fn unresolvable_or_repeated_titles_become_orphans() {
        let hierarchy = DomainIndex::from_hierarchy(&[DomainItemRef {
            identifier: "1001".into(),
            internal_id: 11,
            item_number: "ITEM-A".into(),
        }]);
        let artifacts = vec![
            ArtifactRef { id: 501, title: "1001".into() },
            ArtifactRef { id: 502, title: "gone".into() },
            ArtifactRef { id: 503, title: "1001".into() },
        ];

        let plan = build_links(&artifacts, &hierarchy, &AssociationKinds::default());
        assert_eq!(plan.links.len(), 1);
        assert_eq!(plan.links[0].association.target_id, 501);
        assert_eq!(
            plan.orphans.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![502, 503]
        );
    }
}
