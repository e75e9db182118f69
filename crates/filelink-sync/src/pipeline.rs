use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use filelink_core::{
    build_links, identifier_of, match_known, plan_pending, unique_identifiers, ArtifactRef,
    AssociationKinds, DomainIndex, NewArtifact, NewAssociation, RecordId,
};
use filelink_storage::{AssociationStore, DomainLookup, FileStore, StoreError};
use filelink_transport::{FetchedFile, RemoteSession, RemoteTransport, TransportError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote transport: {0}")]
    Transport(#[from] TransportError),
    #[error("relational store: {0}")]
    Store(#[from] StoreError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn RemoteTransport>,
    pub domains: Arc<dyn DomainLookup>,
    pub files: Arc<dyn FileStore>,
    pub associations: Arc<dyn AssociationStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// No remote file matched a domain record.
    NoMatches,
    /// Every matched domain record already has an association.
    NothingPending,
    Linked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkedArtifact {
    pub identifier: String,
    pub item_number: Option<String>,
    pub filename: String,
    pub artifact_id: RecordId,
    pub association_id: RecordId,
}

/// Listing, matching and diff results; nothing has been written yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub remote_files: usize,
    pub matched: Vec<String>,
    pub pending: Vec<String>,
    pub skipped_duplicates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub remote_files: usize,
    pub matched: usize,
    pub pending: usize,
    pub skipped_duplicates: Vec<String>,
    pub artifact_ids: Vec<RecordId>,
    pub association_ids: Vec<RecordId>,
    pub links: Vec<LinkedArtifact>,
    /// Artifacts stored this run that ended up without an association, either
    /// because the domain record vanished or another run claimed it first.
    pub orphaned: Vec<ArtifactRef>,
    /// Identifiers whose association was written by someone else after the diff.
    pub already_claimed: Vec<String>,
}

impl SyncRunSummary {
    fn from_plan(run_id: Uuid, started_at: DateTime<Utc>, outcome: RunOutcome, plan: SyncPlan) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            outcome,
            remote_files: plan.remote_files,
            matched: plan.matched.len(),
            pending: plan.pending.len(),
            skipped_duplicates: plan.skipped_duplicates,
            artifact_ids: Vec::new(),
            association_ids: Vec::new(),
            links: Vec::new(),
            orphaned: Vec::new(),
            already_claimed: Vec::new(),
        }
    }
}

/// Reconciles the remote directory with domain records, one run at a time.
pub struct SyncPipeline {
    kinds: AssociationKinds,
    collaborators: Collaborators,
}

impl SyncPipeline {
    pub fn new(kinds: AssociationKinds, collaborators: Collaborators) -> Self {
        Self {
            kinds,
            collaborators,
        }
    }

    /// Compute what a run would process without fetching or writing anything.
    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        self.reconcile().instrument(info_span!("sync_plan")).await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.execute(run_id, started_at)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<SyncRunSummary, SyncError> {
        let plan = self.reconcile().await?;
        if plan.matched.is_empty() {
            info!(stage = "match", "no remote files match a domain record, nothing to do");
            return Ok(SyncRunSummary::from_plan(run_id, started_at, RunOutcome::NoMatches, plan));
        }
        if plan.pending.is_empty() {
            info!(stage = "diff", matched = plan.matched.len(), "all matched files already stored");
            return Ok(SyncRunSummary::from_plan(
                run_id,
                started_at,
                RunOutcome::NothingPending,
                plan,
            ));
        }

        let fetched = self.fetch_all(&plan.pending).await?;
        info!(stage = "fetch", files = fetched.len(), "retrieved remote files");

        let filename_by_identifier: BTreeMap<String, String> = plan
            .pending
            .iter()
            .map(|filename| (identifier_of(filename).to_string(), filename.clone()))
            .collect();
        let items: Vec<NewArtifact> = fetched
            .into_iter()
            .map(|file| NewArtifact {
                title: identifier_of(&file.filename).to_string(),
                description: file.filename,
                content: file.content,
            })
            .collect();

        let artifacts = self.collaborators.files.store_all(&items).await?;
        info!(stage = "store", artifacts = artifacts.len(), "stored artifacts");

        let titles: BTreeSet<String> = artifacts.iter().map(|a| a.title.clone()).collect();
        let hierarchy = DomainIndex::from_hierarchy(
            &self.collaborators.domains.resolve_with_item(&titles).await?,
        );
        let link_plan = build_links(&artifacts, &hierarchy, &self.kinds);

        let records: Vec<NewAssociation> = link_plan
            .links
            .iter()
            .map(|link| link.association.clone())
            .collect();
        let inserted = if records.is_empty() {
            warn!(stage = "link", "no association could be built for the stored artifacts");
            Vec::new()
        } else {
            match self.collaborators.associations.insert_all(&records).await {
                Ok(inserted) => inserted,
                Err(err) => {
                    let artifact_ids: Vec<RecordId> = artifacts.iter().map(|a| a.id).collect();
                    warn!(
                        stage = "link",
                        ?artifact_ids,
                        "association write failed, stored artifacts are left unlinked"
                    );
                    return Err(err.into());
                }
            }
        };

        let association_by_source: BTreeMap<RecordId, RecordId> = inserted
            .iter()
            .map(|row| (row.source_id, row.id))
            .collect();
        let mut links = Vec::with_capacity(inserted.len());
        let mut already_claimed = Vec::new();
        let mut orphaned = link_plan.orphans;
        for link in link_plan.links {
            match association_by_source.get(&link.association.source_id) {
                Some(&association_id) => links.push(LinkedArtifact {
                    filename: filename_by_identifier
                        .get(&link.identifier)
                        .cloned()
                        .unwrap_or_else(|| link.identifier.clone()),
                    identifier: link.identifier,
                    item_number: link.item_number,
                    artifact_id: link.association.target_id,
                    association_id,
                }),
                None => {
                    warn!(
                        identifier = %link.identifier,
                        artifact_id = link.association.target_id,
                        "association already claimed by another run"
                    );
                    orphaned.push(ArtifactRef {
                        id: link.association.target_id,
                        title: link.identifier.clone(),
                    });
                    already_claimed.push(link.identifier);
                }
            }
        }
        info!(
            stage = "link",
            created = inserted.len(),
            orphaned = orphaned.len(),
            already_claimed = already_claimed.len(),
            "created association records"
        );

        let mut summary =
            SyncRunSummary::from_plan(run_id, started_at, RunOutcome::Linked, plan);
        summary.artifact_ids = artifacts.iter().map(|a| a.id).collect();
        summary.association_ids = inserted.iter().map(|row| row.id).collect();
        summary.links = links;
        summary.orphaned = orphaned;
        summary.already_claimed = already_claimed;
        Ok(summary)
    }

    /// List, match and diff.
    async fn reconcile(&self) -> Result<SyncPlan, SyncError> {
        let remote = self.list_remote().await?;
        info!(stage = "list", files = remote.len(), "listed remote directory");

        let known = self.collaborators.domains.all_identifiers().await?;
        let matched = match_known(&remote, &known);
        info!(stage = "match", matched = matched.len(), known = known.len(), "matched remote files");

        let mut plan = SyncPlan {
            remote_files: remote.len(),
            ..SyncPlan::default()
        };
        if matched.is_empty() {
            return Ok(plan);
        }

        let domains = DomainIndex::from_refs(
            &self
                .collaborators
                .domains
                .resolve(&unique_identifiers(&matched))
                .await?,
        );
        let existing: HashSet<RecordId> = self
            .collaborators
            .associations
            .existing_source_ids(&domains.internal_ids(), &self.kinds.source_type)
            .await?;
        let diff = plan_pending(&matched, &domains, &existing);
        info!(
            stage = "diff",
            pending = diff.pending.len(),
            already_associated = existing.len(),
            skipped_duplicates = diff.skipped_duplicates.len(),
            "computed files to process"
        );

        plan.matched = matched;
        plan.pending = diff.pending;
        plan.skipped_duplicates = diff.skipped_duplicates;
        Ok(plan)
    }

    async fn list_remote(&self) -> Result<Vec<String>, SyncError> {
        let mut session = self.collaborators.transport.open().await?;
        let listed = session.list().await;
        release(session.as_mut()).await;
        Ok(listed?)
    }

    /// Retrieve every file over one session, stopping at the first failure.
    async fn fetch_all(&self, filenames: &[String]) -> Result<Vec<FetchedFile>, SyncError> {
        let mut session = self.collaborators.transport.open().await?;
        let fetched = retrieve_each(session.as_mut(), filenames).await;
        release(session.as_mut()).await;
        Ok(fetched?)
    }
}

async fn retrieve_each(
    session: &mut dyn RemoteSession,
    filenames: &[String],
) -> Result<Vec<FetchedFile>, TransportError> {
    let mut fetched = Vec::with_capacity(filenames.len());
    for filename in filenames {
        let file = session.retrieve(filename).await?;
        debug!(
            filename = %file.filename,
            bytes = file.byte_size(),
            sha256 = %file.sha256,
            "retrieved remote file"
        );
        fetched.push(file);
    }
    Ok(fetched)
}

// The data has already been transferred (or the phase failed), so a failing
// close is only worth a warning.
async fn release(session: &mut dyn RemoteSession) {
    if let Err(err) = session.close().await {
        warn!(error = %err, "closing remote session failed");
    }
}
