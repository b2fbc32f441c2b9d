//! Topic aggregation: fuzzy clustering of student topic requests into canonical approvals.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use strsim::sorensen_dice;
use thiserror::Error;
use topics_core::{
    ApprovalStatus, CoreError, NewTopicApproval, PhaseId, TopicApproval, TopicRequest,
    TopicSubmission,
};
use topics_storage::{BucketFilter, MemoryTopicStore, PgTopicStore, StoreError, TopicStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "topics-engine";

/// Two topics are duplicates when their similarity is strictly greater than this.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub similarity_threshold: f64,
    pub reconcile_retries: u32,
    pub web_port: u16,
    pub run_migrations: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reconcile_retries: 1,
            web_port: 8000,
            run_migrations: true,
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the YAML file named by `TOPICS_CONFIG` (if set), then env overrides.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var("TOPICS_CONFIG") {
            Ok(path) => Self::load(&path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(v) = lookup("TOPICS_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v
                .trim()
                .parse()
                .with_context(|| format!("parsing TOPICS_SIMILARITY_THRESHOLD={v:?}"))?;
        }
        if let Some(v) = lookup("TOPICS_RECONCILE_RETRIES") {
            self.reconcile_retries = v
                .trim()
                .parse()
                .with_context(|| format!("parsing TOPICS_RECONCILE_RETRIES={v:?}"))?;
        }
        if let Some(v) = lookup("TOPICS_WEB_PORT") {
            self.web_port = v
                .trim()
                .parse()
                .with_context(|| format!("parsing TOPICS_WEB_PORT={v:?}"))?;
        }
        if let Some(v) = lookup("TOPICS_RUN_MIGRATIONS") {
            self.run_migrations = parse_flag(&v)
                .with_context(|| format!("parsing TOPICS_RUN_MIGRATIONS={v:?}"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// The threshold lies in `[0, 1)`; at 1.0 the strict comparison never groups identical topics.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within [0, 1), got {}",
                self.similarity_threshold
            );
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean flag, got {other:?}"),
    }
}

/// Symmetric, reflexive, pure similarity score in `[0, 1]`.
pub trait SimilarityOracle: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Sørensen–Dice over character bigrams of the case-folded inputs. Whitespace is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceSimilarity;

impl SimilarityOracle for DiceSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        sorensen_dice(&a.to_lowercase(), &b.to_lowercase()).clamp(0.0, 1.0)
    }
}

/// One cluster. The first member is the representative and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicGroup<T> {
    members: Vec<T>,
}

impl<T> TopicGroup<T> {
    pub fn representative(&self) -> &T {
        // Groups are only created by the clusterer, always with one member.
        &self.members[0]
    }

    pub fn members(&self) -> &[T] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Single-pass greedy clusterer. Each topic joins the first group whose representative
/// it exceeds the threshold against, or opens a new group. Compares against
/// representatives only, so the result depends on input order.
#[derive(Clone)]
pub struct TopicClusterer {
    oracle: Arc<dyn SimilarityOracle>,
    threshold: f64,
}

impl Default for TopicClusterer {
    fn default() -> Self {
        Self::new(Arc::new(DiceSimilarity), DEFAULT_SIMILARITY_THRESHOLD)
    }
}

impl TopicClusterer {
    pub fn new(oracle: Arc<dyn SimilarityOracle>, threshold: f64) -> Self {
        Self { oracle, threshold }
    }

    pub fn is_duplicate(&self, a: &str, b: &str) -> bool {
        self.oracle.similarity(a, b) > self.threshold
    }

    pub fn cluster_by<T, F>(&self, items: impl IntoIterator<Item = T>, topic: F) -> Vec<TopicGroup<T>>
    where
        F: Fn(&T) -> &str,
    {
        let mut groups: Vec<TopicGroup<T>> = Vec::new();
        for item in items {
            let slot = groups
                .iter()
                .position(|g| self.is_duplicate(topic(&item), topic(g.representative())));
            match slot {
                Some(idx) => groups[idx].members.push(item),
                None => groups.push(TopicGroup { members: vec![item] }),
            }
        }
        groups
    }

    pub fn cluster<S: AsRef<str>>(&self, topics: impl IntoIterator<Item = S>) -> Vec<TopicGroup<S>> {
        self.cluster_by(topics, |t| t.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] CoreError),
    #[error("topic approval {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub domain: String,
    pub phase: PhaseId,
    pub requests: usize,
    pub approvals: usize,
    pub carried_over: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationReport {
    Completed(ReconcileOutcome),
    Failed { warning: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub request: TopicRequest,
    pub reconciliation: ReconciliationReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegenerationSummary {
    pub deleted: u64,
    pub requests: usize,
    pub domains: usize,
    pub approvals: usize,
}

pub struct TopicEngine {
    store: Arc<dyn TopicStore>,
    clusterer: TopicClusterer,
    reconcile_retries: u32,
}

impl TopicEngine {
    pub fn new(store: Arc<dyn TopicStore>, clusterer: TopicClusterer) -> Self {
        Self {
            store,
            clusterer,
            reconcile_retries: 1,
        }
    }

    pub fn from_config(config: &ServiceConfig, store: Arc<dyn TopicStore>) -> Self {
        let clusterer = TopicClusterer::new(Arc::new(DiceSimilarity), config.similarity_threshold);
        Self::new(store, clusterer).with_reconcile_retries(config.reconcile_retries)
    }

    pub fn with_reconcile_retries(mut self, retries: u32) -> Self {
        self.reconcile_retries = retries;
        self
    }

    /// Persists a submission and reconciles its bucket. A reconciliation failure is
    /// reported in the receipt; the stored request is never rolled back.
    pub async fn submit_request(
        &self,
        submission: TopicSubmission,
    ) -> Result<SubmissionReceipt, EngineError> {
        let request = submission.validate()?;
        let stored = self.store.insert_request(request).await?;
        info!(
            request_id = %stored.id,
            domain = %stored.domain,
            phase = stored.phase.get(),
            "topic request stored"
        );

        let reconciliation = match self.reconcile(&stored.domain, stored.phase).await {
            Ok(outcome) => ReconciliationReport::Completed(outcome),
            Err(err) => {
                warn!(
                    domain = %stored.domain,
                    phase = stored.phase.get(),
                    error = %err,
                    "reconciliation failed; approvals rebuild on next read"
                );
                ReconciliationReport::Failed {
                    warning: format!("topic request saved but approvals were not refreshed: {err}"),
                }
            }
        };

        Ok(SubmissionReceipt {
            request: stored,
            reconciliation,
        })
    }

    /// Rebuilds the approvals of one (domain, phase) bucket from its requests.
    pub async fn reconcile(
        &self,
        domain: &str,
        phase: PhaseId,
    ) -> Result<ReconcileOutcome, EngineError> {
        let span = info_span!("reconcile", domain, phase = phase.get());
        self.reconcile_with_retries(domain, phase)
            .instrument(span)
            .await
    }

    async fn reconcile_with_retries(
        &self,
        domain: &str,
        phase: PhaseId,
    ) -> Result<ReconcileOutcome, EngineError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.rebuild_bucket(domain, phase).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempts;
                    info!(
                        requests = outcome.requests,
                        approvals = outcome.approvals,
                        carried_over = outcome.carried_over,
                        attempts,
                        "bucket reconciled"
                    );
                    return Ok(outcome);
                }
                Err(StoreError::DuplicateKey(detail)) if attempts <= self.reconcile_retries => {
                    debug!(%detail, attempts, "concurrent reconciliation landed first; rebuilding");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn rebuild_bucket(
        &self,
        domain: &str,
        phase: PhaseId,
    ) -> Result<ReconcileOutcome, StoreError> {
        let filter = BucketFilter::bucket(domain, phase);
        let requests = self.store.list_requests(&filter).await?;
        let prior = self.store.list_approvals(&filter).await?;
        let prior_status = prior
            .iter()
            .map(|a| (a.topic.as_str(), a.approval))
            .collect::<HashMap<_, _>>();

        let groups = self
            .clusterer
            .cluster_by(requests.iter(), |r| r.topic.trim());

        let mut carried_over = 0usize;
        let candidates = groups
            .iter()
            .map(|group| {
                let topic = group.representative().topic.trim().to_string();
                let approval = match prior_status.get(topic.as_str()) {
                    Some(status) => {
                        carried_over += 1;
                        *status
                    }
                    None => ApprovalStatus::OnHold,
                };
                NewTopicApproval {
                    phase,
                    domain: domain.to_string(),
                    topic,
                    total_requested: count_to_i32(group.size()),
                    approval,
                }
            })
            .collect::<Vec<_>>();

        // Wholesale replace. A failure between these two leaves the bucket empty,
        // which the next read regenerates.
        self.store.delete_approvals(&filter).await?;
        let inserted = self.store.insert_approvals(&candidates).await?;

        Ok(ReconcileOutcome {
            domain: domain.to_string(),
            phase,
            requests: requests.len(),
            approvals: inserted.len(),
            carried_over,
            attempts: 0,
        })
    }

    /// Approvals for a phase selector such as `"Phase 7"`, derived on demand when absent.
    pub async fn get_approvals(&self, selector: &str) -> Result<Vec<TopicApproval>, EngineError> {
        let phase = PhaseId::parse_selector(selector)?;
        let filter = BucketFilter::phase(phase);

        let existing = self.store.list_approvals(&filter).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        // A reconciliation may have completed since the first read.
        let rechecked = self.store.list_approvals(&filter).await?;
        if !rechecked.is_empty() {
            debug!(phase = phase.get(), "approvals appeared on recheck");
            return Ok(rechecked);
        }

        self.regenerate_phase(phase).await
    }

    async fn regenerate_phase(&self, phase: PhaseId) -> Result<Vec<TopicApproval>, EngineError> {
        let span = info_span!("regenerate_phase", phase = phase.get());
        self.insert_phase_approvals(phase).instrument(span).await
    }

    async fn insert_phase_approvals(
        &self,
        phase: PhaseId,
    ) -> Result<Vec<TopicApproval>, EngineError> {
        let filter = BucketFilter::phase(phase);
        let requests = self.store.list_requests(&filter).await?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for (domain, bucket) in group_by_domain(&requests) {
            for group in self.clusterer.cluster_by(bucket, |r| r.topic.trim()) {
                candidates.push(NewTopicApproval {
                    phase,
                    domain: domain.to_string(),
                    topic: group.representative().topic.trim().to_string(),
                    total_requested: count_to_i32(group.size()),
                    approval: ApprovalStatus::OnHold,
                });
            }
        }

        match self.store.insert_approvals(&candidates).await {
            Ok(inserted) => {
                info!(
                    requests = requests.len(),
                    approvals = inserted.len(),
                    "approvals regenerated on read"
                );
                Ok(inserted)
            }
            Err(StoreError::DuplicateKey(detail)) => {
                info!(%detail, "another reader regenerated this phase first");
                Ok(self.store.list_approvals(&filter).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<TopicApproval, EngineError> {
        let updated = self.store.update_approval_status(id, status).await?;
        info!(approval_id = %id, status = %status, "approval status updated");
        Ok(updated)
    }

    /// Raw requests whose text is close to `topic`, recomputed from request text on every call.
    pub async fn find_requests_matching_topic(
        &self,
        domain: &str,
        topic: &str,
        phase: Option<PhaseId>,
    ) -> Result<Vec<TopicRequest>, EngineError> {
        let (domain, topic) = (domain.trim(), topic.trim());
        let mut missing = Vec::new();
        if domain.is_empty() {
            missing.push("domain");
        }
        if topic.is_empty() {
            missing.push("topic");
        }
        if !missing.is_empty() {
            return Err(CoreError::MissingFields(missing).into());
        }

        let candidates = self
            .store
            .list_requests(&BucketFilter::domain(domain, phase))
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|r| self.clusterer.is_duplicate(r.topic.trim(), topic))
            .collect())
    }

    /// Administrative rebuild of every approval from every request. Groups by domain only,
    /// so requests from different phases can merge; each approval takes the phase of its
    /// representative request. All statuses reset to On Hold.
    pub async fn regenerate_all(&self) -> Result<RegenerationSummary, EngineError> {
        let span = info_span!("regenerate_all");
        self.rebuild_all_approvals().instrument(span).await
    }

    async fn rebuild_all_approvals(&self) -> Result<RegenerationSummary, EngineError> {
        let deleted = self.store.delete_approvals(&BucketFilter::all()).await?;
        let requests = self.store.list_requests(&BucketFilter::all()).await?;

        let by_domain = group_by_domain(&requests);
        let domains = by_domain.len();
        let mut candidates = Vec::new();
        for (domain, bucket) in by_domain {
            for group in self.clusterer.cluster_by(bucket, |r| r.topic.trim()) {
                let representative = group.representative();
                candidates.push(NewTopicApproval {
                    phase: representative.phase,
                    domain: domain.to_string(),
                    topic: representative.topic.trim().to_string(),
                    total_requested: count_to_i32(group.size()),
                    approval: ApprovalStatus::OnHold,
                });
            }
        }

        let inserted = self.store.insert_approvals(&candidates).await?;
        let summary = RegenerationSummary {
            deleted,
            requests: requests.len(),
            domains,
            approvals: inserted.len(),
        };
        info!(
            deleted = summary.deleted,
            requests = summary.requests,
            domains = summary.domains,
            approvals = summary.approvals,
            "all approvals regenerated"
        );
        Ok(summary)
    }
}

/// Groups requests by domain, keeping domains in first-seen order and requests in input order.
fn group_by_domain(requests: &[TopicRequest]) -> Vec<(&str, Vec<&TopicRequest>)> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<(&str, Vec<&TopicRequest>)> = Vec::new();
    for request in requests {
        let slot = *index.entry(request.domain.as_str()).or_insert_with(|| {
            out.push((request.domain.as_str(), Vec::new()));
            out.len() - 1
        });
        out[slot].1.push(request);
    }
    out
}

fn count_to_i32(count: usize) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Postgres when `database_url` is configured, otherwise the in-memory store.
pub async fn connect_store(config: &ServiceConfig) -> Result<Arc<dyn TopicStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgTopicStore::connect(url).await?;
            if config.run_migrations {
                store.migrate().await?;
            }
            info!("using postgres topic store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; topic requests are kept in memory only");
            Ok(Arc::new(MemoryTopicStore::new()))
        }
    }
}

pub async fn engine_from_env() -> Result<(ServiceConfig, TopicEngine)> {
    let config = ServiceConfig::from_env()?;
    let store = connect_store(&config).await?;
    let engine = TopicEngine::from_config(&config, store);
    Ok((config, engine))
}
