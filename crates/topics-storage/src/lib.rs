//! Persistence for topic requests and approvals: store traits plus Postgres and in-memory backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use topics_core::{
    ApprovalStatus, NewTopicApproval, NewTopicRequest, PhaseId, TopicApproval, TopicRequest,
};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "topics-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate approval key: {0}")]
    DuplicateKey(String),
    #[error("approval {0} not found")]
    NotFound(Uuid),
    #[error("malformed row: {0}")]
    Malformed(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::DuplicateKey(db.message().to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Selects rows by optional domain and optional phase. The default selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketFilter {
    pub domain: Option<String>,
    pub phase: Option<PhaseId>,
}

impl BucketFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn bucket(domain: impl Into<String>, phase: PhaseId) -> Self {
        Self {
            domain: Some(domain.into()),
            phase: Some(phase),
        }
    }

    pub fn phase(phase: PhaseId) -> Self {
        Self {
            domain: None,
            phase: Some(phase),
        }
    }

    pub fn domain(domain: impl Into<String>, phase: Option<PhaseId>) -> Self {
        Self {
            domain: Some(domain.into()),
            phase,
        }
    }

    fn matches(&self, domain: &str, phase: PhaseId) -> bool {
        self.domain.as_deref().map_or(true, |d| d == domain) && self.phase.map_or(true, |p| p == phase)
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: NewTopicRequest) -> Result<TopicRequest, StoreError>;

    /// Requests matching `filter`, in insertion order.
    async fn list_requests(&self, filter: &BucketFilter) -> Result<Vec<TopicRequest>, StoreError>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Approvals matching `filter`, in insertion order.
    async fn list_approvals(&self, filter: &BucketFilter) -> Result<Vec<TopicApproval>, StoreError>;

    async fn delete_approvals(&self, filter: &BucketFilter) -> Result<u64, StoreError>;

    /// Inserts the whole batch or nothing. A (phase, domain, topic) collision with an
    /// existing row or within the batch fails with [`StoreError::DuplicateKey`].
    async fn insert_approvals(
        &self,
        approvals: &[NewTopicApproval],
    ) -> Result<Vec<TopicApproval>, StoreError>;

    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<TopicApproval, StoreError>;
}

pub trait TopicStore: RequestStore + ApprovalStore {}

impl<T: RequestStore + ApprovalStore> TopicStore for T {}

#[derive(Debug, Clone)]
pub struct PgTopicStore {
    pool: PgPool,
}

impl PgTopicStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running topic store migrations")?;
        Ok(())
    }
}

const APPROVAL_COLUMNS: &str =
    "id, phase, domain, topic, total_requested, approval, created_at, updated_at";

fn phase_from_column(value: i32) -> Result<PhaseId, StoreError> {
    PhaseId::new(value).ok_or_else(|| StoreError::Malformed(format!("phase {value}")))
}

fn request_from_row(row: &PgRow) -> Result<TopicRequest, StoreError> {
    Ok(TopicRequest {
        id: row.try_get("id")?,
        seq: row.try_get("seq")?,
        email: row.try_get("email")?,
        domain: row.try_get("domain")?,
        phase: phase_from_column(row.try_get("phase")?)?,
        topic: row.try_get("topic")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn approval_from_row(row: &PgRow) -> Result<TopicApproval, StoreError> {
    let approval: String = row.try_get("approval")?;
    Ok(TopicApproval {
        id: row.try_get("id")?,
        phase: phase_from_column(row.try_get("phase")?)?,
        domain: row.try_get("domain")?,
        topic: row.try_get("topic")?,
        total_requested: row.try_get("total_requested")?,
        approval: approval
            .parse()
            .map_err(|_| StoreError::Malformed(format!("approval status {approval:?}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RequestStore for PgTopicStore {
    async fn insert_request(&self, request: NewTopicRequest) -> Result<TopicRequest, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO topic_requests (id, email, domain, phase, topic, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, seq, email, domain, phase, topic, reason, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.email)
        .bind(&request.domain)
        .bind(request.phase.get())
        .bind(&request.topic)
        .bind(&request.reason)
        .fetch_one(&self.pool)
        .await?;
        request_from_row(&row)
    }

    async fn list_requests(&self, filter: &BucketFilter) -> Result<Vec<TopicRequest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, seq, email, domain, phase, topic, reason, created_at
              FROM topic_requests
             WHERE ($1::text IS NULL OR domain = $1)
               AND ($2::int4 IS NULL OR phase = $2)
             ORDER BY seq
            "#,
        )
        .bind(filter.domain.as_deref())
        .bind(filter.phase.map(PhaseId::get))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl ApprovalStore for PgTopicStore {
    async fn list_approvals(&self, filter: &BucketFilter) -> Result<Vec<TopicApproval>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {APPROVAL_COLUMNS}
              FROM topic_approvals
             WHERE ($1::text IS NULL OR domain = $1)
               AND ($2::int4 IS NULL OR phase = $2)
             ORDER BY seq
            "#
        ))
        .bind(filter.domain.as_deref())
        .bind(filter.phase.map(PhaseId::get))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(approval_from_row).collect()
    }

    async fn delete_approvals(&self, filter: &BucketFilter) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM topic_approvals
             WHERE ($1::text IS NULL OR domain = $1)
               AND ($2::int4 IS NULL OR phase = $2)
            "#,
        )
        .bind(filter.domain.as_deref())
        .bind(filter.phase.map(PhaseId::get))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_approvals(
        &self,
        approvals: &[NewTopicApproval],
    ) -> Result<Vec<TopicApproval>, StoreError> {
        if approvals.is_empty() {
            return Ok(Vec::new());
        }

        // A single statement, so a unique violation rejects the whole batch.
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO topic_approvals (id, phase, domain, topic, total_requested, approval) ",
        );
        builder.push_values(approvals, |mut b, approval| {
            b.push_bind(Uuid::new_v4())
                .push_bind(approval.phase.get())
                .push_bind(approval.domain.clone())
                .push_bind(approval.topic.clone())
                .push_bind(approval.total_requested)
                .push_bind(approval.approval.as_str());
        });
        builder.push(" RETURNING seq, ");
        builder.push(APPROVAL_COLUMNS);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut inserted = rows
            .iter()
            .map(|row| -> Result<_, StoreError> {
                Ok((row.try_get::<i64, _>("seq")?, approval_from_row(row)?))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        inserted.sort_by_key(|(seq, _)| *seq);
        debug!(rows = inserted.len(), "inserted topic approvals");
        Ok(inserted.into_iter().map(|(_, approval)| approval).collect())
    }

    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<TopicApproval, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE topic_approvals
               SET approval = $2,
                   updated_at = NOW()
             WHERE id = $1
            RETURNING {APPROVAL_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => approval_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    requests: Vec<TopicRequest>,
    approvals: Vec<TopicApproval>,
    next_seq: i64,
}

/// Process-local store with the same uniqueness rules as the Postgres schema.
///
/// Every call yields to the scheduler before touching state, so concurrent callers
/// interleave at the same points they would against a real database.
#[derive(Debug, Default)]
pub struct MemoryTopicStore {
    state: Mutex<MemoryState>,
    failing_approval_inserts: AtomicUsize,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` approval inserts fail with [`StoreError::Unavailable`].
    pub fn fail_next_approval_inserts(&self, count: usize) {
        self.failing_approval_inserts.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_approval_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RequestStore for MemoryTopicStore {
    async fn insert_request(&self, request: NewTopicRequest) -> Result<TopicRequest, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        let stored = TopicRequest {
            id: Uuid::new_v4(),
            seq: state.next_seq,
            email: request.email,
            domain: request.domain,
            phase: request.phase,
            topic: request.topic,
            reason: request.reason,
            created_at: Utc::now(),
        };
        state.requests.push(stored.clone());
        Ok(stored)
    }

    async fn list_requests(&self, filter: &BucketFilter) -> Result<Vec<TopicRequest>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state.lock().await;
        Ok(state
            .requests
            .iter()
            .filter(|r| filter.matches(&r.domain, r.phase))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ApprovalStore for MemoryTopicStore {
    async fn list_approvals(&self, filter: &BucketFilter) -> Result<Vec<TopicApproval>, StoreError> {
        tokio::task::yield_now().await;
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .iter()
            .filter(|a| filter.matches(&a.domain, a.phase))
            .cloned()
            .collect())
    }

    async fn delete_approvals(&self, filter: &BucketFilter) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        let before = state.approvals.len();
        state
            .approvals
            .retain(|a| !filter.matches(&a.domain, a.phase));
        Ok((before - state.approvals.len()) as u64)
    }

    async fn insert_approvals(
        &self,
        approvals: &[NewTopicApproval],
    ) -> Result<Vec<TopicApproval>, StoreError> {
        tokio::task::yield_now().await;
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected approval insert failure".into()));
        }
        let mut state = self.state.lock().await;

        let mut keys: HashSet<(PhaseId, &str, &str)> =
            state.approvals.iter().map(TopicApproval::bucket_key).collect();
        for approval in approvals {
            if !keys.insert((approval.phase, approval.domain.as_str(), approval.topic.as_str())) {
                return Err(StoreError::DuplicateKey(format!(
                    "(phase, domain, topic)=({}, {}, {})",
                    approval.phase, approval.domain, approval.topic
                )));
            }
        }
        drop(keys);

        let now = Utc::now();
        let inserted = approvals
            .iter()
            .map(|approval| TopicApproval {
                id: Uuid::new_v4(),
                phase: approval.phase,
                domain: approval.domain.clone(),
                topic: approval.topic.clone(),
                total_requested: approval.total_requested,
                approval: approval.approval,
                created_at: now,
                updated_at: now,
            })
            .collect::<Vec<_>>();
        state.approvals.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn update_approval_status(
        &self,
        id: Uuid,
        status: ApprovalStatus,
    ) -> Result<TopicApproval, StoreError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        let approval = state
            .approvals
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StoreError::NotFound(id))?;
        approval.approval = status;
        approval.updated_at = Utc::now();
        Ok(approval.clone())
    }
}
