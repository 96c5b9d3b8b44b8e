//! Storage seam for the pricing core.
//!
//! Each repository is a trait so services never depend on the backing store.
//! `Pg*` types implement them with sqlx; `MemoryStore` implements all of them
//! in-process. Both enforce the one-pitch-per-(user, opportunity) rule inside
//! a single statement / critical section.

pub mod draft_repository;
pub mod memory;
pub mod opportunity_repository;
pub mod pitch_repository;
pub mod price_history_repository;

pub use draft_repository::PgDraftRepository;
pub use memory::MemoryStore;
pub use opportunity_repository::PgOpportunityRepository;
pub use pitch_repository::PgPitchRepository;
pub use price_history_repository::PgPriceHistoryRepository;

use crate::error::RepositoryError;
use crate::models::{DemandStats, Draft, Opportunity, Pitch, PricePoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Durable opportunity records. `current_price` and `final_price` are written
/// only by the price engine.
#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    async fn insert(&self, opportunity: &Opportunity) -> RepoResult<Opportunity>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Opportunity>>;

    /// Opportunities the engine still owns (no final price yet)
    async fn find_unfrozen(&self) -> RepoResult<Vec<Opportunity>>;

    /// Unfrozen opportunities whose primary industry or a secondary tag
    /// matches `industry` (case-insensitive), excluding `exclude`
    async fn find_by_industry_or_tag(
        &self,
        industry: &str,
        exclude: Option<Uuid>,
    ) -> RepoResult<Vec<Opportunity>>;

    /// No-op once the opportunity is frozen
    async fn update_current_price(&self, id: Uuid, price: Decimal) -> RepoResult<()>;

    /// Record the final price; later calls leave the first value in place
    async fn freeze(&self, id: Uuid, final_price: Decimal) -> RepoResult<()>;

    async fn close_manually(&self, id: Uuid) -> RepoResult<Opportunity>;

    async fn update_slots_remaining(&self, id: Uuid, slots_remaining: i32)
        -> RepoResult<Opportunity>;
}

/// Append-only price ledger
#[async_trait]
pub trait PriceHistoryRepository: Send + Sync {
    /// Append one point. A point already stored with the same
    /// (opportunity, timestamp) reports `Duplicate`.
    async fn append(&self, point: &PricePoint) -> RepoResult<()>;

    async fn latest(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>>;

    async fn first(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>>;

    /// Points strictly after `since` (all points when `None`), oldest first
    async fn find_since(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<PricePoint>>;

    /// The last `limit` points, oldest first
    async fn find_recent(&self, opportunity_id: Uuid, limit: usize) -> RepoResult<Vec<PricePoint>>;
}

/// Draft write for a (user, opportunity) pair
#[derive(Debug, Clone)]
pub struct DraftWrite {
    pub user_id: Uuid,
    pub opportunity_id: Uuid,
    pub content: String,
    pub bid_amount_snapshot: Decimal,
    pub saved_at: DateTime<Utc>,
}

/// Result of a draft upsert
#[derive(Debug, Clone, PartialEq)]
pub enum DraftSaveOutcome {
    /// Row created or content changed
    Saved(Draft),
    /// Same content already stored; nothing written
    Unchanged(Draft),
    /// A pitch exists for the pair; no draft written
    AlreadySubmitted,
}

#[async_trait]
pub trait DraftRepository: Send + Sync {
    async fn upsert(&self, write: &DraftWrite) -> RepoResult<DraftSaveOutcome>;

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Draft>>;

    /// Returns whether a draft was removed
    async fn delete(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<bool>;
}

/// Submission request handed to the store
#[derive(Debug, Clone)]
pub struct PitchSubmission {
    pub user_id: Uuid,
    pub opportunity_id: Uuid,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

#[async_trait]
pub trait PitchRepository: Send + Sync {
    /// Atomically read the opportunity's engine price, insert the pitch at
    /// that price and delete the pair's draft. A second pitch for the same
    /// pair fails with `Duplicate`; waiting on the store longer than
    /// `max_wait` fails with `Timeout`. Nothing is written on failure.
    async fn submit(&self, submission: &PitchSubmission, max_wait: Duration) -> RepoResult<Pitch>;

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Pitch>>;

    async fn demand_stats(&self, opportunity_id: Uuid) -> RepoResult<DemandStats>;
}

/// All repositories behind their traits
#[derive(Clone)]
pub struct Repositories {
    pub opportunities: Arc<dyn OpportunityRepository>,
    pub price_history: Arc<dyn PriceHistoryRepository>,
    pub drafts: Arc<dyn DraftRepository>,
    pub pitches: Arc<dyn PitchRepository>,
}

impl Repositories {
    /// Postgres-backed repositories sharing one pool
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            opportunities: Arc::new(PgOpportunityRepository::new(pool.clone())),
            price_history: Arc::new(PgPriceHistoryRepository::new(pool.clone())),
            drafts: Arc::new(PgDraftRepository::new(pool.clone())),
            pitches: Arc::new(PgPitchRepository::new(pool)),
        }
    }

    /// Every repository served by one in-process store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            opportunities: store.clone(),
            price_history: store.clone(),
            drafts: store.clone(),
            pitches: store,
        }
    }
}
