#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use pitchdesk_backend::broadcaster::PriceBroadcaster;
use pitchdesk_backend::clock::{Clock, ManualClock};
use pitchdesk_backend::config::{BroadcastConfig, EngineConfig, PricingConfig, SubmissionConfig};
use pitchdesk_backend::error::RepositoryError;
use pitchdesk_backend::models::{NewOpportunity, Opportunity, PricePoint};
use pitchdesk_backend::pricing::PricingModel;
use pitchdesk_backend::repositories::{
    MemoryStore, OpportunityRepository, PriceHistoryRepository, RepoResult, Repositories,
};
use pitchdesk_backend::services::{OpportunityService, PitchService, PriceEngine, QueryService};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Fixed start so deadline-day arithmetic is deterministic
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

/// Services wired over one in-memory store and a hand-driven clock.
/// The engine is not spawned; tests drive it with `tick` and `recompute`.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub repos: Repositories,
    pub clock: Arc<ManualClock>,
    pub pricing: Arc<PricingModel>,
    pub broadcaster: PriceBroadcaster,
    pub engine: PriceEngine,
    pub pitches: Arc<PitchService>,
    pub queries: QueryService,
    pub opportunities: OpportunityService,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::memory(store.clone());
        Self::build(store, repos, BroadcastConfig::default())
    }

    /// Postgres-like ledger precision and a caller-sized broadcast buffer
    pub fn with_micros_ledger(broadcast: BroadcastConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mut repos = Repositories::memory(store.clone());
        repos.price_history = Arc::new(MicrosLedger::new(store.clone()));
        Self::build(store, repos, broadcast)
    }

    /// Same wiring, but price history appends go through a `FlakyLedger`
    pub fn with_flaky_ledger() -> (Self, Arc<FlakyLedger>) {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(FlakyLedger::new(store.clone()));
        let mut repos = Repositories::memory(store.clone());
        repos.price_history = ledger.clone();
        (Self::build(store, repos, BroadcastConfig::default()), ledger)
    }

    fn build(store: Arc<MemoryStore>, repos: Repositories, broadcast: BroadcastConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let pricing = Arc::new(PricingModel::new(PricingConfig::default()).unwrap());
        let broadcaster = PriceBroadcaster::new(
            repos.opportunities.clone(),
            repos.price_history.clone(),
            pricing.clone(),
            clock.clone(),
            broadcast,
        );
        let engine = PriceEngine::new(
            &repos,
            pricing.clone(),
            broadcaster.clone(),
            clock.clone(),
            EngineConfig {
                append_retry_attempts: 3,
                retry_backoff_ms: 1,
                ..EngineConfig::default()
            },
        );
        let pitches = Arc::new(PitchService::new(
            &repos,
            clock.clone(),
            SubmissionConfig::default(),
        ));
        let queries = QueryService::new(&repos, pricing.clone(), clock.clone());
        let opportunities = OpportunityService::new(&repos, pricing.clone());

        Self {
            store,
            repos,
            clock,
            pricing,
            broadcaster,
            engine,
            pitches,
            queries,
            opportunities,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open opportunity posted now at the tier's configured price
    pub async fn create_opportunity(&self, tier: i32, deadline_in: Duration) -> Opportunity {
        self.create_with(tier, "technology", vec![], deadline_in).await
    }

    pub async fn create_with(
        &self,
        tier: i32,
        industry: &str,
        tags: Vec<&str>,
        deadline_in: Duration,
    ) -> Opportunity {
        let now = self.now();
        self.opportunities
            .create(NewOpportunity {
                title: format!("{} commentary", industry),
                industry: industry.to_string(),
                tags: tags.into_iter().map(String::from).collect(),
                tier,
                base_price: None,
                slots_total: 4,
                posted_at: now,
                deadline: now + deadline_in,
            })
            .await
            .expect("Failed to create opportunity")
    }

    pub async fn reload(&self, id: Uuid) -> Opportunity {
        self.repos
            .opportunities
            .find_by_id(id)
            .await
            .expect("Failed to load opportunity")
            .expect("Opportunity missing")
    }

    pub async fn ledger(&self, id: Uuid) -> Vec<PricePoint> {
        self.repos
            .price_history
            .find_since(id, None)
            .await
            .expect("Failed to read ledger")
    }
}

/// Price ledger that rejects the next `failures` appends as unavailable,
/// then delegates to the wrapped store
pub struct FlakyLedger {
    inner: Arc<MemoryStore>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyLedger {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceHistoryRepository for FlakyLedger {
    async fn append(&self, point: &PricePoint) -> RepoResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RepositoryError::Unavailable("ledger offline".to_string()));
        }
        self.inner.append(point).await
    }

    async fn latest(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        self.inner.latest(opportunity_id).await
    }

    async fn first(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        self.inner.first(opportunity_id).await
    }

    async fn find_since(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<PricePoint>> {
        self.inner.find_since(opportunity_id, since).await
    }

    async fn find_recent(&self, opportunity_id: Uuid, limit: usize) -> RepoResult<Vec<PricePoint>> {
        self.inner.find_recent(opportunity_id, limit).await
    }
}

/// Price ledger that stores timestamps at microsecond precision, the way
/// `TIMESTAMPTZ` does
pub struct MicrosLedger {
    inner: Arc<MemoryStore>,
}

impl MicrosLedger {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PriceHistoryRepository for MicrosLedger {
    async fn append(&self, point: &PricePoint) -> RepoResult<()> {
        let mut stored = point.clone();
        stored.recorded_at = point
            .recorded_at
            .duration_trunc(Duration::microseconds(1))
            .expect("timestamp in range");
        self.inner.append(&stored).await
    }

    async fn latest(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        self.inner.latest(opportunity_id).await
    }

    async fn first(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        self.inner.first(opportunity_id).await
    }

    async fn find_since(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<PricePoint>> {
        self.inner.find_since(opportunity_id, since).await
    }

    async fn find_recent(&self, opportunity_id: Uuid, limit: usize) -> RepoResult<Vec<PricePoint>> {
        self.inner.find_recent(opportunity_id, limit).await
    }
}
