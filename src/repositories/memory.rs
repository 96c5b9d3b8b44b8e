//! In-process store implementing every repository trait.
//!
//! All state sits behind one async mutex, so each repository call is a single
//! critical section: the pitch check-and-insert cannot interleave with another
//! submit. Lock acquisition is bounded so a stalled holder surfaces as
//! `RepositoryError::Timeout` instead of an indefinite wait.

use super::{
    DraftRepository, DraftSaveOutcome, DraftWrite, OpportunityRepository, PitchRepository,
    PitchSubmission, PriceHistoryRepository, RepoResult,
};
use crate::error::RepositoryError;
use crate::models::{DemandStats, Draft, Opportunity, Pitch, PricePoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type PairKey = (Uuid, Uuid);

#[derive(Default)]
struct MemoryState {
    opportunities: HashMap<Uuid, Opportunity>,
    price_points: HashMap<Uuid, Vec<PricePoint>>,
    drafts: HashMap<PairKey, Draft>,
    pitches: HashMap<PairKey, Pitch>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    lock_timeout: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lock_timeout,
        }
    }

    async fn lock_within(&self, wait: Duration) -> RepoResult<MutexGuard<'_, MemoryState>> {
        tokio::time::timeout(wait, self.state.lock())
            .await
            .map_err(|_| RepositoryError::Timeout("Memory store lock wait exceeded".to_string()))
    }

    async fn lock(&self) -> RepoResult<MutexGuard<'_, MemoryState>> {
        self.lock_within(self.lock_timeout).await
    }

    /// Number of pitches stored for an opportunity
    pub async fn pitch_count(&self, opportunity_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .pitches
            .values()
            .filter(|p| p.opportunity_id == opportunity_id)
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: Uuid) -> RepositoryError {
    RepositoryError::NotFound(format!("Opportunity {} not found", id))
}

#[async_trait]
impl OpportunityRepository for MemoryStore {
    async fn insert(&self, opportunity: &Opportunity) -> RepoResult<Opportunity> {
        let mut state = self.lock().await?;
        if state.opportunities.contains_key(&opportunity.id) {
            return Err(RepositoryError::Duplicate(format!(
                "Opportunity {} already exists",
                opportunity.id
            )));
        }
        state.opportunities.insert(opportunity.id, opportunity.clone());
        Ok(opportunity.clone())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Opportunity>> {
        let state = self.lock().await?;
        Ok(state.opportunities.get(&id).cloned())
    }

    async fn find_unfrozen(&self) -> RepoResult<Vec<Opportunity>> {
        let state = self.lock().await?;
        let mut unfrozen: Vec<Opportunity> = state
            .opportunities
            .values()
            .filter(|o| !o.is_frozen())
            .cloned()
            .collect();
        unfrozen.sort_by_key(|o| o.posted_at);
        Ok(unfrozen)
    }

    async fn find_by_industry_or_tag(
        &self,
        industry: &str,
        exclude: Option<Uuid>,
    ) -> RepoResult<Vec<Opportunity>> {
        let needle = industry.to_lowercase();
        let state = self.lock().await?;
        let mut matches: Vec<Opportunity> = state
            .opportunities
            .values()
            .filter(|o| !o.is_frozen() && !o.manually_closed)
            .filter(|o| Some(o.id) != exclude)
            .filter(|o| {
                o.industry.to_lowercase() == needle
                    || o.tags.iter().any(|t| t.to_lowercase() == needle)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
        Ok(matches)
    }

    async fn update_current_price(&self, id: Uuid, price: Decimal) -> RepoResult<()> {
        let mut state = self.lock().await?;
        let opportunity = state.opportunities.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !opportunity.is_frozen() {
            opportunity.current_price = price;
        }
        Ok(())
    }

    async fn freeze(&self, id: Uuid, final_price: Decimal) -> RepoResult<()> {
        let mut state = self.lock().await?;
        let opportunity = state.opportunities.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !opportunity.is_frozen() {
            opportunity.final_price = Some(final_price);
            opportunity.current_price = final_price;
        }
        Ok(())
    }

    async fn close_manually(&self, id: Uuid) -> RepoResult<Opportunity> {
        let mut state = self.lock().await?;
        let opportunity = state.opportunities.get_mut(&id).ok_or_else(|| not_found(id))?;
        opportunity.manually_closed = true;
        Ok(opportunity.clone())
    }

    async fn update_slots_remaining(
        &self,
        id: Uuid,
        slots_remaining: i32,
    ) -> RepoResult<Opportunity> {
        let mut state = self.lock().await?;
        let opportunity = state.opportunities.get_mut(&id).ok_or_else(|| not_found(id))?;
        if slots_remaining < 0 || slots_remaining > opportunity.slots_total {
            return Err(RepositoryError::ConstraintViolation(format!(
                "Slots remaining must be between 0 and {}",
                opportunity.slots_total
            )));
        }
        opportunity.slots_remaining = slots_remaining;
        Ok(opportunity.clone())
    }
}

#[async_trait]
impl PriceHistoryRepository for MemoryStore {
    async fn append(&self, point: &PricePoint) -> RepoResult<()> {
        let mut state = self.lock().await?;
        if !state.opportunities.contains_key(&point.opportunity_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "Unknown opportunity {}",
                point.opportunity_id
            )));
        }

        let ledger = state.price_points.entry(point.opportunity_id).or_default();
        if let Some(last) = ledger.last() {
            if point.recorded_at == last.recorded_at {
                return Err(RepositoryError::Duplicate(format!(
                    "Price point at {} already recorded",
                    point.recorded_at
                )));
            }
            if point.recorded_at < last.recorded_at {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "Price point at {} precedes latest point at {}",
                    point.recorded_at, last.recorded_at
                )));
            }
        }
        ledger.push(point.clone());
        Ok(())
    }

    async fn latest(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        let state = self.lock().await?;
        Ok(state
            .price_points
            .get(&opportunity_id)
            .and_then(|ledger| ledger.last().cloned()))
    }

    async fn first(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        let state = self.lock().await?;
        Ok(state
            .price_points
            .get(&opportunity_id)
            .and_then(|ledger| ledger.first().cloned()))
    }

    async fn find_since(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<PricePoint>> {
        let state = self.lock().await?;
        let ledger = match state.price_points.get(&opportunity_id) {
            Some(ledger) => ledger,
            None => return Ok(Vec::new()),
        };
        Ok(ledger
            .iter()
            .filter(|p| since.map_or(true, |s| p.recorded_at > s))
            .cloned()
            .collect())
    }

    async fn find_recent(&self, opportunity_id: Uuid, limit: usize) -> RepoResult<Vec<PricePoint>> {
        let state = self.lock().await?;
        let ledger = match state.price_points.get(&opportunity_id) {
            Some(ledger) => ledger,
            None => return Ok(Vec::new()),
        };
        let start = ledger.len().saturating_sub(limit);
        Ok(ledger[start..].to_vec())
    }
}

#[async_trait]
impl DraftRepository for MemoryStore {
    async fn upsert(&self, write: &DraftWrite) -> RepoResult<DraftSaveOutcome> {
        let key = (write.user_id, write.opportunity_id);
        let mut state = self.lock().await?;

        if state.pitches.contains_key(&key) {
            return Ok(DraftSaveOutcome::AlreadySubmitted);
        }

        if let Some(existing) = state.drafts.get_mut(&key) {
            if existing.content == write.content {
                return Ok(DraftSaveOutcome::Unchanged(existing.clone()));
            }
            existing.content = write.content.clone();
            existing.bid_amount_snapshot = write.bid_amount_snapshot;
            existing.updated_at = write.saved_at;
            return Ok(DraftSaveOutcome::Saved(existing.clone()));
        }

        let draft = Draft::new(
            write.user_id,
            write.opportunity_id,
            write.content.clone(),
            write.bid_amount_snapshot,
            write.saved_at,
        );
        state.drafts.insert(key, draft.clone());
        Ok(DraftSaveOutcome::Saved(draft))
    }

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Draft>> {
        let state = self.lock().await?;
        Ok(state.drafts.get(&(user_id, opportunity_id)).cloned())
    }

    async fn delete(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<bool> {
        let mut state = self.lock().await?;
        Ok(state.drafts.remove(&(user_id, opportunity_id)).is_some())
    }
}

#[async_trait]
impl PitchRepository for MemoryStore {
    async fn submit(&self, submission: &PitchSubmission, max_wait: Duration) -> RepoResult<Pitch> {
        let key = (submission.user_id, submission.opportunity_id);
        let mut state = self.lock_within(max_wait).await?;

        if state.pitches.contains_key(&key) {
            return Err(RepositoryError::Duplicate(format!(
                "Pitch already exists for user {} on opportunity {}",
                submission.user_id, submission.opportunity_id
            )));
        }

        let bid_amount = state
            .opportunities
            .get(&submission.opportunity_id)
            .map(|o| o.effective_price())
            .ok_or_else(|| not_found(submission.opportunity_id))?;

        let pitch = Pitch::new(
            submission.user_id,
            submission.opportunity_id,
            submission.content.clone(),
            bid_amount,
            submission.submitted_at,
        );
        state.pitches.insert(key, pitch.clone());
        state.drafts.remove(&key);

        Ok(pitch)
    }

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Pitch>> {
        let state = self.lock().await?;
        Ok(state.pitches.get(&(user_id, opportunity_id)).cloned())
    }

    async fn demand_stats(&self, opportunity_id: Uuid) -> RepoResult<DemandStats> {
        let state = self.lock().await?;
        let mut stats = DemandStats::default();
        for pitch in state.pitches.values().filter(|p| p.opportunity_id == opportunity_id) {
            stats.pitch_count += 1;
            stats.last_pitch_at = match stats.last_pitch_at {
                Some(last) if last >= pitch.submitted_at => Some(last),
                _ => Some(pitch.submitted_at),
            };
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewOpportunity, PriceTrend};
    use chrono::Duration as ChronoDuration;

    fn opportunity() -> Opportunity {
        let now = Utc::now();
        NewOpportunity {
            title: "Supply chain outlook".into(),
            industry: "logistics".into(),
            tags: vec!["shipping".into()],
            tier: 2,
            base_price: None,
            slots_total: 3,
            posted_at: now,
            deadline: now + ChronoDuration::days(2),
        }
        .into_opportunity(Decimal::new(175, 0))
    }

    #[tokio::test]
    async fn test_append_rejects_out_of_order_points() {
        let store = MemoryStore::new();
        let opp = store.insert(&opportunity()).await.unwrap();
        let t0 = opp.posted_at;

        let first = PricePoint::initial(opp.id, t0, opp.base_price, 3);
        store.append(&first).await.unwrap();

        let same_time = PricePoint::new(opp.id, t0, Decimal::new(180, 0), 3, PriceTrend::Up);
        assert!(matches!(
            store.append(&same_time).await,
            Err(RepositoryError::Duplicate(_))
        ));

        let earlier = PricePoint::new(
            opp.id,
            t0 - ChronoDuration::seconds(1),
            Decimal::new(180, 0),
            3,
            PriceTrend::Up,
        );
        assert!(matches!(
            store.append(&earlier).await,
            Err(RepositoryError::ConstraintViolation(_))
        ));

        assert_eq!(store.find_since(opp.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_is_unique_and_clears_draft() {
        let store = MemoryStore::new();
        let opp = store.insert(&opportunity()).await.unwrap();
        let user = Uuid::new_v4();

        let write = DraftWrite {
            user_id: user,
            opportunity_id: opp.id,
            content: "draft".into(),
            bid_amount_snapshot: opp.current_price,
            saved_at: Utc::now(),
        };
        assert!(matches!(
            store.upsert(&write).await.unwrap(),
            DraftSaveOutcome::Saved(_)
        ));

        let submission = PitchSubmission {
            user_id: user,
            opportunity_id: opp.id,
            content: "final".into(),
            submitted_at: Utc::now(),
        };
        let pitch = store.submit(&submission, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pitch.bid_amount, Decimal::new(175, 0));
        assert!(DraftRepository::find(&store, user, opp.id).await.unwrap().is_none());

        let second = store.submit(&submission, Duration::from_secs(1)).await;
        assert!(matches!(second, Err(RepositoryError::Duplicate(_))));

        assert_eq!(
            store.upsert(&write).await.unwrap(),
            DraftSaveOutcome::AlreadySubmitted
        );
    }

    #[tokio::test]
    async fn test_frozen_opportunity_ignores_price_updates() {
        let store = MemoryStore::new();
        let opp = store.insert(&opportunity()).await.unwrap();

        store.freeze(opp.id, Decimal::new(190, 0)).await.unwrap();
        store.update_current_price(opp.id, Decimal::new(250, 0)).await.unwrap();
        store.freeze(opp.id, Decimal::new(260, 0)).await.unwrap();

        let stored = store.find_by_id(opp.id).await.unwrap().unwrap();
        assert_eq!(stored.final_price, Some(Decimal::new(190, 0)));
        assert_eq!(stored.effective_price(), Decimal::new(190, 0));
        assert!(store.find_unfrozen().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slots_bounds() {
        let store = MemoryStore::new();
        let opp = store.insert(&opportunity()).await.unwrap();
        assert!(store.update_slots_remaining(opp.id, 4).await.is_err());
        let updated = store.update_slots_remaining(opp.id, 1).await.unwrap();
        assert_eq!(updated.slots_remaining, 1);
    }
}
