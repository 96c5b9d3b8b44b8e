use crate::clock::Clock;
use crate::config::SubmissionConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Draft, Opportunity, Pitch};
use crate::repositories::{
    DraftRepository, DraftSaveOutcome, DraftWrite, OpportunityRepository, PitchRepository,
    PitchSubmission, Repositories,
};
use crate::services::price_engine::EngineHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub pitch: Pitch,
    /// Price locked in by the store at the write
    pub bid_amount: Decimal,
    /// Display price the client thought it was bidding, echoed back
    pub claimed_price: Option<Decimal>,
    /// The opportunity was closed, so the bid is its frozen price
    pub price_frozen: bool,
}

/// A user's relationship to one opportunity, for rendering the right form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPitchStatus {
    pub has_submitted: bool,
    pub is_pending: bool,
    pub has_draft: bool,
    pub draft_content: Option<String>,
    pub pitch: Option<Pitch>,
}

/// Draft and pitch lifecycle for (user, opportunity) pairs.
///
/// The one-pitch rule is enforced by the store's atomic submit; nothing here
/// pre-checks before writing.
pub struct PitchService {
    opportunities: Arc<dyn OpportunityRepository>,
    drafts: Arc<dyn DraftRepository>,
    pitches: Arc<dyn PitchRepository>,
    clock: Arc<dyn Clock>,
    config: SubmissionConfig,
    engine: Option<EngineHandle>,
}

impl PitchService {
    pub fn new(repos: &Repositories, clock: Arc<dyn Clock>, config: SubmissionConfig) -> Self {
        Self {
            opportunities: repos.opportunities.clone(),
            drafts: repos.drafts.clone(),
            pitches: repos.pitches.clone(),
            clock,
            config,
            engine: None,
        }
    }

    /// Notify this engine of new demand after each submission
    pub fn with_engine(mut self, engine: EngineHandle) -> Self {
        self.engine = Some(engine);
        self
    }

    async fn load_opportunity(&self, opportunity_id: Uuid) -> AppResult<Opportunity> {
        self.opportunities
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Opportunity {} not found", opportunity_id)))
    }

    /// Create or update the pair's draft. Re-saving identical content writes
    /// nothing. Rejected once the pair has a pitch.
    pub async fn save_draft(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
        content: &str,
    ) -> AppResult<Draft> {
        validate_content(content)?;
        let opportunity = self.load_opportunity(opportunity_id).await?;

        let write = DraftWrite {
            user_id,
            opportunity_id,
            content: content.to_string(),
            bid_amount_snapshot: opportunity.effective_price(),
            saved_at: self.clock.now(),
        };

        match self.drafts.upsert(&write).await? {
            DraftSaveOutcome::Saved(draft) => {
                debug!("Draft saved for user {} on {}", user_id, opportunity_id);
                Ok(draft)
            }
            DraftSaveOutcome::Unchanged(draft) => Ok(draft),
            DraftSaveOutcome::AlreadySubmitted => Err(AppError::DuplicateSubmission),
        }
    }

    /// Remove the pair's draft. Returns whether one existed.
    pub async fn discard_draft(&self, user_id: Uuid, opportunity_id: Uuid) -> AppResult<bool> {
        Ok(self.drafts.delete(user_id, opportunity_id).await?)
    }

    /// Submit the pair's single pitch.
    ///
    /// The bid is whatever the engine's price is at the instant of the store
    /// write; `claimed_price` is only echoed back. The write runs on its own
    /// task, so it completes (or fails cleanly) even if the caller goes away.
    pub async fn submit_pitch(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
        content: &str,
        claimed_price: Option<Decimal>,
    ) -> AppResult<SubmissionReceipt> {
        validate_content(content)?;
        let opportunity = self.load_opportunity(opportunity_id).await?;
        let now = self.clock.now();
        let price_frozen = !opportunity.is_open(now) || opportunity.is_frozen();

        let submission = PitchSubmission {
            user_id,
            opportunity_id,
            content: content.to_string(),
            submitted_at: now,
        };
        let pitches = self.pitches.clone();
        let max_wait = self.config.store_timeout();

        let written = tokio::spawn(async move { pitches.submit(&submission, max_wait).await })
            .await
            .map_err(|e| AppError::Message(format!("Submission task failed: {}", e)))?;

        let pitch = match written {
            Ok(pitch) => pitch,
            Err(e) => {
                let err = AppError::from(e);
                match &err {
                    AppError::DuplicateSubmission => {
                        info!("Duplicate submission by user {} on {}", user_id, opportunity_id)
                    }
                    _ => warn!(
                        "Submission by user {} on {} failed: {}",
                        user_id, opportunity_id, err
                    ),
                }
                return Err(err);
            }
        };

        info!(
            "Pitch {} submitted by user {} on {} at {}",
            pitch.id, user_id, opportunity_id, pitch.bid_amount
        );

        if let Some(engine) = &self.engine {
            if !price_frozen {
                engine.notify_demand(opportunity_id);
            }
        }

        Ok(SubmissionReceipt {
            bid_amount: pitch.bid_amount,
            claimed_price,
            price_frozen,
            pitch,
        })
    }

    /// Advisory view of the pair's state
    pub async fn get_user_pitch_status(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
    ) -> AppResult<UserPitchStatus> {
        let pitch = self.pitches.find(user_id, opportunity_id).await?;

        // A draft racing a submit can outlive it; the pitch wins
        let draft = match pitch {
            Some(_) => None,
            None => self.drafts.find(user_id, opportunity_id).await?,
        };

        Ok(UserPitchStatus {
            has_submitted: pitch.is_some(),
            is_pending: pitch.as_ref().map(|p| p.is_pending()).unwrap_or(false),
            has_draft: draft.is_some(),
            draft_content: draft.map(|d| d.content),
            pitch,
        })
    }
}

fn validate_content(content: &str) -> AppResult<()> {
    if content.trim().is_empty() {
        return Err(AppError::Validation("Content must not be empty".to_string()));
    }
    Ok(())
}

type DraftKey = (Uuid, Uuid);

/// Fire-and-forget draft saves.
///
/// Saves for the same pair are coalesced down to the latest content and
/// written on the next flush. New pairs are dropped while the queue is full.
#[derive(Clone)]
pub struct AutosaveQueue {
    service: Arc<PitchService>,
    queued: Arc<Mutex<HashMap<DraftKey, String>>>,
    capacity: usize,
}

impl AutosaveQueue {
    pub fn new(service: Arc<PitchService>, capacity: usize) -> Self {
        Self {
            service,
            queued: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Queue a save. Returns false when it was dropped.
    pub async fn enqueue(&self, user_id: Uuid, opportunity_id: Uuid, content: String) -> bool {
        if content.trim().is_empty() {
            return false;
        }

        let mut queued = self.queued.lock().await;
        let key = (user_id, opportunity_id);
        if !queued.contains_key(&key) && queued.len() >= self.capacity {
            warn!(
                "Autosave queue full ({}), dropping save for user {} on {}",
                self.capacity, user_id, opportunity_id
            );
            return false;
        }
        queued.insert(key, content);
        true
    }

    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }

    /// Write everything queued. Returns how many drafts were saved.
    pub async fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.queued.lock().await);
        let mut saved = 0;

        for ((user_id, opportunity_id), content) in batch {
            match self.service.save_draft(user_id, opportunity_id, &content).await {
                Ok(_) => saved += 1,
                // Submitted meanwhile, or otherwise moot
                Err(AppError::DuplicateSubmission) | Err(AppError::NotFound(_)) => {}
                Err(e) => warn!(
                    "Autosave for user {} on {} dropped: {}",
                    user_id, opportunity_id, e
                ),
            }
        }

        saved
    }

    /// Flush on a fixed interval until the task is aborted
    pub fn spawn_flusher(&self, every: Duration) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            info!("Autosave flusher started, flushing every {:?}", every);
            loop {
                interval.tick().await;
                let saved = queue.flush().await;
                if saved > 0 {
                    debug!("Autosave flushed {} drafts", saved);
                }
            }
        })
    }
}
