use crate::error::{AppError, AppResult};
use crate::models::{NewOpportunity, Opportunity};
use crate::pricing::PricingModel;
use crate::repositories::{OpportunityRepository, Repositories};
use crate::services::price_engine::EngineHandle;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Hooks for the external ingestion and placement workflows
pub struct OpportunityService {
    opportunities: Arc<dyn OpportunityRepository>,
    pricing: Arc<PricingModel>,
    engine: Option<EngineHandle>,
}

impl OpportunityService {
    pub fn new(repos: &Repositories, pricing: Arc<PricingModel>) -> Self {
        Self {
            opportunities: repos.opportunities.clone(),
            pricing,
            engine: None,
        }
    }

    pub fn with_engine(mut self, engine: EngineHandle) -> Self {
        self.engine = Some(engine);
        self
    }

    fn nudge_engine(&self, opportunity_id: Uuid) {
        if let Some(engine) = &self.engine {
            engine.notify_demand(opportunity_id);
        }
    }

    /// Store a new opportunity, taking its base price from the tier table
    /// unless one was supplied
    pub async fn create(&self, new: NewOpportunity) -> AppResult<Opportunity> {
        new.validate().map_err(AppError::Validation)?;

        let base_price = match new.base_price {
            Some(price) => price,
            None => self.pricing.base_price_for_tier(new.tier).ok_or_else(|| {
                AppError::Validation(format!("No base price configured for tier {}", new.tier))
            })?,
        };

        let created = self
            .opportunities
            .insert(&new.into_opportunity(base_price))
            .await?;
        info!(
            "Opportunity {} created at tier {} with base price {}",
            created.id, created.tier, created.base_price
        );

        self.nudge_engine(created.id);
        Ok(created)
    }

    /// Close now; the engine freezes the price on its next pass
    pub async fn close(&self, opportunity_id: Uuid) -> AppResult<Opportunity> {
        let closed = self.opportunities.close_manually(opportunity_id).await?;
        info!("Opportunity {} closed manually", opportunity_id);
        self.nudge_engine(opportunity_id);
        Ok(closed)
    }

    pub async fn update_slots_remaining(
        &self,
        opportunity_id: Uuid,
        slots_remaining: i32,
    ) -> AppResult<Opportunity> {
        let current = self
            .opportunities
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Opportunity {} not found", opportunity_id))
            })?;

        if slots_remaining < 0 || slots_remaining > current.slots_total {
            return Err(AppError::Validation(format!(
                "Slots remaining must be between 0 and {}",
                current.slots_total
            )));
        }

        let updated = self
            .opportunities
            .update_slots_remaining(opportunity_id, slots_remaining)
            .await?;
        self.nudge_engine(opportunity_id);
        Ok(updated)
    }
}
