use crate::clock::Clock;
use crate::error::{AppError, AppResult};
use crate::models::{Opportunity, OpportunityStatus, PricePoint};
use crate::pricing::{history, PricingModel};
use crate::repositories::{
    OpportunityRepository, PitchRepository, PriceHistoryRepository, Repositories,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_WINDOW: &str = "30d";
pub const DEFAULT_RELATED_LIMIT: usize = 6;

/// Trailing time window for trend queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceWindow {
    All,
    Trailing(Duration),
}

impl PriceWindow {
    /// Parse `<n>m`, `<n>h`, `<n>d`, `<n>w` or `all` (case-insensitive)
    pub fn parse(raw: &str) -> AppResult<Self> {
        let value = raw.trim().to_lowercase();
        if value == "all" {
            return Ok(PriceWindow::All);
        }

        let invalid = || {
            AppError::Validation(format!(
                "Invalid window '{}': expected <n>m, <n>h, <n>d, <n>w or all",
                raw
            ))
        };

        let unit = value.chars().last().ok_or_else(invalid)?;
        let amount: i64 = value[..value.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        if amount < 1 {
            return Err(invalid());
        }

        let span = match unit {
            'm' => Duration::try_minutes(amount),
            'h' => Duration::try_hours(amount),
            'd' => Duration::try_days(amount),
            'w' => Duration::try_weeks(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;

        Ok(PriceWindow::Trailing(span))
    }

    /// Start of the window ending at `now`
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            PriceWindow::All => None,
            PriceWindow::Trailing(span) => now.checked_sub_signed(*span),
        }
    }
}

impl Default for PriceWindow {
    fn default() -> Self {
        PriceWindow::Trailing(Duration::days(30))
    }
}

/// Current price view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentPrice {
    pub opportunity_id: Uuid,
    pub price: Decimal,
    pub status: OpportunityStatus,
    pub frozen: bool,
}

/// Price plus chart points for a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTrendView {
    pub opportunity_id: Uuid,
    pub current_price: Decimal,
    pub status: OpportunityStatus,
    pub points: Vec<PricePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidInfo {
    pub opportunity_id: Uuid,
    pub current_price: Decimal,
    pub min_next_bid: Decimal,
    pub min_increment: Decimal,
    pub slots_total: i32,
    pub slots_remaining: i32,
    pub deadline: DateTime<Utc>,
    pub is_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedOpportunity {
    pub id: Uuid,
    pub title: String,
    pub industry: String,
    pub tier: i32,
    pub current_price: Decimal,
    pub slots_remaining: i32,
    pub deadline: DateTime<Utc>,
    pub posted_at: DateTime<Utc>,
    /// Matched on primary industry rather than a secondary tag
    pub industry_match: bool,
}

/// Read-side views. Nothing here writes.
pub struct QueryService {
    opportunities: Arc<dyn OpportunityRepository>,
    price_history: Arc<dyn PriceHistoryRepository>,
    pitches: Arc<dyn PitchRepository>,
    pricing: Arc<PricingModel>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(repos: &Repositories, pricing: Arc<PricingModel>, clock: Arc<dyn Clock>) -> Self {
        Self {
            opportunities: repos.opportunities.clone(),
            price_history: repos.price_history.clone(),
            pitches: repos.pitches.clone(),
            pricing,
            clock,
        }
    }

    async fn load(&self, opportunity_id: Uuid) -> AppResult<Opportunity> {
        self.opportunities
            .find_by_id(opportunity_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Opportunity {} not found", opportunity_id)))
    }

    /// Frozen price once closed, otherwise the engine's latest price
    pub async fn current_price(&self, opportunity_id: Uuid) -> AppResult<CurrentPrice> {
        let opportunity = self.load(opportunity_id).await?;
        let status = opportunity.status(self.clock.now());
        Ok(CurrentPrice {
            opportunity_id,
            price: opportunity.effective_price(),
            status,
            frozen: opportunity.is_frozen() || status == OpportunityStatus::Closed,
        })
    }

    /// What the model would price the opportunity at right now, without
    /// writing anything. Closed opportunities have no live price.
    pub async fn live_quote(&self, opportunity_id: Uuid) -> AppResult<Decimal> {
        let opportunity = self.load(opportunity_id).await?;
        let now = self.clock.now();
        if !opportunity.is_open(now) || opportunity.is_frozen() {
            return Err(AppError::OpportunityClosed(format!(
                "Opportunity {} has a frozen price of {}",
                opportunity_id,
                opportunity.effective_price()
            )));
        }

        let demand = self.pitches.demand_stats(opportunity_id).await?;
        let inputs = self.pricing.inputs_for(&opportunity, &demand, now);
        self.pricing
            .quote(&inputs)
            .map_err(|e| AppError::Computation(format!("opportunity {}: {}", opportunity_id, e)))
    }

    /// Ordered points in the window, always starting from a base-price point
    /// when the ledger's own start is missing or wrong.
    ///
    /// A ledger read failure degrades to the base point alone rather than
    /// an error.
    pub async fn price_trend(
        &self,
        opportunity_id: Uuid,
        window: PriceWindow,
    ) -> AppResult<PriceTrendView> {
        let opportunity = self.load(opportunity_id).await?;
        let now = self.clock.now();
        let base = self.pricing.tier_base_price(&opportunity);

        let points = match self.window_points(&opportunity, base, window, now).await {
            Ok(points) => points,
            Err(e) => {
                warn!(
                    "Price history for opportunity {} unavailable, serving fallback: {}",
                    opportunity_id, e
                );
                history::with_base_point(&opportunity, base, Vec::new())
            }
        };

        Ok(PriceTrendView {
            opportunity_id,
            current_price: opportunity.effective_price(),
            status: opportunity.status(now),
            points,
        })
    }

    async fn window_points(
        &self,
        opportunity: &Opportunity,
        base: Decimal,
        window: PriceWindow,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<PricePoint>> {
        let first = self.price_history.first(opportunity.id).await?;
        let anchored = history::starts_at_base(first.as_ref(), base);

        let start = window.start(now);
        let mut points = self.price_history.find_since(opportunity.id, start).await?;

        if !anchored {
            return Ok(history::with_base_point(opportunity, base, points));
        }

        if points.is_empty() {
            // Quiet window: carry the latest known price forward
            if let Some(latest) = self.price_history.latest(opportunity.id).await? {
                points.push(latest);
            }
        }
        Ok(points)
    }

    pub async fn bid_info(&self, opportunity_id: Uuid) -> AppResult<BidInfo> {
        let opportunity = self.load(opportunity_id).await?;
        let current_price = opportunity.effective_price();
        Ok(BidInfo {
            opportunity_id,
            current_price,
            min_next_bid: self.pricing.min_next_bid(current_price),
            min_increment: self.pricing.config().min_bid_increment,
            slots_total: opportunity.slots_total,
            slots_remaining: opportunity.slots_remaining,
            deadline: opportunity.deadline,
            is_closed: !opportunity.is_open(self.clock.now()),
        })
    }

    /// Open opportunities sharing an industry or tag with `industry`:
    /// primary-industry matches first, then tag matches, newest first within
    /// each group. `exclude` never appears.
    pub async fn related_opportunities(
        &self,
        industry: &str,
        exclude: Option<Uuid>,
        limit: Option<usize>,
    ) -> AppResult<Vec<RelatedOpportunity>> {
        let needle = industry.trim();
        if needle.is_empty() {
            return Err(AppError::Validation("Industry must not be empty".to_string()));
        }
        let limit = limit.unwrap_or(DEFAULT_RELATED_LIMIT);
        let now = self.clock.now();

        let candidates = self
            .opportunities
            .find_by_industry_or_tag(needle, exclude)
            .await?;

        let mut related: Vec<RelatedOpportunity> = candidates
            .into_iter()
            .filter(|o| Some(o.id) != exclude && o.is_open(now))
            .map(|o| RelatedOpportunity {
                industry_match: o.industry.eq_ignore_ascii_case(needle),
                id: o.id,
                current_price: o.effective_price(),
                title: o.title,
                industry: o.industry,
                tier: o.tier,
                slots_remaining: o.slots_remaining,
                deadline: o.deadline,
                posted_at: o.posted_at,
            })
            .collect();

        related.sort_by(|a, b| {
            b.industry_match
                .cmp(&a.industry_match)
                .then_with(|| b.posted_at.cmp(&a.posted_at))
        });
        related.truncate(limit);
        Ok(related)
    }
}
