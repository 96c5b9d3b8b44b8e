use crate::config::PricingConfig;
use crate::models::{DemandStats, Opportunity};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Error types for price computation
#[derive(Error, Debug)]
pub enum PricingError {
    #[error("Invalid pricing policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Calculation error: {0}")]
    CalculationError(String),
}

/// Result type for price computation
pub type PricingResult<T> = Result<T, PricingError>;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Everything the price of one opportunity depends on at one instant
#[derive(Debug, Clone, Copy)]
pub struct PriceInputs {
    pub base_price: Decimal,
    pub slots_total: i32,
    pub slots_remaining: i32,
    pub pitch_count: i64,
    pub posted_at: DateTime<Utc>,
    pub last_demand_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Demand-minus-decay price model
///
/// `anchor = base * (1 + pitch_weight * min(pitches, cap) + scarcity_weight * taken/total)`
/// `price  = clamp(anchor * (1 - decay_per_hour * idle_hours), base * floor, base * ceiling)`
///
/// where `idle_hours` counts from the most recent pitch (or posting time).
/// Every demand event resets idle time and raises the anchor, so a pitch can
/// only move the price up or hold it.
#[derive(Debug, Clone)]
pub struct PricingModel {
    config: PricingConfig,
}

impl PricingModel {
    /// Create a model from a validated policy
    pub fn new(config: PricingConfig) -> PricingResult<Self> {
        config.validate().map_err(PricingError::InvalidPolicy)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Configured base price for a tier (tier 1 is the most expensive)
    pub fn base_price_for_tier(&self, tier: i32) -> Option<Decimal> {
        if tier < 1 {
            return None;
        }
        self.config.tier_base_prices.get((tier - 1) as usize).copied()
    }

    /// Base price an opportunity's history must start at: the price resolved
    /// from the tier table at creation, or the table itself if none was stored
    pub fn tier_base_price(&self, opportunity: &Opportunity) -> Decimal {
        if opportunity.base_price > Decimal::ZERO {
            return opportunity.base_price;
        }
        self.base_price_for_tier(opportunity.tier)
            .unwrap_or(opportunity.base_price)
    }

    pub fn floor(&self, base_price: Decimal) -> Decimal {
        (base_price * self.config.floor_fraction).round_dp(2)
    }

    pub fn ceiling(&self, base_price: Decimal) -> Decimal {
        (base_price * self.config.ceiling_multiplier).round_dp(2)
    }

    /// Current price plus the configured increment
    pub fn min_next_bid(&self, current_price: Decimal) -> Decimal {
        current_price + self.config.min_bid_increment
    }

    /// Assemble model inputs from an opportunity and its pitch activity
    pub fn inputs_for(
        &self,
        opportunity: &Opportunity,
        demand: &DemandStats,
        now: DateTime<Utc>,
    ) -> PriceInputs {
        PriceInputs {
            base_price: self.tier_base_price(opportunity),
            slots_total: opportunity.slots_total,
            slots_remaining: opportunity.slots_remaining,
            pitch_count: demand.pitch_count,
            posted_at: opportunity.posted_at,
            last_demand_at: demand.last_pitch_at,
            now,
        }
    }

    /// Compute the price for the given inputs
    pub fn quote(&self, inputs: &PriceInputs) -> PricingResult<Decimal> {
        if inputs.base_price <= Decimal::ZERO {
            return Err(PricingError::InvalidInput(format!(
                "Base price must be positive, got {}",
                inputs.base_price
            )));
        }
        if inputs.slots_total < 0 || inputs.slots_remaining < 0 {
            return Err(PricingError::InvalidInput("Slot counts must not be negative".to_string()));
        }
        if inputs.pitch_count < 0 {
            return Err(PricingError::InvalidInput("Pitch count must not be negative".to_string()));
        }

        let demand = self.demand_multiplier(inputs);
        let anchor = inputs
            .base_price
            .checked_mul(demand)
            .ok_or_else(|| PricingError::CalculationError("Demand price overflow".to_string()))?;

        let decay = self.decay_fraction(inputs);
        let raw = anchor * (Decimal::ONE - decay);

        let stepped = self.quantize(raw);
        let floor = self.floor(inputs.base_price);
        let ceiling = self.ceiling(inputs.base_price);

        Ok(stepped.max(floor).min(ceiling))
    }

    fn demand_multiplier(&self, inputs: &PriceInputs) -> Decimal {
        let pitches = inputs.pitch_count.min(self.config.pitch_cap as i64);
        let pitch_lift = self.config.pitch_weight * Decimal::from(pitches);

        let scarcity_lift = if inputs.slots_total > 0 {
            let remaining = inputs.slots_remaining.min(inputs.slots_total);
            let taken = Decimal::from((inputs.slots_total - remaining) as i64);
            self.config.scarcity_weight * taken / Decimal::from(inputs.slots_total as i64)
        } else {
            Decimal::ZERO
        };

        Decimal::ONE + pitch_lift + scarcity_lift
    }

    /// Share of the anchor lost to idle time, capped at 1
    fn decay_fraction(&self, inputs: &PriceInputs) -> Decimal {
        let idle_since = match inputs.last_demand_at {
            Some(last) if last > inputs.posted_at => last,
            _ => inputs.posted_at,
        };

        let idle_ms = (inputs.now - idle_since).num_milliseconds().max(0);
        let idle_hours = Decimal::from(idle_ms) / Decimal::from(MILLIS_PER_HOUR);

        (self.config.decay_per_hour * idle_hours).min(Decimal::ONE)
    }

    /// Round to the nearest price step, then to cents
    fn quantize(&self, price: Decimal) -> Decimal {
        let step = self.config.price_step;
        let steps =
            (price / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        (steps * step).round_dp(2)
    }
}
