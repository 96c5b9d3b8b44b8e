use super::price_point::ledger_time;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Opportunity status, always derived from the deadline and the manual-close flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Open,
    Closed,
}

impl OpportunityStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "open" => Ok(OpportunityStatus::Open),
            "closed" => Ok(OpportunityStatus::Closed),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Open => "open",
            OpportunityStatus::Closed => "closed",
        }
    }
}

/// A media request for expert commentary with a moving price
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Opportunity {
    pub id: Uuid,
    pub title: String,
    /// Primary industry classification
    pub industry: String,
    /// Secondary tags
    pub tags: Vec<String>,
    pub tier: i32,
    pub base_price: Decimal,
    /// Written only by the price engine
    pub current_price: Decimal,
    /// Set once by the engine's freeze write
    pub final_price: Option<Decimal>,
    pub slots_total: i32,
    pub slots_remaining: i32,
    pub posted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub manually_closed: bool,
}

impl Opportunity {
    /// Last instant of the deadline's calendar day (UTC)
    pub fn end_of_deadline_day(&self) -> DateTime<Utc> {
        self.deadline
            .date_naive()
            .and_hms_nano_opt(23, 59, 59, 999_999_999)
            .map(|dt| dt.and_utc())
            .unwrap_or(self.deadline)
    }

    /// Status at `now`. Never cached.
    pub fn status(&self, now: DateTime<Utc>) -> OpportunityStatus {
        if self.manually_closed || now > self.end_of_deadline_day() {
            OpportunityStatus::Closed
        } else {
            OpportunityStatus::Open
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.status(now) == OpportunityStatus::Open
    }

    /// The engine has written the freeze and will not touch this row again
    pub fn is_frozen(&self) -> bool {
        self.final_price.is_some()
    }

    /// Frozen price once closed, otherwise the engine's latest price
    pub fn effective_price(&self) -> Decimal {
        self.final_price.unwrap_or(self.current_price)
    }
}

/// Input for the ingestion process creating an opportunity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOpportunity {
    pub title: String,
    pub industry: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tier: i32,
    /// Defaults to the configured price for `tier`
    pub base_price: Option<Decimal>,
    pub slots_total: i32,
    pub posted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl NewOpportunity {
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Title must not be empty".to_string());
        }
        if self.industry.trim().is_empty() {
            return Err("Industry must not be empty".to_string());
        }
        if self.tier < 1 {
            return Err("Tier must be 1 or greater".to_string());
        }
        if self.slots_total < 0 {
            return Err("Slots must not be negative".to_string());
        }
        if let Some(price) = self.base_price {
            if price <= Decimal::ZERO {
                return Err("Base price must be positive".to_string());
            }
        }
        if self.deadline < self.posted_at {
            return Err("Deadline must not precede posting time".to_string());
        }
        Ok(())
    }

    /// Build the stored record with the resolved base price
    pub fn into_opportunity(self, base_price: Decimal) -> Opportunity {
        Opportunity {
            id: Uuid::new_v4(),
            title: self.title,
            industry: self.industry,
            tags: self.tags,
            tier: self.tier,
            base_price,
            current_price: base_price,
            final_price: None,
            slots_total: self.slots_total,
            slots_remaining: self.slots_total,
            posted_at: ledger_time(self.posted_at),
            deadline: ledger_time(self.deadline),
            manually_closed: false,
        }
    }
}
