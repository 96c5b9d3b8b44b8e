use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Review status of a submitted pitch. Advanced only by the external review workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitchStatus {
    Pending,
    Sent,
    Interested,
    NotInterested,
    Successful,
}

impl PitchStatus {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(PitchStatus::Pending),
            "sent" => Ok(PitchStatus::Sent),
            "interested" => Ok(PitchStatus::Interested),
            "not_interested" => Ok(PitchStatus::NotInterested),
            "successful" => Ok(PitchStatus::Successful),
            _ => Err(format!("Invalid pitch status: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            PitchStatus::Pending => "pending",
            PitchStatus::Sent => "sent",
            PitchStatus::Interested => "interested",
            PitchStatus::NotInterested => "not_interested",
            PitchStatus::Successful => "successful",
        }
    }
}

/// A user's final, price-locked submission against an opportunity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Pitch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub opportunity_id: Uuid,
    pub content: String,
    /// Engine price at the instant of the write; never changes afterwards
    pub bid_amount: Decimal,
    pub status: String, // Stored as TEXT, use PitchStatus for type safety
    pub submitted_at: DateTime<Utc>,
}

impl Pitch {
    pub fn new(
        user_id: Uuid,
        opportunity_id: Uuid,
        content: String,
        bid_amount: Decimal,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            opportunity_id,
            content,
            bid_amount,
            status: PitchStatus::Pending.as_str().to_string(),
            submitted_at,
        }
    }

    pub fn status_enum(&self) -> PitchStatus {
        PitchStatus::from_str(&self.status).unwrap_or(PitchStatus::Pending)
    }

    pub fn is_pending(&self) -> bool {
        self.status_enum() == PitchStatus::Pending
    }
}

/// Pitch activity feeding the price engine's demand term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, FromRow)]
pub struct DemandStats {
    pub pitch_count: i64,
    pub last_pitch_at: Option<DateTime<Utc>>,
}
