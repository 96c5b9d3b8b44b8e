use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user's unsubmitted pitch-in-progress, one per (user, opportunity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Draft {
    pub id: Uuid,
    pub user_id: Uuid,
    pub opportunity_id: Uuid,
    pub content: String,
    /// Engine price when the draft was last saved
    pub bid_amount_snapshot: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Draft {
    pub fn new(
        user_id: Uuid,
        opportunity_id: Uuid,
        content: String,
        bid_amount_snapshot: Decimal,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            opportunity_id,
            content,
            bid_amount_snapshot,
            updated_at,
        }
    }
}
