use chrono::{DateTime, Duration, DurationRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::cmp::Ordering;
use uuid::Uuid;

/// Direction of a price change relative to the previous point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTrend {
    Up,
    Down,
    Stable,
    Initial,
}

impl PriceTrend {
    /// Convert from database string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "up" => Ok(PriceTrend::Up),
            "down" => Ok(PriceTrend::Down),
            "stable" => Ok(PriceTrend::Stable),
            "initial" => Ok(PriceTrend::Initial),
            _ => Err(format!("Invalid trend: {}", s)),
        }
    }

    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTrend::Up => "up",
            PriceTrend::Down => "down",
            PriceTrend::Stable => "stable",
            PriceTrend::Initial => "initial",
        }
    }

    /// sign(new - previous)
    pub fn between(previous: Decimal, next: Decimal) -> Self {
        match next.cmp(&previous) {
            Ordering::Greater => PriceTrend::Up,
            Ordering::Less => PriceTrend::Down,
            Ordering::Equal => PriceTrend::Stable,
        }
    }
}

/// Truncate to microseconds, the precision `TIMESTAMPTZ` keeps. Ledger
/// timestamps and the live events built from them must compare equal.
pub fn ledger_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(Duration::microseconds(1)).unwrap_or(at)
}

/// One immutable sample of an opportunity's price history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PricePoint {
    pub opportunity_id: Uuid,
    #[serde(rename = "timestamp")]
    pub recorded_at: DateTime<Utc>,
    pub price: Decimal,
    pub slots_remaining: i32,
    pub trend: String, // Stored as TEXT, use PriceTrend for type safety
}

impl PricePoint {
    pub fn new(
        opportunity_id: Uuid,
        recorded_at: DateTime<Utc>,
        price: Decimal,
        slots_remaining: i32,
        trend: PriceTrend,
    ) -> Self {
        Self {
            opportunity_id,
            recorded_at: ledger_time(recorded_at),
            price,
            slots_remaining,
            trend: trend.as_str().to_string(),
        }
    }

    /// The base-price point every history starts with
    pub fn initial(
        opportunity_id: Uuid,
        posted_at: DateTime<Utc>,
        base_price: Decimal,
        slots_remaining: i32,
    ) -> Self {
        Self::new(opportunity_id, posted_at, base_price, slots_remaining, PriceTrend::Initial)
    }

    pub fn trend_enum(&self) -> PriceTrend {
        PriceTrend::from_str(&self.trend).unwrap_or(PriceTrend::Stable)
    }

    pub fn is_initial(&self) -> bool {
        self.trend_enum() == PriceTrend::Initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_between() {
        let a = Decimal::new(200, 0);
        let b = Decimal::new(210, 0);
        assert_eq!(PriceTrend::between(a, b), PriceTrend::Up);
        assert_eq!(PriceTrend::between(b, a), PriceTrend::Down);
        assert_eq!(PriceTrend::between(a, a), PriceTrend::Stable);
    }

    #[test]
    fn test_point_serializes_timestamp_field() {
        let point = PricePoint::initial(Uuid::new_v4(), Utc::now(), Decimal::new(225, 0), 3);
        let json = serde_json::to_value(&point).unwrap();
        assert!(json.get("timestamp").is_some());
        assert_eq!(json["trend"], "initial");
        assert!(point.is_initial());
    }

    #[test]
    fn test_points_keep_microsecond_precision() {
        let at = Utc::now()
            .duration_trunc(Duration::seconds(1))
            .unwrap()
            + Duration::nanoseconds(42_000_999);
        let point = PricePoint::new(Uuid::new_v4(), at, Decimal::new(210, 0), 2, PriceTrend::Down);
        assert_eq!(point.recorded_at, at - Duration::nanoseconds(999));
        assert_eq!(ledger_time(point.recorded_at), point.recorded_at);
    }
}
