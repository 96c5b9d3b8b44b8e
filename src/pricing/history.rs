use crate::models::{ledger_time, Opportunity, PricePoint};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

/// `now` at ledger precision, pushed past `previous` so ledger timestamps
/// strictly increase
pub fn next_timestamp(now: DateTime<Utc>, previous: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = ledger_time(previous) + Duration::milliseconds(1);
    ledger_time(now).max(earliest)
}

/// Whether a ledger's first point is the expected base-price start
pub fn starts_at_base(first: Option<&PricePoint>, base_price: Decimal) -> bool {
    matches!(first, Some(point) if point.price == base_price)
}

/// The initial point every chart starts from, at `posted_at`
pub fn base_point(opportunity: &Opportunity, base_price: Decimal) -> PricePoint {
    PricePoint::initial(
        opportunity.id,
        opportunity.posted_at,
        base_price,
        opportunity.slots_total,
    )
}

/// Prepend the base point unless `points` already begins with it.
///
/// Points timestamped at or before `posted_at` are dropped first so the
/// result stays strictly ordered.
pub fn with_base_point(
    opportunity: &Opportunity,
    base_price: Decimal,
    mut points: Vec<PricePoint>,
) -> Vec<PricePoint> {
    let base = base_point(opportunity, base_price);
    if let Some(first) = points.first() {
        if first.recorded_at == base.recorded_at && first.price == base.price {
            return points;
        }
    }

    points.retain(|p| p.recorded_at > base.recorded_at);
    let mut anchored = Vec::with_capacity(points.len() + 1);
    anchored.push(base);
    anchored.extend(points);
    anchored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewOpportunity, PriceTrend};

    fn opportunity() -> Opportunity {
        let now = Utc::now();
        NewOpportunity {
            title: "Hiring freeze".into(),
            industry: "tech".into(),
            tags: vec![],
            tier: 1,
            base_price: None,
            slots_total: 2,
            posted_at: now,
            deadline: now + Duration::days(1),
        }
        .into_opportunity(Decimal::new(225, 0))
    }

    #[test]
    fn test_empty_history_gets_base_point() {
        let opp = opportunity();
        let points = with_base_point(&opp, Decimal::new(225, 0), vec![]);
        assert_eq!(points.len(), 1);
        assert!(points[0].is_initial());
        assert_eq!(points[0].price, Decimal::new(225, 0));
        assert_eq!(points[0].recorded_at, opp.posted_at);
    }

    #[test]
    fn test_existing_base_point_kept() {
        let opp = opportunity();
        let base = Decimal::new(225, 0);
        let ledger = vec![
            base_point(&opp, base),
            PricePoint::new(
                opp.id,
                opp.posted_at + Duration::hours(1),
                Decimal::new(220, 0),
                2,
                PriceTrend::Down,
            ),
        ];
        assert_eq!(with_base_point(&opp, base, ledger.clone()), ledger);
    }

    #[test]
    fn test_mismatched_start_is_replaced() {
        let opp = opportunity();
        let base = Decimal::new(225, 0);
        let ledger = vec![
            PricePoint::new(opp.id, opp.posted_at, Decimal::new(300, 0), 2, PriceTrend::Initial),
            PricePoint::new(
                opp.id,
                opp.posted_at + Duration::hours(1),
                Decimal::new(220, 0),
                2,
                PriceTrend::Down,
            ),
        ];
        let anchored = with_base_point(&opp, base, ledger);
        assert_eq!(anchored.len(), 2);
        assert_eq!(anchored[0].price, base);
        assert_eq!(anchored[1].price, Decimal::new(220, 0));
        assert!(!starts_at_base(None, base));
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let t = ledger_time(Utc::now());
        assert_eq!(next_timestamp(t, t), t + Duration::milliseconds(1));
        assert_eq!(next_timestamp(t + Duration::seconds(5), t), t + Duration::seconds(5));
    }

    #[test]
    fn test_next_timestamp_drops_sub_microsecond_digits() {
        let previous = ledger_time(Utc::now());
        let now = previous + Duration::seconds(2) + Duration::nanoseconds(789);
        assert_eq!(next_timestamp(now, previous), previous + Duration::seconds(2));
    }
}
