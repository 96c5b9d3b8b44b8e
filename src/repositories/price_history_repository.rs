use super::{PriceHistoryRepository, RepoResult};
use crate::models::PricePoint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Append-only access to `price_points`. A trigger rejects updates and
/// deletes at the database.
pub struct PgPriceHistoryRepository {
    pool: PgPool,
}

impl PgPriceHistoryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceHistoryRepository for PgPriceHistoryRepository {
    async fn append(&self, point: &PricePoint) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO price_points (opportunity_id, recorded_at, price, slots_remaining, trend)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(point.opportunity_id)
        .bind(point.recorded_at)
        .bind(point.price)
        .bind(point.slots_remaining)
        .bind(&point.trend)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        let point = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT opportunity_id, recorded_at, price, slots_remaining, trend
            FROM price_points
            WHERE opportunity_id = $1
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .bind(opportunity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(point)
    }

    async fn first(&self, opportunity_id: Uuid) -> RepoResult<Option<PricePoint>> {
        let point = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT opportunity_id, recorded_at, price, slots_remaining, trend
            FROM price_points
            WHERE opportunity_id = $1
            ORDER BY recorded_at ASC
            LIMIT 1
            "#,
        )
        .bind(opportunity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(point)
    }

    async fn find_since(
        &self,
        opportunity_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<PricePoint>> {
        let points = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT opportunity_id, recorded_at, price, slots_remaining, trend
            FROM price_points
            WHERE opportunity_id = $1
              AND ($2::timestamptz IS NULL OR recorded_at > $2)
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(opportunity_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }

    async fn find_recent(&self, opportunity_id: Uuid, limit: usize) -> RepoResult<Vec<PricePoint>> {
        let points = sqlx::query_as::<_, PricePoint>(
            r#"
            SELECT opportunity_id, recorded_at, price, slots_remaining, trend
            FROM (
                SELECT opportunity_id, recorded_at, price, slots_remaining, trend
                FROM price_points
                WHERE opportunity_id = $1
                ORDER BY recorded_at DESC
                LIMIT $2
            ) recent
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(opportunity_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }
}
