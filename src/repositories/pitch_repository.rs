use super::{PitchRepository, PitchSubmission, RepoResult};
use crate::error::RepositoryError;
use crate::models::{DemandStats, Pitch};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Repository for pitch data access
pub struct PgPitchRepository {
    pool: PgPool,
}

impl PgPitchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PitchRepository for PgPitchRepository {
    /// Insert the pitch at the opportunity's stored engine price and drop the
    /// draft, all in one transaction.
    ///
    /// Uniqueness comes from `pitches_user_opportunity_key`: a concurrent
    /// second insert waits on the first and then fails with 23505, which maps
    /// to `RepositoryError::Duplicate`. `lock_timeout` and `statement_timeout`
    /// bound that wait.
    async fn submit(&self, submission: &PitchSubmission, max_wait: Duration) -> RepoResult<Pitch> {
        let wait_ms = max_wait.as_millis().max(1);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", wait_ms))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = '{}ms'", wait_ms))
            .execute(&mut *tx)
            .await?;

        let pitch = sqlx::query_as::<_, Pitch>(
            r#"
            INSERT INTO pitches (id, user_id, opportunity_id, content, bid_amount, status, submitted_at)
            SELECT $1, $2, o.id, $4, COALESCE(o.final_price, o.current_price), 'pending', $5
            FROM opportunities o
            WHERE o.id = $3
            RETURNING id, user_id, opportunity_id, content, bid_amount, status, submitted_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(submission.user_id)
        .bind(submission.opportunity_id)
        .bind(&submission.content)
        .bind(submission.submitted_at)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            RepositoryError::NotFound(format!(
                "Opportunity {} not found",
                submission.opportunity_id
            ))
        })?;

        sqlx::query("DELETE FROM drafts WHERE user_id = $1 AND opportunity_id = $2")
            .bind(submission.user_id)
            .bind(submission.opportunity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(pitch)
    }

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Pitch>> {
        let pitch = sqlx::query_as::<_, Pitch>(
            r#"
            SELECT id, user_id, opportunity_id, content, bid_amount, status, submitted_at
            FROM pitches
            WHERE user_id = $1 AND opportunity_id = $2
            "#,
        )
        .bind(user_id)
        .bind(opportunity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(pitch)
    }

    async fn demand_stats(&self, opportunity_id: Uuid) -> RepoResult<DemandStats> {
        let stats = sqlx::query_as::<_, DemandStats>(
            r#"
            SELECT COUNT(*) AS pitch_count, MAX(submitted_at) AS last_pitch_at
            FROM pitches
            WHERE opportunity_id = $1
            "#,
        )
        .bind(opportunity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }
}
