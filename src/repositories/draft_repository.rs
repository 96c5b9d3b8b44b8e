use super::{DraftRepository, DraftSaveOutcome, DraftWrite, RepoResult};
use crate::error::RepositoryError;
use crate::models::Draft;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

/// Repository for draft data access
pub struct PgDraftRepository {
    pool: PgPool,
}

impl PgDraftRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn pitch_exists(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pitches WHERE user_id = $1 AND opportunity_id = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(opportunity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}

#[async_trait]
impl DraftRepository for PgDraftRepository {
    /// Insert or update the pair's draft in one statement. Nothing is
    /// written when a pitch exists or the content is unchanged.
    async fn upsert(&self, write: &DraftWrite) -> RepoResult<DraftSaveOutcome> {
        let saved = sqlx::query_as::<_, Draft>(
            r#"
            INSERT INTO drafts (id, user_id, opportunity_id, content, bid_amount_snapshot, updated_at)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (
                SELECT 1 FROM pitches WHERE user_id = $2 AND opportunity_id = $3
            )
            ON CONFLICT (user_id, opportunity_id) DO UPDATE
            SET content = EXCLUDED.content,
                bid_amount_snapshot = EXCLUDED.bid_amount_snapshot,
                updated_at = EXCLUDED.updated_at
            WHERE drafts.content IS DISTINCT FROM EXCLUDED.content
            RETURNING id, user_id, opportunity_id, content, bid_amount_snapshot, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(write.user_id)
        .bind(write.opportunity_id)
        .bind(&write.content)
        .bind(write.bid_amount_snapshot)
        .bind(write.saved_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(draft) = saved {
            return Ok(DraftSaveOutcome::Saved(draft));
        }

        if self.pitch_exists(write.user_id, write.opportunity_id).await? {
            return Ok(DraftSaveOutcome::AlreadySubmitted);
        }

        match self.find(write.user_id, write.opportunity_id).await? {
            Some(draft) => Ok(DraftSaveOutcome::Unchanged(draft)),
            // Removed between the upsert and the read (submitted or discarded)
            None => Err(RepositoryError::Unavailable(
                "Draft changed concurrently, retry the save".to_string(),
            )),
        }
    }

    async fn find(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<Option<Draft>> {
        let draft = sqlx::query_as::<_, Draft>(
            r#"
            SELECT id, user_id, opportunity_id, content, bid_amount_snapshot, updated_at
            FROM drafts
            WHERE user_id = $1 AND opportunity_id = $2
            "#,
        )
        .bind(user_id)
        .bind(opportunity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(draft)
    }

    async fn delete(&self, user_id: Uuid, opportunity_id: Uuid) -> RepoResult<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE user_id = $1 AND opportunity_id = $2")
            .bind(user_id)
            .bind(opportunity_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
