use super::{OpportunityRepository, RepoResult};
use crate::error::RepositoryError;
use crate::models::Opportunity;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

const OPPORTUNITY_COLUMNS: &str = r#"
    id,
    title,
    industry,
    tags,
    tier,
    base_price,
    current_price,
    final_price,
    slots_total,
    slots_remaining,
    posted_at,
    deadline,
    manually_closed
"#;

/// Repository for opportunity data access
pub struct PgOpportunityRepository {
    pool: PgPool,
}

impl PgOpportunityRepository {
    /// Create a new PgOpportunityRepository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OpportunityRepository for PgOpportunityRepository {
    /// Insert a new opportunity
    async fn insert(&self, opportunity: &Opportunity) -> RepoResult<Opportunity> {
        let query = format!(
            r#"
            INSERT INTO opportunities (
                id, title, industry, tags, tier, base_price, current_price, final_price,
                slots_total, slots_remaining, posted_at, deadline, manually_closed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            OPPORTUNITY_COLUMNS
        );

        let created = sqlx::query_as::<_, Opportunity>(&query)
            .bind(opportunity.id)
            .bind(&opportunity.title)
            .bind(&opportunity.industry)
            .bind(&opportunity.tags)
            .bind(opportunity.tier)
            .bind(opportunity.base_price)
            .bind(opportunity.current_price)
            .bind(opportunity.final_price)
            .bind(opportunity.slots_total)
            .bind(opportunity.slots_remaining)
            .bind(opportunity.posted_at)
            .bind(opportunity.deadline)
            .bind(opportunity.manually_closed)
            .fetch_one(&self.pool)
            .await?;

        Ok(created)
    }

    /// Find an opportunity by UUID
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Opportunity>> {
        let query = format!("SELECT {} FROM opportunities WHERE id = $1", OPPORTUNITY_COLUMNS);

        let opportunity = sqlx::query_as::<_, Opportunity>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(opportunity)
    }

    async fn find_unfrozen(&self) -> RepoResult<Vec<Opportunity>> {
        let query = format!(
            "SELECT {} FROM opportunities WHERE final_price IS NULL ORDER BY posted_at ASC",
            OPPORTUNITY_COLUMNS
        );

        let opportunities = sqlx::query_as::<_, Opportunity>(&query)
            .fetch_all(&self.pool)
            .await?;

        Ok(opportunities)
    }

    async fn find_by_industry_or_tag(
        &self,
        industry: &str,
        exclude: Option<Uuid>,
    ) -> RepoResult<Vec<Opportunity>> {
        let query = format!(
            r#"
            SELECT {}
            FROM opportunities
            WHERE final_price IS NULL
              AND manually_closed = FALSE
              AND ($2::uuid IS NULL OR id <> $2)
              AND (
                  LOWER(industry) = LOWER($1)
                  OR EXISTS (SELECT 1 FROM UNNEST(tags) AS tag WHERE LOWER(tag) = LOWER($1))
              )
            ORDER BY posted_at DESC
            "#,
            OPPORTUNITY_COLUMNS
        );

        let opportunities = sqlx::query_as::<_, Opportunity>(&query)
            .bind(industry)
            .bind(exclude)
            .fetch_all(&self.pool)
            .await?;

        Ok(opportunities)
    }

    async fn update_current_price(&self, id: Uuid, price: Decimal) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE opportunities
            SET current_price = $2
            WHERE id = $1 AND final_price IS NULL
            "#,
        )
        .bind(id)
        .bind(price)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn freeze(&self, id: Uuid, final_price: Decimal) -> RepoResult<()> {
        sqlx::query(
            r#"
            UPDATE opportunities
            SET final_price = $2, current_price = $2
            WHERE id = $1 AND final_price IS NULL
            "#,
        )
        .bind(id)
        .bind(final_price)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close_manually(&self, id: Uuid) -> RepoResult<Opportunity> {
        let query = format!(
            r#"
            UPDATE opportunities
            SET manually_closed = TRUE
            WHERE id = $1
            RETURNING {}
            "#,
            OPPORTUNITY_COLUMNS
        );

        sqlx::query_as::<_, Opportunity>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("Opportunity {} not found", id)))
    }

    async fn update_slots_remaining(
        &self,
        id: Uuid,
        slots_remaining: i32,
    ) -> RepoResult<Opportunity> {
        if slots_remaining < 0 {
            return Err(RepositoryError::InvalidInput(
                "Slots remaining must not be negative".to_string(),
            ));
        }

        let query = format!(
            r#"
            UPDATE opportunities
            SET slots_remaining = $2
            WHERE id = $1
            RETURNING {}
            "#,
            OPPORTUNITY_COLUMNS
        );

        // The CHECK constraint rejects values above slots_total
        sqlx::query_as::<_, Opportunity>(&query)
            .bind(id)
            .bind(slots_remaining)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("Opportunity {} not found", id)))
    }
}
