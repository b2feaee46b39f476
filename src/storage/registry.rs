// =============================================================================
// Model registry -- versioned k-means models with one active row
// =============================================================================
//
// The trainer writes here; the classifier worker only reads. Promotion swaps
// the active flag and inserts the new model inside a single transaction, so a
// reader observes either the previous model or the new one, never zero or two
// active rows.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::info;

use crate::types::ModelParameters;

/// One row of `model_registry`.
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub id: i32,
    pub created_at: DateTime<Utc>,
    pub algorithm: String,
    pub parameters: ModelParameters,
    pub is_active: bool,
}

#[derive(Debug, FromRow)]
struct ModelRow {
    id: i32,
    created_at: DateTime<Utc>,
    algorithm: String,
    parameters: Json<ModelParameters>,
    is_active: bool,
}

impl From<ModelRow> for ModelRecord {
    fn from(row: ModelRow) -> Self {
        ModelRecord {
            id: row.id,
            created_at: row.created_at,
            algorithm: row.algorithm,
            parameters: row.parameters.0,
            is_active: row.is_active,
        }
    }
}

/// Store for reading and promoting models.
#[derive(Clone)]
pub struct ModelRegistry {
    pool: PgPool,
}

impl ModelRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure the registry table exists. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_registry (
                id          SERIAL PRIMARY KEY,
                created_at  TIMESTAMPTZ NOT NULL,
                algorithm   TEXT        NOT NULL,
                parameters  JSONB       NOT NULL,
                is_active   BOOLEAN     NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create model_registry table")?;
        Ok(())
    }

    /// Load the currently active model, if any.
    pub async fn active_model(&self) -> Result<Option<ModelRecord>> {
        let row: Option<ModelRow> = sqlx::query_as(
            r#"
            SELECT id, created_at, algorithm, parameters, is_active
            FROM model_registry
            WHERE is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to load active model")?;

        Ok(row.map(ModelRecord::from))
    }

    /// Atomically deactivate the current model and insert `parameters` as the
    /// new active one. Returns the new model id.
    ///
    /// Any failure rolls the transaction back, leaving the previous model in
    /// force.
    pub async fn promote(&self, algorithm: &str, parameters: &ModelParameters) -> Result<i32> {
        let mut tx = self.pool.begin().await.context("failed to begin promotion")?;

        sqlx::query("UPDATE model_registry SET is_active = FALSE WHERE is_active = TRUE")
            .execute(&mut *tx)
            .await
            .context("failed to deactivate current model")?;

        let id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO model_registry (created_at, algorithm, parameters, is_active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(algorithm)
        .bind(Json(parameters))
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert new model")?;

        tx.commit().await.context("failed to commit promotion")?;

        info!(model_id = id, algorithm, "model promoted to active");
        Ok(id)
    }
}
