use crate::db::models::{NewStageMarker, StageMarker};
use crate::error::Result;
use crate::state::{ProjectState, Stage};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn get_stage_marker(&self, project: &str, stage: &str) -> Result<Option<StageMarker>> {
        let result = sqlx::query_as::<_, StageMarker>(
            "SELECT * FROM stage_markers WHERE project = $1 AND stage = $2",
        )
        .bind(project)
        .bind(stage)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    pub async fn get_stage_markers(&self, project: &str) -> Result<Vec<StageMarker>> {
        let markers = sqlx::query_as::<_, StageMarker>(
            "SELECT * FROM stage_markers WHERE project = $1 ORDER BY completed_at, id",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;

        Ok(markers)
    }

    /// Insert a marker, or refresh its location and timestamp if the stage
    /// was already recorded for this project.
    pub async fn upsert_stage_marker(&self, marker: NewStageMarker) -> Result<i32> {
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO stage_markers (project, stage, output_location)
            VALUES ($1, $2, $3)
            ON CONFLICT (project, stage) DO UPDATE SET
                output_location = EXCLUDED.output_location,
                completed_at = NOW()
            RETURNING id
            "#,
        )
        .bind(&marker.project)
        .bind(&marker.stage)
        .bind(&marker.output_location)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn clear_stage_markers(&self, project: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stage_markers WHERE project = $1")
            .bind(project)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// PostgreSQL-backed project state, scoped to one project key.
pub struct PgProjectState {
    repo: Repository,
    project: String,
}

impl PgProjectState {
    pub fn new(pool: PgPool, project: impl Into<String>) -> Self {
        Self {
            repo: Repository::new(pool),
            project: project.into(),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }
}

#[async_trait]
impl ProjectState for PgProjectState {
    async fn has_stage_output(&self, stage: Stage) -> Result<bool> {
        Ok(self
            .repo
            .get_stage_marker(&self.project, stage.as_str())
            .await?
            .is_some())
    }

    async fn read_stage_output(&self, stage: Stage) -> Result<Option<String>> {
        Ok(self
            .repo
            .get_stage_marker(&self.project, stage.as_str())
            .await?
            .map(|m| m.output_location))
    }

    async fn mark_stage_complete(&self, stage: Stage, location: &str) -> Result<()> {
        let id = self
            .repo
            .upsert_stage_marker(NewStageMarker {
                project: self.project.clone(),
                stage: stage.as_str().to_string(),
                output_location: location.to_string(),
            })
            .await?;
        debug!("Stage marker {} recorded for {}/{}", id, self.project, stage);
        Ok(())
    }
}
