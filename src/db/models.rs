use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct StageMarker {
    pub id: i32,
    pub project: String,
    pub stage: String,
    pub output_location: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStageMarker {
    pub project: String,
    pub stage: String,
    pub output_location: String,
}
