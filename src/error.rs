use crate::acquisition::ChunkFailure;
use crate::state::Stage;
use crate::tmy::TmyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("TMY construction failed: {0}")]
    Tmy(#[from] TmyError),

    #[error("Acquisition incomplete: {} chunk(s) permanently failed", failed.len())]
    AcquisitionIncomplete { failed: Vec<ChunkFailure> },

    #[error("Workflow cancelled before stage '{0}'")]
    Cancelled(Stage),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            AppError::Stage { .. } | AppError::Cancelled(_) => self,
            other => AppError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage a workflow failure was raised in, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Stage { stage, .. } => Some(*stage),
            AppError::Cancelled(stage) => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
