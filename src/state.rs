use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Ordered workflow stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Assemble,
    PersistTimeseries,
    ConstructTmy,
    PersistTmy,
    RenderPlots,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Acquire,
        Stage::Assemble,
        Stage::PersistTimeseries,
        Stage::ConstructTmy,
        Stage::PersistTmy,
        Stage::RenderPlots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Assemble => "assemble",
            Stage::PersistTimeseries => "persist_timeseries",
            Stage::ConstructTmy => "construct_tmy",
            Stage::PersistTmy => "persist_tmy",
            Stage::RenderPlots => "render_plots",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of which stages have finished and where their output is.
#[async_trait]
pub trait ProjectState: Send + Sync {
    async fn has_stage_output(&self, stage: Stage) -> Result<bool>;

    async fn read_stage_output(&self, stage: Stage) -> Result<Option<String>>;

    async fn mark_stage_complete(&self, stage: Stage, location: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub output: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    stages: BTreeMap<Stage, StageRecord>,
}

/// JSON-file state store. Queries are answered from memory; each commit
/// rewrites the file atomically.
#[derive(Debug)]
pub struct FileProjectState {
    path: PathBuf,
    state: Mutex<StateFile>,
}

impl FileProjectState {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StateFile::default(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                AppError::InvalidData(format!(
                    "Corrupt project state {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(
            "Opened project state {} ({} completed stage(s))",
            path.display(),
            state.stages.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn commit(&self, state: &StateFile) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectState for FileProjectState {
    async fn has_stage_output(&self, stage: Stage) -> Result<bool> {
        Ok(self.state.lock().await.stages.contains_key(&stage))
    }

    async fn read_stage_output(&self, stage: Stage) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .stages
            .get(&stage)
            .map(|r| r.output.clone()))
    }

    async fn mark_stage_complete(&self, stage: Stage, location: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.stages.insert(
            stage,
            StageRecord {
                output: location.to_string(),
                completed_at: Utc::now(),
            },
        );
        self.commit(&state).await?;
        debug!("Marked stage {} complete -> {}", stage, location);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_name(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::PersistTmy.to_string(), "persist_tmy");
        assert_eq!(Stage::from_name("plot"), None);
    }

    #[tokio::test]
    async fn test_markers_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = FileProjectState::open(&path).await.unwrap();
        assert!(!state.has_stage_output(Stage::Acquire).await.unwrap());
        state
            .mark_stage_complete(Stage::Acquire, "chunks")
            .await
            .unwrap();

        let reopened = FileProjectState::open(&path).await.unwrap();
        assert_eq!(reopened.path(), path.as_path());
        assert!(reopened.has_stage_output(Stage::Acquire).await.unwrap());
        assert_eq!(
            reopened.read_stage_output(Stage::Acquire).await.unwrap(),
            Some("chunks".to_string())
        );
        assert_eq!(reopened.read_stage_output(Stage::Assemble).await.unwrap(), None);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_state_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(FileProjectState::open(&path).await.is_err());
    }
}
