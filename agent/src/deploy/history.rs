//! Deployment history log

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fsm::HostDeploymentState;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::result::DeploymentResult;

/// One line of the history log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum HistoryRecord {
    /// Final state of one host
    Host {
        deployment_id: Uuid,
        recorded_at: DateTime<Utc>,
        state: HostDeploymentState,
    },

    /// Final result of a deployment
    Deployment {
        recorded_at: DateTime<Utc>,
        result: DeploymentResult,
    },
}

/// Append-only destination for finished host states and results
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: &HistoryRecord) -> Result<(), DeployError>;
}

/// History kept as JSON lines in a file
pub struct JsonLinesHistory {
    file: File,
}

impl JsonLinesHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
        }
    }

    /// Read back every record, oldest first
    pub async fn read_all(&self) -> Result<Vec<HistoryRecord>, DeployError> {
        if !self.file.exists().await {
            return Ok(Vec::new());
        }
        let contents = self.file.read_string().await?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(DeployError::from))
            .collect()
    }
}

#[async_trait]
impl HistorySink for JsonLinesHistory {
    async fn record(&self, record: &HistoryRecord) -> Result<(), DeployError> {
        let line = serde_json::to_string(record)?;
        self.file.append_line(&line).await
    }
}
