//! Durable research records
//!
//! The orchestrator records each research task in a [`ResearchStore`]: once
//! when it is created, and once more when it reaches a terminal status.
//! The engine itself never touches the store.
//!
//! # File layout
//!
//! ```text
//! {data_dir}/
//! ├── 5b0c…e1.json
//! └── 9f3a…07.json
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::state::{Clarifications, ResearchStatus};

/// A research task as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub clarifications: Clarifications,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: ResearchStatus,
    pub max_iterations: u32,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchRecord {
    pub fn new(id: impl Into<String>, topic: impl Into<String>, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            topic: topic.into(),
            clarifications: Clarifications::new(),
            user_id: None,
            status: ResearchStatus::Initialized,
            max_iterations,
            report: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Record a status change. Terminal statuses stamp `completed_at`.
    pub fn set_status(&mut self, status: ResearchStatus, report: Option<String>, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.report = report;
        self.error = error;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }
}

/// Persistence sink for research records
#[async_trait]
pub trait ResearchStore: Send + Sync {
    /// Insert or replace a record
    async fn save_research(&self, record: &ResearchRecord) -> Result<(), StoreError>;

    /// Fetch a record, or [`StoreError::NotFound`]
    async fn get_research(&self, id: &str) -> Result<ResearchRecord, StoreError>;

    /// Update status, report and error of an existing record
    async fn update_status(
        &self,
        id: &str,
        status: ResearchStatus,
        report: Option<String>,
        error: Option<String>,
    ) -> Result<ResearchRecord, StoreError> {
        let mut record = self.get_research(id).await?;
        record.set_status(status, report, error);
        self.save_research(&record).await?;
        Ok(record)
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ResearchRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResearchStore for MemoryStore {
    async fn save_research(&self, record: &ResearchRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_research(&self, id: &str) -> Result<ResearchRecord, StoreError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// One JSON file per research task.
///
/// Writes go to a temporary file that is renamed into place, so a reader
/// never sees a half-written record.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Self::check_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.tmp", id))
    }

    /// Ids become file names; only allow a safe alphabet
    fn check_id(id: &str) -> Result<(), StoreError> {
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if safe {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ResearchStore for FileStore {
    async fn save_research(&self, record: &ResearchRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id)?;
        let temp = self.temp_path(&record.id);

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to create {}: {}", self.dir.display(), e)))?;

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        fs::write(&temp, &json)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write {}: {}", temp.display(), e)))?;
        fs::rename(&temp, &path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to rename into {}: {}", path.display(), e)))
    }

    async fn get_research(&self, id: &str) -> Result<ResearchRecord, StoreError> {
        let path = self.record_path(id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(StoreError::Io(format!("Failed to read {}: {}", path.display(), e))),
        };
        serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
