//! Workflow registry: project-keyed records, in-memory or durable.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use crate::database::WorkflowRecord;
use crate::database::{DatabaseError, SessionDb};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("workflow already exists: {0}")]
    Exists(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Stable key for a project: last path component plus a short digest of
/// the canonical working directory and the VCS remote, so the same checkout
/// maps to the same workflow across runs while distinct clones stay apart.
pub fn project_key(workdir: &Path, remote: Option<&str>) -> String {
    let canonical = workdir
        .canonicalize()
        .unwrap_or_else(|_| workdir.to_path_buf());
    let stem = canonical
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project")
        .to_lowercase()
        .replace([' ', '/'], "-");

    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    remote.unwrap_or_default().hash(&mut hasher);
    format!("{stem}-{:08x}", hasher.finish() as u32)
}

pub trait Registry: Send + Sync {
    fn create(&self, record: WorkflowRecord) -> Result<(), RegistryError>;
    fn get(&self, key: &str) -> Result<WorkflowRecord, RegistryError>;
    fn list(&self) -> Result<Vec<WorkflowRecord>, RegistryError>;
    fn update(&self, record: &WorkflowRecord) -> Result<(), RegistryError>;
    fn remove(&self, key: &str) -> Result<(), RegistryError>;
    fn set_session_ref(&self, key: &str, session_ref: Option<&str>) -> Result<(), RegistryError>;
    fn set_paused(&self, key: &str, paused: bool) -> Result<(), RegistryError>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    records: Mutex<HashMap<String, WorkflowRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for InMemoryRegistry {
    fn create(&self, record: WorkflowRecord) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.key) {
            return Err(RegistryError::Exists(record.key));
        }
        records.insert(record.key.clone(), record);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<WorkflowRecord, RegistryError> {
        self.records
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    fn list(&self) -> Result<Vec<WorkflowRecord>, RegistryError> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn update(&self, record: &WorkflowRecord) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&record.key) {
            return Err(RegistryError::NotFound(record.key.clone()));
        }
        records.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RegistryError> {
        self.records
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    fn set_session_ref(&self, key: &str, session_ref: Option<&str>) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        record.session_ref = session_ref.map(str::to_string);
        Ok(())
    }

    fn set_paused(&self, key: &str, paused: bool) -> Result<(), RegistryError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        record.paused = paused;
        Ok(())
    }
}

/// Durable registry over the session repository.
pub struct SqliteRegistry {
    db: Arc<SessionDb>,
}

impl SqliteRegistry {
    pub fn new(db: Arc<SessionDb>) -> Self {
        Self { db }
    }
}

impl Registry for SqliteRegistry {
    fn create(&self, record: WorkflowRecord) -> Result<(), RegistryError> {
        if self.db.get_workflow(&record.key)?.is_some() {
            return Err(RegistryError::Exists(record.key));
        }
        self.db.upsert_workflow(&record)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<WorkflowRecord, RegistryError> {
        self.db
            .get_workflow(key)?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    fn list(&self) -> Result<Vec<WorkflowRecord>, RegistryError> {
        Ok(self.db.list_workflows()?)
    }

    fn update(&self, record: &WorkflowRecord) -> Result<(), RegistryError> {
        self.get(&record.key)?;
        self.db.upsert_workflow(record)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), RegistryError> {
        if self.db.remove_workflow(key)? {
            Ok(())
        } else {
            Err(RegistryError::NotFound(key.to_string()))
        }
    }

    fn set_session_ref(&self, key: &str, session_ref: Option<&str>) -> Result<(), RegistryError> {
        self.get(key)?;
        self.db.set_session_ref(key, session_ref)?;
        Ok(())
    }

    fn set_paused(&self, key: &str, paused: bool) -> Result<(), RegistryError> {
        self.get(key)?;
        self.db.set_paused(key, paused)?;
        Ok(())
    }
}
