//! In-process repository, optionally snapshotted to a JSON file on flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    error::{Result, StoreError},
    repository::JobRepository,
    types::{InstanceId, InstanceStatus, Job, JobId, JobInstance, NewInstance, NewJob},
};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    instances: HashMap<InstanceId, JobInstance>,
}

/// On-disk shape of a snapshot. Lists keep the file stable to diff.
#[derive(Deserialize)]
struct Snapshot {
    jobs: Vec<Job>,
    instances: Vec<JobInstance>,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a JSON snapshot to `path` on every [`flush`](JobRepository::flush).
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::default(),
            snapshot_path: Some(path.into()),
        }
    }

    /// Restore from a snapshot written by [`with_snapshot`](Self::with_snapshot).
    /// A missing file yields an empty repository.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!(
                    path = %path.display(),
                    jobs = snapshot.jobs.len(),
                    instances = snapshot.instances.len(),
                    "memory repository restored from snapshot"
                );
                State {
                    jobs: snapshot.jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
                    instances: snapshot
                        .instances
                        .into_iter()
                        .map(|i| (i.id.clone(), i))
                        .collect(),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn get_jobs(&self) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.read().await.jobs.get(id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<Job> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::JobNotFound {
                id: job.id.to_string(),
            })?;
        *stored = job.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = new_job.into_job(Utc::now());
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateJob {
                id: job.id.to_string(),
            });
        }
        state.jobs.insert(job.id.clone(), job.clone());
        debug!(job_id = %job.id, "job created");
        Ok(job)
    }

    async fn remove_job(&self, id: &JobId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.jobs.remove(id).is_none() {
            return Err(StoreError::JobNotFound { id: id.to_string() });
        }
        state.instances.retain(|_, instance| &instance.job_id != id);
        Ok(())
    }

    async fn add_instance(&self, job_id: &JobId, init: NewInstance) -> Result<JobInstance> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(job_id) {
            return Err(StoreError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        let instance = init.into_instance(job_id.clone());
        state.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn save_instance(&self, instance: &JobInstance) -> Result<JobInstance> {
        let mut state = self.state.write().await;
        let stored =
            state
                .instances
                .get_mut(&instance.id)
                .ok_or_else(|| StoreError::InstanceNotFound {
                    id: instance.id.to_string(),
                })?;
        *stored = instance.clone();
        Ok(instance.clone())
    }

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<JobInstance>> {
        Ok(self.state.read().await.instances.get(id).cloned())
    }

    async fn instances_with_status(
        &self,
        job_id: &JobId,
        status: InstanceStatus,
    ) -> Result<Vec<JobInstance>> {
        let state = self.state.read().await;
        let mut found: Vec<JobInstance> = state
            .instances
            .values()
            .filter(|i| &i.job_id == job_id && i.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.occurrence_index);
        Ok(found)
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let json = {
            let state = self.state.read().await;
            let mut jobs: Vec<&Job> = state.jobs.values().collect();
            jobs.sort_by(|a, b| a.id.cmp(&b.id));
            let mut instances: Vec<&JobInstance> = state.instances.values().collect();
            instances.sort_by(|a, b| a.id.cmp(&b.id));
            serde_json::to_vec_pretty(&serde_json::json!({
                "jobs": jobs,
                "instances": instances,
            }))?
        };

        // Atomic replace.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), bytes = json.len(), "snapshot written");
        Ok(())
    }
}
