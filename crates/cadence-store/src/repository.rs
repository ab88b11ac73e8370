use async_trait::async_trait;

use crate::{
    error::Result,
    types::{InstanceId, InstanceStatus, Job, JobId, JobInstance, NewInstance, NewJob},
};

/// Storage for jobs and their instances.
///
/// The orchestrator never touches storage except through this trait, so the
/// same scheduling logic runs against [`MemoryRepository`](crate::MemoryRepository)
/// in tests and [`SqliteRepository`](crate::SqliteRepository) in the daemon.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// All jobs, oldest first.
    async fn get_jobs(&self) -> Result<Vec<Job>>;

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    /// Persist every field of `job` and bump `updated_at`.
    ///
    /// Fails with `JobNotFound` if the job was removed meanwhile.
    async fn save_job(&self, job: &Job) -> Result<Job>;

    /// Insert a new job. Fails with `DuplicateJob` if the ID is taken.
    async fn create_job(&self, new_job: NewJob) -> Result<Job>;

    /// Delete a job together with all of its instances.
    async fn remove_job(&self, id: &JobId) -> Result<()>;

    /// Materialise a new instance in the `scheduled` state.
    async fn add_instance(&self, job_id: &JobId, init: NewInstance) -> Result<JobInstance>;

    /// Persist every field of `instance`.
    async fn save_instance(&self, instance: &JobInstance) -> Result<JobInstance>;

    async fn get_instance(&self, id: &InstanceId) -> Result<Option<JobInstance>>;

    /// Instances of `job_id` in `status`, ordered by occurrence index.
    async fn instances_with_status(
        &self,
        job_id: &JobId,
        status: InstanceStatus,
    ) -> Result<Vec<JobInstance>>;

    /// Make everything written so far durable. No-op by default.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
