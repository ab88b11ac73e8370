pub mod db;
pub mod durability;
pub mod error;
pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod types;

pub use durability::spawn_durability_task;
pub use error::{Result, StoreError};
pub use memory::MemoryRepository;
pub use repository::JobRepository;
pub use sqlite::SqliteRepository;
pub use types::{
    InstanceId, InstanceStatus, Job, JobId, JobInstance, JobStatus, NewInstance, NewJob,
};
