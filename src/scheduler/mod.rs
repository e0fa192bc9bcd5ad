pub mod dependency;
pub mod history;
pub mod job;
pub mod queue;

pub use job::{BinlogInfo, Job, JobState, JobType, SchemaDiff, SchemaState};
pub use queue::JobQueue;
