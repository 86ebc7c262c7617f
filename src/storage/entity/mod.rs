pub mod batch;
pub mod job;
pub mod job_error;
pub mod job_result;

pub use batch::Entity as Batch;
pub use job::Entity as Job;
pub use job_error::Entity as JobError;
pub use job_result::Entity as JobResult;
