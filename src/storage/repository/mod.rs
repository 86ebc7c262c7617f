pub mod batch_repo;
pub mod job_repo;

pub use batch_repo::BatchRepository;
pub use job_repo::{JobRepository, JobTransition};
