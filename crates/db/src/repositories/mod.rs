//! Repositories: one struct of associated query functions per table group.

pub mod dead_letter_repo;
pub mod job_repo;
pub mod tracker_repo;

pub use dead_letter_repo::DeadLetterRepo;
pub use job_repo::JobRepo;
pub use tracker_repo::{RecordResult, TrackerRepo};
