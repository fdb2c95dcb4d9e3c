//! Row models and DTOs for every table the pipeline touches.

pub mod dead_letter;
pub mod job;
pub mod status;
pub mod tracker;
