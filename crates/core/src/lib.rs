//! Domain types and rules for the pixelbatch image pipeline.
//!
//! Everything in this crate is pure: no I/O, no runtime, no internal
//! dependencies. Persistence, delivery and orchestration crates build on
//! these types.

pub mod batch;
pub mod error;
pub mod job;
pub mod job_events;
pub mod retry;
pub mod types;
pub mod webhook;
