//! Queue lifecycle events and outbound webhook delivery.
//!
//! - [`EventBus`] is an in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying [`QueueEvent`]s from the job queue
//!   to whoever aggregates completions.
//! - [`delivery`] holds external delivery channels (webhook).

pub mod bus;
pub mod delivery;

pub use bus::{EventBus, QueueEvent};
pub use delivery::webhook::{WebhookConfig, WebhookDelivery, WebhookError};
