//! External delivery channels for batch notifications.

pub mod webhook;
