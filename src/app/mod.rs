// src/app/mod.rs
//! Daemon wiring
//!
//! Glue between the external collaborators (task queue, controlling
//! platform) and the worker pool. Nothing here owns engine semantics; it
//! connects the seams.

pub mod dispatcher;
pub mod platform;

pub use dispatcher::Dispatcher;
pub use platform::{NullPlatform, PlatformClient};
