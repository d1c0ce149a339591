// src/pool/mod.rs
//! Worker pool supervision
//!
//! The broker side of the engine: process launching, the pipe protocol,
//! per-worker state tracking, and the pool broker actor that hands out
//! workers under concurrency and cache limits.
//!
//! - **broker**: the owning actor and its public [`BrokerHandle`]
//! - **events**: broker event stream and load classification
//! - **launcher**: worker process spawning and transports
//! - **protocol**: the stdin/stdout frame contract
//! - **worker**: broker-side per-worker state

pub mod broker;
pub mod events;
pub mod launcher;
pub mod protocol;
pub mod worker;

// Re-export commonly used types
pub use broker::{spawn_broker, BrokerHandle};
pub use events::{BrokerEvent, PoolSnapshot, PoolStatus};
pub use launcher::{ProcessLauncher, WorkerLauncher};
pub use protocol::{decode_frame, encode_frame, ParentFrame, WorkerFrame};
pub use worker::{WorkerId, WorkerLink, WorkerPlace, WorkerSignal, WorkerState};
