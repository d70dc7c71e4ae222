//! Reconciliation of desired and reported device config.
//!
//! This crate provides:
//! - Retry policy and transmission window alignment
//! - A bounded transmit queue with its publishing worker
//! - The reconciliation engine and its background check chains
//! - The periodic fleet sweep
//! - Operator service and inbound message dispatch

pub mod engine;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod service;
pub mod sweep;
pub mod window;

pub use engine::{EngineBuilder, ReconciliationEngine, SetDesiredOutcome, SetDesiredRequest};
pub use processor::{ConnectionChange, MessageProcessor};
pub use queue::{QueueError, TransmitQueue, TransmitWorker, WorkerStats};
pub use retry::{NextDelay, RetryPolicy};
pub use service::ConfigService;
pub use sweep::{SweepConfig, SweepReport, SweepScheduler};
pub use window::{Clock, FixedClock, ReservedWindow, SystemClock, WindowScheduler};
