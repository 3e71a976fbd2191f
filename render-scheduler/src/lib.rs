//! Scheduling machinery for the media job orchestrator: dispatcher,
//! monitor loops, reconciler, local worker pool, remote executor
//! client and webhook notifier.

pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod local_pool;
pub mod monitor;
pub mod notifier;
pub mod reconciler;
pub mod remote;
