//! Queue scheduling for cadence.
//!
//! A single serialized worker per account owns the ordered queue, applies
//! pacing and retries, consults the quota ledger and emergency stop before
//! every dispatch, and fans state deltas out to observers.

pub mod broadcast;
pub mod client;
pub mod error;
pub mod pacing;
pub mod queue;
pub mod registry;
pub mod replica;
pub mod state_machine;
pub mod worker;

pub use broadcast::{BroadcastHub, ObserverLiveness, Subscription};
pub use client::{ActionClient, ActionOutcome, SimulatedClient};
pub use error::{Result, SchedulerError};
pub use registry::AccountRegistry;
pub use replica::QueueReplica;
pub use worker::{AccountHandle, AccountWorker, ResumeOutcome};
