//! Distributed admission control.
//!
//! A task must hold a slot before running. Slots live in the coordination
//! store, so the limit holds across every instance sharing it.
//!
//! Per-task lifecycle:
//! - `acquire` with free capacity and an empty queue: absent -> active
//! - otherwise: absent -> queued -> active, in FIFO order
//! - `release`: active -> absent
//!
//! A queued task leaves the queue only by being granted, or by giving up
//! through [`AcquireOptions`] (cancellation, deadline).

mod controller;
mod error;
mod waiters;

pub use controller::{AcquireOptions, AdmissionController, SlotStats};
pub use error::AdmissionError;
