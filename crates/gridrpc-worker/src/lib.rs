//! gridrpc worker
//!
//! The reporting side of the gridrpc compute cluster. A worker serves RPCs
//! over the [`gridrpc_core`] substrate and runs one heartbeat task per
//! configured master: it registers on first contact (or whenever the master
//! stops recognizing it), then keeps its descriptor fresh with periodic
//! load reports.

pub mod heartbeater;
pub mod load;
pub mod worker;

pub use heartbeater::{HeartbeatOptions, Heartbeater};
pub use load::LoadTracker;
pub use worker::{WorkerOptions, WorkerServer};
