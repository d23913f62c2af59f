//! gridrpc master
//!
//! The coordinating side of the gridrpc compute cluster. The master accepts
//! worker connections over the [`gridrpc_core`] substrate and tracks
//! cluster membership: workers register through their first heartbeat, keep
//! their descriptor fresh with periodic heartbeats, and are presumed dead
//! once their last heartbeat is older than the configured threshold.
//!
//! Liveness is a derived predicate, recomputed on demand — nothing is
//! persisted, and a dead worker's descriptor stays in the registry in case
//! it comes back.

pub mod master;
pub mod proto;
pub mod service;
pub mod worker_descriptor;
pub mod worker_manager;

pub use master::{Master, MasterOptions};
pub use service::MasterService;
pub use worker_descriptor::WorkerDescriptor;
pub use worker_manager::WorkerManager;
