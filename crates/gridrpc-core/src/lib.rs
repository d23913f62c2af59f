//! gridrpc RPC substrate
//!
//! The transport layer of the gridrpc compute cluster: a custom binary RPC
//! protocol over TCP, with connection multiplexing, per-call deadlines,
//! bounded-queue dispatch, and client-side retry.
//!
//! # Architecture
//!
//! - [`Messenger`] — top-level handle. Owns a fixed set of reactor tasks,
//!   the registered-service map, and the acceptor pools.
//! - Reactors — each multiplexes a disjoint subset of connections (assigned
//!   by hashing the remote address) and runs the deferred callbacks used for
//!   retry backoff.
//! - Connections — one driver task per socket handles negotiation, framing,
//!   and call-ID multiplexing. Responses may complete out of order; call IDs
//!   correlate them.
//! - [`ServicePool`] — bounded queue plus worker tasks executing a
//!   registered [`ServiceIf`]. A full queue rejects new calls immediately
//!   with a retryable `ServerTooBusy` response.
//! - [`Proxy`] / [`RetriableCall`] — client-side call issuing, with
//!   backoff/deadline retry handling on busy rejections.
//!
//! # Wire Format
//!
//! ```text
//! [4-byte length][4-byte magic "hrpc"][1-byte version][2-byte flags]
//! [4-byte header length][postcard header][body][sidecars...]
//! ```
//!
//! See [`frame`] for details.

pub mod error;
pub mod frame;
pub mod message;
pub mod messenger;
pub mod proxy;
pub mod retry;
pub mod service;
pub mod service_pool;

mod acceptor;
mod connection;
mod reactor;

pub use error::{Result, RpcError};
pub use message::{ErrorStatus, RemoteErrorCode, RemoteMethod};
pub use messenger::{Messenger, MessengerBuilder};
pub use proxy::{CallReply, CallState, Proxy};
pub use retry::{RetriableCall, RpcRetrier};
pub use service::{InboundCall, ServiceFuture, ServiceIf};
pub use service_pool::{DrainOrder, ServicePool, ServicePoolOptions};
