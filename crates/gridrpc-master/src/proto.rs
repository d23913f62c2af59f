//! Wire messages for the master service, shared with the worker crate.
//!
//! All messages are postcard-encoded into RPC frame bodies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Service name workers address their heartbeats to.
pub const MASTER_SERVICE: &str = "gridrpc.MasterService";

/// Trivial liveness check, used to validate a newly established proxy
/// before real heartbeats are sent over it.
pub const METHOD_PING: &str = "Ping";

pub const METHOD_WORKER_HEARTBEAT: &str = "WorkerHeartbeat";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of one worker process: a UUID stable across restarts plus a
/// sequence number monotonic per process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub permanent_uuid: String,
    pub instance_seqno: i64,
}

/// A worker's advertised addresses and software version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub rpc_addresses: Vec<HostPort>,
    pub http_addresses: Vec<HostPort>,
    pub software_version: String,
}

/// Point-in-time load snapshot reported with every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub cpu_load: f64,
    pub mem_load: f64,
    pub disk_load: f64,
    pub pending_tasks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub instance: WorkerInstance,
    /// Present only when the worker believes the master does not recognize
    /// it (first run, or the previous response asked for it).
    pub registration: Option<WorkerRegistration>,
    pub load: WorkerLoad,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Set when the master does not recognize the worker; the worker should
    /// include its full registration on the next heartbeat.
    pub needs_register: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {}
