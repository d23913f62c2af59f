//! Worker server assembly: messenger, acceptor, identity, and heartbeater.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use gridrpc_core::{Messenger, MessengerBuilder, Result, ServicePool};
use tracing::info;
use uuid::Uuid;

use gridrpc_master::proto::{HostPort, WorkerInstance, WorkerRegistration};

use crate::heartbeater::{HeartbeatOptions, Heartbeater};
use crate::load::LoadTracker;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Masters to report to. One heartbeat task is started per address.
    pub master_addresses: Vec<HostPort>,
    /// Address to accept RPC connections on.
    pub bind_address: SocketAddr,
    pub num_acceptors: usize,
    /// Advertised admin HTTP address, included in the registration. The
    /// admin server itself is served elsewhere.
    pub http_address: HostPort,
    pub heartbeat: HeartbeatOptions,
    pub num_reactors: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            master_addresses: Vec::new(),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            num_acceptors: 1,
            http_address: HostPort::new("0.0.0.0", 8051),
            heartbeat: HeartbeatOptions::default(),
            num_reactors: 4,
        }
    }
}

/// One worker process: serves RPCs over the substrate and reports liveness
/// and load to every configured master.
///
/// The permanent UUID is generated at startup; the instance sequence
/// number is the startup time in seconds, making it monotonic across
/// restarts of the same worker.
pub struct WorkerServer {
    messenger: Messenger,
    instance: WorkerInstance,
    registration: WorkerRegistration,
    bound_rpc_address: SocketAddr,
    load: Arc<LoadTracker>,
    heartbeater: Heartbeater,
}

impl WorkerServer {
    pub async fn start(options: WorkerOptions) -> Result<WorkerServer> {
        let messenger = MessengerBuilder::new("worker")
            .set_num_reactors(options.num_reactors)
            .build();
        let bound_rpc_address = messenger
            .add_acceptor_pool(options.bind_address, options.num_acceptors)
            .await?;

        let instance = WorkerInstance {
            permanent_uuid: Uuid::new_v4().to_string(),
            instance_seqno: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        };
        let registration = WorkerRegistration {
            rpc_addresses: vec![HostPort::new(
                bound_rpc_address.ip().to_string(),
                bound_rpc_address.port(),
            )],
            http_addresses: vec![options.http_address.clone()],
            software_version: format!("gridrpc {}", env!("CARGO_PKG_VERSION")),
        };
        let load = Arc::new(LoadTracker::new());

        let heartbeater = Heartbeater::start(
            &options.master_addresses,
            options.heartbeat.clone(),
            messenger.clone(),
            instance.clone(),
            registration.clone(),
            load.clone(),
        );

        info!(
            "worker {} (seqno {}) serving on {}",
            instance.permanent_uuid, instance.instance_seqno, bound_rpc_address
        );
        Ok(WorkerServer {
            messenger,
            instance,
            registration,
            bound_rpc_address,
            load,
            heartbeater,
        })
    }

    pub fn instance(&self) -> &WorkerInstance {
        &self.instance
    }

    pub fn registration(&self) -> &WorkerRegistration {
        &self.registration
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn bound_rpc_address(&self) -> SocketAddr {
        self.bound_rpc_address
    }

    pub fn load(&self) -> &Arc<LoadTracker> {
        &self.load
    }

    /// Register an application service pool with this worker's messenger.
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        pool: Arc<ServicePool>,
    ) -> Result<()> {
        self.messenger.register_service(name, pool).await
    }

    /// Stop heartbeating, then tear down the messenger.
    pub async fn shutdown(&self) {
        self.heartbeater.stop().await;
        self.messenger.shutdown().await;
    }
}
