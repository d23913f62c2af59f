//! Master server assembly: messenger, acceptor pools, and the master
//! service wired together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gridrpc_core::{
    DrainOrder, Messenger, MessengerBuilder, Result, ServicePool, ServicePoolOptions,
};
use tracing::info;

use crate::proto::MASTER_SERVICE;
use crate::service::MasterService;
use crate::worker_manager::WorkerManager;

#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Addresses to accept worker connections on.
    pub bind_addresses: Vec<SocketAddr>,
    /// Accept tasks per bound address.
    pub num_acceptors_per_address: usize,
    /// Worker tasks executing master service handlers.
    pub num_service_workers: usize,
    /// Capacity of the master service's dispatch queue.
    pub service_queue_length: usize,
    pub service_drain_order: DrainOrder,
    /// A worker whose last heartbeat is older than this is presumed dead.
    pub worker_dead_timeout: Duration,
    pub num_reactors: usize,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            bind_addresses: vec![SocketAddr::from(([0, 0, 0, 0], 7050))],
            num_acceptors_per_address: 1,
            num_service_workers: 4,
            service_queue_length: 50,
            service_drain_order: DrainOrder::NewestFirst,
            worker_dead_timeout: Duration::from_secs(60),
            num_reactors: 4,
        }
    }
}

/// The cluster master: accepts worker connections and tracks membership
/// through the heartbeat service.
pub struct Master {
    messenger: Messenger,
    manager: Arc<WorkerManager>,
    service_pool: Arc<ServicePool>,
    bound_addresses: Vec<SocketAddr>,
}

impl Master {
    pub async fn start(options: MasterOptions) -> Result<Master> {
        let messenger = MessengerBuilder::new("master")
            .set_num_reactors(options.num_reactors)
            .build();
        let manager = Arc::new(WorkerManager::new(options.worker_dead_timeout));

        let service_pool = ServicePool::new(
            Arc::new(MasterService::new(manager.clone())),
            ServicePoolOptions {
                num_workers: options.num_service_workers,
                queue_len: options.service_queue_length,
                drain_order: options.service_drain_order,
            },
        );
        service_pool.start().await;
        messenger
            .register_service(MASTER_SERVICE, service_pool.clone())
            .await?;

        let mut bound_addresses = Vec::with_capacity(options.bind_addresses.len());
        for addr in &options.bind_addresses {
            bound_addresses.push(
                messenger
                    .add_acceptor_pool(*addr, options.num_acceptors_per_address)
                    .await?,
            );
        }
        info!("master serving on {:?}", bound_addresses);

        Ok(Master {
            messenger,
            manager,
            service_pool,
            bound_addresses,
        })
    }

    pub fn worker_manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn bound_addresses(&self) -> &[SocketAddr] {
        &self.bound_addresses
    }

    /// Calls the master service rejected because its queue was full.
    pub fn service_queue_overflows(&self) -> u64 {
        self.service_pool.queue_overflows()
    }

    pub async fn shutdown(&self) {
        self.messenger.shutdown().await;
    }
}
