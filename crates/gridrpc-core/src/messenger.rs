//! The messenger: top-level handle owning reactors, registered services,
//! and acceptor pools.
//!
//! # Ownership
//!
//! `Messenger` is a cheap clone around an `Arc` core. Reactor tasks,
//! connection drivers, and acceptor tasks hold only `Weak` references to the
//! core, so dropping every external handle lets the whole fabric wind down
//! without a task ever joining itself; calling [`Messenger::shutdown`]
//! tears it down deterministically instead — acceptors stop, service pools
//! drain their queues with explicit error responses, and every reactor
//! closes its connections.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::acceptor::{self, AcceptorPool};
use crate::error::{Result, RpcError};
use crate::message::{ErrorStatus, RemoteErrorCode};
use crate::proxy::OutboundCall;
use crate::reactor::{self, ReactorCommand, ReactorHandle};
use crate::service::InboundCall;
use crate::service_pool::ServicePool;

/// Builds a [`Messenger`].
///
/// # Example
///
/// ```no_run
/// use gridrpc_core::MessengerBuilder;
///
/// let messenger = MessengerBuilder::new("master")
///     .set_num_reactors(4)
///     .set_keepalive(std::time::Duration::from_secs(65))
///     .build();
/// ```
pub struct MessengerBuilder {
    name: String,
    num_reactors: usize,
    keepalive: Duration,
    sweep_granularity: Duration,
}

impl MessengerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_reactors: 4,
            keepalive: Duration::from_secs(65),
            sweep_granularity: Duration::from_millis(500),
        }
    }

    /// Number of reactor tasks. Each owns a disjoint subset of connections,
    /// assigned by hashing the remote address.
    pub fn set_num_reactors(mut self, num_reactors: usize) -> Self {
        self.num_reactors = num_reactors.max(1);
        self
    }

    /// Idle window after which a quiescent connection is proactively closed.
    pub fn set_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Granularity of the reactors' idle-sweep timer.
    pub fn set_sweep_granularity(mut self, granularity: Duration) -> Self {
        self.sweep_granularity = granularity;
        self
    }

    pub fn build(self) -> Messenger {
        let MessengerBuilder {
            name,
            num_reactors,
            keepalive,
            sweep_granularity,
        } = self;
        let core = Arc::new_cyclic(|weak: &Weak<MessengerCore>| {
            let reactors = (0..num_reactors)
                .map(|i| reactor::spawn_reactor(i, weak.clone(), keepalive, sweep_granularity))
                .collect();
            MessengerCore {
                name,
                reactors,
                services: RwLock::new(HashMap::new()),
                acceptors: Mutex::new(Vec::new()),
                closing: AtomicBool::new(false),
                next_delayed_reactor: AtomicUsize::new(0),
            }
        });
        Messenger { core }
    }
}

/// Top-level handle for one process's RPC fabric.
#[derive(Clone)]
pub struct Messenger {
    core: Arc<MessengerCore>,
}

pub(crate) struct MessengerCore {
    name: String,
    reactors: Vec<ReactorHandle>,
    services: RwLock<HashMap<String, Arc<ServicePool>>>,
    acceptors: Mutex<Vec<AcceptorPool>>,
    closing: AtomicBool,
    next_delayed_reactor: AtomicUsize,
}

impl Messenger {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn num_reactors(&self) -> usize {
        self.core.reactors.len()
    }

    pub fn is_closing(&self) -> bool {
        self.core.closing.load(Ordering::Relaxed)
    }

    /// Bind `addr` and start `num_acceptors` accept tasks feeding it.
    /// Returns the actual bound address (useful with port 0).
    pub async fn add_acceptor_pool(
        &self,
        addr: SocketAddr,
        num_acceptors: usize,
    ) -> Result<SocketAddr> {
        if self.is_closing() {
            return Err(RpcError::Shutdown);
        }
        let pool = acceptor::start(Arc::downgrade(&self.core), addr, num_acceptors).await?;
        let bound = pool.bind_address();
        self.core.acceptors.lock().await.push(pool);
        info!("messenger {}: listening on {}", self.core.name, bound);
        Ok(bound)
    }

    /// Total connections accepted across all acceptor pools.
    pub async fn connections_accepted(&self) -> u64 {
        let acceptors = self.core.acceptors.lock().await;
        acceptors.iter().map(|a| a.connections_accepted()).sum()
    }

    /// Register a service pool under `name`. Inbound calls carrying that
    /// service name are routed to it.
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        pool: Arc<ServicePool>,
    ) -> Result<()> {
        if self.is_closing() {
            return Err(RpcError::Shutdown);
        }
        let name = name.into();
        let mut services = self.core.services.write().await;
        if services.contains_key(&name) {
            return Err(RpcError::AlreadyPresent(format!(
                "service {} is already registered",
                name
            )));
        }
        services.insert(name, pool);
        Ok(())
    }

    pub async fn unregister_service(&self, name: &str) -> Result<Arc<ServicePool>> {
        self.core
            .services
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RpcError::NotFound(format!("service {} is not registered", name)))
    }

    /// Hand an outbound call to the reactor owning the connection to
    /// `remote`. Never blocks; failures are delivered on the call's reply
    /// channel.
    pub(crate) fn queue_outbound_call(&self, remote: SocketAddr, call: OutboundCall) {
        if self.is_closing() {
            call.fail(RpcError::Shutdown);
            return;
        }
        let reactor = self.core.reactor_for(remote);
        if let Err(cmd) = reactor.send(ReactorCommand::AssignCall { remote, call }) {
            if let ReactorCommand::AssignCall { call, .. } = cmd {
                call.fail(RpcError::Shutdown);
            }
        }
    }

    /// Run `f` on a reactor task after `delay`. Used by the retrier for
    /// backoff. If the messenger is shutting down, `f` is dropped; waiters
    /// observe that as a dropped channel.
    pub fn schedule_on_reactor(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        if self.is_closing() {
            return;
        }
        let index = self.core.next_delayed_reactor.fetch_add(1, Ordering::Relaxed)
            % self.core.reactors.len();
        let _ = self.core.reactors[index].send(ReactorCommand::ScheduleDelayed {
            when: Instant::now() + delay,
            f: Box::new(f),
        });
    }

    /// Stop accepting, drain every registered service pool, and close all
    /// connections. Idempotent.
    pub async fn shutdown(&self) {
        if self.core.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("messenger {}: shutting down", self.core.name);

        let mut acceptors = self.core.acceptors.lock().await;
        for pool in acceptors.iter_mut() {
            pool.shutdown().await;
        }
        acceptors.clear();
        drop(acceptors);

        let services: Vec<_> = self.core.services.write().await.drain().collect();
        for (_, pool) in services {
            pool.shutdown().await;
        }

        for reactor in &self.core.reactors {
            let _ = reactor.send(ReactorCommand::Shutdown);
        }
    }
}

impl MessengerCore {
    fn reactor_for(&self, remote: SocketAddr) -> &ReactorHandle {
        let mut hasher = DefaultHasher::new();
        remote.hash(&mut hasher);
        &self.reactors[(hasher.finish() as usize) % self.reactors.len()]
    }

    /// Called by acceptor tasks with a freshly accepted socket.
    pub(crate) fn register_inbound_socket(&self, stream: TcpStream, remote: SocketAddr) {
        let _ = self
            .reactor_for(remote)
            .send(ReactorCommand::RegisterInbound { stream, remote });
    }

    /// Called by server connection drivers with a parsed inbound call;
    /// routes it to the registered service pool by service name.
    pub(crate) async fn route_inbound(&self, call: InboundCall) {
        let pool = {
            let services = self.services.read().await;
            services.get(&call.method().service).cloned()
        };
        match pool {
            Some(pool) => pool.queue_inbound_call(call).await,
            None => {
                warn!("inbound call for unregistered service {}", call.method());
                let message = format!("service {} is not registered", call.method().service);
                call.respond_error_status(ErrorStatus {
                    code: RemoteErrorCode::UnknownService,
                    message,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_defaults() {
        let messenger = MessengerBuilder::new("test").build();
        assert_eq!(messenger.name(), "test");
        assert_eq!(messenger.num_reactors(), 4);
        assert!(!messenger.is_closing());
        messenger.shutdown().await;
        assert!(messenger.is_closing());
    }

    #[tokio::test]
    async fn test_acceptor_pool_rejected_after_shutdown() {
        let messenger = MessengerBuilder::new("test").build();
        messenger.shutdown().await;
        let err = messenger
            .add_acceptor_pool("127.0.0.1:0".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Shutdown));
    }

    #[tokio::test]
    async fn test_duplicate_service_registration_rejected() {
        use crate::service::{InboundCall, ServiceFuture, ServiceIf};

        struct NullService;
        impl ServiceIf for NullService {
            fn service_name(&self) -> &str {
                "NullService"
            }
            fn handle(&self, _call: InboundCall) -> ServiceFuture {
                Box::pin(async {})
            }
        }

        let messenger = MessengerBuilder::new("test").build();
        let pool = ServicePool::new(Arc::new(NullService), Default::default());
        messenger
            .register_service("NullService", pool.clone())
            .await
            .unwrap();
        let err = messenger
            .register_service("NullService", pool)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyPresent(_)));
        messenger.shutdown().await;
    }
}
