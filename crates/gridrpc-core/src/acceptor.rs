//! Accept loops feeding new sockets to the messenger.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::messenger::MessengerCore;

/// A set of accept tasks bound to one address. Accepted sockets get
/// `TCP_NODELAY` set and are handed to the messenger, which assigns each to
/// a reactor.
pub(crate) struct AcceptorPool {
    bind_address: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    connections_accepted: Arc<AtomicU64>,
}

pub(crate) async fn start(
    messenger: Weak<MessengerCore>,
    addr: SocketAddr,
    num_acceptors: usize,
) -> Result<AcceptorPool> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RpcError::Network(format!("failed to bind to {}: {}", addr, e)))?;
    let bind_address = listener
        .local_addr()
        .map_err(|e| RpcError::Network(format!("failed to get bound address: {}", e)))?;
    let listener = Arc::new(listener);
    let (shutdown_tx, _) = watch::channel(false);
    let connections_accepted = Arc::new(AtomicU64::new(0));

    let tasks = (0..num_acceptors.max(1))
        .map(|_| {
            let listener = listener.clone();
            let messenger = messenger.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let accepted = connections_accepted.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        result = listener.accept() => match result {
                            Ok((stream, remote)) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!(
                                        "failed to set TCP_NODELAY on socket from {}: {}",
                                        remote, e
                                    );
                                    continue;
                                }
                                accepted.fetch_add(1, Ordering::Relaxed);
                                let Some(core) = messenger.upgrade() else { break };
                                core.register_inbound_socket(stream, remote);
                            }
                            Err(e) => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                                warn!("accept on {} failed: {}", bind_address, e);
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        },
                    }
                }
                debug!("acceptor on {} shutting down", bind_address);
            })
        })
        .collect();

    Ok(AcceptorPool {
        bind_address,
        shutdown_tx,
        tasks,
        connections_accepted,
    })
}

impl AcceptorPool {
    pub(crate) fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    pub(crate) fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub(crate) async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
