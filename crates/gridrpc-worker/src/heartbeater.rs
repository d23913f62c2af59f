//! Worker-side heartbeat tasks, one per configured master.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gridrpc_core::{Messenger, Proxy, Result, RpcError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridrpc_master::proto::{
    HeartbeatRequest, HeartbeatResponse, HostPort, PingRequest, WorkerInstance,
    WorkerRegistration, MASTER_SERVICE, METHOD_PING, METHOD_WORKER_HEARTBEAT,
};

use crate::load::LoadTracker;

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    /// Interval between heartbeats once registered.
    pub interval: Duration,
    /// Timeout for each heartbeat (and ping) RPC.
    pub rpc_timeout: Duration,
    /// Consecutive failures after which fast re-registration attempts back
    /// off to the normal interval, to avoid hammering an unreachable
    /// master.
    pub max_failures_before_backoff: u32,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(15),
            max_failures_before_backoff: 3,
        }
    }
}

/// Periodic reporting to every configured master: one sub-task per master
/// address, each owning its own proxy and registration state.
pub struct Heartbeater {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Heartbeater {
    pub(crate) fn start(
        masters: &[HostPort],
        options: HeartbeatOptions,
        messenger: Messenger,
        instance: WorkerInstance,
        registration: WorkerRegistration,
        load: Arc<LoadTracker>,
    ) -> Heartbeater {
        let (shutdown_tx, _) = watch::channel(false);
        let tasks = masters
            .iter()
            .map(|master| {
                let task = HeartbeatTask {
                    master: master.clone(),
                    options: options.clone(),
                    messenger: messenger.clone(),
                    instance: instance.clone(),
                    registration: registration.clone(),
                    load: load.clone(),
                    proxy: None,
                    needs_register: true,
                    consecutive_failures: 0,
                };
                tokio::spawn(run_heartbeat_task(task, shutdown_tx.subscribe()))
            })
            .collect();
        Heartbeater {
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}

struct HeartbeatTask {
    master: HostPort,
    options: HeartbeatOptions,
    messenger: Messenger,
    instance: WorkerInstance,
    registration: WorkerRegistration,
    load: Arc<LoadTracker>,
    /// Lazily established; dropped after network errors or repeated
    /// failures, forcing a reconnect on the next cycle.
    proxy: Option<Proxy>,
    /// Seeded true so the first heartbeat carries the registration.
    needs_register: bool,
    consecutive_failures: u32,
}

impl HeartbeatTask {
    /// Time until the next heartbeat: immediate while a registration is
    /// pending, unless repeated failures have pushed us into backoff.
    fn time_until_next_heartbeat(&self) -> Duration {
        if self.needs_register && self.consecutive_failures < self.options.max_failures_before_backoff
        {
            return Duration::ZERO;
        }
        self.options.interval
    }

    /// (Re-)establish the proxy, validating it with a ping before any real
    /// heartbeat is sent over it.
    async fn connect_to_master(&mut self) -> Result<()> {
        let addr = resolve_master(&self.master)?;
        let proxy = Proxy::new(self.messenger.clone(), addr, MASTER_SERVICE);
        let body = postcard::to_allocvec(&PingRequest::default())?;
        proxy
            .call(METHOD_PING, Bytes::from(body), Some(self.options.rpc_timeout))
            .await?;
        info!("connected to master at {}", self.master);
        self.proxy = Some(proxy);
        Ok(())
    }

    async fn do_heartbeat(&mut self) -> Result<()> {
        if self.proxy.is_none() {
            debug!("no master proxy for {}; connecting", self.master);
            self.connect_to_master().await?;
        }
        let Some(proxy) = self.proxy.as_ref() else {
            return Err(RpcError::Network(format!(
                "no proxy to master {}",
                self.master
            )));
        };

        let mut req = HeartbeatRequest {
            instance: self.instance.clone(),
            registration: None,
            load: self.load.snapshot().await,
        };
        if self.needs_register {
            info!("registering worker with master {}", self.master);
            req.registration = Some(self.registration.clone());
        }

        let body = postcard::to_allocvec(&req)?;
        let reply = proxy
            .call(
                METHOD_WORKER_HEARTBEAT,
                Bytes::from(body),
                Some(self.options.rpc_timeout),
            )
            .await?;
        let resp: HeartbeatResponse = postcard::from_bytes(&reply.body)?;
        self.needs_register = resp.needs_register;
        Ok(())
    }
}

fn resolve_master(master: &HostPort) -> Result<std::net::SocketAddr> {
    let mut addrs = (master.host.as_str(), master.port)
        .to_socket_addrs()
        .map_err(|e| RpcError::Network(format!("failed to resolve {}: {}", master, e)))?;
    let first = addrs
        .next()
        .ok_or_else(|| RpcError::Network(format!("{} resolved to no addresses", master)))?;
    if addrs.next().is_some() {
        warn!("master address {} resolves to multiple addresses; using {}", master, first);
    }
    Ok(first)
}

async fn run_heartbeat_task(mut task: HeartbeatTask, mut shutdown_rx: watch::Receiver<bool>) {
    debug!("heartbeat task for master {} starting", task.master);
    loop {
        let wait = task.time_until_next_heartbeat();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => {
                debug!("heartbeat task for master {} stopping", task.master);
                return;
            }
        }

        match task.do_heartbeat().await {
            Ok(()) => {
                task.consecutive_failures = 0;
            }
            Err(e) => {
                warn!("failed to heartbeat to {}: {}", task.master, e);
                task.consecutive_failures += 1;
                if task.consecutive_failures == task.options.max_failures_before_backoff {
                    warn!(
                        "failed {} heartbeats to {} in a row; no longer allowing fast attempts",
                        task.consecutive_failures, task.master
                    );
                }
                if e.is_network()
                    || task.consecutive_failures >= task.options.max_failures_before_backoff
                {
                    task.proxy = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrpc_core::MessengerBuilder;

    fn task_with(needs_register: bool, failures: u32) -> HeartbeatTask {
        HeartbeatTask {
            master: HostPort::new("127.0.0.1", 7050),
            options: HeartbeatOptions::default(),
            messenger: MessengerBuilder::new("test").build(),
            instance: WorkerInstance {
                permanent_uuid: "w".to_string(),
                instance_seqno: 1,
            },
            registration: WorkerRegistration {
                rpc_addresses: vec![HostPort::new("127.0.0.1", 7060)],
                http_addresses: vec![HostPort::new("127.0.0.1", 8051)],
                software_version: "gridrpc 0.1.0".to_string(),
            },
            load: Arc::new(LoadTracker::new()),
            proxy: None,
            needs_register,
            consecutive_failures: failures,
        }
    }

    #[tokio::test]
    async fn test_pending_registration_heartbeats_immediately() {
        let task = task_with(true, 0);
        assert_eq!(task.time_until_next_heartbeat(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_registered_worker_uses_normal_interval() {
        let task = task_with(false, 0);
        assert_eq!(
            task.time_until_next_heartbeat(),
            HeartbeatOptions::default().interval
        );
    }

    #[tokio::test]
    async fn test_repeated_failures_back_off_fast_registration() {
        let backoff = HeartbeatOptions::default().max_failures_before_backoff;
        let task = task_with(true, backoff - 1);
        assert_eq!(task.time_until_next_heartbeat(), Duration::ZERO);

        let task = task_with(true, backoff);
        assert_eq!(
            task.time_until_next_heartbeat(),
            HeartbeatOptions::default().interval
        );
    }

    #[test]
    fn test_resolve_master_literal_address() {
        let addr = resolve_master(&HostPort::new("127.0.0.1", 7050)).unwrap();
        assert_eq!(addr, "127.0.0.1:7050".parse().unwrap());
    }
}
