//! Master-side bookkeeping record for one worker process.

use std::collections::HashSet;
use std::time::Duration;

use gridrpc_core::{Result, RpcError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::proto::{HostPort, WorkerInstance, WorkerLoad, WorkerRegistration};

/// Registration and liveness state for one worker, keyed by its permanent
/// UUID. Created on first successful registration, mutated in place on
/// every heartbeat, never explicitly destroyed — a worker is logically
/// dead once its last heartbeat is older than the configured threshold.
#[derive(Debug)]
pub struct WorkerDescriptor {
    permanent_uuid: String,
    state: Mutex<DescriptorState>,
}

#[derive(Debug)]
struct DescriptorState {
    latest_seqno: i64,
    last_heartbeat: Instant,
    registration: Option<WorkerRegistration>,
    load: WorkerLoad,
}

fn host_port_sets_equal(a: &[HostPort], b: &[HostPort]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let a: HashSet<&HostPort> = a.iter().collect();
    let b: HashSet<&HostPort> = b.iter().collect();
    a == b
}

impl WorkerDescriptor {
    pub(crate) fn new(permanent_uuid: String) -> Self {
        Self {
            permanent_uuid,
            state: Mutex::new(DescriptorState {
                latest_seqno: -1,
                last_heartbeat: Instant::now(),
                registration: None,
                load: WorkerLoad::default(),
            }),
        }
    }

    pub fn permanent_uuid(&self) -> &str {
        &self.permanent_uuid
    }

    /// Apply a (re-)registration.
    ///
    /// A worker may not change its advertised host/port set across
    /// re-registrations; a lower sequence number than the stored one is a
    /// stale retry from a previous process; an equal one is an idempotent
    /// retry of the current registration.
    pub async fn register(
        &self,
        instance: &WorkerInstance,
        registration: &WorkerRegistration,
        load: &WorkerLoad,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(existing) = &state.registration {
            if !host_port_sets_equal(&existing.rpc_addresses, &registration.rpc_addresses)
                || !host_port_sets_equal(&existing.http_addresses, &registration.http_addresses)
            {
                let msg = format!(
                    "worker {} attempted to re-register with a different host/port set; \
                     this is not supported (old: {:?}, new: {:?})",
                    self.permanent_uuid, existing.rpc_addresses, registration.rpc_addresses
                );
                warn!("{}", msg);
                return Err(RpcError::InvalidArgument(msg));
            }
        }

        if registration.rpc_addresses.is_empty() || registration.http_addresses.is_empty() {
            return Err(RpcError::InvalidArgument(format!(
                "invalid registration for worker {}: must have at least one RPC and one HTTP address",
                self.permanent_uuid
            )));
        }

        if instance.instance_seqno < state.latest_seqno {
            return Err(RpcError::AlreadyPresent(format!(
                "cannot register worker {} with sequence number {}: already have a registration \
                 from sequence number {}",
                self.permanent_uuid, instance.instance_seqno, state.latest_seqno
            )));
        } else if instance.instance_seqno == state.latest_seqno {
            info!(
                "processing retry of worker registration from {}",
                self.permanent_uuid
            );
        }

        state.latest_seqno = instance.instance_seqno;
        state.registration = Some(registration.clone());
        state.load = *load;
        Ok(())
    }

    pub async fn update_heartbeat_time(&self) {
        self.state.lock().await.last_heartbeat = Instant::now();
    }

    pub async fn update_load(&self, load: &WorkerLoad) {
        self.state.lock().await.load = *load;
    }

    pub async fn time_since_heartbeat(&self) -> Duration {
        let state = self.state.lock().await;
        state.last_heartbeat.elapsed()
    }

    /// Derived liveness predicate: recomputed on demand, never stored.
    pub async fn presumed_dead(&self, threshold: Duration) -> bool {
        self.time_since_heartbeat().await >= threshold
    }

    pub async fn latest_seqno(&self) -> i64 {
        self.state.lock().await.latest_seqno
    }

    pub async fn registration(&self) -> Option<WorkerRegistration> {
        self.state.lock().await.registration.clone()
    }

    pub async fn load(&self) -> WorkerLoad {
        self.state.lock().await.load
    }

    /// One-line description for logs.
    pub async fn summary(&self) -> String {
        let state = self.state.lock().await;
        match state
            .registration
            .as_ref()
            .and_then(|r| r.rpc_addresses.first())
        {
            Some(addr) => format!(
                "{} ({}) seqno {}",
                self.permanent_uuid, addr, state.latest_seqno
            ),
            None => format!("{} (unregistered)", self.permanent_uuid),
        }
    }

    #[cfg(test)]
    pub(crate) async fn rewind_heartbeat(&self, age: Duration) {
        self.state.lock().await.last_heartbeat = Instant::now() - age;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(seqno: i64) -> WorkerInstance {
        WorkerInstance {
            permanent_uuid: "worker-1".to_string(),
            instance_seqno: seqno,
        }
    }

    fn registration(rpc_port: u16) -> WorkerRegistration {
        WorkerRegistration {
            rpc_addresses: vec![HostPort::new("10.0.0.1", rpc_port)],
            http_addresses: vec![HostPort::new("10.0.0.1", 8051)],
            software_version: "gridrpc 0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_registration() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        desc.register(&instance(5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        assert_eq!(desc.latest_seqno().await, 5);
        assert_eq!(
            desc.registration().await.unwrap().rpc_addresses,
            vec![HostPort::new("10.0.0.1", 7050)]
        );
    }

    #[tokio::test]
    async fn test_registration_requires_rpc_and_http_addresses() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        let mut reg = registration(7050);
        reg.http_addresses.clear();
        let err = desc
            .register(&instance(1), &reg, &WorkerLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));

        let mut reg = registration(7050);
        reg.rpc_addresses.clear();
        let err = desc
            .register(&instance(1), &reg, &WorkerLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_stale_seqno_rejected_and_state_unchanged() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        desc.register(&instance(5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();

        let err = desc
            .register(&instance(4), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyPresent(_)));
        assert_eq!(desc.latest_seqno().await, 5);
    }

    #[tokio::test]
    async fn test_equal_seqno_accepted_as_retry() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        desc.register(&instance(5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        desc.register(&instance(5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        assert_eq!(desc.latest_seqno().await, 5);
    }

    #[tokio::test]
    async fn test_changed_host_port_set_rejected() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        desc.register(&instance(5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();

        let err = desc
            .register(&instance(6), &registration(7051), &WorkerLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
        assert_eq!(desc.latest_seqno().await, 5);
    }

    #[tokio::test]
    async fn test_host_port_order_does_not_matter() {
        let desc = WorkerDescriptor::new("worker-1".to_string());
        let mut reg = registration(7050);
        reg.rpc_addresses.push(HostPort::new("10.0.0.2", 7050));
        desc.register(&instance(1), &reg, &WorkerLoad::default())
            .await
            .unwrap();

        let mut reordered = reg.clone();
        reordered.rpc_addresses.reverse();
        desc.register(&instance(2), &reordered, &WorkerLoad::default())
            .await
            .unwrap();
        assert_eq!(desc.latest_seqno().await, 2);
    }

    #[tokio::test]
    async fn test_presumed_dead_threshold() {
        let threshold = Duration::from_secs(60);
        let desc = WorkerDescriptor::new("worker-1".to_string());
        desc.register(&instance(1), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();

        desc.rewind_heartbeat(Duration::from_secs(59)).await;
        assert!(!desc.presumed_dead(threshold).await);

        desc.rewind_heartbeat(Duration::from_secs(61)).await;
        assert!(desc.presumed_dead(threshold).await);
    }
}
