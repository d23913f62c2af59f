//! Process-wide registry of worker descriptors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gridrpc_core::{Result, RpcError};
use tokio::sync::RwLock;
use tracing::info;

use crate::proto::{WorkerInstance, WorkerLoad, WorkerRegistration};
use crate::worker_descriptor::WorkerDescriptor;

/// Registry of [`WorkerDescriptor`] keyed by permanent UUID, behind a
/// reader-writer lock: heartbeat lookups are frequent and concurrent,
/// registrations are rare writes.
pub struct WorkerManager {
    workers: RwLock<HashMap<String, Arc<WorkerDescriptor>>>,
    dead_threshold: Duration,
}

impl WorkerManager {
    pub fn new(dead_threshold: Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            dead_threshold,
        }
    }

    pub fn dead_threshold(&self) -> Duration {
        self.dead_threshold
    }

    /// Look up the descriptor for a heartbeat-only update. Both the UUID
    /// and the sequence number must match what is registered; a mismatch
    /// signals the caller to re-register.
    pub async fn lookup_worker(&self, instance: &WorkerInstance) -> Result<Arc<WorkerDescriptor>> {
        let desc = {
            let workers = self.workers.read().await;
            workers.get(&instance.permanent_uuid).cloned()
        };
        let desc = desc.ok_or_else(|| {
            RpcError::NotFound(format!("unknown worker {}", instance.permanent_uuid))
        })?;
        if desc.latest_seqno().await != instance.instance_seqno {
            return Err(RpcError::NotFound(format!(
                "mismatched instance sequence number {} for worker {}",
                instance.instance_seqno, instance.permanent_uuid
            )));
        }
        Ok(desc)
    }

    pub async fn lookup_by_uuid(&self, uuid: &str) -> Option<Arc<WorkerDescriptor>> {
        self.workers.read().await.get(uuid).cloned()
    }

    /// Create or update the descriptor for a heartbeat that carries
    /// registration info.
    pub async fn register_worker(
        &self,
        instance: &WorkerInstance,
        registration: &WorkerRegistration,
        load: &WorkerLoad,
    ) -> Result<Arc<WorkerDescriptor>> {
        let mut workers = self.workers.write().await;
        match workers.get(&instance.permanent_uuid) {
            None => {
                let desc = Arc::new(WorkerDescriptor::new(instance.permanent_uuid.clone()));
                desc.register(instance, registration, load).await?;
                workers.insert(instance.permanent_uuid.clone(), desc.clone());
                info!("registered new worker: {}", desc.summary().await);
                Ok(desc)
            }
            Some(found) => {
                let desc = found.clone();
                desc.register(instance, registration, load).await?;
                info!("re-registered known worker: {}", desc.summary().await);
                Ok(desc)
            }
        }
    }

    pub async fn all_descriptors(&self) -> Vec<Arc<WorkerDescriptor>> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Descriptors whose last heartbeat is within the dead threshold.
    pub async fn live_descriptors(&self) -> Vec<Arc<WorkerDescriptor>> {
        let all = self.all_descriptors().await;
        let mut live = Vec::with_capacity(all.len());
        for desc in all {
            if !desc.presumed_dead(self.dead_threshold).await {
                live.push(desc);
            }
        }
        live
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HostPort;

    fn instance(uuid: &str, seqno: i64) -> WorkerInstance {
        WorkerInstance {
            permanent_uuid: uuid.to_string(),
            instance_seqno: seqno,
        }
    }

    fn registration(port: u16) -> WorkerRegistration {
        WorkerRegistration {
            rpc_addresses: vec![HostPort::new("10.0.0.1", port)],
            http_addresses: vec![HostPort::new("10.0.0.1", 8051)],
            software_version: "gridrpc 0.1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = WorkerManager::new(Duration::from_secs(60));
        manager
            .register_worker(&instance("w1", 1), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        assert_eq!(manager.count().await, 1);

        let desc = manager.lookup_worker(&instance("w1", 1)).await.unwrap();
        assert_eq!(desc.permanent_uuid(), "w1");
        assert!(manager.lookup_by_uuid("w1").await.is_some());
    }

    #[tokio::test]
    async fn test_lookup_unknown_uuid_is_not_found() {
        let manager = WorkerManager::new(Duration::from_secs(60));
        let err = manager.lookup_worker(&instance("w1", 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_lookup_with_mismatched_seqno_is_not_found() {
        let manager = WorkerManager::new(Duration::from_secs(60));
        manager
            .register_worker(&instance("w1", 2), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        let err = manager.lookup_worker(&instance("w1", 1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_registration_leaves_descriptor_unchanged() {
        let manager = WorkerManager::new(Duration::from_secs(60));
        manager
            .register_worker(&instance("w1", 5), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();

        let err = manager
            .register_worker(&instance("w1", 4), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::AlreadyPresent(_)));

        let desc = manager.lookup_by_uuid("w1").await.unwrap();
        assert_eq!(desc.latest_seqno().await, 5);
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_live_descriptors_filters_presumed_dead() {
        let manager = WorkerManager::new(Duration::from_secs(60));
        manager
            .register_worker(&instance("w1", 1), &registration(7050), &WorkerLoad::default())
            .await
            .unwrap();
        manager
            .register_worker(&instance("w2", 1), &registration(7060), &WorkerLoad::default())
            .await
            .unwrap();

        let stale = manager.lookup_by_uuid("w2").await.unwrap();
        stale.rewind_heartbeat(Duration::from_secs(61)).await;

        let live = manager.live_descriptors().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].permanent_uuid(), "w1");
        assert_eq!(manager.all_descriptors().await.len(), 2);
    }
}
