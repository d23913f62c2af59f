//! Load tracking for heartbeat reports.

use std::sync::atomic::{AtomicU64, Ordering};

use gridrpc_master::proto::WorkerLoad;
use tokio::sync::Mutex;

/// Tracks the load figures reported with every heartbeat: a pending-task
/// counter maintained by the task execution layer, plus CPU/memory/disk
/// gauges set by whoever samples them.
pub struct LoadTracker {
    pending_tasks: AtomicU64,
    gauges: Mutex<Gauges>,
}

#[derive(Default, Clone, Copy)]
struct Gauges {
    cpu_load: f64,
    mem_load: f64,
    disk_load: f64,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self {
            pending_tasks: AtomicU64::new(0),
            gauges: Mutex::new(Gauges::default()),
        }
    }

    pub fn task_started(&self) {
        self.pending_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.pending_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending_tasks(&self) -> u64 {
        self.pending_tasks.load(Ordering::Relaxed)
    }

    pub async fn set_gauges(&self, cpu_load: f64, mem_load: f64, disk_load: f64) {
        *self.gauges.lock().await = Gauges {
            cpu_load,
            mem_load,
            disk_load,
        };
    }

    pub async fn snapshot(&self) -> WorkerLoad {
        let gauges = *self.gauges.lock().await;
        WorkerLoad {
            cpu_load: gauges.cpu_load,
            mem_load: gauges.mem_load,
            disk_load: gauges.disk_load,
            pending_tasks: self.pending_tasks(),
        }
    }
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}
