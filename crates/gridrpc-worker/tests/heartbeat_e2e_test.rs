//! Full-loop membership test: a real master and a real worker, joined only
//! by the heartbeat protocol over the wire.

use std::time::Duration;

use gridrpc_master::proto::HostPort;
use gridrpc_master::{Master, MasterOptions};
use gridrpc_worker::{HeartbeatOptions, WorkerOptions, WorkerServer};

async fn start_master(dead_timeout: Duration) -> Master {
    Master::start(MasterOptions {
        bind_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        worker_dead_timeout: dead_timeout,
        ..MasterOptions::default()
    })
    .await
    .unwrap()
}

fn worker_options(master: &Master) -> WorkerOptions {
    let addr = master.bound_addresses()[0];
    WorkerOptions {
        master_addresses: vec![HostPort::new(addr.ip().to_string(), addr.port())],
        bind_address: "127.0.0.1:0".parse().unwrap(),
        http_address: HostPort::new("127.0.0.1", 8051),
        heartbeat: HeartbeatOptions {
            interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(5),
            max_failures_before_backoff: 3,
        },
        ..WorkerOptions::default()
    }
}

async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_worker_registers_and_stays_live() {
    let master = start_master(Duration::from_secs(60)).await;
    let worker = WorkerServer::start(worker_options(&master)).await.unwrap();

    let manager = master.worker_manager().clone();
    wait_for("worker registration", || {
        let manager = manager.clone();
        async move { manager.count().await == 1 }
    })
    .await;

    let desc = manager
        .lookup_by_uuid(&worker.instance().permanent_uuid)
        .await
        .expect("worker should be registered under its UUID");
    assert_eq!(desc.latest_seqno().await, worker.instance().instance_seqno);
    let registration = desc.registration().await.unwrap();
    assert_eq!(
        registration.rpc_addresses,
        worker.registration().rpc_addresses
    );
    assert!(!desc.presumed_dead(Duration::from_secs(60)).await);
    assert_eq!(manager.live_descriptors().await.len(), 1);

    worker.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_heartbeats_keep_refreshing_the_descriptor() {
    let master = start_master(Duration::from_secs(60)).await;
    let worker = WorkerServer::start(worker_options(&master)).await.unwrap();

    let manager = master.worker_manager().clone();
    wait_for("worker registration", || {
        let manager = manager.clone();
        async move { manager.count().await == 1 }
    })
    .await;

    // Load changes propagate through subsequent heartbeats.
    worker.load().task_started();
    worker.load().task_started();

    let uuid = worker.instance().permanent_uuid.clone();
    let manager = master.worker_manager().clone();
    wait_for("load snapshot to propagate", || {
        let manager = manager.clone();
        let uuid = uuid.clone();
        async move {
            match manager.lookup_by_uuid(&uuid).await {
                Some(desc) => desc.load().await.pending_tasks == 2,
                None => false,
            }
        }
    })
    .await;

    // The descriptor stays fresh while heartbeats flow.
    let desc = manager.lookup_by_uuid(&uuid).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(desc.time_since_heartbeat().await < Duration::from_secs(1));

    worker.shutdown().await;
    master.shutdown().await;
}

#[tokio::test]
async fn test_stopped_worker_goes_presumed_dead() {
    // A tight dead threshold so the test can observe the transition.
    let master = start_master(Duration::from_millis(400)).await;
    let worker = WorkerServer::start(worker_options(&master)).await.unwrap();

    let manager = master.worker_manager().clone();
    wait_for("worker registration", || {
        let manager = manager.clone();
        async move { manager.count().await == 1 }
    })
    .await;
    assert_eq!(manager.live_descriptors().await.len(), 1);

    worker.shutdown().await;

    let manager = master.worker_manager().clone();
    wait_for("worker to be presumed dead", || {
        let manager = manager.clone();
        async move { manager.live_descriptors().await.is_empty() }
    })
    .await;
    // The descriptor itself is never destroyed.
    assert_eq!(manager.count().await, 1);

    master.shutdown().await;
}

#[tokio::test]
async fn test_worker_started_before_master_eventually_registers() {
    // Reserve an address, then release it so the worker's first heartbeats
    // fail and it goes through its reconnect path.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let worker = WorkerServer::start(WorkerOptions {
        master_addresses: vec![HostPort::new(addr.ip().to_string(), addr.port())],
        bind_address: "127.0.0.1:0".parse().unwrap(),
        http_address: HostPort::new("127.0.0.1", 8051),
        heartbeat: HeartbeatOptions {
            interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(2),
            max_failures_before_backoff: 3,
        },
        ..WorkerOptions::default()
    })
    .await
    .unwrap();

    // Let a few failed cycles pass before the master appears.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let master = Master::start(MasterOptions {
        bind_addresses: vec![addr],
        ..MasterOptions::default()
    })
    .await
    .unwrap();

    let manager = master.worker_manager().clone();
    wait_for("late registration", || {
        let manager = manager.clone();
        async move { manager.count().await == 1 }
    })
    .await;

    worker.shutdown().await;
    master.shutdown().await;
}
