//! The master's RPC service: Ping and WorkerHeartbeat.

use std::sync::Arc;

use bytes::Bytes;
use gridrpc_core::{
    InboundCall, RemoteErrorCode, Result, RpcError, ServiceFuture, ServiceIf,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::proto::{
    HeartbeatRequest, HeartbeatResponse, PingResponse, MASTER_SERVICE, METHOD_PING,
    METHOD_WORKER_HEARTBEAT,
};
use crate::worker_manager::WorkerManager;

pub struct MasterService {
    manager: Arc<WorkerManager>,
}

impl MasterService {
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        Self { manager }
    }

    /// Core heartbeat handling, split from dispatch for direct testing.
    ///
    /// A heartbeat carrying registration info registers (or re-registers)
    /// the worker; typed failures are surfaced to the caller. A heartbeat
    /// without registration from an unknown or stale instance is answered
    /// with `needs_register = true` rather than an error, telling the
    /// worker to re-register on its next cycle.
    pub(crate) async fn handle_heartbeat(
        manager: &WorkerManager,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let desc = if let Some(registration) = &req.registration {
            match manager
                .register_worker(&req.instance, registration, &req.load)
                .await
            {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(
                        "unable to register worker {}: {}",
                        req.instance.permanent_uuid, e
                    );
                    return Err(e);
                }
            }
        } else {
            match manager.lookup_worker(&req.instance).await {
                Ok(desc) => desc,
                Err(e) if e.is_not_found() => {
                    info!(
                        "heartbeat from unknown worker {} (seqno {}); asking it to re-register",
                        req.instance.permanent_uuid, req.instance.instance_seqno
                    );
                    return Ok(HeartbeatResponse {
                        needs_register: true,
                    });
                }
                Err(e) => {
                    warn!(
                        "unable to look up worker {} for heartbeat: {}",
                        req.instance.permanent_uuid, e
                    );
                    return Err(e);
                }
            }
        };

        desc.update_heartbeat_time().await;
        desc.update_load(&req.load).await;
        Ok(HeartbeatResponse::default())
    }
}

fn respond_message<T: Serialize>(call: InboundCall, message: &T) {
    match postcard::to_allocvec(message) {
        Ok(body) => call.respond_success(Bytes::from(body)),
        Err(e) => call.respond_failure(&RpcError::Serialization(e)),
    }
}

impl ServiceIf for MasterService {
    fn service_name(&self) -> &str {
        MASTER_SERVICE
    }

    fn handle(&self, call: InboundCall) -> ServiceFuture {
        let manager = self.manager.clone();
        Box::pin(async move {
            let method = call.method().method.clone();
            match method.as_str() {
                METHOD_PING => {
                    respond_message(call, &PingResponse::default());
                }
                METHOD_WORKER_HEARTBEAT => {
                    let req: HeartbeatRequest = match postcard::from_bytes(call.body()) {
                        Ok(req) => req,
                        Err(e) => {
                            call.respond_failure(&RpcError::InvalidArgument(format!(
                                "malformed heartbeat request: {}",
                                e
                            )));
                            return;
                        }
                    };
                    match MasterService::handle_heartbeat(&manager, req).await {
                        Ok(resp) => respond_message(call, &resp),
                        Err(e) => call.respond_failure(&e),
                    }
                }
                other => {
                    call.respond_failure(&RpcError::Remote {
                        code: RemoteErrorCode::UnknownMethod,
                        message: format!("unknown method {}", other),
                    });
                }
            }
        })
    }
}
