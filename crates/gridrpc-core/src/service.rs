//! Server-side representation of one in-flight RPC and the service trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::connection::{ConnCommand, ConnShared};
use crate::error::RpcError;
use crate::frame;
use crate::message::{ErrorStatus, RemoteMethod, ResponseHeader};

/// Boxed future returned by service dispatch.
pub type ServiceFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A registered RPC service. The service pool's worker tasks invoke
/// `handle` for each dequeued call; the implementation matches on the
/// method name and responds through the call.
pub trait ServiceIf: Send + Sync + 'static {
    fn service_name(&self) -> &str;
    fn handle(&self, call: InboundCall) -> ServiceFuture;
}

/// Server-side representation of one RPC invocation on a connection.
///
/// The parameter bytes are owned views into the received transfer buffer,
/// so they stay valid for the life of the call regardless of what the
/// connection reads next. Responding consumes the call; a call dropped
/// without a response simply releases its connection bookkeeping.
pub struct InboundCall {
    call_id: i32,
    method: RemoteMethod,
    body: Bytes,
    sidecars: Vec<Bytes>,
    deadline: Option<Instant>,
    received_at: Instant,
    handling_started_at: Option<Instant>,
    response_tx: mpsc::UnboundedSender<ConnCommand>,
    conn: Arc<ConnShared>,
}

impl InboundCall {
    pub(crate) fn new(
        call_id: i32,
        method: RemoteMethod,
        body: Bytes,
        sidecars: Vec<Bytes>,
        deadline: Option<Instant>,
        response_tx: mpsc::UnboundedSender<ConnCommand>,
        conn: Arc<ConnShared>,
    ) -> Self {
        conn.inbound_started();
        Self {
            call_id,
            method,
            body,
            sidecars,
            deadline,
            received_at: Instant::now(),
            handling_started_at: None,
            response_tx,
            conn,
        }
    }

    pub fn call_id(&self) -> i32 {
        self.call_id
    }

    pub fn method(&self) -> &RemoteMethod {
        &self.method
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn sidecars(&self) -> &[Bytes] {
        &self.sidecars
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// True once the caller's deadline has already passed; such calls are
    /// not worth handling, the client has given up on them.
    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub(crate) fn mark_handling_started(&mut self) {
        self.handling_started_at = Some(Instant::now());
    }

    pub fn respond_success(self, body: Bytes) {
        self.respond_success_with_sidecars(body, Vec::new());
    }

    pub fn respond_success_with_sidecars(self, body: Bytes, sidecars: Vec<Bytes>) {
        let header = ResponseHeader {
            call_id: self.call_id,
            is_error: false,
            sidecar_lens: sidecars.iter().map(|s| s.len() as u32).collect(),
        };
        self.send_response(header, &body, &sidecars);
    }

    pub fn respond_failure(self, err: &RpcError) {
        self.respond_error_status(ErrorStatus {
            code: err.wire_code(),
            message: err.to_string(),
        });
    }

    pub(crate) fn respond_error_status(self, status: ErrorStatus) {
        let body = match postcard::to_allocvec(&status) {
            Ok(body) => body,
            Err(e) => {
                trace!(call_id = self.call_id, "failed to encode error status: {}", e);
                return;
            }
        };
        let header = ResponseHeader {
            call_id: self.call_id,
            is_error: true,
            sidecar_lens: Vec::new(),
        };
        self.send_response(header, &body, &[]);
    }

    fn send_response(self, header: ResponseHeader, body: &[u8], sidecars: &[Bytes]) {
        match frame::encode_frame(&header, body, sidecars) {
            Ok(buf) => {
                trace!(
                    call_id = self.call_id,
                    queued_us = self
                        .handling_started_at
                        .map(|t| (t - self.received_at).as_micros() as u64),
                    total_us = self.received_at.elapsed().as_micros() as u64,
                    "responding to {}",
                    self.method
                );
                // A closed channel means the connection is already gone;
                // there is nobody left to tell.
                let _ = self.response_tx.send(ConnCommand::Respond { buf });
            }
            Err(e) => {
                trace!(call_id = self.call_id, "failed to encode response: {}", e);
            }
        }
    }
}

impl Drop for InboundCall {
    fn drop(&mut self) {
        self.conn.inbound_finished();
    }
}

impl std::fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCall")
            .field("call_id", &self.call_id)
            .field("method", &self.method)
            .field("body_len", &self.body.len())
            .field("sidecars", &self.sidecars.len())
            .finish()
    }
}
