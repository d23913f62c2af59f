//! Client-side call objects and the service proxy.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Result, RpcError};
use crate::message::RemoteMethod;
use crate::messenger::Messenger;

/// Lifecycle of one outbound call attempt. Terminal states are reported
/// through the call's reply channel; the in-flight states are tracked for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ready,
    OnOutboundQueue,
    Sent,
    TimedOut,
    FinishedError,
    FinishedSuccess,
}

/// A successful call result: response body plus any sidecar blocks.
#[derive(Debug)]
pub struct CallReply {
    pub body: Bytes,
    pub sidecars: Vec<Bytes>,
}

/// Client-side representation of one RPC attempt, handed to a connection
/// driver which assigns the call ID, writes the frame, and resolves `reply`.
pub(crate) struct OutboundCall {
    pub(crate) method: RemoteMethod,
    pub(crate) body: Bytes,
    pub(crate) sidecars: Vec<Bytes>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) state: CallState,
    pub(crate) reply: oneshot::Sender<Result<CallReply>>,
}

impl OutboundCall {
    pub(crate) fn fail(self, err: RpcError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Handle for issuing calls to one service on one remote address.
///
/// The proxy is cheap to clone and holds no connection state itself; the
/// messenger routes each call onto the reactor owning the connection to
/// `remote`, establishing it on first use.
#[derive(Clone)]
pub struct Proxy {
    messenger: Messenger,
    remote: SocketAddr,
    service: String,
}

impl Proxy {
    pub fn new(messenger: Messenger, remote: SocketAddr, service: impl Into<String>) -> Self {
        Self {
            messenger,
            remote,
            service: service.into(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    /// Issue a single call attempt and wait for its completion.
    ///
    /// The timeout, when set, is armed as a per-call timer on the owning
    /// connection; firing fails only this call, never the connection.
    pub async fn call(
        &self,
        method: &str,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<CallReply> {
        self.call_with_sidecars(method, body, Vec::new(), timeout)
            .await
    }

    pub async fn call_with_sidecars(
        &self,
        method: &str,
        body: Bytes,
        sidecars: Vec<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<CallReply> {
        let (tx, rx) = oneshot::channel();
        let call = OutboundCall {
            method: RemoteMethod::new(self.service.clone(), method),
            body,
            sidecars,
            deadline: timeout.map(|t| Instant::now() + t),
            state: CallState::Ready,
            reply: tx,
        };
        self.messenger.queue_outbound_call(self.remote, call);
        match rx.await {
            Ok(result) => result,
            // The driver went away without resolving the call.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}
