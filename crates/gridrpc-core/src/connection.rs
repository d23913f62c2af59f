//! Per-socket connection driver: negotiation, framing, call multiplexing.
//!
//! Each connection is owned by exactly one driver task, spawned by the
//! reactor the connection was assigned to. The reactor keeps the canonical
//! table of live connections and talks to a driver only through its command
//! channel; nothing else holds the socket. Within one connection, calls are
//! read and dispatched in arrival order, but responses may complete out of
//! order — the call ID, not arrival order, correlates them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Result, RpcError};
use crate::frame::{self, InboundTransfer};
use crate::message::{
    ErrorStatus, NegotiateHeader, RequestHeader, ResponseHeader, NEGOTIATE_CALL_ID,
    SUPPORTED_FEATURES,
};
use crate::messenger::MessengerCore;
use crate::proxy::{CallReply, CallState, OutboundCall};
use crate::reactor::ReactorCommand;
use crate::service::InboundCall;

/// Timeout for establishing a client connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the negotiation exchange on a new connection.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(10);

/// How far out to park the deadline timer when no call has a deadline.
const TIMER_PARK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    Client,
    Server,
}

/// Commands accepted by a connection driver task.
pub(crate) enum ConnCommand {
    /// Queue an outbound call (client connections only).
    Call(OutboundCall),
    /// Write a pre-serialized response frame (server connections only).
    Respond { buf: Bytes },
    /// Fail everything in flight and close the socket.
    Shutdown(RpcError),
}

/// Connection state shared with the owning reactor for idle sweeps.
pub(crate) struct ConnShared {
    epoch: Instant,
    last_activity_ms: AtomicU64,
    pending_calls: AtomicUsize,
    inbound_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl ConnShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            pending_calls: AtomicUsize::new(0),
            inbound_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn set_pending(&self, n: usize) {
        self.pending_calls.store(n, Ordering::Relaxed);
    }

    pub(crate) fn inbound_started(&self) {
        self.inbound_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inbound_finished(&self) {
        self.inbound_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// A connection is idle when it has no in-flight calls in either
    /// direction and no activity within the keepalive window.
    pub(crate) fn is_idle(&self, keepalive: Duration) -> bool {
        if self.pending_calls.load(Ordering::Relaxed) != 0
            || self.inbound_in_flight.load(Ordering::Relaxed) != 0
        {
            return false;
        }
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last) >= keepalive
    }
}

/// The reactor's handle to one connection driver.
pub(crate) struct ConnHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    pub(crate) shared: Arc<ConnShared>,
}

/// Next sequential call ID, rolling over from `i32::MAX` to 0. Negative
/// IDs are reserved for connection-level traffic and never issued here.
pub(crate) fn advance_call_id(next_call_id: &mut i32) -> i32 {
    let call_id = *next_call_id;
    if *next_call_id == i32::MAX {
        *next_call_id = 0;
    } else {
        *next_call_id += 1;
    }
    call_id
}

struct PendingCall {
    reply: tokio::sync::oneshot::Sender<Result<CallReply>>,
    state: CallState,
}

struct ConnState {
    remote: SocketAddr,
    direction: Direction,
    shared: Arc<ConnShared>,
    messenger: Weak<MessengerCore>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    reactor_tx: mpsc::UnboundedSender<ReactorCommand>,
    pending: HashMap<i32, PendingCall>,
    deadlines: BinaryHeap<Reverse<(Instant, i32)>>,
    next_call_id: i32,
}

pub(crate) fn spawn_server(
    stream: TcpStream,
    remote: SocketAddr,
    messenger: Weak<MessengerCore>,
    reactor_tx: mpsc::UnboundedSender<ReactorCommand>,
) -> ConnHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = ConnShared::new();
    let handle = ConnHandle {
        cmd_tx: cmd_tx.clone(),
        shared: shared.clone(),
    };

    tokio::spawn(async move {
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let mut transfer = InboundTransfer::new();

        if let Err(e) = negotiate_server(&mut reader, &mut writer, &mut transfer).await {
            debug!("negotiation with {} failed: {}", remote, e);
            abort(&shared, cmd_rx, &reactor_tx, remote, Direction::Server, e);
            return;
        }

        let state = ConnState {
            remote,
            direction: Direction::Server,
            shared,
            messenger,
            cmd_tx,
            reactor_tx,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_call_id: 0,
        };
        run(state, reader, writer, cmd_rx, transfer).await;
    });

    handle
}

pub(crate) fn spawn_client(
    remote: SocketAddr,
    messenger: Weak<MessengerCore>,
    reactor_tx: mpsc::UnboundedSender<ReactorCommand>,
) -> ConnHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = ConnShared::new();
    let handle = ConnHandle {
        cmd_tx: cmd_tx.clone(),
        shared: shared.clone(),
    };

    tokio::spawn(async move {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = RpcError::Network(format!("failed to connect to {}: {}", remote, e));
                abort(&shared, cmd_rx, &reactor_tx, remote, Direction::Client, err);
                return;
            }
            Err(_) => {
                let err = RpcError::TimedOut(format!("connecting to {} timed out", remote));
                abort(&shared, cmd_rx, &reactor_tx, remote, Direction::Client, err);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY on connection to {}: {}", remote, e);
        }

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let mut transfer = InboundTransfer::new();

        if let Err(e) = negotiate_client(&mut reader, &mut writer, &mut transfer).await {
            debug!("negotiation with {} failed: {}", remote, e);
            abort(&shared, cmd_rx, &reactor_tx, remote, Direction::Client, e);
            return;
        }

        let state = ConnState {
            remote,
            direction: Direction::Client,
            shared,
            messenger,
            cmd_tx,
            reactor_tx,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_call_id: 0,
        };
        run(state, reader, writer, cmd_rx, transfer).await;
    });

    handle
}

/// Tear down a connection that never finished setup: fail any calls queued
/// while it was connecting and deregister it from the reactor.
fn abort(
    shared: &Arc<ConnShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    reactor_tx: &mpsc::UnboundedSender<ReactorCommand>,
    remote: SocketAddr,
    direction: Direction,
    err: RpcError,
) {
    shared.mark_closed();
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        if let ConnCommand::Call(call) = cmd {
            call.fail(err.replicate());
        }
    }
    let _ = reactor_tx.send(ReactorCommand::ConnClosed { remote, direction });
}

async fn run(
    mut state: ConnState,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    mut transfer: InboundTransfer,
) {
    state.shared.touch();
    let status: RpcError = loop {
        let wake = state
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + TIMER_PARK);
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCommand::Call(call)) => {
                    if let Err(e) = state.send_outbound(&mut writer, call).await {
                        break e;
                    }
                }
                Some(ConnCommand::Respond { buf }) => {
                    if let Err(e) = state.write_frame(&mut writer, &buf).await {
                        break e;
                    }
                }
                Some(ConnCommand::Shutdown(e)) => break e,
                None => break RpcError::Shutdown,
            },
            received = transfer.receive(&mut reader) => match received {
                Ok(Some(frame_buf)) => {
                    if let Err(e) = state.handle_transfer(frame_buf).await {
                        break e;
                    }
                }
                Ok(None) => break RpcError::Network("connection closed by peer".to_string()),
                Err(e) => break e,
            },
            _ = sleep_until(wake) => state.expire_calls(),
        }
    };
    state.shutdown(status, cmd_rx, writer).await;
}

impl ConnState {
    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((when, _))| *when)
    }

    async fn send_outbound(
        &mut self,
        writer: &mut BufWriter<OwnedWriteHalf>,
        call: OutboundCall,
    ) -> Result<()> {
        if let Some(deadline) = call.deadline {
            if Instant::now() >= deadline {
                call.fail(RpcError::TimedOut(format!(
                    "call to {} timed out before it was sent",
                    self.remote
                )));
                return Ok(());
            }
        }

        let call_id = advance_call_id(&mut self.next_call_id);
        let timeout_ms = call
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        let header = RequestHeader {
            call_id,
            method: call.method.clone(),
            required_features: SUPPORTED_FEATURES,
            timeout_ms,
            sidecar_lens: call.sidecars.iter().map(|s| s.len() as u32).collect(),
        };
        let buf = match frame::encode_frame(&header, &call.body, &call.sidecars) {
            Ok(buf) => buf,
            Err(e) => {
                // Local encoding failure: fail the call, keep the connection.
                call.fail(e);
                return Ok(());
            }
        };

        trace!("sending call {} ({}) to {}", call_id, call.method, self.remote);
        if let Some(deadline) = call.deadline {
            self.deadlines.push(Reverse((deadline, call_id)));
        }
        self.pending.insert(
            call_id,
            PendingCall {
                reply: call.reply,
                state: CallState::OnOutboundQueue,
            },
        );
        self.shared.set_pending(self.pending.len());

        self.write_frame(writer, &buf).await?;
        if let Some(pending) = self.pending.get_mut(&call_id) {
            pending.state = CallState::Sent;
        }
        Ok(())
    }

    async fn write_frame(
        &mut self,
        writer: &mut BufWriter<OwnedWriteHalf>,
        buf: &Bytes,
    ) -> Result<()> {
        self.shared.touch();
        writer
            .write_all(buf)
            .await
            .map_err(|e| RpcError::Network(format!("write to {} failed: {}", self.remote, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| RpcError::Network(format!("flush to {} failed: {}", self.remote, e)))?;
        Ok(())
    }

    async fn handle_transfer(&mut self, buf: Bytes) -> Result<()> {
        self.shared.touch();
        let (header_buf, rest) = frame::split_transfer(buf)?;
        match self.direction {
            Direction::Client => self.handle_call_response(&header_buf, rest),
            Direction::Server => self.handle_incoming_call(&header_buf, rest).await,
        }
    }

    fn handle_call_response(&mut self, header_buf: &[u8], rest: Bytes) -> Result<()> {
        let header: ResponseHeader = frame::decode_header(header_buf)?;
        let (body, sidecars) = frame::split_sidecars(rest, &header.sidecar_lens)?;
        let Some(pending) = self.pending.remove(&header.call_id) else {
            trace!(
                "response for unknown call {} on connection to {} (already timed out?)",
                header.call_id,
                self.remote
            );
            return Ok(());
        };
        self.shared.set_pending(self.pending.len());

        if header.is_error {
            let status: ErrorStatus = postcard::from_bytes(&body)?;
            let _ = pending.reply.send(Err(RpcError::from_wire(status)));
        } else {
            let _ = pending.reply.send(Ok(CallReply { body, sidecars }));
        }
        Ok(())
    }

    async fn handle_incoming_call(&mut self, header_buf: &[u8], rest: Bytes) -> Result<()> {
        let header: RequestHeader = frame::decode_header(header_buf)?;
        if header.call_id < 0 {
            return Err(RpcError::InvalidFrame(format!(
                "reserved call id {} on an established connection",
                header.call_id
            )));
        }
        let (body, sidecars) = frame::split_sidecars(rest, &header.sidecar_lens)?;
        let deadline = (header.timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(header.timeout_ms));
        let call = InboundCall::new(
            header.call_id,
            header.method,
            body,
            sidecars,
            deadline,
            self.cmd_tx.clone(),
            self.shared.clone(),
        );
        match self.messenger.upgrade() {
            Some(core) => {
                core.route_inbound(call).await;
                Ok(())
            }
            None => Err(RpcError::Shutdown),
        }
    }

    /// Fire the timers of calls whose deadline has passed. Timing one call
    /// out never touches the others or the connection itself.
    fn expire_calls(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((when, call_id))) = self.deadlines.peek().copied() {
            if when > now {
                break;
            }
            self.deadlines.pop();
            if let Some(pending) = self.pending.remove(&call_id) {
                debug!(
                    "call {} to {} timed out in state {:?}",
                    call_id, self.remote, pending.state
                );
                let _ = pending.reply.send(Err(RpcError::TimedOut(format!(
                    "call {} to {} timed out",
                    call_id, self.remote
                ))));
            }
        }
        self.shared.set_pending(self.pending.len());
    }

    async fn shutdown(
        mut self,
        status: RpcError,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        mut writer: BufWriter<OwnedWriteHalf>,
    ) {
        debug!(
            "connection to {} ({:?}) shutting down: {}",
            self.remote, self.direction, status
        );
        self.shared.mark_closed();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(status.replicate()));
        }
        self.shared.set_pending(0);

        // Fail queued-but-unsent calls; queued responses are dropped.
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let ConnCommand::Call(call) = cmd {
                call.fail(status.replicate());
            }
        }

        let _ = writer.shutdown().await;
        let _ = self.reactor_tx.send(ReactorCommand::ConnClosed {
            remote: self.remote,
            direction: self.direction,
        });
    }
}

async fn negotiate_client(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut BufWriter<OwnedWriteHalf>,
    transfer: &mut InboundTransfer,
) -> Result<()> {
    let ours = NegotiateHeader::new();
    let buf = frame::encode_frame(&ours, &[], &[])?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| RpcError::Network(format!("negotiation write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Network(format!("negotiation flush failed: {}", e)))?;

    let theirs = receive_negotiate(reader, transfer).await?;
    if theirs.call_id != NEGOTIATE_CALL_ID {
        return Err(RpcError::InvalidFrame(format!(
            "unexpected call id {} during negotiation",
            theirs.call_id
        )));
    }
    Ok(())
}

async fn negotiate_server(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut BufWriter<OwnedWriteHalf>,
    transfer: &mut InboundTransfer,
) -> Result<()> {
    let theirs = receive_negotiate(reader, transfer).await?;
    if theirs.call_id != NEGOTIATE_CALL_ID {
        return Err(RpcError::InvalidFrame(format!(
            "unexpected call id {} during negotiation",
            theirs.call_id
        )));
    }

    let ours = NegotiateHeader::new();
    let buf = frame::encode_frame(&ours, &[], &[])?;
    writer
        .write_all(&buf)
        .await
        .map_err(|e| RpcError::Network(format!("negotiation write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::Network(format!("negotiation flush failed: {}", e)))?;
    Ok(())
}

async fn receive_negotiate(
    reader: &mut BufReader<OwnedReadHalf>,
    transfer: &mut InboundTransfer,
) -> Result<NegotiateHeader> {
    let frame_buf = tokio::time::timeout(NEGOTIATE_TIMEOUT, transfer.receive(reader))
        .await
        .map_err(|_| RpcError::TimedOut("negotiation timed out".to_string()))??
        .ok_or_else(|| RpcError::Network("connection closed during negotiation".to_string()))?;
    let (header_buf, _rest) = frame::split_transfer(frame_buf)?;
    frame::decode_header(&header_buf)
}
