//! Reactor tasks: each multiplexes a disjoint subset of connections.
//!
//! A reactor owns the canonical table of its live connections, keyed by
//! (remote address, direction), plus a heap of deferred one-shot callbacks
//! used for retry backoff. The messenger assigns each remote to a reactor by
//! hashing its address, so no two reactors ever share connection state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::connection::{self, ConnCommand, ConnHandle, Direction};
use crate::error::RpcError;
use crate::messenger::MessengerCore;
use crate::proxy::OutboundCall;

pub(crate) enum ReactorCommand {
    /// A freshly accepted socket to wrap in a server connection.
    RegisterInbound {
        stream: TcpStream,
        remote: SocketAddr,
    },
    /// An outbound call to send on the client connection to `remote`,
    /// establishing it first if needed.
    AssignCall {
        remote: SocketAddr,
        call: OutboundCall,
    },
    /// Run `f` on this reactor task once `when` is reached.
    ScheduleDelayed {
        when: Instant,
        f: Box<dyn FnOnce() + Send + 'static>,
    },
    /// A connection driver has exited.
    ConnClosed {
        remote: SocketAddr,
        direction: Direction,
    },
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct ReactorHandle {
    tx: mpsc::UnboundedSender<ReactorCommand>,
}

impl ReactorHandle {
    pub(crate) fn send(&self, cmd: ReactorCommand) -> std::result::Result<(), ReactorCommand> {
        self.tx.send(cmd).map_err(|e| e.0)
    }
}

struct DelayedTask {
    when: Instant,
    seq: u64,
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest deadline.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Reactor {
    index: usize,
    messenger: Weak<MessengerCore>,
    conns: HashMap<(SocketAddr, Direction), ConnHandle>,
    delayed: BinaryHeap<DelayedTask>,
    next_task_seq: u64,
    keepalive: Duration,
    tx: mpsc::UnboundedSender<ReactorCommand>,
}

pub(crate) fn spawn_reactor(
    index: usize,
    messenger: Weak<MessengerCore>,
    keepalive: Duration,
    sweep_granularity: Duration,
) -> ReactorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let reactor = Reactor {
        index,
        messenger,
        conns: HashMap::new(),
        delayed: BinaryHeap::new(),
        next_task_seq: 0,
        keepalive,
        tx: tx.clone(),
    };
    tokio::spawn(reactor.run(rx, sweep_granularity));
    ReactorHandle { tx }
}

impl Reactor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ReactorCommand>,
        sweep_granularity: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_granularity);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let wake = self
                .delayed
                .peek()
                .map(|t| t.when)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(ReactorCommand::RegisterInbound { stream, remote }) => {
                        self.register_inbound(stream, remote);
                    }
                    Some(ReactorCommand::AssignCall { remote, call }) => {
                        self.assign_call(remote, call);
                    }
                    Some(ReactorCommand::ScheduleDelayed { when, f }) => {
                        let seq = self.next_task_seq;
                        self.next_task_seq += 1;
                        self.delayed.push(DelayedTask { when, seq, f });
                    }
                    Some(ReactorCommand::ConnClosed { remote, direction }) => {
                        self.conns.remove(&(remote, direction));
                    }
                    Some(ReactorCommand::Shutdown) | None => break,
                },
                _ = sweep.tick() => self.sweep_idle(),
                _ = sleep_until(wake) => self.run_delayed(),
            }
        }
        self.close_all();
        debug!("reactor {} shut down", self.index);
    }

    fn register_inbound(&mut self, stream: TcpStream, remote: SocketAddr) {
        trace!("reactor {}: new inbound connection from {}", self.index, remote);
        let handle =
            connection::spawn_server(stream, remote, self.messenger.clone(), self.tx.clone());
        self.conns.insert((remote, Direction::Server), handle);
    }

    fn assign_call(&mut self, remote: SocketAddr, call: OutboundCall) {
        let key = (remote, Direction::Client);
        // Replace an entry whose driver has already exited; its ConnClosed
        // notice may still be queued behind this command.
        if let Some(entry) = self.conns.get(&key) {
            if entry.shared.is_closed() {
                self.conns.remove(&key);
            }
        }
        let messenger = self.messenger.clone();
        let tx = self.tx.clone();
        let entry = self
            .conns
            .entry(key)
            .or_insert_with(|| connection::spawn_client(remote, messenger, tx));

        if let Err(err) = entry.cmd_tx.send(ConnCommand::Call(call)) {
            if let ConnCommand::Call(call) = err.0 {
                call.fail(RpcError::Network(format!(
                    "connection to {} is closed",
                    remote
                )));
            }
            self.conns.remove(&key);
        }
    }

    /// Proactively close connections that have gone idle past the keepalive
    /// window, and drop table entries for drivers that already exited.
    fn sweep_idle(&mut self) {
        let keepalive = self.keepalive;
        self.conns.retain(|(remote, direction), entry| {
            if entry.shared.is_closed() {
                return false;
            }
            if entry.shared.is_idle(keepalive) {
                debug!("closing idle connection to {} ({:?})", remote, direction);
                let _ = entry.cmd_tx.send(ConnCommand::Shutdown(RpcError::Network(
                    "connection idle past keepalive window".to_string(),
                )));
                return false;
            }
            true
        });
    }

    fn run_delayed(&mut self) {
        let now = Instant::now();
        while let Some(task) = self.delayed.peek() {
            if task.when > now {
                break;
            }
            if let Some(task) = self.delayed.pop() {
                (task.f)();
            }
        }
    }

    fn close_all(&mut self) {
        for (_, entry) in self.conns.drain() {
            let _ = entry.cmd_tx.send(ConnCommand::Shutdown(RpcError::Shutdown));
        }
        // Pending delayed callbacks are dropped; their waiters observe the
        // dropped channel as a shutdown.
        self.delayed.clear();
    }
}
