//! Client-side retry/backoff/deadline policy wrapping an outbound call.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Result, RpcError};
use crate::proxy::{CallReply, Proxy};
use tracing::debug;

/// Retry state for one logical RPC: attempt counter, overall deadline, and
/// the last observed error. Not itself a call — it is mutated across the
/// repeated attempts made for the same logical RPC.
pub struct RpcRetrier {
    attempt_num: usize,
    deadline: Instant,
    last_error: Option<String>,
}

impl RpcRetrier {
    pub fn new(deadline: Instant) -> Self {
        Self {
            attempt_num: 1,
            deadline,
            last_error: None,
        }
    }

    /// Attempts made so far, including the in-flight one. Always >= 1.
    pub fn num_attempts(&self) -> usize {
        self.attempt_num
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Decide whether a response warrants a retry. A `ServerTooBusy` remote
    /// error always does, without surfacing to the caller; anything else is
    /// final.
    pub fn handle_response(&mut self, result: &Result<CallReply>) -> bool {
        match result {
            Err(e) if e.is_server_too_busy() => {
                self.last_error = Some(e.to_string());
                true
            }
            _ => false,
        }
    }

    /// Base backoff in milliseconds for the given attempt number, ignoring
    /// jitter. Strictly increasing with the attempt number.
    pub fn base_delay_ms(attempt_num: usize) -> u64 {
        attempt_num as u64
    }

    fn next_delay(&mut self) -> Duration {
        self.attempt_num += 1;
        // Some jitter keeps a busy server's rejected callers from
        // retrying in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..5);
        Duration::from_millis(Self::base_delay_ms(self.attempt_num) + jitter_ms)
    }

    /// Wait out the backoff before the next attempt, via the messenger's
    /// deferred-callback facility so the wait runs on a reactor timer.
    ///
    /// The overall deadline is checked both before scheduling and after the
    /// delay fires — the delay itself can push past the deadline, in which
    /// case this fails with `TimedOut` (carrying the last observed error as
    /// context) instead of allowing another send.
    pub async fn delayed_retry(&mut self, messenger: &crate::messenger::Messenger) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        let delay = self.next_delay();
        let (tx, rx) = oneshot::channel();
        messenger.schedule_on_reactor(delay, move || {
            let _ = tx.send(());
        });
        if rx.await.is_err() {
            return Err(RpcError::Shutdown);
        }
        if Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    fn timeout_error(&self) -> RpcError {
        let mut msg = "RPC passed its deadline".to_string();
        if let Some(last) = &self.last_error {
            msg.push_str(": last error: ");
            msg.push_str(last);
        }
        RpcError::TimedOut(msg)
    }
}

/// One logical, possibly multiply-attempted remote call bound to a
/// deadline.
///
/// # Example
///
/// ```no_run
/// # use gridrpc_core::{Proxy, RetriableCall};
/// # use bytes::Bytes;
/// # use tokio::time::Instant;
/// # async fn example(proxy: Proxy) -> gridrpc_core::Result<()> {
/// let deadline = Instant::now() + std::time::Duration::from_secs(10);
/// let mut call = RetriableCall::new(proxy, "Ping", Bytes::new(), deadline);
/// let reply = call.send().await?;
/// # Ok(())
/// # }
/// ```
pub struct RetriableCall {
    proxy: Proxy,
    method: String,
    body: Bytes,
    retrier: RpcRetrier,
}

impl RetriableCall {
    pub fn new(proxy: Proxy, method: impl Into<String>, body: Bytes, deadline: Instant) -> Self {
        Self {
            proxy,
            method: method.into(),
            body,
            retrier: RpcRetrier::new(deadline),
        }
    }

    pub fn num_attempts(&self) -> usize {
        self.retrier.num_attempts()
    }

    /// Send the call, retrying busy rejections with increasing backoff
    /// until it completes or the deadline is exhausted.
    pub async fn send(&mut self) -> Result<CallReply> {
        loop {
            let remaining = self
                .retrier
                .deadline()
                .saturating_duration_since(Instant::now());
            let result = self
                .proxy
                .call(&self.method, self.body.clone(), Some(remaining))
                .await;
            if self.retrier.handle_response(&result) {
                debug!(
                    "{} rejected as too busy; scheduling attempt {}",
                    self.method,
                    self.retrier.num_attempts() + 1
                );
                let messenger = self.proxy.messenger().clone();
                self.retrier.delayed_retry(&messenger).await?;
                continue;
            }
            return result;
        }
    }
}
