#![expect(
    clippy::module_name_repetitions,
    reason = "Monitor types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use tokio::runtime::Handle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::config::{LogarithmicBackoff, ReconnectConfig, STALE_THRESHOLD};
use super::traits::Reconnect;
use crate::Result;

#[derive(Debug)]
struct MonitorState {
    pinged_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    backoff: LogarithmicBackoff,
}

/// Watches heartbeats and reopens a connection that has gone stale.
///
/// The poll loop runs on its own task, independent of the connection's
/// worker. Each tick waits for the current backoff delay, then reopens the
/// target if no heartbeat arrived within [`STALE_THRESHOLD`]. Attempts are
/// bounded by [`ReconnectConfig::max_attempts`] and reset once the connection
/// opens again.
pub struct ConnectionMonitor<R: Reconnect> {
    target: R,
    reconnect: ReconnectConfig,
    runtime: Handle,
    state: Mutex<MonitorState>,
    poller: Mutex<Option<CancellationToken>>,
}

impl<R: Reconnect> ConnectionMonitor<R> {
    /// Create a stopped monitor. Must be called within a Tokio runtime.
    pub fn new(target: R, reconnect: ReconnectConfig) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let backoff = LogarithmicBackoff::from(reconnect.clone());

        Ok(Self {
            target,
            reconnect,
            runtime,
            state: Mutex::new(MonitorState {
                pinged_at: None,
                disconnected_at: None,
                started_at: None,
                stopped_at: None,
                backoff,
            }),
            poller: Mutex::new(None),
        })
    }

    /// The connection opened.
    pub fn connected(&self) {
        let mut state = self.lock();
        state.backoff.reset();
        state.pinged_at = Some(Instant::now());
        state.disconnected_at = None;
    }

    /// The connection closed.
    pub fn disconnected(&self) {
        self.lock().disconnected_at = Some(Instant::now());
    }

    /// A heartbeat arrived.
    pub fn ping_received(&self) {
        self.lock().pinged_at = Some(Instant::now());
    }

    /// Start polling. Restarting replaces the previous poll loop.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            state.backoff.reset();
            state.stopped_at = None;
            state.started_at = Some(Instant::now());
        }

        let token = CancellationToken::new();
        let previous = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            enabled = self.reconnect.enabled,
            max_attempts = self.reconnect.max_attempts,
            "connection monitor started"
        );

        self.runtime.spawn(Arc::clone(self).poll(token));
    }

    /// Stop polling. The in-flight tick observes the stop marker and does not reschedule.
    pub fn stop(&self) {
        self.lock().stopped_at = Some(Instant::now());

        if let Some(token) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("connection monitor stopped");
    }

    /// Number of reconnect attempts since the connection last opened.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().backoff.attempts()
    }

    /// Delay before the next health check.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.lock().backoff.next_backoff().unwrap_or(self.reconnect.delay)
    }

    /// Whether more than [`STALE_THRESHOLD`] whole seconds have passed without a heartbeat.
    ///
    /// Counts from the last heartbeat, or from [`start`](Self::start) if none
    /// has arrived yet. With the default threshold a connection turns stale
    /// once 7 seconds have elapsed.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        Self::stale(&self.lock(), Instant::now())
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.lock().stopped_at.is_some()
    }

    /// Run one health check. Returns `true` if the target was asked to reopen.
    pub fn reconnect_if_stale(&self) -> bool {
        let reopen = {
            let mut state = self.lock();
            let now = Instant::now();

            if !self.reconnect.enabled
                || !Self::stale(&state, now)
                || state.backoff.attempts() >= self.reconnect.max_attempts
            {
                return false;
            }

            state.backoff.record_attempt();

            // A fresh disconnect is still settling; count the attempt but let it be.
            let disconnected_recently = state
                .disconnected_at
                .is_some_and(|at| whole_seconds_between(at, now) < STALE_THRESHOLD.as_secs());

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempt = state.backoff.attempts(),
                disconnected_recently,
                "connection is stale"
            );

            !disconnected_recently
        };

        if reopen {
            self.target.reopen();
        }
        reopen
    }

    async fn poll(self: Arc<Self>, token: CancellationToken) {
        loop {
            let delay = self.poll_interval();

            tokio::select! {
                () = token.cancelled() => break,
                () = sleep(delay) => {}
            }

            if self.is_stopped() {
                break;
            }
            self.reconnect_if_stale();
        }
    }

    fn stale(state: &MonitorState, now: Instant) -> bool {
        state
            .pinged_at
            .or(state.started_at)
            .is_none_or(|since| whole_seconds_between(since, now) > STALE_THRESHOLD.as_secs())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Reconnect> Drop for ConnectionMonitor<R> {
    fn drop(&mut self) {
        if let Some(token) = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

/// Elapsed time in whole seconds, rounded down.
fn whole_seconds_between(earlier: Instant, later: Instant) -> u64 {
    later.saturating_duration_since(earlier).as_secs()
}
