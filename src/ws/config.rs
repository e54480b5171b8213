#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::fmt;
use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;
use tokio_tungstenite::Connector;

/// Interval at which the server pushes heartbeat envelopes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// A connection is stale once two heartbeats have been missed.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(HEARTBEAT_INTERVAL.as_secs() * 2);

const DEFAULT_MAX_ATTEMPTS: u32 = 30;
const DEFAULT_RECONNECTION_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_RECONNECTION_DELAY_MAX: Duration = Duration::from_secs(30);
const BACKOFF_SCALE_SECONDS: f64 = 5.0;

/// Configuration for the cable connection.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use actioncable_client::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .reconnect(ReconnectConfig::builder().enabled(true).build())
///     .headers(vec![("Origin".to_owned(), "https://example.com".to_owned())])
///     .query(vec![("token".to_owned(), "abc 123".to_owned())])
///     .ping_interval(Duration::from_secs(20))
///     .build();
///
/// assert!(config.reconnect.enabled);
/// ```
#[non_exhaustive]
#[derive(Clone, Builder)]
pub struct Config {
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Extra HTTP headers sent with the upgrade request, in order
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    /// Query parameters URL-encoded onto the endpoint, in order
    #[builder(default)]
    pub query: Vec<(String, String)>,
    /// Cookies sent as a single `Cookie` header
    #[builder(default)]
    pub cookies: Vec<(String, String)>,
    /// Interval for client-initiated WebSocket pings. `None` disables them.
    pub ping_interval: Option<Duration>,
    /// TLS connector used for `wss://` endpoints. `None` uses the default roots.
    pub connector: Option<Connector>,
    /// How long a close handshake may take before the transport is dropped
    #[builder(default = STALE_THRESHOLD)]
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("reconnect", &self.reconnect)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("cookies", &self.cookies.len())
            .field("ping_interval", &self.ping_interval)
            .field("connector", &self.connector.is_some())
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Whether stale connections are reopened automatically
    #[builder(default)]
    pub enabled: bool,
    /// Maximum number of reconnection attempts before giving up
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Lower bound of the delay between health checks
    #[builder(default = DEFAULT_RECONNECTION_DELAY)]
    pub delay: Duration,
    /// Upper bound of the delay between health checks
    #[builder(default = DEFAULT_RECONNECTION_DELAY_MAX)]
    pub delay_max: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Logarithmic backoff: `clamp(5 * ln(attempts + 1), delay, delay_max)`,
/// truncated to whole seconds.
///
/// Unlike an exponential schedule, the delay depends only on the number of
/// recorded attempts, so [`Backoff::next_backoff`] does not advance it. Call
/// [`LogarithmicBackoff::record_attempt`] when a reconnection is attempted.
#[derive(Debug, Clone)]
pub struct LogarithmicBackoff {
    attempts: u32,
    min: Duration,
    max: Duration,
}

impl LogarithmicBackoff {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Delay for the given number of attempts.
    #[must_use]
    #[expect(
        clippy::float_arithmetic,
        reason = "The schedule is defined on a natural logarithm"
    )]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let seconds = BACKOFF_SCALE_SECONDS * (f64::from(attempts) + 1.0).ln();
        let delay = Duration::from_secs_f64(seconds).clamp(self.min, self.max.max(self.min));
        Duration::from_secs(delay.as_secs())
    }
}

impl Backoff for LogarithmicBackoff {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.delay_for(self.attempts))
    }
}

impl From<ReconnectConfig> for LogarithmicBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            min: config.delay,
            max: config.delay_max,
        }
    }
}
