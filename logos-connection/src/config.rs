//! Connection policy configuration.
//!
//! Every delay the manager uses lives here so that tests and embedders can
//! shrink or stretch the policy without touching the state machine.

use std::time::Duration;

const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Primary real-time endpoint (`ws://` or `wss://`)
    pub endpoint: String,
    /// Endpoint tried once the primary one is exhausted (None = give up)
    pub fallback_endpoint: Option<String>,
    /// Project the session joins, sent as the `projectId` query parameter
    pub project_id: Option<String>,
    /// Upper bound for a single transport handshake
    pub connect_timeout: Duration,
    /// Period of the idle-disconnect poll
    pub idle_check_interval: Duration,
    /// Inactivity after which the session is dropped proactively
    pub disconnect_after: Duration,
    /// Inactivity after which reconnect countdowns use the long range
    pub inactive_reconnect_threshold: Duration,
    /// Base delay of the connect-error retry ladder
    pub connection_error_reconnect_delay: Duration,
    /// Backoff used by `try_reconnect_now`
    pub user_activity_reconnect_now_delay: Duration,
    /// Backoff used when user activity finds the connection closed
    pub user_activity_reconnect_delay: Duration,
    /// Backoff used after the server rate-limited a join
    pub rate_limited_delay: Duration,
    /// Poll interval while waiting for a quiet moment to cycle the socket
    pub graceful_retry_interval: Duration,
    /// Maximum time a graceful reconnect may be deferred
    pub graceful_window: Duration,
    /// Connect errors tolerated per attempt before giving up
    pub max_retry_connect: u32,
    /// Fraction of `disconnect_after` that makes a graceful reconnect a plain disconnect
    pub graceful_idle_factor: f64,
    /// Seed for the jitter generator (None = seeded from entropy)
    pub rng_seed: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:3026/socket.io".to_string(),
            fallback_endpoint: None,
            project_id: None,
            connect_timeout: Duration::from_secs(30),
            idle_check_interval: ONE_HOUR,
            disconnect_after: ONE_HOUR * 24,
            inactive_reconnect_threshold: Duration::from_secs(2 * 60),
            connection_error_reconnect_delay: Duration::from_millis(1000),
            user_activity_reconnect_now_delay: Duration::from_millis(1000),
            user_activity_reconnect_delay: Duration::from_millis(5000),
            rate_limited_delay: Duration::from_secs(15),
            graceful_retry_interval: Duration::from_secs(5),
            graceful_window: Duration::from_secs(45),
            max_retry_connect: 5,
            graceful_idle_factor: 0.75,
            rng_seed: None,
        }
    }
}

impl ConnectionConfig {
    /// Default policy against the given endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Inactivity after which a graceful reconnect request just disconnects.
    pub fn graceful_idle_threshold(&self) -> Duration {
        self.disconnect_after.mul_f64(self.graceful_idle_factor)
    }

    /// Build the URL for `endpoint`, appending `projectId` when configured.
    ///
    /// An endpoint that does not parse is returned unchanged; the handshake
    /// then fails and goes through the retry ladder like any other.
    pub fn connect_url(&self, endpoint: &str) -> String {
        let Some(project_id) = &self.project_id else {
            return endpoint.to_string();
        };
        match url::Url::parse(endpoint) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("projectId", project_id);
                url.to_string()
            }
            Err(e) => {
                log::warn!("Invalid endpoint {endpoint}: {e}");
                endpoint.to_string()
            }
        }
    }
}
