//! Server configuration.

use std::time::Duration;

/// What to do with new work while the server is overloaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverloadBehavior {
    /// Answer `503 Service Unavailable` with `Retry-After`, then close.
    Reject503,
    /// Accept and close immediately without a response.
    CloseConnection,
    /// Hold acceptance in the bounded handoff queue; drop past its cap.
    QueueRequest,
}

/// Server configuration options.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port (0 picks an ephemeral port)
    pub port: u16,
    /// Number of worker event loops (0 = detected core count)
    pub num_workers: usize,
    /// Total capacity of the accept→worker handoff queues
    pub connection_queue_size: usize,
    /// OS listen backlog
    pub listen_backlog: u32,
    /// Reject request heads larger than this (431)
    pub max_header_size: usize,
    /// Reject request bodies larger than this (413)
    pub max_body_size: usize,
    /// Deadline for reading one full request once its first byte arrived
    pub read_timeout: Duration,
    /// Deadline for flushing one full response
    pub write_timeout: Duration,
    /// Idle deadline between requests on a kept-alive connection
    pub keep_alive_timeout: Duration,
    /// Requests served per connection before forcing close (0 = unlimited)
    pub max_requests_per_connection: u32,
    /// Grace period for `shutdown_graceful` before force-closing
    pub shutdown_timeout: Duration,
    /// Hard cap on concurrent connections
    pub max_connections: usize,
    /// Overload flips on at `high_water * max_connections` active
    pub connection_high_water: f64,
    /// Overload flips back off below `low_water * max_connections`
    pub connection_low_water: f64,
    /// Hard cap on concurrently dispatched requests
    pub max_in_flight_requests: usize,
    pub overload_behavior: OverloadBehavior,
    /// `Retry-After` seconds on 503 responses
    pub retry_after_seconds: u32,
    /// Extra invariant checking (double-release scans always run; this
    /// gates verbose lifecycle logging)
    pub debug_mode: bool,
}

impl ServerConfig {
    /// Create a config with the documented defaults.
    pub fn new(host: &str, port: u16) -> ServerConfig {
        ServerConfig {
            host: host.to_string(),
            port,
            num_workers: 0,
            connection_queue_size: 4096,
            listen_backlog: 1024,
            max_header_size: 64 * 1024,
            max_body_size: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(120),
            max_requests_per_connection: 1000,
            shutdown_timeout: Duration::from_secs(30),
            max_connections: 10_000,
            connection_high_water: 0.8,
            connection_low_water: 0.6,
            max_in_flight_requests: 1000,
            overload_behavior: OverloadBehavior::Reject503,
            retry_after_seconds: 5,
            debug_mode: false,
        }
    }

    /// Set the number of worker event loops.
    pub fn workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_header_size(mut self, n: usize) -> Self {
        self.max_header_size = n;
        self
    }

    pub fn max_body_size(mut self, n: usize) -> Self {
        self.max_body_size = n;
        self
    }

    pub fn read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn keep_alive_timeout(mut self, d: Duration) -> Self {
        self.keep_alive_timeout = d;
        self
    }

    pub fn max_requests_per_connection(mut self, n: u32) -> Self {
        self.max_requests_per_connection = n;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn max_in_flight_requests(mut self, n: usize) -> Self {
        self.max_in_flight_requests = n;
        self
    }

    pub fn overload_behavior(mut self, behavior: OverloadBehavior) -> Self {
        self.overload_behavior = behavior;
        self
    }

    pub fn connection_water_marks(mut self, low: f64, high: f64) -> Self {
        self.connection_low_water = low;
        self.connection_high_water = high;
        self
    }

    pub fn retry_after_seconds(mut self, n: u32) -> Self {
        self.retry_after_seconds = n;
        self
    }

    pub fn debug_mode(mut self, on: bool) -> Self {
        self.debug_mode = on;
        self
    }

    /// Resolved worker count.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_workers
        }
    }

    /// Check cross-field invariants before the server starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::new("max_connections must be positive"));
        }
        if self.connection_queue_size == 0 {
            return Err(ConfigError::new("connection_queue_size must be positive"));
        }
        if self.max_in_flight_requests == 0 {
            return Err(ConfigError::new("max_in_flight_requests must be positive"));
        }
        for (name, v) in [
            ("connection_high_water", self.connection_high_water),
            ("connection_low_water", self.connection_low_water),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::new(&format!("{name} must be within [0, 1]")));
            }
        }
        if self.connection_low_water >= self.connection_high_water {
            return Err(ConfigError::new(
                "connection_low_water must be below connection_high_water",
            ));
        }
        if self.max_header_size == 0 || self.max_body_size == 0 {
            return Err(ConfigError::new("size limits must be positive"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("0.0.0.0", 8080)
    }
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {msg}")]
pub struct ConfigError {
    msg: String,
}

impl ConfigError {
    fn new(msg: &str) -> ConfigError {
        ConfigError {
            msg: msg.to_string(),
        }
    }
}
