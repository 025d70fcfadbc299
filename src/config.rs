use std::time::Duration;

/// Relay endpoint used when the cloud transport is selected; the device is
/// addressed by serial inside the protocol itself.
pub const CLOUD_ENDPOINT: &str = "app.wattpilot.io:443";

/// Port the charger listens on for local connections.
pub const DEVICE_PORT: u16 = 80;

/// Backoff policy for the automatic reconnect path.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first retry; doubles per attempt.
    pub initial_backoff: Duration,
    /// Ceiling for the doubled delay.
    pub max_backoff: Duration,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

/// Connection parameters for one charger endpoint.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname or `host:port` of the charger (ignored for cloud sessions).
    pub host: String,
    pub password: String,
    /// Pre-known serial; skips waiting for auto-detection before the secret
    /// can be derived, and selects the cloud session to join.
    pub serial: Option<String>,
    /// Connect through the vendor relay instead of the local socket.
    pub cloud: bool,
    /// Bound on the dial + handshake phase of `connect`.
    pub connect_timeout: Duration,
    /// Bound on the initial full-status assembly after authentication.
    pub init_timeout: Duration,
    /// Bound used by command helpers waiting to observe their own writes.
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Decompose compound properties into addressable child entries.
    pub split_compound: bool,
}

impl Config {
    /// Configuration for a local connection to `host`.
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            password: password.into(),
            serial: None,
            cloud: false,
            connect_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            split_compound: true,
        }
    }

    /// Configuration for a cloud session to the charger with `serial`.
    pub fn cloud(serial: impl Into<String>, password: impl Into<String>) -> Self {
        let mut config = Self::new(String::new(), password);
        config.serial = Some(serial.into());
        config.cloud = true;
        config
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Address the default connector dials.
    pub fn endpoint(&self) -> String {
        if self.cloud {
            CLOUD_ENDPOINT.to_string()
        } else if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, DEVICE_PORT)
        }
    }
}
