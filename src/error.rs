use thiserror::Error;

/// Socket and lifecycle failures.
///
/// Automatic retry happens only on the background reconnect path; an explicit
/// `connect` call fails after its own timeout and is never retried silently.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed unexpectedly")]
    Closed,
    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("not connected")]
    NotConnected,
    #[error("operation cancelled by disconnect")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Authentication failures; terminal for the current connect attempt.
///
/// A wrong password and a corrupted handshake both land in `Rejected` — the
/// device's rejection message is carried verbatim when it sends one, and the
/// client does not guess beyond that.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("unsupported auth algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("device serial unusable as bcrypt salt: {0}")]
    BadSerial(String),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Write-path property failures, raised synchronously at the call site.
///
/// Never raised on read paths: unknown inbound keys are stored verbatim.
#[derive(Debug, Clone, Error)]
pub enum PropertyError {
    #[error("unknown property key: {0}")]
    UnknownKey(String),
    #[error("property {0} is read-only")]
    ReadOnly(String),
    #[error("cannot convert {value} to {expected} for property {key}")]
    Uncoercible {
        key: String,
        expected: &'static str,
        value: String,
    },
    #[error("no firmware update available")]
    NoUpdateAvailable,
}

/// Command envelope failures.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("command encode failed: {0}")]
    Encode(String),
    #[error("device rejected request {request_id}: {message}")]
    Rejected { request_id: String, message: String },
}

/// Top-level error for the public client surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl Error {
    /// True when the error belongs to the connection category.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}
