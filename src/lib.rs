//! Client for the Wattpilot wallbox control protocol.
//!
//! The charger speaks a reverse-engineered text-frame protocol over one
//! persistent bidirectional socket: a challenge/response handshake (PBKDF2
//! or bcrypt, negotiated per device family), a full property snapshot at
//! session start, incremental deltas afterwards, and JSON write commands
//! that are HMAC-signed when the device runs in secured mode.
//!
//! [`Wattpilot`] is the entry point: it owns one session per endpoint,
//! mirrors the device's property state behind typed accessors, fans out
//! change callbacks, and layers device-specific command sequencing (trip
//! scheduling, firmware updates, cloud API control) on top of validated
//! property writes.

pub mod auth;
pub mod client;
mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod messages;
pub mod schema;
pub mod store;
pub mod transport;

pub use auth::AuthMethod;
pub use client::{CableLockMode, CarStatus, CloudInfo, ForceState, LoadMode, Wattpilot};
pub use config::{Config, ReconnectPolicy};
pub use connection::{ConnectionState, DeviceInfo};
pub use error::{AuthError, CommandError, ConnectionError, Error, PropertyError};
pub use events::CallbackHandle;
pub use messages::Message;
pub use schema::{Access, PropertyKind, Schema};
pub use transport::{Connector, TcpConnector, TcpLineTransport, Transport};
