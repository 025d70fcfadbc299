//! Socket transport seam.
//!
//! The connection state machine talks to the device through the [`Transport`]
//! trait; [`Connector`] dials a fresh one for each attempt, which is how the
//! reconnect path re-establishes the link. Tests plug in-memory pipes into
//! the same seam.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::config::Config;
use crate::error::ConnectionError;

/// Upper bound on one frame; full-status frames are large but bounded.
const MAX_FRAME_LEN: usize = 1 << 20;

/// One established bidirectional text-frame socket.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError>;

    /// `Ok(None)` signals an orderly remote close.
    async fn recv(&mut self) -> Result<Option<String>, ConnectionError>;
}

/// Dials a fresh transport for each connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Newline-delimited JSON over TCP; the framing the device speaks.
pub struct TcpLineTransport {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TcpLineTransport {
    pub async fn dial(endpoint: &str) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| ConnectionError::Unreachable(format!("{endpoint}: {e}")))?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        })
    }
}

#[async_trait]
impl Transport for TcpLineTransport {
    async fn send(&mut self, text: String) -> Result<(), ConnectionError> {
        self.framed.send(text).await.map_err(map_codec_err)
    }

    async fn recv(&mut self) -> Result<Option<String>, ConnectionError> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(err)) => Err(map_codec_err(err)),
            None => Ok(None),
        }
    }
}

fn map_codec_err(err: LinesCodecError) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

/// Default connector: dials the configured endpoint, local device or cloud
/// relay.
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            endpoint: config.endpoint(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        Ok(Box::new(TcpLineTransport::dial(&self.endpoint).await?))
    }
}
