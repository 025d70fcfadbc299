//! Wire message model for the text-frame protocol.
//!
//! Every frame is one JSON document with a `type` discriminator. Decoding is
//! tolerant: frames whose type is unknown still surface to raw-message
//! listeners instead of failing the session — newer firmware adds message
//! types freely.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth;
use crate::error::CommandError;

/// Device greeting; first inbound frame of a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    pub serial: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devicetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u32>,
    /// Non-zero when the session requires signed write commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secured: Option<u32>,
}

/// Server-issued challenge tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequired {
    pub token1: String,
    pub token2: String,
    /// Explicit algorithm identifier; newer firmware sends it, older firmware
    /// relies on the device-type hint from the greeting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Snapshot frame. The initial snapshot may be split across several frames;
/// `batch_index`/`batch_count` or the legacy `partial` flag mark completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(rename = "batchIndex", skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<u32>,
    #[serde(rename = "batchCount", skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<u32>,
    pub status: Map<String, Value>,
}

impl FullStatus {
    /// True when this frame completes the snapshot it belongs to.
    pub fn completes_batch(&self) -> bool {
        match (self.batch_index, self.batch_count, self.partial) {
            (Some(index), Some(count), _) => index + 1 >= count,
            (_, _, Some(partial)) => !partial,
            _ => true,
        }
    }
}

/// Device answer to a write command. The protocol has no correlation ids
/// beyond the echoed request id; successful responses carry the resulting
/// property values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    #[serde(default)]
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Signed envelope around an already-encoded command payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuredMsg {
    pub data: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub hmac: String,
}

/// All known frame shapes, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "hello")]
    Hello(Hello),
    #[serde(rename = "authRequired")]
    AuthRequired(AuthRequired),
    #[serde(rename = "auth")]
    Auth { token3: String, hash: String },
    #[serde(rename = "authSuccess")]
    AuthSuccess,
    #[serde(rename = "authError")]
    AuthError { message: Option<String> },
    #[serde(rename = "fullStatus")]
    FullStatus(FullStatus),
    #[serde(rename = "deltaStatus")]
    DeltaStatus { status: Map<String, Value> },
    #[serde(rename = "response")]
    Response(CommandResponse),
    #[serde(rename = "setValue")]
    SetValue {
        #[serde(rename = "requestId")]
        request_id: u64,
        key: String,
        value: Value,
    },
    #[serde(rename = "securedMsg")]
    SecuredMsg(SecuredMsg),
}

/// One decoded inbound frame. `raw` is always preserved for raw-message
/// listeners; `message` is present only when the type is known.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub raw: Value,
    pub message: Option<Message>,
}

/// Decodes an inbound text frame. Unknown `type` values yield
/// `message: None`; only malformed JSON is an error.
pub fn decode(text: &str) -> Result<Inbound, serde_json::Error> {
    let raw: Value = serde_json::from_str(text)?;
    let message = Message::deserialize(&raw).ok();
    Ok(Inbound { raw, message })
}

/// Encodes an outbound frame.
pub fn encode(message: &Message) -> Result<String, CommandError> {
    serde_json::to_string(message).map_err(|e| CommandError::Encode(e.to_string()))
}

/// Wraps an already-encoded payload in a signed envelope. The counter shows
/// up twice by design: inside the signed payload and, suffixed, as the
/// envelope request id.
pub fn secured_envelope(payload: String, request_id: u64, secret: &[u8]) -> Message {
    let hmac = auth::sign_payload(payload.as_bytes(), secret);
    Message::SecuredMsg(SecuredMsg {
        data: payload,
        request_id: format!("{request_id}sm"),
        hmac,
    })
}
