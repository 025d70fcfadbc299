//! Outgoing write commands and acknowledgement observation.
//!
//! The protocol carries no request/response correlation: a write is
//! "confirmed" only when the key's new value comes back through the normal
//! update path. `set_property` is therefore fire-and-forget; helpers that
//! need read-your-own-write semantics wait on the store instead.

use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::connection::{ConnectionState, Session};
use crate::error::{ConnectionError, Error, PropertyError};
use crate::messages::{self, Message};

impl Session {
    /// Validates, coerces, and sends one property write. Wraps the envelope
    /// in a signed frame when the session is secured.
    pub(crate) fn set_property(&self, key: &str, value: Value) -> Result<(), Error> {
        let def = self
            .schema
            .get(key)
            .ok_or_else(|| PropertyError::UnknownKey(key.to_string()))?;
        if !def.rw.writable() {
            return Err(PropertyError::ReadOnly(key.to_string()).into());
        }
        let value = self.schema.coerce(key, value)?;

        let request_id = self.next_request_id();
        let message = Message::SetValue {
            request_id,
            key: key.to_string(),
            value,
        };
        let frame = if self.secured_mode() {
            let secret = self
                .secret
                .lock()
                .clone()
                .ok_or(ConnectionError::NotConnected)?;
            let payload = messages::encode(&message)?;
            messages::encode(&messages::secured_envelope(payload, request_id, &secret))?
        } else {
            messages::encode(&message)?
        };
        debug!(key, request_id, "set property");
        self.send_frame(frame)?;
        Ok(())
    }

    /// Waits until the live store satisfies `pred` for `key`, bounded by
    /// `wait`.
    ///
    /// An explicit disconnect cancels the wait with a connection error. A
    /// lost link does not: the echo may still arrive once the reconnect path
    /// resynchronizes, so the wait runs until its own deadline.
    pub(crate) async fn await_property<F>(
        &self,
        key: &str,
        wait: Duration,
        pred: F,
    ) -> Result<Value, Error>
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = Instant::now() + wait;
        let mut revisions = self.store.subscribe_revision();
        let mut states = self.state_watch();
        loop {
            if let Some(value) = self.store.get(key) {
                if pred(&value) {
                    return Ok(value);
                }
            }
            if self.closing() && self.state() == ConnectionState::Disconnected {
                return Err(ConnectionError::Cancelled.into());
            }
            tokio::select! {
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return Err(ConnectionError::Cancelled.into());
                    }
                }
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(ConnectionError::Cancelled.into());
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(ConnectionError::Timeout("property confirmation").into());
                }
            }
        }
    }

    /// Waits until the connection state satisfies `pred`, bounded by
    /// `deadline`. An explicit disconnect that `pred` does not accept cancels
    /// the wait instead of leaving it suspended.
    pub(crate) async fn await_state<F>(
        &self,
        deadline: Instant,
        waiting_for: &'static str,
        pred: F,
    ) -> Result<ConnectionState, Error>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let mut states = self.state_watch();
        loop {
            let current = *states.borrow_and_update();
            if pred(current) {
                return Ok(current);
            }
            if current == ConnectionState::Disconnected && self.closing() {
                return Err(ConnectionError::Cancelled.into());
            }
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        return Err(ConnectionError::Cancelled.into());
                    }
                }
                _ = sleep_until(deadline) => {
                    return Err(ConnectionError::Timeout(waiting_for).into());
                }
            }
        }
    }
}
