//! Connection lifecycle: handshake, receive loop, reconnection.
//!
//! One spawned IO task owns the socket and drives every state transition and
//! store mutation; public operations observe the session through watch
//! channels and hand frames over through a queued sender. That keeps the
//! store single-writer without letting callers re-enter the receive path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::auth::{self, AuthMethod};
use crate::config::Config;
use crate::error::{AuthError, CommandError, ConnectionError, Error};
use crate::events::EventBus;
use crate::messages::{self, AuthRequired, CommandResponse, FullStatus, Hello, Message};
use crate::schema::Schema;
use crate::store::PropertyStore;
use crate::transport::{Connector, Transport};

/// Device-type hint for the Flex family; selects bcrypt when the challenge
/// carries no explicit algorithm identifier.
const FLEX_DEVICE_TYPE: &str = "wattpilot_flex";

/// Lifecycle states of a session's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Authenticated,
    Syncing,
    Ready,
    /// Authentication was explicitly rejected; reachable only from
    /// `Authenticating` and never retried automatically.
    Failed,
}

impl ConnectionState {
    /// True while a link exists or a handshake is in flight.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Device identity captured from the greeting.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub serial: String,
    pub hostname: Option<String>,
    pub friendly_name: Option<String>,
    pub version: Option<String>,
    pub manufacturer: Option<String>,
    pub device_type: Option<String>,
    pub protocol: u32,
    /// Non-zero when write commands must be signed.
    pub secured: u32,
}

impl DeviceInfo {
    pub fn secured_mode(&self) -> bool {
        self.secured > 0
    }
}

/// Why an IO task stopped.
#[derive(Debug, Clone, Copy)]
enum CloseReason {
    /// Caller asked for it (disconnect, teardown, or a superseded link).
    Requested,
    /// Authentication rejected; the session must not retry on its own.
    AuthFailed,
    /// The socket dropped out from under us.
    Lost,
}

/// One wakeup of the IO loop.
enum IoEvent {
    Shutdown,
    Outbound(Option<String>),
    Inbound(Result<Option<String>, ConnectionError>),
}

/// Awaits whichever side has work. Only the inbound arm borrows the
/// transport, so the caller is free to send once this returns.
async fn next_io_event(
    transport: &mut Box<dyn Transport>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &Notify,
) -> IoEvent {
    tokio::select! {
        _ = shutdown.notified() => IoEvent::Shutdown,
        frame = outbound.recv() => IoEvent::Outbound(frame),
        inbound = transport.recv() => IoEvent::Inbound(inbound),
    }
}

/// All mutable state of one device session. Shared between the public
/// façade, the IO task, and the reconnect task.
pub(crate) struct Session {
    pub(crate) config: Config,
    pub(crate) schema: Arc<Schema>,
    pub(crate) store: PropertyStore,
    pub(crate) events: EventBus,
    connector: Arc<dyn Connector>,
    pub(crate) device: Mutex<DeviceInfo>,
    /// Shared secret derived during the handshake; keys secured writes.
    pub(crate) secret: Mutex<Option<Vec<u8>>>,
    pub(crate) auth_method: Mutex<AuthMethod>,
    /// Replay counter for signed commands; never reused, never reset.
    pub(crate) request_id: AtomicU64,
    auth_error: Mutex<Option<AuthError>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    io_handle: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect attempts so concurrent callers never race dials.
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: Notify,
    closing: AtomicBool,
    ever_ready: AtomicBool,
    reconnecting: AtomicBool,
    /// Bumped whenever the current link is replaced; stale IO tasks notice
    /// and exit without touching shared state.
    link_epoch: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Session {
    pub(crate) fn new(config: Config, connector: Arc<dyn Connector>) -> Arc<Self> {
        let schema = Arc::new(Schema::builtin());
        let store = PropertyStore::new(Arc::clone(&schema), config.split_compound);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let device = DeviceInfo {
            serial: config.serial.clone().unwrap_or_default(),
            ..DeviceInfo::default()
        };
        Arc::new(Self {
            config,
            schema,
            store,
            events: EventBus::new(),
            connector,
            device: Mutex::new(device),
            secret: Mutex::new(None),
            auth_method: Mutex::new(AuthMethod::default()),
            request_id: AtomicU64::new(0),
            auth_error: Mutex::new(None),
            outbound: Mutex::new(None),
            io_handle: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            shutdown: Notify::new(),
            closing: AtomicBool::new(false),
            ever_ready: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            link_epoch: AtomicU64::new(0),
            state_tx,
            state_rx,
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub(crate) fn secured_mode(&self) -> bool {
        self.device.lock().secured_mode()
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues a frame for the IO task. The queue is the single serialized
    /// send path; frames never interleave.
    pub(crate) fn send_frame(&self, frame: String) -> Result<(), ConnectionError> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(frame).map_err(|_| ConnectionError::NotConnected)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "connection state");
        }
        if next == ConnectionState::Ready {
            self.ever_ready.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn close_error(&self) -> ConnectionError {
        if self.closing() {
            ConnectionError::Cancelled
        } else {
            ConnectionError::Closed
        }
    }

    fn take_auth_error(&self) -> AuthError {
        self.auth_error
            .lock()
            .take()
            .unwrap_or_else(|| AuthError::Rejected("authentication failed".to_string()))
    }

    async fn wait_state(&self, pred: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        let result = match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            Err(_) => ConnectionState::Disconnected,
        };
        result
    }

    /// Opens the link and blocks until `Ready`, a failure, or a timeout.
    ///
    /// Already `Ready` returns immediately. While another attempt is in
    /// flight the caller suspends until that attempt resolves instead of
    /// dialing a duplicate.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let guard = self.connect_lock.lock().await;
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.closing.store(false, Ordering::SeqCst);
                *self.auth_error.lock() = None;
                let result = self.run_attempt().await;
                drop(guard);
                result
            }
            _ => {
                // A background attempt owns the link; observe its outcome.
                drop(guard);
                let budget = self.config.connect_timeout + self.config.init_timeout;
                let resolved = timeout(
                    budget,
                    self.wait_state(|s| {
                        matches!(
                            s,
                            ConnectionState::Ready
                                | ConnectionState::Failed
                                | ConnectionState::Disconnected
                        )
                    }),
                )
                .await;
                match resolved {
                    Ok(ConnectionState::Ready) => Ok(()),
                    Ok(ConnectionState::Failed) => Err(self.take_auth_error().into()),
                    Ok(_) => Err(self.close_error().into()),
                    Err(_) => Err(ConnectionError::Timeout("in-flight connect attempt").into()),
                }
            }
        }
    }

    /// One dial + handshake + initial sync, bounded by the configured
    /// timeouts. Caller must hold `connect_lock`.
    async fn run_attempt(self: &Arc<Self>) -> Result<(), Error> {
        self.set_state(ConnectionState::Connecting);
        let transport = match timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err.into());
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Timeout("dial").into());
            }
        };

        let epoch = self.link_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(out_tx);
        let session = Arc::clone(self);
        let handle = tokio::spawn(session.io_task(epoch, transport, out_rx));
        *self.io_handle.lock() = Some(handle);

        let authed = timeout(
            self.config.connect_timeout,
            self.wait_state(|s| {
                matches!(
                    s,
                    ConnectionState::Authenticated
                        | ConnectionState::Syncing
                        | ConnectionState::Ready
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected
                )
            }),
        )
        .await;
        let state = match authed {
            Ok(state) => state,
            Err(_) => {
                self.shutdown_link();
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Timeout("authentication").into());
            }
        };
        match state {
            ConnectionState::Failed => {
                self.shutdown_link();
                return Err(self.take_auth_error().into());
            }
            ConnectionState::Disconnected => return Err(self.close_error().into()),
            _ => {}
        }

        let ready = timeout(
            self.config.init_timeout,
            self.wait_state(|s| {
                matches!(
                    s,
                    ConnectionState::Ready
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected
                )
            }),
        )
        .await;
        match ready {
            Ok(ConnectionState::Ready) => {
                info!(serial = %self.device.lock().serial, "session ready");
                Ok(())
            }
            Ok(ConnectionState::Failed) => {
                self.shutdown_link();
                Err(self.take_auth_error().into())
            }
            Ok(_) => Err(self.close_error().into()),
            Err(_) => {
                self.shutdown_link();
                self.set_state(ConnectionState::Disconnected);
                Err(ConnectionError::Timeout("property initialization").into())
            }
        }
    }

    /// Idempotent; reachable from any state. Cancels in-flight handshakes,
    /// reconnect timers, and suspended helper waits.
    pub(crate) fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown_link();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Retires the current link without deciding the next state.
    fn shutdown_link(&self) {
        self.link_epoch.fetch_add(1, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        *self.outbound.lock() = None;
        if let Some(handle) = self.io_handle.lock().take() {
            handle.abort();
        }
    }

    async fn io_task(
        self: Arc<Self>,
        epoch: u64,
        mut transport: Box<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        self.events.ensure_dispatcher();
        let mut pending_batch: Map<String, Value> = Map::new();
        let reason = loop {
            if self.closing() || self.link_epoch.load(Ordering::SeqCst) != epoch {
                break CloseReason::Requested;
            }
            match next_io_event(&mut transport, &mut outbound, &self.shutdown).await {
                IoEvent::Shutdown => break CloseReason::Requested,
                IoEvent::Outbound(Some(text)) => {
                    trace!(frame = %text, "sending");
                    if let Err(err) = transport.send(text).await {
                        warn!(error = %err, "send failed");
                        break CloseReason::Lost;
                    }
                }
                IoEvent::Outbound(None) => break CloseReason::Requested,
                IoEvent::Inbound(Ok(Some(text))) => {
                    if let Err(reason) = self
                        .handle_frame(&mut transport, &mut pending_batch, &text)
                        .await
                    {
                        break reason;
                    }
                }
                IoEvent::Inbound(Ok(None)) => break CloseReason::Lost,
                IoEvent::Inbound(Err(err)) => {
                    warn!(error = %err, "receive failed");
                    break CloseReason::Lost;
                }
            }
        };
        self.on_link_down(epoch, reason);
    }

    fn on_link_down(self: &Arc<Self>, epoch: u64, reason: CloseReason) {
        if self.link_epoch.load(Ordering::SeqCst) != epoch {
            // A newer link owns the session state now.
            return;
        }
        *self.outbound.lock() = None;
        match reason {
            CloseReason::Requested => self.set_state(ConnectionState::Disconnected),
            CloseReason::AuthFailed => {}
            CloseReason::Lost => {
                let was_ready = self.ever_ready.load(Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                if was_ready
                    && !self.closing()
                    && self.config.reconnect.enabled
                    && !self.reconnecting.swap(true, Ordering::SeqCst)
                {
                    tokio::spawn(Arc::clone(self).reconnect_loop());
                }
            }
        }
    }

    /// Background retry with exponential backoff. Runs only after the
    /// session has been `Ready` once and the closure was not requested.
    async fn reconnect_loop(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let mut delay = policy.initial_backoff;
        let mut attempts: u32 = 0;
        info!("connection lost, reconnecting");
        loop {
            if self.closing() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => {}
            }
            if self.closing() {
                break;
            }
            attempts += 1;
            let guard = self.connect_lock.lock().await;
            if self.state() == ConnectionState::Ready {
                // An explicit connect call got there first.
                drop(guard);
                break;
            }
            let result = self.run_attempt().await;
            drop(guard);
            match result {
                Ok(()) => {
                    info!(attempts, "reconnected");
                    break;
                }
                Err(Error::Auth(err)) => {
                    warn!(error = %err, "reconnect aborted: authentication failed");
                    break;
                }
                Err(err) => {
                    warn!(attempts, error = %err, "reconnect attempt failed");
                    if policy.max_attempts.is_some_and(|max| attempts >= max) {
                        let exhausted = ConnectionError::ReconnectExhausted { attempts };
                        warn!(error = %exhausted, "giving up");
                        break;
                    }
                    delay = (delay * 2).min(policy.max_backoff);
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn handle_frame(
        &self,
        transport: &mut Box<dyn Transport>,
        pending_batch: &mut Map<String, Value>,
        text: &str,
    ) -> Result<(), CloseReason> {
        trace!(frame = %text, "received");
        let inbound = match messages::decode(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(error = %err, "undecodable frame");
                return Ok(());
            }
        };
        self.events.publish_message(inbound.raw);
        let Some(message) = inbound.message else {
            debug!("unhandled message type");
            return Ok(());
        };

        match message {
            Message::Hello(hello) => self.on_hello(hello),
            Message::AuthRequired(challenge) => {
                self.on_auth_required(transport, challenge).await?;
            }
            Message::AuthSuccess => {
                info!("authentication successful");
                self.set_state(ConnectionState::Authenticated);
                self.set_state(ConnectionState::Syncing);
            }
            Message::AuthError { message } => {
                let reason = message.unwrap_or_else(|| "authentication rejected".to_string());
                return self.fail_auth(AuthError::Rejected(reason));
            }
            Message::FullStatus(full) => self.on_full_status(pending_batch, full),
            Message::DeltaStatus { status } => self.on_delta_status(status),
            Message::Response(response) => self.on_response(response),
            Message::Auth { .. } | Message::SetValue { .. } | Message::SecuredMsg(_) => {
                debug!("ignoring outbound-only frame echoed by the device");
            }
        }
        Ok(())
    }

    fn on_hello(&self, hello: Hello) {
        info!(serial = %hello.serial, "device greeting");
        {
            let mut device = self.device.lock();
            if !hello.serial.is_empty() {
                device.serial = hello.serial;
            }
            if hello.hostname.is_some() {
                device.hostname = hello.hostname;
            }
            if hello.friendly_name.is_some() {
                device.friendly_name = hello.friendly_name;
            }
            if hello.version.is_some() {
                device.version = hello.version;
            }
            if hello.manufacturer.is_some() {
                device.manufacturer = hello.manufacturer;
            }
            if hello.devicetype.is_some() {
                device.device_type = hello.devicetype;
            }
            if let Some(protocol) = hello.protocol {
                device.protocol = protocol;
            }
            if let Some(secured) = hello.secured {
                device.secured = secured;
            }
        }
        self.set_state(ConnectionState::AwaitingChallenge);
    }

    async fn on_auth_required(
        &self,
        transport: &mut Box<dyn Transport>,
        challenge: AuthRequired,
    ) -> Result<(), CloseReason> {
        self.set_state(ConnectionState::Authenticating);
        let method = match challenge.hash.as_deref() {
            Some(id) => match AuthMethod::from_wire(id) {
                Ok(method) => method,
                Err(err) => return self.fail_auth(err),
            },
            None => {
                if self.device.lock().device_type.as_deref() == Some(FLEX_DEVICE_TYPE) {
                    AuthMethod::Bcrypt
                } else {
                    AuthMethod::Pbkdf2
                }
            }
        };
        *self.auth_method.lock() = method;
        debug!(?method, "challenge received");

        let serial = self.device.lock().serial.clone();
        let password = self.config.password.clone();
        // Password hashing is deliberately slow; keep it off the IO thread.
        let derived =
            tokio::task::spawn_blocking(move || auth::derive_secret(&password, &serial, method))
                .await;
        let secret = match derived {
            Ok(Ok(secret)) => secret,
            Ok(Err(err)) => return self.fail_auth(err),
            Err(err) => return self.fail_auth(AuthError::Hashing(err.to_string())),
        };

        let token3 = auth::generate_token();
        let hash = auth::auth_response(&challenge.token1, &challenge.token2, &token3, &secret);
        *self.secret.lock() = Some(secret);

        let frame = match messages::encode(&Message::Auth { token3, hash }) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "auth response encode failed");
                return Err(CloseReason::Lost);
            }
        };
        transport.send(frame).await.map_err(|err| {
            warn!(error = %err, "auth response send failed");
            CloseReason::Lost
        })
    }

    fn fail_auth(&self, err: AuthError) -> Result<(), CloseReason> {
        warn!(error = %err, "authentication failed");
        *self.auth_error.lock() = Some(err);
        self.set_state(ConnectionState::Failed);
        Err(CloseReason::AuthFailed)
    }

    fn on_full_status(&self, pending_batch: &mut Map<String, Value>, full: FullStatus) {
        if self.store.initialized() {
            // Post-initialization refresh; apply directly.
            let changes = self.store.apply_full(full.status);
            self.events.publish_changes(changes);
            return;
        }

        let completes = full.completes_batch();
        for (key, value) in full.status {
            pending_batch.insert(key, value);
        }
        if completes {
            let batch = std::mem::take(pending_batch);
            debug!(properties = batch.len(), "initial snapshot assembled");
            let changes = self.store.apply_full(batch);
            self.store.mark_initialized();
            self.set_state(ConnectionState::Ready);
            self.events.publish_changes(changes);
        }
    }

    fn on_delta_status(&self, status: Map<String, Value>) {
        if !self.store.initialized() {
            debug!("delta before initialization dropped");
            return;
        }
        for (key, value) in status {
            let changes = self.store.apply_delta(&key, value);
            self.events.publish_changes(changes);
        }
    }

    fn on_response(&self, response: CommandResponse) {
        if response.success {
            if let Some(status) = response.status {
                self.on_delta_status(status);
            }
        } else {
            let err = CommandError::Rejected {
                request_id: response
                    .request_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                message: response.message.unwrap_or_else(|| "unknown".to_string()),
            };
            // No correlation id exists to route this to a caller.
            warn!(error = %err, "device rejected command");
        }
    }
}
