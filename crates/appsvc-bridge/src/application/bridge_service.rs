//! The bridge between the platform app-service channel and the native side.
//!
//! [`Bridge`] owns the single app-service connection, the native callback
//! registrations and the return pump.  Everything the platform sends arrives
//! through [`Bridge::on_request_received`] / [`Bridge::on_closed`]; everything
//! the native side sends arrives through [`Bridge::call`] /
//! [`Bridge::complete_return`].
//!
//! # What is an app-service connection? (for beginners)
//!
//! An *app service* is a named endpoint that one packaged application exposes
//! to others.  A client opens it by naming the service and the package family
//! that provides it.  Once open, the channel is symmetric: either side may send
//! a message (a *value set*, a flat map of string keys to strings) and the
//! other side answers it with exactly one response.
//!
//! The bridge uses the channel in two directions:
//!
//! | Direction          | Platform sends           | Bridge answers / sends       |
//! |--------------------|--------------------------|------------------------------|
//! | platform → native  | `{method, input, ui}`    | `{ack}` or `{error}`         |
//! | native → platform  | (nothing)                | `{return_id, result, error}` |
//!
//! A *call* is synchronous: the platform waits for the acknowledgment.  A
//! *return* is the asynchronous completion of an earlier call, raised later by
//! the native side with the request id it chose.
//!
//! # Connection lifecycle
//!
//! ```text
//! Unconnected ──connect()──► Connecting ──open ok──► Connected
//!      ▲                          │                      │
//!      └────── open failed ───────┘                on_closed()
//!                                                        ▼
//!                                                     Closed
//! ```
//!
//! A close that arrives while a connect is still in flight is ignored: the new
//! connection's events are only read once it is stored, so the close can only
//! belong to an earlier connection.
//!
//! # Threads and tasks
//!
//! ```text
//! platform ──request──► event loop task ──► spawn_blocking(call callback)
//!                                      ◄── ack / error response
//! native thread ──complete_return()──► mpsc ──► return pump task
//!                                               ├─► spawn_blocking(return callback)
//!                                               └─► spawn(connection.send_message({return_id, result, error}))
//! ```
//!
//! Native callbacks always run on blocking threads, off the async scheduler.
//! Return callbacks run one at a time, in the order the returns were
//! completed.  Each platform send runs in its own task, so a send the
//! platform never answers holds back nothing but itself.
//!
//! The connection lock is a plain `std::sync::Mutex` and is never held across
//! an `.await`.
//!
//! # Correlation
//!
//! The bridge keeps no table of pending calls.  Request ids are opaque
//! strings chosen by whoever completes the call; each accepted return is
//! delivered exactly once to the return callback and sent at most once over
//! the open connection.

use std::ffi::{CStr, CString};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use appsvc_core::protocol::{decode_request, keys, ClosedStatus, OpenStatus, RequestDecodeError};
use appsvc_core::text;
use appsvc_core::{
    CallEnvelope, ConnectionState, EncodingError, EnvelopeError, OutcomeError, ReturnMessage,
    StateError, ValueSet,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::callbacks::CallbackRegistry;
use crate::domain::BridgeConfig;
use crate::infrastructure::app_service::{
    AppServiceConnection, AppServiceRequest, AppServiceTransport, ConnectionEvent, ConnectionId,
    TransportError,
};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Which native callback an operation needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Call,
    Return,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Call => "call",
            Self::Return => "return",
        })
    }
}

/// Errors from bridge operations other than connect.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An operation ran before [`Bridge::initialize`].
    #[error("bridge is not initialized")]
    NotInitialized,

    /// [`Bridge::initialize`] ran twice.
    #[error("bridge is already initialized")]
    AlreadyInitialized,

    /// [`Bridge::initialize`] ran outside a tokio runtime.
    #[error("bridge must be initialized inside a tokio runtime")]
    NoRuntime,

    /// The native side has not registered the callback this path needs.
    #[error("no {0} callback is registered")]
    CallbackNotRegistered(CallbackKind),

    /// Text could not cross between platform strings and native buffers.
    #[error("text conversion failed: {0}")]
    Encoding(#[from] EncodingError),

    /// An encoded call string is malformed.
    #[error("invalid call: {0}")]
    Envelope(#[from] EnvelopeError),

    /// An inbound request value set is malformed.
    #[error("invalid request: {0}")]
    Request(#[from] RequestDecodeError),

    /// A return carries both a result and an error.
    #[error("invalid return: {0}")]
    Outcome(#[from] OutcomeError),

    #[error("return has an empty request id")]
    EmptyRequestId,

    /// The call callback panicked.
    #[error("call callback panicked")]
    CallbackPanicked,

    /// The blocking task running a native callback failed to join.
    #[error("native callback task failed: {0}")]
    NativeTask(String),

    /// The return pump is no longer running.
    #[error("return pump has stopped")]
    PumpStopped,
}

/// Errors from [`Bridge::connect`].  A failed connect is reported once and
/// never retried.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A connect is already in flight, or the connection is already open.
    #[error(transparent)]
    State(#[from] StateError),

    /// The platform refused to open the service.
    #[error("app service refused the connection: {0:?}")]
    Refused(OpenStatus),

    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),

    /// The transport failed for another reason.
    #[error("transport failed while connecting: {0}")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Refused(status) => Self::Refused(status),
            other => Self::Transport(other),
        }
    }
}

// ── Bridge ────────────────────────────────────────────────────────────────────

/// Connection state and the connection it describes, kept under one lock so
/// they always change together.
#[derive(Default)]
struct Link {
    /// Where the single connection is in its lifecycle.
    state: ConnectionState,
    /// The open connection.  `Some` only while `state` is `Connected`.
    connection: Option<Arc<dyn AppServiceConnection>>,
}

/// A return accepted by [`Bridge::complete_return_str`], with its native
/// buffers already built so the pump cannot fail on conversion.
struct QueuedReturn {
    /// The message sent to the platform.
    message: ReturnMessage,
    /// Request id handed to the return callback.
    id: CString,
    /// Result half handed to the return callback; empty when absent.
    result: CString,
    /// Error half handed to the return callback; empty when absent.
    error: CString,
}

/// Bridges one app-service connection and one native call target.
///
/// A `Bridge` is always shared as `Arc<Bridge>`: the event loop task and the
/// request handlers it spawns each hold a clone.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use std::ffi::{CStr, CString};
/// use std::sync::Arc;
///
/// use appsvc_bridge::infrastructure::loopback;
/// use appsvc_bridge::{Bridge, BridgeConfig};
///
/// let (transport, _host) = loopback();
/// let bridge = Bridge::new(BridgeConfig::default(), Arc::new(transport));
/// bridge.set_call_callback(|_call: &CStr| CString::new("ack").unwrap_or_default());
/// bridge.set_return_callback(|_id: &CStr, _result: &CStr, _error: &CStr| {});
/// bridge.initialize()?;
/// bridge.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Bridge {
    /// Which service to open and how long to wait for it.
    config: BridgeConfig,
    /// Opens the platform channel on [`Bridge::connect`].
    transport: Arc<dyn AppServiceTransport>,
    /// Native call and return callbacks, shared with the return pump.
    callbacks: Arc<CallbackRegistry>,
    /// Connection state, shared with the return pump.
    link: Arc<Mutex<Link>>,
    /// Producer side of the return queue.  Any thread may push.
    returns: mpsc::UnboundedSender<QueuedReturn>,
    /// Consumer side of the return queue, taken by `initialize` to start the
    /// pump.
    pump_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedReturn>>>,
    /// Set once the return pump is running.
    initialized: AtomicBool,
}

impl Bridge {
    /// Creates an uninitialized bridge.  No task is spawned until
    /// [`Bridge::initialize`].
    pub fn new(config: BridgeConfig, transport: Arc<dyn AppServiceTransport>) -> Arc<Self> {
        let (returns, pump_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            transport,
            callbacks: Arc::new(CallbackRegistry::new()),
            link: Arc::new(Mutex::new(Link::default())),
            returns,
            pump_rx: Mutex::new(Some(pump_rx)),
            initialized: AtomicBool::new(false),
        })
    }

    /// One-time setup: starts the return pump on the current runtime.
    ///
    /// The returned handle resolves once the bridge is dropped and every
    /// queued return has been delivered.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NoRuntime`] outside a tokio runtime,
    /// [`BridgeError::AlreadyInitialized`] on a second call.
    pub fn initialize(&self) -> Result<JoinHandle<()>, BridgeError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        let returns = lock(&self.pump_rx)
            .take()
            .ok_or(BridgeError::AlreadyInitialized)?;

        let pump = ReturnPump {
            callbacks: Arc::clone(&self.callbacks),
            link: Arc::clone(&self.link),
        };
        let handle = runtime.spawn(pump.run(returns));
        self.initialized.store(true, Ordering::Release);

        info!(
            "bridge initialized for app service '{}'",
            self.config.service_name
        );
        Ok(handle)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }

    /// Id of the open connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.link).connection.as_ref().map(|c| c.id())
    }

    /// Registers the native call callback, replacing any previous one.
    pub fn set_call_callback<F>(&self, callback: F)
    where
        F: Fn(&CStr) -> CString + Send + Sync + 'static,
    {
        if self.callbacks.set_call(Arc::new(callback)) {
            debug!("call callback replaced");
        } else {
            debug!("call callback registered");
        }
    }

    /// Registers the native return callback, replacing any previous one.
    pub fn set_return_callback<F>(&self, callback: F)
    where
        F: Fn(&CStr, &CStr, &CStr) + Send + Sync + 'static,
    {
        if self.callbacks.set_return(Arc::new(callback)) {
            debug!("return callback replaced");
        } else {
            debug!("return callback registered");
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Opens the configured app service.
    ///
    /// On success the bridge holds the connection, the state is `Connected`,
    /// and a task feeds the connection's events into
    /// [`Bridge::on_request_received`] and [`Bridge::on_closed`].  On failure
    /// the state returns to `Unconnected`.
    ///
    /// # Errors
    ///
    /// See [`ConnectError`].
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectionId, ConnectError> {
        self.ensure_initialized()?;
        {
            let mut link = lock(&self.link);
            link.state = link.state.begin_connect()?;
        }

        let target = self.config.service_target();
        info!(
            "connecting to app service '{}' in package '{}'",
            target.service_name, target.package_family_name
        );

        let timeout = self.config.connect_timeout;
        let opened = match tokio::time::timeout(timeout, self.transport.open(&target)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.abandon_connect();
                warn!("connect to '{}' failed: {e}", target.service_name);
                return Err(e.into());
            }
            Err(_) => {
                self.abandon_connect();
                warn!(
                    "connect to '{}' timed out after {timeout:?}",
                    target.service_name
                );
                return Err(ConnectError::TimedOut(timeout));
            }
        };

        let id = opened.connection.id();
        {
            let mut link = lock(&self.link);
            link.state = link.state.open_succeeded()?;
            link.connection = Some(opened.connection);
        }
        info!(
            "connected to app service '{}' (connection {id})",
            target.service_name
        );

        tokio::spawn(Arc::clone(self).run_events(id, opened.events));
        Ok(id)
    }

    fn abandon_connect(&self) {
        let mut link = lock(&self.link);
        if let Ok(next) = link.state.open_failed() {
            link.state = next;
        }
    }

    async fn run_events(
        self: Arc<Self>,
        id: ConnectionId,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::RequestReceived(request) => {
                    let bridge = Arc::clone(&self);
                    tokio::spawn(async move { bridge.on_request_received(request).await });
                }
                ConnectionEvent::Closed(status) => {
                    self.on_closed(id, status);
                    return;
                }
            }
        }
        // The transport dropped its event sender without a close event.
        self.on_closed(id, ClosedStatus::Unknown);
    }

    /// Handles the platform closing a connection.
    ///
    /// Releases the connection and moves to `Closed`.  Two notifications are
    /// ignored because they cannot belong to the current connection:
    ///
    /// - one for a connection other than the one currently held, and
    /// - any close that arrives while a connect is in flight.  The new
    ///   connection's events are only read after it is stored, so such a
    ///   close was raised by an earlier connection.
    pub fn on_closed(&self, connection: ConnectionId, status: ClosedStatus) {
        let mut link = lock(&self.link);
        let stale = match &link.connection {
            Some(current) => current.id() != connection,
            None => link.state == ConnectionState::Connecting,
        };
        if stale {
            debug!("ignoring close of stale connection {connection} while {}", link.state);
            return;
        }
        let previous = link.state;
        link.connection = None;
        link.state = previous.close();
        drop(link);

        info!("app-service connection {connection} closed ({status:?}) while {previous}");
    }

    // ── Platform → native ─────────────────────────────────────────────────────

    /// Handles one inbound platform request.
    ///
    /// Takes the request deferral, decodes the call, runs the call callback
    /// on a blocking thread and answers with `{ack}` or `{error}`.  The
    /// deferral is completed after the response is sent.
    pub async fn on_request_received(&self, mut request: Box<dyn AppServiceRequest>) {
        let deferral = request.take_deferral();
        let message = request.message().clone();

        let response = match self.handle_request(&message).await {
            Ok(ack) => ValueSet::new().with(keys::ACK, ack),
            Err(e) => {
                warn!("request failed: {e}");
                ValueSet::new().with(keys::ERROR, e.to_string())
            }
        };

        if let Err(e) = request.send_response(response).await {
            warn!("failed to send response: {e}");
        }
        deferral.complete();
    }

    async fn handle_request(&self, message: &ValueSet) -> Result<String, BridgeError> {
        self.ensure_initialized()?;
        let call = decode_request(message)?;
        debug!("request received for method '{}'", call.method);

        let callbacks = Arc::clone(&self.callbacks);
        let encoded = call.encode();
        tokio::task::spawn_blocking(move || invoke_call(&callbacks, &encoded))
            .await
            .map_err(|e| BridgeError::NativeTask(e.to_string()))?
    }

    /// Encodes `call` and hands it to the call callback on the current
    /// thread.  Returns the acknowledgment.
    ///
    /// # Errors
    ///
    /// [`BridgeError::CallbackNotRegistered`] without a call callback, or a
    /// conversion error if the acknowledgment is not UTF-8.
    pub fn dispatch(&self, call: &CallEnvelope) -> Result<String, BridgeError> {
        self.ensure_initialized()?;
        invoke_call(&self.callbacks, &call.encode())
    }

    /// Native entry point: forwards an already-encoded call, byte for byte,
    /// to the call callback and returns the acknowledgment.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Envelope`] if `encoded` is not a valid call string,
    /// plus the errors of [`Bridge::dispatch`].
    pub fn call(&self, encoded: &str) -> Result<String, BridgeError> {
        self.ensure_initialized()?;
        CallEnvelope::decode(encoded)?;
        invoke_call(&self.callbacks, encoded)
    }

    // ── Native → platform ─────────────────────────────────────────────────────

    /// Completes a call from native buffers.  Safe to call from any thread.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Encoding`] if a buffer is not UTF-8, plus the errors of
    /// [`Bridge::complete_return_str`].
    pub fn complete_return(
        &self,
        request_id: &CStr,
        result: &CStr,
        error: &CStr,
    ) -> Result<(), BridgeError> {
        let request_id = text::from_buffer(request_id)?;
        let result = text::from_buffer(result)?;
        let error = text::from_buffer(error)?;
        self.complete_return_str(&request_id, &result, &error)
    }

    /// Completes a call.  An empty string means "absent"; exactly one of
    /// `result` and `error` may be non-empty.
    ///
    /// The return is queued for the pump, which hands it to the return
    /// callback and then sends `{return_id, result, error}` over the open
    /// connection.
    ///
    /// # Errors
    ///
    /// [`BridgeError::CallbackNotRegistered`] without a return callback,
    /// [`BridgeError::EmptyRequestId`], [`BridgeError::Outcome`] when both
    /// halves are set, and [`BridgeError::Encoding`] for interior NULs.
    pub fn complete_return_str(
        &self,
        request_id: &str,
        result: &str,
        error: &str,
    ) -> Result<(), BridgeError> {
        self.ensure_initialized()?;
        if self.callbacks.return_callback().is_none() {
            error!("return for request '{request_id}' dropped: no return callback is registered");
            return Err(BridgeError::CallbackNotRegistered(CallbackKind::Return));
        }
        if request_id.is_empty() {
            return Err(BridgeError::EmptyRequestId);
        }

        let message = ReturnMessage::from_parts(request_id, result, error)?;
        let queued = QueuedReturn {
            id: text::to_buffer(request_id)?,
            result: text::to_buffer(result)?,
            error: text::to_buffer(error)?,
            message,
        };
        self.returns
            .send(queued)
            .map_err(|_| BridgeError::PumpStopped)?;

        debug!("return for request '{request_id}' queued");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), BridgeError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized)
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("service", &self.config.service_name)
            .field("state", &self.state())
            .field("initialized", &self.is_initialized())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Runs the call callback for one encoded call.
fn invoke_call(callbacks: &CallbackRegistry, encoded: &str) -> Result<String, BridgeError> {
    let Some(callback) = callbacks.call_callback() else {
        error!("call '{encoded}' dropped: no call callback is registered");
        return Err(BridgeError::CallbackNotRegistered(CallbackKind::Call));
    };

    let buffer = text::to_buffer(encoded)?;
    let ack = catch_unwind(AssertUnwindSafe(|| callback(&buffer))).map_err(|_| {
        error!("call callback panicked while handling '{encoded}'");
        BridgeError::CallbackPanicked
    })?;
    Ok(text::from_buffer(&ack)?)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Return pump ───────────────────────────────────────────────────────────────

/// Sole consumer of queued returns.
///
/// The pump hands each return to the return callback, waits for the callback
/// to finish, then starts the platform send in a separate task and moves on
/// to the next return.
struct ReturnPump {
    /// Where the return callback is looked up for every return.
    callbacks: Arc<CallbackRegistry>,
    /// Where the open connection, if any, is read for every send.
    link: Arc<Mutex<Link>>,
}

impl ReturnPump {
    async fn run(self, mut returns: mpsc::UnboundedReceiver<QueuedReturn>) {
        while let Some(queued) = returns.recv().await {
            self.deliver(queued).await;
        }
        debug!("return pump stopped");
    }

    async fn deliver(&self, queued: QueuedReturn) {
        let QueuedReturn {
            message,
            id,
            result,
            error,
        } = queued;

        // Return callbacks are never unregistered, and one was present when
        // this return was queued.
        if let Some(callback) = self.callbacks.return_callback() {
            let ran = tokio::task::spawn_blocking(move || {
                catch_unwind(AssertUnwindSafe(|| callback(&id, &result, &error))).is_ok()
            })
            .await;
            if !matches!(ran, Ok(true)) {
                error!("return callback panicked for request '{}'", message.id);
            }
        }

        let Some(connection) = lock(&self.link).connection.clone() else {
            warn!(
                "return for request '{}' not delivered: no open connection",
                message.id
            );
            return;
        };

        // The platform may sit on a send indefinitely; later returns must
        // still reach the return callback.
        tokio::spawn(async move {
            match connection.send_message(message.to_value_set()).await {
                Ok(_) => debug!("return for request '{}' delivered", message.id),
                Err(e) => warn!("return for request '{}' not delivered: {e}", message.id),
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
