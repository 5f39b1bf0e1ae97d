//! In-memory app-service channel.
//!
//! [`loopback`] returns two linked halves:
//!
//! - a [`LoopbackTransport`] that the bridge opens like any other transport;
//! - a [`LoopbackService`] that plays the platform: it decides whether opens
//!   succeed, injects inbound requests, observes every message the bridge
//!   sends, and closes the channel.
//!
//! Messages the bridge sends are answered immediately with an empty value
//! set and queued for the service to read.

use std::future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appsvc_core::protocol::{keys, ClosedStatus, OpenStatus};
use appsvc_core::ValueSet;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::app_service::{
    AppServiceConnection, AppServiceRequest, AppServiceTransport, ConnectionEvent, ConnectionId,
    DeferralWaiter, OpenedConnection, RequestDeferral, TransportError,
};
use crate::domain::config::ServiceTarget;

/// Inbound events buffered per connection before `send_request` waits.
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy)]
enum OpenPolicy {
    Accept,
    Refuse(OpenStatus),
    Stall,
}

struct ServiceSide {
    id: ConnectionId,
    events: mpsc::Sender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
}

struct Shared {
    policy: Mutex<OpenPolicy>,
    opens: AtomicUsize,
    current: Mutex<Option<ServiceSide>>,
    inbox: mpsc::UnboundedSender<ValueSet>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates a linked transport / service pair.  Opens are accepted until
/// told otherwise.
pub fn loopback() -> (LoopbackTransport, LoopbackService) {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        policy: Mutex::new(OpenPolicy::Accept),
        opens: AtomicUsize::new(0),
        current: Mutex::new(None),
        inbox: inbox_tx,
    });
    (
        LoopbackTransport {
            shared: Arc::clone(&shared),
        },
        LoopbackService {
            shared,
            inbox: tokio::sync::Mutex::new(inbox_rx),
        },
    )
}

// ── Bridge side ───────────────────────────────────────────────────────────────

/// Bridge-side half of the loopback pair.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl AppServiceTransport for LoopbackTransport {
    async fn open(&self, target: &ServiceTarget) -> Result<OpenedConnection, TransportError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let policy = *lock(&self.shared.policy);
        match policy {
            OpenPolicy::Accept => {}
            OpenPolicy::Refuse(status) => return Err(TransportError::Refused(status)),
            OpenPolicy::Stall => future::pending::<()>().await,
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        *lock(&self.shared.current) = Some(ServiceSide {
            id,
            events: events_tx,
            closed: Arc::clone(&closed),
        });
        debug!("loopback: opened '{}' as connection {id}", target.service_name);

        let connection = LoopbackConnection {
            id,
            inbox: self.shared.inbox.clone(),
            closed,
        };
        Ok(OpenedConnection {
            connection: Arc::new(connection),
            events: events_rx,
        })
    }
}

struct LoopbackConnection {
    id: ConnectionId,
    inbox: mpsc::UnboundedSender<ValueSet>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl AppServiceConnection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_message(&self, message: ValueSet) -> Result<ValueSet, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.inbox
            .send(message)
            .map_err(|_| TransportError::Closed)?;
        Ok(ValueSet::new())
    }
}

struct LoopbackRequest {
    message: ValueSet,
    reply: Option<oneshot::Sender<ValueSet>>,
    deferral: Arc<Mutex<Option<DeferralWaiter>>>,
    deferral_taken: bool,
}

#[async_trait]
impl AppServiceRequest for LoopbackRequest {
    fn message(&self) -> &ValueSet {
        &self.message
    }

    fn take_deferral(&mut self) -> RequestDeferral {
        if self.deferral_taken {
            return RequestDeferral::detached();
        }
        self.deferral_taken = true;
        let (deferral, waiter) = RequestDeferral::new();
        *lock(&self.deferral) = Some(waiter);
        deferral
    }

    async fn send_response(&mut self, message: ValueSet) -> Result<(), TransportError> {
        let reply = self
            .reply
            .take()
            .ok_or_else(|| TransportError::Protocol("request already answered".to_string()))?;
        reply.send(message).map_err(|_| TransportError::Closed)
    }
}

// ── Platform side ─────────────────────────────────────────────────────────────

/// The response to a request injected with [`LoopbackService::send_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackReply {
    pub message: ValueSet,
    /// Whether the handler took (and has since completed) a deferral.
    pub deferred: bool,
}

impl LoopbackReply {
    pub fn ack(&self) -> Option<String> {
        self.text(keys::ACK)
    }

    pub fn error(&self) -> Option<String> {
        self.text(keys::ERROR)
    }

    fn text(&self, key: &str) -> Option<String> {
        self.message.get_text(key).ok().flatten()
    }
}

/// Platform-side half of the loopback pair.
pub struct LoopbackService {
    shared: Arc<Shared>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<ValueSet>>,
}

impl LoopbackService {
    pub fn accept_opens(&self) {
        *lock(&self.shared.policy) = OpenPolicy::Accept;
    }

    /// Makes every later open fail with `status`.
    pub fn refuse_opens(&self, status: OpenStatus) {
        *lock(&self.shared.policy) = OpenPolicy::Refuse(status);
    }

    /// Makes every later open hang forever.
    pub fn stall_opens(&self) {
        *lock(&self.shared.policy) = OpenPolicy::Stall;
    }

    /// Number of open attempts seen so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Id of the connection the service currently holds open.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.shared.current).as_ref().map(|side| side.id)
    }

    /// Sends a request to the bridge and waits for its response.
    ///
    /// If the handler took a deferral, this also waits for the deferral to
    /// complete.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] without an open connection and
    /// [`TransportError::NoResponse`] if the request was dropped unanswered.
    pub async fn send_request(&self, message: ValueSet) -> Result<LoopbackReply, TransportError> {
        let events = lock(&self.shared.current)
            .as_ref()
            .filter(|side| !side.closed.load(Ordering::SeqCst))
            .map(|side| side.events.clone())
            .ok_or(TransportError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let deferral = Arc::new(Mutex::new(None));
        let request = LoopbackRequest {
            message,
            reply: Some(reply_tx),
            deferral: Arc::clone(&deferral),
            deferral_taken: false,
        };
        events
            .send(ConnectionEvent::RequestReceived(Box::new(request)))
            .await
            .map_err(|_| TransportError::Closed)?;

        let message = reply_rx.await.map_err(|_| TransportError::NoResponse)?;
        let waiter = lock(&deferral).take();
        let deferred = waiter.is_some();
        if let Some(waiter) = waiter {
            waiter.wait().await;
        }
        Ok(LoopbackReply { message, deferred })
    }

    /// Closes the current connection and notifies the bridge.
    pub async fn close(&self, status: ClosedStatus) {
        let side = lock(&self.shared.current).take();
        if let Some(side) = side {
            side.closed.store(true, Ordering::SeqCst);
            debug!("loopback: closing connection {} ({status:?})", side.id);
            let _ = side.events.send(ConnectionEvent::Closed(status)).await;
        }
    }

    /// Next message the bridge sent, waiting if none is queued yet.
    pub async fn next_message(&self) -> Option<ValueSet> {
        self.inbox.lock().await.recv().await
    }

    /// Next message the bridge sent, if one is already queued.
    pub fn try_next_message(&self) -> Option<ValueSet> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target() -> ServiceTarget {
        ServiceTarget {
            service_name: "com.example.appsvc".to_string(),
            package_family_name: "Example.Bridge_8wekyb3d8bbwe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_refused_open_reports_status() {
        let (transport, service) = loopback();
        service.refuse_opens(OpenStatus::NotAuthorized);

        let result = transport.open(&target()).await;

        assert!(matches!(
            result,
            Err(TransportError::Refused(OpenStatus::NotAuthorized))
        ));
        assert_eq!(service.open_count(), 1);
        assert!(service.connection_id().is_none());
    }

    #[tokio::test]
    async fn test_stalled_open_never_resolves() {
        let (transport, service) = loopback();
        service.stall_opens();

        let result = tokio::time::timeout(Duration::from_millis(20), transport.open(&target())).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sent_messages_reach_service_inbox() {
        // Arrange
        let (transport, service) = loopback();
        let opened = transport.open(&target()).await.unwrap();

        // Act
        let reply = opened
            .connection
            .send_message(ValueSet::new().with(keys::RESULT, "done"))
            .await
            .unwrap();

        // Assert
        assert!(reply.is_empty());
        let seen = service.try_next_message().unwrap();
        assert_eq!(seen.get_text(keys::RESULT).unwrap().as_deref(), Some("done"));
        assert_eq!(service.connection_id(), Some(opened.connection.id()));
    }

    #[tokio::test]
    async fn test_injected_request_round_trips() {
        // Arrange: answer every request by echoing the input.
        let (transport, service) = loopback();
        let mut opened = transport.open(&target()).await.unwrap();
        let responder = tokio::spawn(async move {
            if let Some(ConnectionEvent::RequestReceived(mut request)) = opened.events.recv().await
            {
                let deferral = request.take_deferral();
                let input = request.message().get_text(keys::INPUT).unwrap().unwrap();
                request
                    .send_response(ValueSet::new().with(keys::ACK, input))
                    .await
                    .unwrap();
                deferral.complete();
            }
        });

        // Act
        let reply = service
            .send_request(ValueSet::new().with(keys::INPUT, "hello"))
            .await
            .unwrap();

        // Assert
        responder.await.unwrap();
        assert_eq!(reply.ack().as_deref(), Some("hello"));
        assert!(reply.deferred);
    }

    #[tokio::test]
    async fn test_dropped_request_is_no_response() {
        let (transport, service) = loopback();
        let mut opened = transport.open(&target()).await.unwrap();
        tokio::spawn(async move {
            let _ = opened.events.recv().await;
        });

        let result = service.send_request(ValueSet::new()).await;

        assert!(matches!(result, Err(TransportError::NoResponse)));
    }

    #[tokio::test]
    async fn test_close_emits_event_and_rejects_sends() {
        // Arrange
        let (transport, service) = loopback();
        let mut opened = transport.open(&target()).await.unwrap();

        // Act
        service.close(ClosedStatus::Canceled).await;

        // Assert
        assert!(matches!(
            opened.events.recv().await,
            Some(ConnectionEvent::Closed(ClosedStatus::Canceled))
        ));
        assert!(opened.events.recv().await.is_none());
        assert!(matches!(
            opened.connection.send_message(ValueSet::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            service.send_request(ValueSet::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
