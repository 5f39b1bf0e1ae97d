//! App-service transport over TCP.
//!
//! The service host listens on a TCP port and speaks the JSON-lines frames
//! defined in [`appsvc_core::protocol::frame`].  Opening a connection is:
//!
//! ```text
//! bridge ──{"kind":"open", service, package}──────► host
//! bridge ◄─{"kind":"open_status", status}─────────── host
//! ```
//!
//! After that, either side may send `request` frames; each is answered by a
//! `response` frame carrying the same id.  A `closed` frame or EOF ends the
//! connection.
//!
//! # What is a JSON-lines frame? (for beginners)
//!
//! Each frame is one JSON object on a single line, terminated by `\n`.  JSON
//! escapes newlines inside strings, so a raw `\n` byte can only ever mean "end
//! of frame".  A complete exchange looks like this on the wire:
//!
//! ```text
//! {"kind":"open","service":"com.example.appsvc","package":"Example.Bridge_8wekyb3d8bbwe"}
//! {"kind":"open_status","status":"success"}
//! {"kind":"request","id":1,"message":{"error":"","result":"done","return_id":"req-1"}}
//! {"kind":"response","id":1,"status":"success","message":{}}
//! ```
//!
//! # How responses find their request
//!
//! Outbound requests are numbered by a [`FrameIdCounter`].  Before writing a
//! request, [`TcpConnection::send_message`] parks a oneshot sender in the
//! shared `pending` table under that id.  The reader task looks up the id of
//! every `response` frame in the table and completes the matching sender.
//! When the connection closes, the table is cleared, which drops every parked
//! sender and fails each waiting send with [`TransportError::Closed`].
//!
//! # Streaming
//!
//! TCP is a stream protocol: one `read()` may return part of a line or
//! several lines at once.  Incoming bytes are accumulated in a buffer and
//! complete lines are split off with [`drain_frames`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appsvc_core::protocol::{
    drain_frames, encode_frame, ClosedStatus, Frame, FrameIdCounter, OpenStatus, ResponseStatus,
};
use appsvc_core::ValueSet;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::app_service::{
    AppServiceConnection, AppServiceRequest, AppServiceTransport, ConnectionEvent, ConnectionId,
    OpenedConnection, RequestDeferral, TransportError,
};
use crate::domain::config::ServiceTarget;

const READ_CHUNK: usize = 4096;
const EVENT_QUEUE: usize = 64;

type PendingReply = oneshot::Sender<(ResponseStatus, ValueSet)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opens app-service connections to a TCP service host.
///
/// Every [`AppServiceTransport::open`] dials a fresh TCP stream, so one
/// transport can serve any number of successive connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Address of the service host, e.g. `127.0.0.1:24900`.
    addr: SocketAddr,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl AppServiceTransport for TcpTransport {
    async fn open(&self, target: &ServiceTarget) -> Result<OpenedConnection, TransportError> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let shared = Arc::new(TcpShared {
            writer: tokio::sync::Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            ids: FrameIdCounter::new(),
            closed: AtomicBool::new(false),
        });
        shared
            .write_frame(&Frame::Open {
                service: target.service_name.clone(),
                package: target.package_family_name.clone(),
            })
            .await?;

        let mut recv_buf = Vec::with_capacity(READ_CHUNK);
        let (status, early) = read_open_status(&mut read_half, &mut recv_buf).await?;
        if status != OpenStatus::Success {
            debug!("host at {} refused '{}': {status:?}", self.addr, target.service_name);
            return Err(TransportError::Refused(status));
        }

        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let reader = FrameReader {
            id,
            shared: Arc::clone(&shared),
            events: events_tx,
        };
        tokio::spawn(reader.run(read_half, recv_buf, early));

        debug!("connection {id} open to {}", self.addr);
        Ok(OpenedConnection {
            connection: Arc::new(TcpConnection { id, shared }),
            events: events_rx,
        })
    }
}

/// Reads until the host answers the `open` frame.  Frames that arrived in
/// the same read after the status are returned for the reader task.
async fn read_open_status(
    read_half: &mut OwnedReadHalf,
    recv_buf: &mut Vec<u8>,
) -> Result<(OpenStatus, Vec<Frame>), TransportError> {
    let mut read_tmp = vec![0u8; READ_CHUNK];
    loop {
        let n = read_half.read(&mut read_tmp).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        recv_buf.extend_from_slice(&read_tmp[..n]);

        let (mut frames, err) = drain_frames(recv_buf);
        if let Some(e) = err {
            return Err(e.into());
        }
        if frames.is_empty() {
            continue;
        }
        return match frames.remove(0) {
            Frame::OpenStatus { status } => Ok((status, frames)),
            other => Err(TransportError::Protocol(format!(
                "expected open_status, got {other:?}"
            ))),
        };
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// State shared by the connection handle, its inbound requests and the
/// reader task.
struct TcpShared {
    /// Write half of the stream.  An async mutex, because a frame write is
    /// awaited while the lock is held and two frames must never interleave.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Outbound requests awaiting a response, by frame id.
    pending: Mutex<HashMap<u64, PendingReply>>,
    /// Source of outbound request frame ids.
    ids: FrameIdCounter,
    /// Set by the reader task once the stream has ended.
    closed: AtomicBool,
}

impl TcpShared {
    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = encode_frame(frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Marks the connection closed and fails every outstanding request.
    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.pending).clear();
    }
}

/// The [`AppServiceConnection`] handed to the bridge.
struct TcpConnection {
    /// Fresh for every open.
    id: ConnectionId,
    shared: Arc<TcpShared>,
}

#[async_trait]
impl AppServiceConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_message(&self, message: ValueSet) -> Result<ValueSet, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let frame_id = self.shared.ids.next();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(frame_id, tx);
        // `shutdown` may have cleared the table just before the insert.
        if self.shared.closed.load(Ordering::SeqCst) {
            lock(&self.shared.pending).remove(&frame_id);
            return Err(TransportError::Closed);
        }

        let frame = Frame::Request {
            id: frame_id,
            message,
        };
        if let Err(e) = self.shared.write_frame(&frame).await {
            lock(&self.shared.pending).remove(&frame_id);
            return Err(e);
        }

        match rx.await {
            Ok((ResponseStatus::Success, reply)) => Ok(reply),
            Ok((status, _)) => Err(TransportError::ResponseFailed(status)),
            Err(_) => Err(TransportError::Closed),
        }
    }
}

// ── Inbound requests ──────────────────────────────────────────────────────────

/// A request frame from the host.  Dropping it unanswered sends a
/// `failure` response.
struct TcpRequest {
    /// Id of the `request` frame; the response echoes it.
    frame_id: u64,
    /// The request payload.
    message: ValueSet,
    shared: Arc<TcpShared>,
    /// Set once a response frame has been written.
    answered: bool,
}

#[async_trait]
impl AppServiceRequest for TcpRequest {
    fn message(&self) -> &ValueSet {
        &self.message
    }

    /// The exchange only ends when the response frame is written, so there
    /// is nothing to wait on.
    fn take_deferral(&mut self) -> RequestDeferral {
        RequestDeferral::detached()
    }

    async fn send_response(&mut self, message: ValueSet) -> Result<(), TransportError> {
        if self.answered {
            return Err(TransportError::Protocol("request already answered".to_string()));
        }
        self.answered = true;
        self.shared
            .write_frame(&Frame::Response {
                id: self.frame_id,
                status: ResponseStatus::Success,
                message,
            })
            .await
    }
}

impl Drop for TcpRequest {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        warn!("request {} dropped without a response", self.frame_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        let frame = Frame::Response {
            id: self.frame_id,
            status: ResponseStatus::Failure,
            message: ValueSet::new(),
        };
        runtime.spawn(async move {
            let _ = shared.write_frame(&frame).await;
        });
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Owns the read half of the stream for the life of the connection.
///
/// The reader is the only task that reads from the socket.  It turns
/// `request` frames into [`ConnectionEvent::RequestReceived`], completes
/// parked sends on `response` frames, and emits exactly one
/// [`ConnectionEvent::Closed`] when the stream ends.
struct FrameReader {
    /// Connection id, for log lines.
    id: ConnectionId,
    shared: Arc<TcpShared>,
    /// Feeds the bridge's event loop.
    events: mpsc::Sender<ConnectionEvent>,
}

impl FrameReader {
    /// Reads frames until the host closes the channel, then emits a single
    /// `Closed` event.
    async fn run(self, mut read_half: OwnedReadHalf, mut recv_buf: Vec<u8>, early: Vec<Frame>) {
        let reason = self.read_until_closed(&mut read_half, &mut recv_buf, early).await;
        self.shared.shutdown();
        debug!("connection {}: closed ({reason:?})", self.id);
        let _ = self.events.send(ConnectionEvent::Closed(reason)).await;
    }

    async fn read_until_closed(
        &self,
        read_half: &mut OwnedReadHalf,
        recv_buf: &mut Vec<u8>,
        early: Vec<Frame>,
    ) -> ClosedStatus {
        for frame in early {
            if let Some(reason) = self.handle(frame).await {
                return reason;
            }
        }

        let mut read_tmp = vec![0u8; READ_CHUNK];
        loop {
            let n = match read_half.read(&mut read_tmp).await {
                Ok(0) => {
                    debug!("connection {}: host closed the stream (EOF)", self.id);
                    return ClosedStatus::Unknown;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("connection {}: read failed: {e}", self.id);
                    return ClosedStatus::Unknown;
                }
            };
            recv_buf.extend_from_slice(&read_tmp[..n]);

            loop {
                let (frames, err) = drain_frames(recv_buf);
                for frame in frames {
                    if let Some(reason) = self.handle(frame).await {
                        return reason;
                    }
                }
                match err {
                    Some(e) => warn!("connection {}: dropping malformed frame: {e}", self.id),
                    None => break,
                }
            }
        }
    }

    /// Routes one frame.  Returns the close reason for a `closed` frame.
    async fn handle(&self, frame: Frame) -> Option<ClosedStatus> {
        match frame {
            Frame::Request { id, message } => {
                let request = TcpRequest {
                    frame_id: id,
                    message,
                    shared: Arc::clone(&self.shared),
                    answered: false,
                };
                if self
                    .events
                    .send(ConnectionEvent::RequestReceived(Box::new(request)))
                    .await
                    .is_err()
                {
                    debug!("connection {}: event receiver gone", self.id);
                }
            }
            Frame::Response {
                id,
                status,
                message,
            } => match lock(&self.shared.pending).remove(&id) {
                Some(reply) => {
                    let _ = reply.send((status, message));
                }
                None => warn!("connection {}: response for unknown request {id}", self.id),
            },
            Frame::Closed { reason } => return Some(reason),
            other => warn!("connection {}: unexpected frame {other:?}", self.id),
        }
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use appsvc_core::protocol::{decode_frame, keys};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::TcpListener;

    /// Scripted service host on the far end of one TCP connection.
    struct Host {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Host {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn recv(&mut self) -> Frame {
            let line = self.lines.next_line().await.unwrap().expect("line");
            decode_frame(line.as_bytes()).unwrap()
        }

        async fn send(&mut self, frame: &Frame) {
            self.writer
                .write_all(&encode_frame(frame).unwrap())
                .await
                .unwrap();
        }

        /// Reads the open frame and answers it with `status`.
        async fn answer_open(&mut self, status: OpenStatus) {
            assert!(matches!(self.recv().await, Frame::Open { .. }));
            self.send(&Frame::OpenStatus { status }).await;
        }
    }

    async fn listener() -> (TcpListener, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let transport = TcpTransport::new(listener.local_addr().unwrap());
        (listener, transport)
    }

    fn target() -> ServiceTarget {
        ServiceTarget {
            service_name: "com.example.appsvc".to_string(),
            package_family_name: "Example.Bridge_8wekyb3d8bbwe".to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_sends_service_and_package() {
        // Arrange
        let (listener, transport) = listener().await;
        let host = tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            let open = host.recv().await;
            host.send(&Frame::OpenStatus {
                status: OpenStatus::Success,
            })
            .await;
            (open, host)
        });

        // Act
        let opened = transport.open(&target()).await;

        // Assert
        let (open, _host) = host.await.unwrap();
        assert!(opened.is_ok());
        assert_eq!(
            open,
            Frame::Open {
                service: "com.example.appsvc".to_string(),
                package: "Example.Bridge_8wekyb3d8bbwe".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_refused_open_reports_status() {
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::AppNotInstalled).await;
        });

        let result = transport.open(&target()).await;

        assert!(matches!(
            result,
            Err(TransportError::Refused(OpenStatus::AppNotInstalled))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_io_error() {
        // Bind then drop to get a port with nothing listening.
        let (listener, transport) = listener().await;
        drop(listener);

        let result = transport.open(&target()).await;

        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_open_status_split_across_writes() {
        // Arrange: deliver the status line in two pieces.
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            assert!(matches!(host.recv().await, Frame::Open { .. }));
            let bytes = encode_frame(&Frame::OpenStatus {
                status: OpenStatus::Success,
            })
            .unwrap();
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            host.writer.write_all(head).await.unwrap();
            host.writer.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            host.writer.write_all(tail).await.unwrap();
            // Keep the stream open until the test ends.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        // Act
        let result = transport.open(&target()).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_message_correlates_response() {
        // Arrange
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
            let Frame::Request { id, message } = host.recv().await else {
                panic!("expected a request frame");
            };
            let id_text = message.get_text(keys::RETURN_ID).unwrap().unwrap();
            host.send(&Frame::Response {
                id,
                status: ResponseStatus::Success,
                message: ValueSet::new().with("seen", id_text),
            })
            .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let opened = transport.open(&target()).await.unwrap();

        // Act
        let reply = opened
            .connection
            .send_message(ValueSet::new().with(keys::RETURN_ID, "req-42"))
            .await
            .unwrap();

        // Assert
        assert_eq!(reply.get_text("seen").unwrap().as_deref(), Some("req-42"));
    }

    #[tokio::test]
    async fn test_failed_response_status_is_an_error() {
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
            let Frame::Request { id, .. } = host.recv().await else {
                panic!("expected a request frame");
            };
            host.send(&Frame::Response {
                id,
                status: ResponseStatus::ResourceLimitsExceeded,
                message: ValueSet::new(),
            })
            .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let opened = transport.open(&target()).await.unwrap();

        let result = opened.connection.send_message(ValueSet::new()).await;

        assert!(matches!(
            result,
            Err(TransportError::ResponseFailed(
                ResponseStatus::ResourceLimitsExceeded
            ))
        ));
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered_with_same_id() {
        // Arrange
        let (listener, transport) = listener().await;
        let host = tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
            host.send(&Frame::Request {
                id: 7,
                message: ValueSet::new().with(keys::METHOD, "echo"),
            })
            .await;
            host.recv().await
        });
        let mut opened = transport.open(&target()).await.unwrap();

        // Act
        let Some(ConnectionEvent::RequestReceived(mut request)) = opened.events.recv().await else {
            panic!("expected a request event");
        };
        assert_eq!(
            request.message().get_text(keys::METHOD).unwrap().as_deref(),
            Some("echo")
        );
        request
            .send_response(ValueSet::new().with(keys::ACK, "hi"))
            .await
            .unwrap();

        // Assert
        let response = host.await.unwrap();
        assert_eq!(
            response,
            Frame::Response {
                id: 7,
                status: ResponseStatus::Success,
                message: ValueSet::new().with(keys::ACK, "hi"),
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_request_sends_failure_response() {
        let (listener, transport) = listener().await;
        let host = tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
            host.send(&Frame::Request {
                id: 9,
                message: ValueSet::new(),
            })
            .await;
            host.recv().await
        });
        let mut opened = transport.open(&target()).await.unwrap();

        let event = opened.events.recv().await;
        drop(event);

        assert!(matches!(
            host.await.unwrap(),
            Frame::Response {
                id: 9,
                status: ResponseStatus::Failure,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_eof_emits_closed_and_fails_sends() {
        // Arrange: the host answers the open, then hangs up.
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
        });
        let mut opened = transport.open(&target()).await.unwrap();

        // Act
        let event = opened.events.recv().await;

        // Assert
        assert!(matches!(
            event,
            Some(ConnectionEvent::Closed(ClosedStatus::Unknown))
        ));
        assert!(matches!(
            opened.connection.send_message(ValueSet::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_closed_frame_reports_reason() {
        let (listener, transport) = listener().await;
        tokio::spawn(async move {
            let mut host = Host::accept(&listener).await;
            host.answer_open(OpenStatus::Success).await;
            host.send(&Frame::Closed {
                reason: ClosedStatus::Completed,
            })
            .await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        });
        let mut opened = transport.open(&target()).await.unwrap();

        let event = opened.events.recv().await;

        assert!(matches!(
            event,
            Some(ConnectionEvent::Closed(ClosedStatus::Completed))
        ));
    }
}
