//! Persistent session client: one TCP connection to one remote endpoint.
//!
//! The middle/judge protocol carries no correlation ids: responses match
//! requests strictly FIFO, oldest pending first. That is only safe while
//! a multi-frame conversation holds the connection's advisory lock, so
//! frames from independent conversations never interleave on one socket.
//!
//! The connection is driven by an explicit state machine plus a single
//! reader task per physical socket. A dropped connection fails every
//! pending request and queued lock waiter, then schedules a reconnect;
//! the logical client survives, the socket does not.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::frame::{self, Frame, FrameError};

/// Delay before an automatic reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Default bound on waiting for a response frame.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Keepalive probe interval armed on every session socket.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Initial capacity of the reader task's inbound buffer.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Logical category of a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Account,
    Message,
    JudgeSubmit,
    JudgeQuery,
    JudgeDiscussion,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Account => "account",
            Role::Message => "message",
            Role::JudgeSubmit => "judge-submit",
            Role::JudgeQuery => "judge-query",
            Role::JudgeDiscussion => "judge-discussion",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host and port of a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// Transient: a connect attempt failed; reconnect scheduling follows
    /// immediately.
    Faulted,
}

/// Errors surfaced by session-client operations.
#[derive(Debug)]
pub enum ClientError {
    /// The connection is not in the `Connected` state.
    NotConnected,
    /// The connection dropped while the operation was outstanding.
    ConnectionLost,
    /// No response frame arrived within the bound.
    Timeout,
    /// Outbound data could not be framed.
    Framing(FrameError),
    /// Socket-level failure.
    Io(std::io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "Not connected"),
            ClientError::ConnectionLost => write!(f, "Connection lost"),
            ClientError::Timeout => write!(f, "Request timeout"),
            ClientError::Framing(e) => write!(f, "Framing error: {}", e),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

/// One outstanding request continuation, FIFO-ordered. The id exists
/// only so a timed-out entry can be removed from the middle of the queue.
struct PendingResponse {
    id: u64,
    tx: oneshot::Sender<Result<Frame, ClientError>>,
}

struct Inner {
    state: ConnState,
    pending: VecDeque<PendingResponse>,
    lock_held: bool,
    lock_waiters: VecDeque<oneshot::Sender<Result<(), ClientError>>>,
    /// Incremented on every successful connect; ties reader tasks to the
    /// socket they serve so a stale reader cannot tear down its successor.
    generation: u64,
}

struct Shared {
    role: Role,
    endpoint: Endpoint,
    reconnect_delay: Duration,
    request_timeout: Duration,
    auto_reconnect: AtomicBool,
    next_request_id: AtomicU64,
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    events_tx: mpsc::UnboundedSender<Frame>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
}

/// Handle to one persistent connection. Cheap to clone; every clone
/// shares the same socket, pending queue, and advisory lock.
#[derive(Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl SessionClient {
    pub fn new(role: Role, endpoint: Endpoint) -> Self {
        Self::with_timing(role, endpoint, RECONNECT_DELAY, REQUEST_TIMEOUT)
    }

    /// Construct with explicit reconnect delay and response timeout.
    pub fn with_timing(
        role: Role,
        endpoint: Endpoint,
        reconnect_delay: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        SessionClient {
            shared: Arc::new(Shared {
                role,
                endpoint,
                reconnect_delay,
                request_timeout,
                auto_reconnect: AtomicBool::new(true),
                next_request_id: AtomicU64::new(1),
                inner: Mutex::new(Inner {
                    state: ConnState::Disconnected,
                    pending: VecDeque::new(),
                    lock_held: false,
                    lock_waiters: VecDeque::new(),
                    generation: 0,
                }),
                writer: tokio::sync::Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Receiver for frames that arrived with no pending request. Can be
    /// taken once; with no receiver attached such frames are dropped
    /// after logging.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.shared.events_rx.lock().unwrap().take()
    }

    /// Open the connection. Returns `Ok(false)` without side effects when
    /// a connect is already in progress or established.
    pub async fn connect(&self) -> Result<bool, ClientError> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                ConnState::Connecting | ConnState::Connected => return Ok(false),
                _ => inner.state = ConnState::Connecting,
            }
        }

        let target = (self.shared.endpoint.host.as_str(), self.shared.endpoint.port);
        match TcpStream::connect(target).await {
            Ok(stream) => {
                if let Err(e) = arm_keepalive(&stream) {
                    debug!(error = %e, "Could not arm TCP keepalive");
                }
                let (read_half, write_half) = stream.into_split();
                let generation = {
                    let mut inner = self.shared.inner.lock().unwrap();
                    inner.state = ConnState::Connected;
                    inner.generation += 1;
                    inner.generation
                };
                *self.shared.writer.lock().await = Some(write_half);

                let client = self.clone();
                tokio::spawn(async move { client.read_loop(read_half, generation).await });

                info!(role = %self.shared.role, endpoint = %self.shared.endpoint, "Connected");
                Ok(true)
            }
            Err(e) => {
                let generation = {
                    let mut inner = self.shared.inner.lock().unwrap();
                    inner.state = ConnState::Faulted;
                    inner.generation
                };
                debug!(role = %self.shared.role, endpoint = %self.shared.endpoint,
                       error = %e, "Connect failed");
                self.handle_disconnect(generation).await;
                Err(ClientError::Io(e))
            }
        }
    }

    /// Permanently close the connection; auto-reconnect is disabled.
    pub async fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        let generation = self.shared.inner.lock().unwrap().generation;
        self.handle_disconnect(generation).await;
        info!(role = %self.shared.role, endpoint = %self.shared.endpoint, "Disconnected");
    }

    /// Write one frame, fire-and-forget. Resolves once the socket write
    /// is accepted.
    pub async fn send_only(&self, command: u8, data: &str) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.write_frame(command, data).await
    }

    /// Write one frame and wait for the response that FIFO-matches it,
    /// bounded by the client's default request timeout.
    pub async fn send_and_wait(&self, command: u8, data: &str) -> Result<Frame, ClientError> {
        self.send_and_wait_timeout(command, data, self.shared.request_timeout)
            .await
    }

    /// `send_and_wait` with an explicit timeout. On timeout the pending
    /// continuation is removed from the FIFO set, so a late frame cannot
    /// resurrect it.
    pub async fn send_and_wait_timeout(
        &self,
        command: u8,
        data: &str,
        timeout: Duration,
    ) -> Result<Frame, ClientError> {
        let id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state != ConnState::Connected {
                return Err(ClientError::NotConnected);
            }
            inner.pending.push_back(PendingResponse { id, tx });
        }

        if let Err(e) = self.write_frame(command, data).await {
            self.remove_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.remove_pending(id);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Take the connection's advisory lock, queueing FIFO behind the
    /// current holder. Acquisition has no timeout: waiters queue until
    /// the holder releases or the connection drops. Every multi-frame
    /// conversation must hold this for its whole duration; without it,
    /// interleaved frames corrupt the FIFO correlation.
    pub async fn acquire_lock(&self) -> Result<LockGuard, ClientError> {
        let waiter = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.lock_held {
                inner.lock_held = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.lock_waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ClientError::ConnectionLost),
            }
        }
        Ok(LockGuard {
            client: self.clone(),
        })
    }

    /// Hand the lock to the next live waiter, or mark it free. Direct
    /// handoff: between holders the lock is never observable as free.
    fn release_lock(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        while let Some(waiter) = inner.lock_waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return;
            }
            // Waiter gave up (its future was dropped); try the next.
        }
        inner.lock_held = false;
    }

    async fn write_frame(&self, command: u8, data: &str) -> Result<(), ClientError> {
        let encoded = frame::encode(command, data).map_err(ClientError::Framing)?;
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.write_all(&encoded).await.map_err(ClientError::Io),
            None => Err(ClientError::NotConnected),
        }
    }

    fn remove_pending(&self, id: u64) {
        self.shared
            .inner
            .lock()
            .unwrap()
            .pending
            .retain(|p| p.id != id);
    }

    async fn read_loop(self, mut read_half: OwnedReadHalf, generation: u64) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            match frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    self.dispatch_frame(frame);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(role = %self.shared.role, endpoint = %self.shared.endpoint,
                          error = %e, "Framing error, dropping connection");
                    break;
                }
            }

            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(role = %self.shared.role, endpoint = %self.shared.endpoint,
                           "Peer closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(role = %self.shared.role, endpoint = %self.shared.endpoint,
                           error = %e, "Read error");
                    break;
                }
            }
        }
        self.handle_disconnect(generation).await;
    }

    /// Resolve the oldest pending request, or surface the frame as an
    /// unsolicited event. The tag travels as auxiliary status; it is
    /// never used for matching.
    fn dispatch_frame(&self, frame: Frame) {
        let slot = self.shared.inner.lock().unwrap().pending.pop_front();
        match slot {
            Some(p) => {
                let _ = p.tx.send(Ok(frame));
            }
            None => {
                debug!(role = %self.shared.role, tag = %(frame.tag as char),
                       "Unsolicited frame");
                let _ = self.shared.events_tx.send(frame);
            }
        }
    }

    /// Transition to `Disconnected` and fail everything outstanding:
    /// pending continuations, queued lock waiters, the write half. Then
    /// schedule a reconnect if auto-reconnect is still on. `generation`
    /// ties the call to the connection that observed the failure.
    async fn handle_disconnect(&self, generation: u64) {
        let (pending, waiters) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.generation != generation || inner.state == ConnState::Disconnected {
                return;
            }
            inner.state = ConnState::Disconnected;
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.lock_waiters),
            )
        };
        *self.shared.writer.lock().await = None;

        if !pending.is_empty() {
            warn!(role = %self.shared.role, endpoint = %self.shared.endpoint,
                  count = pending.len(), "Failing requests pending at disconnect");
        }
        for p in pending {
            let _ = p.tx.send(Err(ClientError::ConnectionLost));
        }
        for w in waiters {
            let _ = w.send(Err(ClientError::ConnectionLost));
        }

        if self.shared.auto_reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        debug!(role = %self.shared.role, endpoint = %self.shared.endpoint,
               delay = ?self.shared.reconnect_delay, "Scheduling reconnect");
        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(client.shared.reconnect_delay).await;
            if !client.shared.auto_reconnect.load(Ordering::SeqCst) {
                return;
            }
            // A failed attempt schedules the next one itself.
            let _ = client.connect().await;
        });
    }
}

/// RAII guard for the advisory lock; dropping releases with handoff.
pub struct LockGuard {
    client: SessionClient,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.client.release_lock();
    }
}

fn arm_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{send, Reply, ScriptedPeer};

    fn test_client(addr: std::net::SocketAddr) -> SessionClient {
        SessionClient::with_timing(
            Role::Account,
            Endpoint::new("127.0.0.1", addr.port()),
            Duration::from_millis(100),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let peer = ScriptedPeer::spawn(vec![]).await;
        let client = test_client(peer.addr);

        assert!(client.connect().await.unwrap());
        assert!(client.is_connected());
        assert!(!client.connect().await.unwrap());

        client.disconnect().await;
        assert_eq!(client.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_faults_and_reports() {
        // Nothing listens here; bind-then-drop reserves a dead port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = test_client(addr);
        assert!(matches!(client.connect().await, Err(ClientError::Io(_))));
        assert_eq!(client.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_and_wait_round_trip() {
        let peer = ScriptedPeer::spawn(vec![send(b'O', "Y")]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();

        let resp = client.send_and_wait(b'V', "cookie").await.unwrap();
        assert_eq!(resp.tag, b'O');
        assert_eq!(resp.body, "Y");
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let peer = ScriptedPeer::spawn(vec![]).await;
        let client = test_client(peer.addr);

        assert!(matches!(
            client.send_and_wait(b'V', "x").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.send_only(b'V', "x").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_fifo_correlation() {
        // The peer stays silent until the third request arrives, then
        // emits all three responses in order. Each caller must get the
        // response matching its position, not its arrival luck.
        let peer = ScriptedPeer::spawn(vec![
            Reply::None,
            Reply::None,
            Reply::SendAll(vec![
                (b'O', "first".into()),
                (b'O', "second".into()),
                (b'O', "third".into()),
            ]),
        ])
        .await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();

        let _lock = client.acquire_lock().await.unwrap();
        let c1 = client.clone();
        let t1 = tokio::spawn(async move { c1.send_and_wait(b'Q', "1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c2 = client.clone();
        let t2 = tokio::spawn(async move { c2.send_and_wait(b'Q', "2").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let r3 = client.send_and_wait(b'Q', "3").await.unwrap();

        assert_eq!(t1.await.unwrap().unwrap().body, "first");
        assert_eq!(t2.await.unwrap().unwrap().body, "second");
        assert_eq!(r3.body, "third");
    }

    #[tokio::test]
    async fn test_lock_exclusion() {
        let peer = ScriptedPeer::spawn(vec![send(b'O', "for-a")]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();

        let guard = client.acquire_lock().await.unwrap();

        let b = client.clone();
        let b_entered = Arc::new(AtomicBool::new(false));
        let b_flag = Arc::clone(&b_entered);
        let b_task = tokio::spawn(async move {
            let _lock = b.acquire_lock().await.unwrap();
            b_flag.store(true, Ordering::SeqCst);
            b.send_only(b'G', "b").await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !b_entered.load(Ordering::SeqCst),
            "B conversed while A held the lock"
        );

        // A's response is A's even though B queued for the lock first.
        let resp = client.send_and_wait(b'V', "a").await.unwrap();
        assert_eq!(resp.body, "for-a");

        drop(guard);
        b_task.await.unwrap().unwrap();
        assert!(b_entered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lock_waiters_wake_in_fifo_order() {
        let peer = ScriptedPeer::spawn(vec![]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();
        let guard = client.acquire_lock().await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let c = client.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _lock = c.acquire_lock().await.unwrap();
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        drop(guard);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_then_reconnects() {
        let peer = ScriptedPeer::spawn(vec![Reply::None, Reply::None, Reply::Hangup]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();

        let mut outstanding = Vec::new();
        for _ in 0..2 {
            let c = client.clone();
            outstanding.push(tokio::spawn(async move { c.send_and_wait(b'Q', "x").await }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The third frame makes the peer drop the connection.
        client.send_only(b'X', "").await.unwrap();

        for task in outstanding {
            assert!(matches!(
                task.await.unwrap(),
                Err(ClientError::ConnectionLost)
            ));
        }

        // Reconnect is scheduled with the shortened test delay; the peer
        // accepts a fresh connection.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_removes_pending() {
        let peer = ScriptedPeer::spawn(vec![Reply::None, send(b'O', "late")]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();
        let mut events = client.take_events().unwrap();

        let result = client
            .send_and_wait_timeout(b'Q', "slow", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout)));

        // The peer only answers the second request. With the timed-out
        // continuation removed, that answer matches the second request
        // instead of resurrecting the dead first one.
        let resp = client.send_and_wait(b'Q', "fast").await.unwrap();
        assert_eq!(resp.body, "late");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsolicited_frame_surfaces_as_event() {
        let peer = ScriptedPeer::spawn(vec![send(b'N', "broadcast")]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();
        let mut events = client.take_events().unwrap();

        // Fire-and-forget send; the peer's reply has no pending request.
        client.send_only(b'R', "x").await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.tag, b'N');
        assert_eq!(frame.body, "broadcast");
    }

    #[tokio::test]
    async fn test_framing_error_drops_connection() {
        // The peer answers with eight bytes whose length field holds no
        // digits at all; the connection must be torn down, not resynced.
        let peer = ScriptedPeer::spawn(vec![Reply::Raw(b"Xabcdefg".to_vec())]).await;
        let client = test_client(peer.addr);
        client.connect().await.unwrap();

        let result = client.send_and_wait(b'Q', "x").await;
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
    }
}
