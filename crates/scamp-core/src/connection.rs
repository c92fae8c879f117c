//! Connection demultiplexer: turns one packet stream into many sessions.
//!
//! The routing task reads packets, groups them by `msg_no`, and publishes each
//! newly opened session on a shared bounded queue. Replies are written back
//! through a writer shared by every session on the connection.

use crate::codec::{self, Packet, PacketKind};
use crate::envelope::{PacketHeader, Request};
use crate::error::{ScampError, ScampResult};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, trace, warn};

/// Largest request blob reassembled for a single session (64 MiB).
pub const MAX_MESSAGE_BLOB: usize = 64 * 1024 * 1024;

/// How long a closing connection waits to flush its writer before giving up.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts sessions opened by the peer.
    Server,
    /// Only answers sessions it opened itself; remote opens are refused.
    Client,
}

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Reassembly state for one message in flight.
pub(crate) struct Inflight {
    header: Option<PacketHeader>,
    blob: Vec<u8>,
    request_tx: Option<oneshot::Sender<ScampResult<Request>>>,
}

impl Inflight {
    fn fail(&mut self, err: ScampError) {
        if let Some(tx) = self.request_tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// State shared between a connection's router and its sessions.
pub(crate) struct ConnectionShared {
    pub(crate) id: u64,
    pub(crate) writer: tokio::sync::Mutex<BoxedWriter>,
    sessions: Mutex<HashMap<u64, Inflight>>,
    closed: watch::Sender<bool>,
    close_notify: Notify,
}

impl ConnectionShared {
    pub(crate) fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Inflight>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Drop the routing entry for `msg_no`. Returns whether one existed.
    pub(crate) fn release(&self, msg_no: u64) -> bool {
        self.sessions().remove(&msg_no).is_some()
    }

    /// Write a sequence of packets without interleaving other sessions' packets.
    ///
    /// Closing the connection abandons a write that is waiting on the lock or
    /// on a peer that stopped reading.
    pub(crate) async fn write_packets(&self, packets: &[Packet]) -> ScampResult<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(ScampError::SessionClosed("connection closed".into()));
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            for packet in packets {
                codec::write_packet(&mut *writer, packet).await?;
            }
            Ok(())
        };
        tokio::select! {
            result = write => result,
            _ = closed.changed() => Err(ScampError::SessionClosed("connection closed during write".into())),
        }
    }

    /// Mark the connection closed. Returns `true` only for the first call.
    fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }

    fn close(&self) -> bool {
        if !self.mark_closed() {
            return false;
        }
        self.close_notify.notify_one();
        true
    }
}

/// Cloneable handle used to close a connection from outside its router.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Close the connection. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let closed = self.shared.close();
        if closed {
            debug!(conn_id = self.shared.id, "connection close requested");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of sessions currently holding a routing slot.
    pub fn open_sessions(&self) -> usize {
        self.shared.sessions().len()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// One packet stream and the queue its new sessions are published on.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    reader: BoxedReader,
    session_tx: mpsc::Sender<Session>,
}

impl Connection {
    /// Wrap a stream. New sessions discovered by [`packet_router`](Self::packet_router)
    /// are sent on `session_tx`.
    pub fn new<S>(stream: S, session_tx: mpsc::Sender<Session>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (reader, writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let shared = Arc::new(ConnectionShared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            sessions: Mutex::new(HashMap::new()),
            closed: watch::channel(false).0,
            close_notify: Notify::new(),
        });
        Self {
            shared,
            reader: Box::new(reader),
            session_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Read and route packets until the peer disconnects, a protocol error
    /// occurs, or the connection is closed through its handle.
    ///
    /// With `keep_sessions_open_after_reply` unset, a session's routing slot
    /// is released as soon as its reply is written instead of when it is freed.
    pub async fn packet_router(
        mut self,
        role: Role,
        keep_sessions_open_after_reply: bool,
    ) -> ScampResult<()> {
        let conn_id = self.shared.id;
        debug!(conn_id, ?role, "packet router started");

        let result = loop {
            tokio::select! {
                _ = self.shared.close_notify.notified() => {
                    debug!(conn_id, "packet router closing");
                    break Ok(());
                }
                read = codec::read_packet(&mut self.reader) => {
                    match read {
                        Ok(Some(packet)) => {
                            if let Err(e) = self.route(packet, role, keep_sessions_open_after_reply).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => {
                            debug!(conn_id, "peer closed connection");
                            break Ok(());
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        self.shutdown().await;
        if let Err(ref e) = result {
            warn!(conn_id, error = %e, "packet router stopped");
        }
        result
    }

    async fn route(&self, packet: Packet, role: Role, keep_open: bool) -> ScampResult<()> {
        let msg_no = packet.msg_no;
        trace!(conn_id = self.shared.id, msg_no, kind = ?packet.kind, len = packet.body.len(), "packet");

        match packet.kind {
            PacketKind::Header => self.open_session(packet, role, keep_open).await,
            PacketKind::Data => {
                let mut sessions = self.shared.sessions();
                if let Some(inflight) = sessions.get_mut(&msg_no) {
                    if inflight.request_tx.is_none() {
                        return Ok(());
                    }
                    if inflight.blob.len() + packet.body.len() > MAX_MESSAGE_BLOB {
                        inflight.fail(ScampError::Protocol(format!(
                            "message exceeds {MAX_MESSAGE_BLOB} bytes"
                        )));
                    } else {
                        inflight.blob.extend_from_slice(&packet.body);
                    }
                } else {
                    debug!(msg_no, "data for unknown session ignored");
                }
                Ok(())
            }
            PacketKind::Eof => {
                let mut sessions = self.shared.sessions();
                if let Some(inflight) = sessions.get_mut(&msg_no) {
                    if let (Some(tx), Some(header)) =
                        (inflight.request_tx.take(), inflight.header.take())
                    {
                        let blob = std::mem::take(&mut inflight.blob);
                        let _ = tx.send(Request::from_parts(header, blob));
                    }
                } else {
                    debug!(msg_no, "eof for unknown session ignored");
                }
                Ok(())
            }
            PacketKind::TxErr => {
                let reason = String::from_utf8_lossy(&packet.body).into_owned();
                if let Some(inflight) = self.shared.sessions().get_mut(&msg_no) {
                    inflight.fail(ScampError::SessionClosed(format!("peer aborted message: {reason}")));
                }
                Ok(())
            }
            PacketKind::Ack => Ok(()),
        }
    }

    async fn open_session(&self, packet: Packet, role: Role, keep_open: bool) -> ScampResult<()> {
        let msg_no = packet.msg_no;

        {
            let mut sessions = self.shared.sessions();
            if let Some(existing) = sessions.get_mut(&msg_no) {
                warn!(msg_no, "duplicate header for open session");
                existing.fail(ScampError::Protocol(format!("duplicate header for message {msg_no}")));
                return Ok(());
            }
        }

        if role == Role::Client {
            warn!(msg_no, "refusing session opened by server peer");
            return self.reject(msg_no, "client does not accept incoming sessions").await;
        }

        let header = match PacketHeader::from_bytes(&packet.body) {
            Ok(h) => h,
            Err(e) => {
                debug!(msg_no, error = %e, "malformed header");
                return self.reject(msg_no, "malformed header").await;
            }
        };

        let (request_tx, request_rx) = oneshot::channel();
        self.shared.sessions().insert(
            msg_no,
            Inflight {
                header: Some(header),
                blob: Vec::new(),
                request_tx: Some(request_tx),
            },
        );
        let session = Session::new(msg_no, self.shared.clone(), request_rx, keep_open);

        // Blocks while the queue is full; a closed connection abandons the send.
        tokio::select! {
            sent = self.session_tx.send(session) => {
                if sent.is_err() {
                    return Err(ScampError::SessionClosed("session queue closed".into()));
                }
            }
            _ = self.shared.close_notify.notified() => {
                // re-arm so the router loop sees the close too
                self.shared.close_notify.notify_one();
            }
        }
        Ok(())
    }

    async fn reject(&self, msg_no: u64, reason: &str) -> ScampResult<()> {
        let packet = Packet::new(PacketKind::TxErr, msg_no, reason.as_bytes().to_vec());
        self.shared.write_packets(&[packet]).await
    }

    async fn shutdown(&self) {
        self.shared.mark_closed();
        let pending = {
            let mut sessions = self.shared.sessions();
            let pending = sessions.len();
            for inflight in sessions.values_mut() {
                inflight.fail(ScampError::SessionClosed("connection closed".into()));
            }
            sessions.clear();
            pending
        };
        let flush = async { self.shared.writer.lock().await.shutdown().await };
        if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, flush).await.is_err() {
            debug!(conn_id = self.shared.id, "writer did not drain before close");
        }
        debug!(conn_id = self.shared.id, pending, "connection shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{data_packets, read_packet, write_packet};
    use crate::envelope::{EnvelopeFormat, Reply};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn request(action: &str) -> Request {
        Request {
            action: action.into(),
            envelope: EnvelopeFormat::Json,
            version: 1,
            ..Default::default()
        }
    }

    async fn send_request(peer: &mut DuplexStream, msg_no: u64, req: &Request, blob: &[u8]) {
        let header = Packet::new(PacketKind::Header, msg_no, req.header().to_bytes().unwrap());
        write_packet(peer, &header).await.unwrap();
        for p in data_packets(msg_no, blob) {
            write_packet(peer, &p).await.unwrap();
        }
    }

    fn spawn_router(role: Role, capacity: usize) -> (DuplexStream, ConnectionHandle, mpsc::Receiver<Session>) {
        let (local, peer) = tokio::io::duplex(1 << 16);
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Connection::new(local, tx);
        let handle = conn.handle();
        tokio::spawn(conn.packet_router(role, true));
        (peer, handle, rx)
    }

    #[tokio::test]
    async fn request_is_reassembled_and_reply_routed_back() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Server, 4);
        send_request(&mut peer, 5, &request("echo"), b"ping").await;

        let mut session = rx.recv().await.unwrap();
        assert_eq!(session.msg_no(), 5);
        let req = session.recv_request().await.unwrap();
        assert_eq!(req.action, "echo");
        assert_eq!(req.blob, b"ping");

        session.send_reply(Reply::new(req.blob)).await.unwrap();

        let header = read_packet(&mut peer).await.unwrap().unwrap();
        assert_eq!(header.kind, PacketKind::Header);
        assert_eq!(header.msg_no, 5);
        let data = read_packet(&mut peer).await.unwrap().unwrap();
        assert_eq!(data.body, b"ping");
        let eof = read_packet(&mut peer).await.unwrap().unwrap();
        assert_eq!(eof.kind, PacketKind::Eof);
    }

    #[tokio::test]
    async fn interleaved_sessions_are_kept_apart() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Server, 4);
        let h1 = Packet::new(PacketKind::Header, 1, request("a").header().to_bytes().unwrap());
        let h2 = Packet::new(PacketKind::Header, 2, request("b").header().to_bytes().unwrap());
        write_packet(&mut peer, &h1).await.unwrap();
        write_packet(&mut peer, &h2).await.unwrap();
        write_packet(&mut peer, &Packet::new(PacketKind::Data, 2, b"two".to_vec())).await.unwrap();
        write_packet(&mut peer, &Packet::new(PacketKind::Data, 1, b"one".to_vec())).await.unwrap();
        write_packet(&mut peer, &Packet::eof(2)).await.unwrap();
        write_packet(&mut peer, &Packet::eof(1)).await.unwrap();

        let mut s1 = rx.recv().await.unwrap();
        let mut s2 = rx.recv().await.unwrap();
        let r2 = s2.recv_request().await.unwrap();
        let r1 = s1.recv_request().await.unwrap();
        assert_eq!((r1.action.as_str(), r1.blob.as_slice()), ("a", &b"one"[..]));
        assert_eq!((r2.action.as_str(), r2.blob.as_slice()), ("b", &b"two"[..]));
    }

    #[tokio::test]
    async fn txerr_fails_pending_request() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Server, 4);
        let h = Packet::new(PacketKind::Header, 3, request("x").header().to_bytes().unwrap());
        write_packet(&mut peer, &h).await.unwrap();
        write_packet(&mut peer, &Packet::new(PacketKind::TxErr, 3, b"gave up".to_vec()))
            .await
            .unwrap();

        let mut session = rx.recv().await.unwrap();
        let err = session.recv_request().await.unwrap_err();
        assert!(err.to_string().contains("gave up"));
    }

    #[tokio::test]
    async fn malformed_header_is_rejected_without_a_session() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Server, 4);
        write_packet(&mut peer, &Packet::new(PacketKind::Header, 8, b"{not json".to_vec()))
            .await
            .unwrap();

        let reply = read_packet(&mut peer).await.unwrap().unwrap();
        assert_eq!(reply.kind, PacketKind::TxErr);
        assert_eq!(reply.msg_no, 8);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_role_refuses_remote_opens() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Client, 4);
        send_request(&mut peer, 1, &request("x"), b"").await;

        let reply = read_packet(&mut peer).await.unwrap().unwrap();
        assert_eq!(reply.kind, PacketKind::TxErr);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_fails_pending_sessions_and_is_idempotent() {
        let (mut peer, handle, mut rx) = spawn_router(Role::Server, 4);
        let h = Packet::new(PacketKind::Header, 1, request("slow").header().to_bytes().unwrap());
        write_packet(&mut peer, &h).await.unwrap();
        let mut session = rx.recv().await.unwrap();

        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());

        let err = session.recv_request().await.unwrap_err();
        assert!(matches!(err, ScampError::SessionClosed(_)));
        assert!(session.send_reply(Reply::new("late")).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (mut peer, handle, mut rx) = spawn_router(Role::Server, 1);
        for msg_no in 1..=3 {
            send_request(&mut peer, msg_no, &request("q"), b"").await;
        }

        // One session fits in the queue, the router holds the second while blocked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.len(), 1);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let session = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(session.msg_no());
            assert!(rx.len() <= 1);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        handle.close();
    }

    #[tokio::test]
    async fn dropping_session_releases_routing_slot() {
        let (mut peer, handle, mut rx) = spawn_router(Role::Server, 4);
        send_request(&mut peer, 1, &request("x"), b"").await;
        let session = rx.recv().await.unwrap();
        assert_eq!(handle.open_sessions(), 1);
        drop(session);
        assert_eq!(handle.open_sessions(), 0);
    }

    #[tokio::test]
    async fn second_reply_is_refused() {
        let (mut peer, _handle, mut rx) = spawn_router(Role::Server, 4);
        send_request(&mut peer, 1, &request("x"), b"").await;
        let mut session = rx.recv().await.unwrap();
        session.recv_request().await.unwrap();

        session.send_reply(Reply::new("one")).await.unwrap();
        let err = session.send_reply(Reply::new("two")).await.unwrap_err();
        assert!(matches!(err, ScampError::AlreadyReplied(1)));
        assert!(session.has_replied());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn router_future_can_be_spawned() {
        let (local, _peer) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::channel(1);
        let router = Connection::new(local, tx).packet_router(Role::Server, true);
        assert_send(&router);
        drop(router);
    }

    #[tokio::test]
    async fn close_abandons_reply_blocked_on_a_stalled_peer() {
        let (local, mut peer) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new(local, tx);
        let handle = conn.handle();
        let router = tokio::spawn(conn.packet_router(Role::Server, true));

        send_request(&mut peer, 1, &request("big"), b"").await;
        let mut session = rx.recv().await.unwrap();
        session.recv_request().await.unwrap();

        // the peer never reads, so this write fills the pipe and stalls
        let writer = tokio::spawn(async move {
            let result = session.send_reply(Reply::new(vec![7u8; 1 << 20])).await;
            (session, result)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        assert!(handle.close());
        tokio::time::timeout(Duration::from_secs(2), router)
            .await
            .expect("router exits after close")
            .unwrap()
            .unwrap();
        let (session, result) = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ScampError::SessionClosed(_))));
        assert!(!session.has_replied());
        drop(peer);
    }

    #[tokio::test]
    async fn reply_releases_slot_when_sessions_are_not_kept_open() {
        let (local, mut peer) = tokio::io::duplex(1 << 16);
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new(local, tx);
        let handle = conn.handle();
        tokio::spawn(conn.packet_router(Role::Server, false));

        send_request(&mut peer, 1, &request("x"), b"").await;
        let mut session = rx.recv().await.unwrap();
        session.recv_request().await.unwrap();
        assert_eq!(handle.open_sessions(), 1);

        session.send_reply(Reply::new("done")).await.unwrap();
        assert_eq!(handle.open_sessions(), 0);
        session.free();
        assert_eq!(handle.open_sessions(), 0);
    }
}
