//! A single request/reply exchange multiplexed over a connection.

use crate::codec::{data_packets, Packet, PacketKind};
use crate::connection::ConnectionShared;
use crate::envelope::{EnvelopeFormat, Reply, Request};
use crate::error::{ScampError, ScampResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// One exchange on a connection.
///
/// The routing slot held by a session is released exactly once: by
/// [`free`](Session::free), or when the session is dropped on any other path.
pub struct Session {
    msg_no: u64,
    shared: Arc<ConnectionShared>,
    request_rx: Option<oneshot::Receiver<ScampResult<Request>>>,
    envelope: EnvelopeFormat,
    request_id: u64,
    keep_open: bool,
    replied: bool,
    released: bool,
}

impl Session {
    pub(crate) fn new(
        msg_no: u64,
        shared: Arc<ConnectionShared>,
        request_rx: oneshot::Receiver<ScampResult<Request>>,
        keep_open: bool,
    ) -> Self {
        Self {
            msg_no,
            shared,
            request_rx: Some(request_rx),
            envelope: EnvelopeFormat::default(),
            request_id: 0,
            keep_open,
            replied: false,
            released: false,
        }
    }

    pub fn msg_no(&self) -> u64 {
        self.msg_no
    }

    /// Id of the connection that carried this session.
    pub fn connection_id(&self) -> u64 {
        self.shared.id
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// Wait for the complete request. May only be called once.
    pub async fn recv_request(&mut self) -> ScampResult<Request> {
        let rx = self
            .request_rx
            .take()
            .ok_or_else(|| ScampError::Protocol("request already received".into()))?;
        let request = rx
            .await
            .map_err(|_| ScampError::SessionClosed("connection closed before request completed".into()))??;
        self.envelope = request.envelope;
        self.request_id = request.request_id;
        trace!(msg_no = self.msg_no, action = %request.action, "request received");
        Ok(request)
    }

    /// Like [`recv_request`](Self::recv_request), giving up with
    /// [`ScampError::Timeout`] after `timeout`.
    pub async fn recv_request_timeout(&mut self, timeout: Duration) -> ScampResult<Request> {
        tokio::time::timeout(timeout, self.recv_request())
            .await
            .map_err(|_| ScampError::Timeout)?
    }

    /// Send the reply. A session carries at most one reply.
    pub async fn send_reply(&mut self, reply: Reply) -> ScampResult<()> {
        if self.replied {
            return Err(ScampError::AlreadyReplied(self.msg_no));
        }
        let header = reply.header(self.envelope, self.request_id);
        let mut packets = vec![Packet::new(PacketKind::Header, self.msg_no, header.to_bytes()?)];
        packets.extend(data_packets(self.msg_no, &reply.blob));

        self.shared.write_packets(&packets).await?;
        self.replied = true;
        trace!(msg_no = self.msg_no, len = reply.blob.len(), "reply sent");

        if !self.keep_open {
            self.release();
        }
        Ok(())
    }

    /// Release the session's resources.
    pub fn free(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.request_rx = None;
        if self.shared.release(self.msg_no) {
            trace!(msg_no = self.msg_no, conn_id = self.shared.id, "session freed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("msg_no", &self.msg_no)
            .field("conn_id", &self.shared.id)
            .field("replied", &self.replied)
            .finish()
    }
}
