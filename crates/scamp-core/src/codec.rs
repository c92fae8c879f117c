//! Binary packet framing for SCAMP connections.
//!
//! Wire format: `[1-byte kind][8-byte BE msg_no][4-byte BE body length][body]`

use crate::error::{ScampError, ScampResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed packet header.
pub const PACKET_HEADER_LEN: usize = 13;

/// Largest body accepted in a single packet (1 MiB).
pub const MAX_PACKET_BODY: usize = 1_048_576;

/// Outgoing blobs are split into `Data` packets of at most this size.
pub const DATA_CHUNK_SIZE: usize = 131_072;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Header = 1,
    Data = 2,
    Eof = 3,
    TxErr = 4,
    Ack = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = ScampError;

    fn try_from(v: u8) -> Result<Self, ScampError> {
        match v {
            1 => Ok(Self::Header),
            2 => Ok(Self::Data),
            3 => Ok(Self::Eof),
            4 => Ok(Self::TxErr),
            5 => Ok(Self::Ack),
            other => Err(ScampError::Protocol(format!("unknown packet kind {other:#04x}"))),
        }
    }
}

/// One framed packet. `msg_no` identifies the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub msg_no: u64,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, msg_no: u64, body: Vec<u8>) -> Self {
        Self { kind, msg_no, body }
    }

    pub fn eof(msg_no: u64) -> Self {
        Self::new(PacketKind::Eof, msg_no, Vec::new())
    }

    /// Encode into a single contiguous frame.
    pub fn encode(&self) -> ScampResult<Vec<u8>> {
        if self.body.len() > MAX_PACKET_BODY {
            return Err(ScampError::Protocol(format!(
                "packet body too large: {} bytes (max {MAX_PACKET_BODY})",
                self.body.len()
            )));
        }
        let mut frame = Vec::with_capacity(PACKET_HEADER_LEN + self.body.len());
        frame.push(self.kind as u8);
        frame.extend_from_slice(&self.msg_no.to_be_bytes());
        frame.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&self.body);
        Ok(frame)
    }
}

/// Split a blob into the `Data` packets that carry it, followed by `Eof`.
pub fn data_packets(msg_no: u64, blob: &[u8]) -> Vec<Packet> {
    let mut packets: Vec<Packet> = blob
        .chunks(DATA_CHUNK_SIZE)
        .map(|chunk| Packet::new(PacketKind::Data, msg_no, chunk.to_vec()))
        .collect();
    packets.push(Packet::eof(msg_no));
    packets
}

fn parse_header(buf: &[u8; PACKET_HEADER_LEN]) -> ScampResult<(PacketKind, u64, usize)> {
    let kind = PacketKind::try_from(buf[0])?;
    let mut msg_no = [0u8; 8];
    msg_no.copy_from_slice(&buf[1..9]);
    let len = u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]) as usize;
    if len > MAX_PACKET_BODY {
        return Err(ScampError::Protocol(format!(
            "packet body too large: {len} bytes (max {MAX_PACKET_BODY})"
        )));
    }
    Ok((kind, u64::from_be_bytes(msg_no), len))
}

/// Read one packet. Returns `Ok(None)` on a clean EOF between packets.
pub async fn read_packet<R>(reader: &mut R) -> ScampResult<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; PACKET_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ScampError::Transport(format!("packet read failed: {e}"))),
    }
    let (kind, msg_no, len) = parse_header(&header)?;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ScampError::Transport(format!("packet body read failed: {e}")))?;

    Ok(Some(Packet { kind, msg_no, body }))
}

/// Write one packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> ScampResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = packet.encode()?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| ScampError::Transport(format!("packet write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ScampError::Transport(format!("packet flush failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_layout_is_kind_msg_no_length_body() {
        let frame = Packet::new(PacketKind::Header, 9, b"{}".to_vec())
            .encode()
            .unwrap();
        assert_eq!(frame.len(), PACKET_HEADER_LEN + 2);
        assert_eq!(frame[0], 1);
        assert_eq!(&frame[1..9], &9u64.to_be_bytes());
        assert_eq!(&frame[9..13], &2u32.to_be_bytes());

        let packet = read_packet(&mut &frame[..]).await.unwrap().unwrap();
        assert_eq!(packet.msg_no, 9);
        assert_eq!(packet.body, b"{}");
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let mut frame = Packet::eof(1).encode().unwrap();
        frame[0] = 0x7f;
        let err = read_packet(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, ScampError::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_body_arrives() {
        let mut frame = Packet::eof(1).encode().unwrap();
        frame[9..13].copy_from_slice(&((MAX_PACKET_BODY as u32) + 1).to_be_bytes());
        let err = read_packet(&mut &frame[..]).await.unwrap_err();
        assert!(matches!(err, ScampError::Protocol(_)));
    }

    #[test]
    fn oversized_body_is_not_encoded() {
        let packet = Packet::new(PacketKind::Data, 1, vec![0; MAX_PACKET_BODY + 1]);
        assert!(packet.encode().is_err());
    }

    #[test]
    fn blobs_are_chunked_and_terminated() {
        let blob = vec![0xabu8; DATA_CHUNK_SIZE * 2 + 5];
        let packets = data_packets(3, &blob);
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[2].body.len(), 5);
        assert_eq!(packets[3].kind, PacketKind::Eof);

        let empty = data_packets(3, &[]);
        assert_eq!(empty, vec![Packet::eof(3)]);
    }

    #[tokio::test]
    async fn read_packet_over_async_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = Packet::new(PacketKind::Data, u64::MAX, b"ping".to_vec());
        write_packet(&mut a, &sent).await.unwrap();
        drop(a);

        assert_eq!(read_packet(&mut b).await.unwrap(), Some(sent));
        assert_eq!(read_packet(&mut b).await.unwrap(), None);
    }
}
