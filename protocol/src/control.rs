//! Control-plane framing shared by the proxy command socket and the agent
//! control channel.
//!
//! Message format:
//!
//! ```text
//! +-------------+--------------+---------------+-----------------+
//! | len (4 BE)  | opcode (4 BE)| corr id (4 BE)| JSON body       |
//! +-------------+--------------+---------------+-----------------+
//! ```
//!
//! `len` counts everything after the length field (opcode + correlation id +
//! body). A correlation id of 0 marks an unsolicited notification.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header length after the length field: opcode + correlation id.
const TAG_LEN: usize = 8;

/// Declared lengths above this are treated as channel corruption.
pub const MAX_CONTROL_BODY: usize = 16 * 1024 * 1024;

/// Correlation id used by unsolicited agent notifications.
pub const NOTIFICATION_CORR: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Proxy command socket, client -> proxy
    Hello,
    Attach,
    AllocateIo,
    Hyper,
    Bye,
    Status,
    // Proxy command socket, proxy -> client
    Ok,
    Err,
    // Agent control channel, host -> guest
    StartPod,
    DestroyPod,
    NewContainer,
    ExecCmd,
    KillContainer,
    AllocateSeq,
    // Agent control channel, guest -> host
    AgentAck,
    AgentError,
    Ready,
    ProcessExited,
    /// Decoded but not understood. Fatal to the RPC, not to the channel.
    Unknown(u32),
}

impl Opcode {
    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::Hello => 0x01,
            Opcode::Attach => 0x02,
            Opcode::AllocateIo => 0x03,
            Opcode::Hyper => 0x04,
            Opcode::Bye => 0x05,
            Opcode::Status => 0x06,
            Opcode::Ok => 0x10,
            Opcode::Err => 0x11,
            Opcode::StartPod => 0x20,
            Opcode::DestroyPod => 0x21,
            Opcode::NewContainer => 0x22,
            Opcode::ExecCmd => 0x23,
            Opcode::KillContainer => 0x24,
            Opcode::AllocateSeq => 0x25,
            Opcode::AgentAck => 0x30,
            Opcode::AgentError => 0x31,
            Opcode::Ready => 0x32,
            Opcode::ProcessExited => 0x33,
            Opcode::Unknown(raw) => raw,
        }
    }

    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0x01 => Opcode::Hello,
            0x02 => Opcode::Attach,
            0x03 => Opcode::AllocateIo,
            0x04 => Opcode::Hyper,
            0x05 => Opcode::Bye,
            0x06 => Opcode::Status,
            0x10 => Opcode::Ok,
            0x11 => Opcode::Err,
            0x20 => Opcode::StartPod,
            0x21 => Opcode::DestroyPod,
            0x22 => Opcode::NewContainer,
            0x23 => Opcode::ExecCmd,
            0x24 => Opcode::KillContainer,
            0x25 => Opcode::AllocateSeq,
            0x30 => Opcode::AgentAck,
            0x31 => Opcode::AgentError,
            0x32 => Opcode::Ready,
            0x33 => Opcode::ProcessExited,
            other => Opcode::Unknown(other),
        }
    }

    pub fn is_agent_command(self) -> bool {
        matches!(
            self,
            Opcode::StartPod
                | Opcode::DestroyPod
                | Opcode::NewContainer
                | Opcode::ExecCmd
                | Opcode::KillContainer
                | Opcode::AllocateSeq
        )
    }
}

#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub opcode: Opcode,
    pub corr: u32,
    pub body: Vec<u8>,
}

impl ControlMessage {
    pub fn new(opcode: Opcode, corr: u32, body: Vec<u8>) -> Self {
        Self { opcode, corr, body }
    }

    /// Build a message with a JSON-encoded body.
    pub fn with_body<T: Serialize>(
        opcode: Opcode,
        corr: u32,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            opcode,
            corr,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Build a bodiless message (empty JSON object).
    pub fn empty(opcode: Opcode, corr: u32) -> Self {
        Self {
            opcode,
            corr,
            body: b"{}".to_vec(),
        }
    }

    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_notification(&self) -> bool {
        self.corr == NOTIFICATION_CORR
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = (TAG_LEN + self.body.len()) as u32;
        let mut out = Vec::with_capacity(4 + len as usize);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.opcode.as_u32().to_be_bytes());
        out.extend_from_slice(&self.corr.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Streaming decoder for control messages. Partial records stay buffered
/// until the remainder arrives.
#[derive(Default)]
pub struct ControlDecoder {
    buf: Vec<u8>,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<ControlMessage>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len < TAG_LEN {
            return Err(ProtocolError::Malformed(format!(
                "declared length {} below tag size",
                len
            )));
        }
        if len - TAG_LEN > MAX_CONTROL_BODY {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        let opcode = Opcode::from_u32(u32::from_be_bytes([
            self.buf[4],
            self.buf[5],
            self.buf[6],
            self.buf[7],
        ]));
        let corr = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
        let body = self.buf[12..4 + len].to_vec();
        self.buf.drain(..4 + len);

        Ok(Some(ControlMessage { opcode, corr, body }))
    }
}

/// Read one control message off an async stream.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ControlMessage, ProtocolError> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(ProtocolError::ChannelClosed);
        }
        return Err(e.into());
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < TAG_LEN {
        return Err(ProtocolError::Malformed(format!(
            "declared length {} below tag size",
            len
        )));
    }
    if len - TAG_LEN > MAX_CONTROL_BODY {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut rest = vec![0u8; len];
    reader.read_exact(&mut rest).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ChannelClosed
        } else {
            ProtocolError::Io(e)
        }
    })?;

    let opcode = Opcode::from_u32(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]));
    let corr = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let body = rest[TAG_LEN..].to_vec();

    Ok(ControlMessage { opcode, corr, body })
}

/// Write one control message to an async stream.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &ControlMessage,
) -> Result<(), ProtocolError> {
    writer.write_all(&msg.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = ControlMessage::with_body(Opcode::Hyper, 7, &json!({"op": 32, "data": {}}))
            .expect("encode body");
        let bytes = msg.encode();

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes);
        let decoded = decoder.next_message().unwrap().expect("complete message");

        assert_eq!(decoded.opcode, Opcode::Hyper);
        assert_eq!(decoded.corr, 7);
        assert_eq!(decoded.body, msg.body);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_partial_input_stays_buffered() {
        let msg = ControlMessage::empty(Opcode::Bye, 3);
        let bytes = msg.encode();

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes[..5]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.feed(&bytes[5..]);
        let decoded = decoder.next_message().unwrap().expect("complete message");
        assert_eq!(decoded.opcode, Opcode::Bye);
        assert_eq!(decoded.corr, 3);
    }

    #[test]
    fn test_two_messages_in_one_feed() {
        let a = ControlMessage::empty(Opcode::Attach, 1);
        let b = ControlMessage::empty(Opcode::Bye, 2);
        let mut bytes = a.encode();
        bytes.extend_from_slice(&b.encode());

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_message().unwrap().unwrap().opcode, Opcode::Attach);
        assert_eq!(decoder.next_message().unwrap().unwrap().opcode, Opcode::Bye);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_unknown_opcode_is_flagged_not_dropped() {
        let msg = ControlMessage::new(Opcode::Unknown(0xdead), 9, b"{}".to_vec());
        let bytes = msg.encode();

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes);
        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded.opcode, Opcode::Unknown(0xdead));
        assert_eq!(decoded.corr, 9);
    }

    #[test]
    fn test_oversize_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_CONTROL_BODY as u32 + 100).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_undersize_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 3]);

        let mut decoder = ControlDecoder::new();
        decoder.feed(&bytes);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_notification_corr() {
        let msg = ControlMessage::empty(Opcode::Ready, NOTIFICATION_CORR);
        assert!(msg.is_notification());
        let msg = ControlMessage::empty(Opcode::AgentAck, 4);
        assert!(!msg.is_notification());
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ControlMessage::with_body(Opcode::KillContainer, 12, &json!({"signal": 15}))
            .unwrap();
        write_message(&mut a, &msg).await.unwrap();

        let decoded = read_message(&mut b).await.unwrap();
        assert_eq!(decoded.opcode, Opcode::KillContainer);
        assert_eq!(decoded.corr, 12);
    }

    #[tokio::test]
    async fn test_read_on_closed_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(ProtocolError::ChannelClosed)
        ));
    }
}
