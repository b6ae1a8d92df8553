//! Wire protocol between a leader and its followers.
//!
//! Every message is length-prefixed: an 8-byte big-endian length, then that
//! many bytes of body. The body starts with a 2-byte big-endian type tag
//! followed by the type-specific fields. All integers on the wire are
//! big-endian, and a message's payload runs to the end of its frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single frame body. A length prefix beyond this is treated
/// as a corrupt stream rather than an allocation request.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const TAG_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Reserved for liveness probes. Never sent.
    Ping = 1,
    UpdateRequest = 2,
    UpdateResponse = 3,
    VersionUpdate = 4,
}

impl MessageType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Ping),
            2 => Some(Self::UpdateRequest),
            3 => Some(Self::UpdateResponse),
            4 => Some(Self::VersionUpdate),
            _ => None,
        }
    }
}

/// Outcome of a forwarded write, as carried by an [`UpdateResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 0,
    MismatchedVersion = 1,
    WriteFailed = 2,
}

impl ResponseCode {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::MismatchedVersion),
            2 => Some(Self::WriteFailed),
            _ => None,
        }
    }
}

/// Read the type tag off a frame body. `None` if the body is too short or the
/// tag is unknown; dispatchers drop such frames.
pub fn message_type(body: &[u8]) -> Option<MessageType> {
    if body.len() < TAG_LEN {
        return None;
    }
    MessageType::from_u16(be_u16(body))
}

/// A follower's optimistic write, forwarded to the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub request_id: u64,
    pub version: u64,
    pub data: Vec<u8>,
}

impl UpdateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(TAG_LEN + 16 + self.data.len());
        body.extend_from_slice(&(MessageType::UpdateRequest as u16).to_be_bytes());
        body.extend_from_slice(&self.request_id.to_be_bytes());
        body.extend_from_slice(&self.version.to_be_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let rest = expect_type(body, MessageType::UpdateRequest)?;
        if rest.len() < 16 {
            return Err(Error::TruncatedMessage);
        }
        Ok(Self {
            request_id: be_u64(&rest[0..8]),
            version: be_u64(&rest[8..16]),
            data: rest[16..].to_vec(),
        })
    }
}

/// The leader's reply to a single [`UpdateRequest`], correlated by request id.
///
/// `code` is kept raw so that a response from a newer peer still decodes; the
/// follower maps codes it does not recognize to an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResponse {
    pub request_id: u64,
    pub code: u16,
    pub version: u64,
    pub data: Vec<u8>,
}

impl UpdateResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(TAG_LEN + 18 + self.data.len());
        body.extend_from_slice(&(MessageType::UpdateResponse as u16).to_be_bytes());
        body.extend_from_slice(&self.request_id.to_be_bytes());
        body.extend_from_slice(&self.code.to_be_bytes());
        body.extend_from_slice(&self.version.to_be_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let rest = expect_type(body, MessageType::UpdateResponse)?;
        if rest.len() < 18 {
            return Err(Error::TruncatedMessage);
        }
        Ok(Self {
            request_id: be_u64(&rest[0..8]),
            code: be_u16(&rest[8..10]),
            version: be_u64(&rest[10..18]),
            data: rest[18..].to_vec(),
        })
    }
}

/// State broadcast from the leader. Also the first frame on every new
/// connection, carrying the snapshot a follower bootstraps from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionUpdate {
    pub version: u64,
    pub data: Vec<u8>,
}

impl VersionUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(TAG_LEN + 8 + self.data.len());
        body.extend_from_slice(&(MessageType::VersionUpdate as u16).to_be_bytes());
        body.extend_from_slice(&self.version.to_be_bytes());
        body.extend_from_slice(&self.data);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let rest = expect_type(body, MessageType::VersionUpdate)?;
        if rest.len() < 8 {
            return Err(Error::TruncatedMessage);
        }
        Ok(Self {
            version: be_u64(&rest[0..8]),
            data: rest[8..].to_vec(),
        })
    }
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean close at a
/// frame boundary; EOF anywhere inside a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 8];
    let n = reader.read(&mut prefix).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[n..]).await?;

    let len = u64::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write `body` with its 8-byte big-endian length prefix and flush, so peers
/// see updates without waiting on further traffic.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64(body.len() as u64).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn expect_type(body: &[u8], expected: MessageType) -> Result<&[u8]> {
    if body.len() < TAG_LEN {
        return Err(Error::TruncatedMessage);
    }
    let raw = be_u16(body);
    if MessageType::from_u16(raw) != Some(expected) {
        return Err(Error::UnexpectedMessageType(raw));
    }
    Ok(&body[TAG_LEN..])
}

fn be_u16(b: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&b[..2]);
    u16::from_be_bytes(buf)
}

fn be_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_be_bytes(buf)
}
