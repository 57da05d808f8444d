//! Length-prefixed message framing.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Result, TransportError};
use crate::proto::Message;
use crate::raft::MAX_SIZE_PER_MSG;

/// Largest accepted frame: the append payload ceiling plus header slack.
pub const MAX_FRAME_SIZE: u32 = MAX_SIZE_PER_MSG as u32 + 64 * 1024;

/// Append one framed message to `buf`.
pub fn encode_message(m: &Message, buf: &mut Vec<u8>) -> Result<()> {
    let body = bincode::serialize(m)?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    buf.reserve(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

/// Read one framed message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len as usize,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}
