//! Length-prefixed CBOR framing shared by every transport.
//!
//! Each frame is a `u32` big-endian byte count followed by one CBOR-encoded
//! [`Envelope`].

use super::envelope::Envelope;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum encoded size of a single frame (64MB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Worst-case frame bytes per array element: a 5-byte CBOR float or
/// integer, each payload byte re-encoded as a CBOR integer of up to 2 bytes
const MAX_ENCODED_ELEMENT_BYTES: usize = 10;

/// Frame bytes reserved for the envelope, tag and array shape
const FRAME_HEADROOM: usize = 4096;

/// Largest chunk, in elements, that always fits in one frame
pub const MAX_CHUNK_ELEMENTS: usize = (MAX_FRAME_BYTES - FRAME_HEADROOM) / MAX_ENCODED_ELEMENT_BYTES;

/// Encode an envelope, rejecting frames over [`MAX_FRAME_BYTES`]
pub fn encode_frame(envelope: &Envelope) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(envelope, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if buf.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Message too large: {} bytes (max {})",
                buf.len(),
                MAX_FRAME_BYTES
            ),
        ));
    }
    Ok(buf)
}

/// Decode an envelope from one frame body
pub fn decode_frame(bytes: &[u8]) -> io::Result<Envelope> {
    ciborium::from_reader(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Read one length-prefixed CBOR envelope
pub async fn read_frame<T>(io: &mut T) -> io::Result<Envelope>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes (max {})", len, MAX_FRAME_BYTES),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    decode_frame(&buf)
}

/// Write one length-prefixed CBOR envelope
pub async fn write_frame<T>(io: &mut T, envelope: &Envelope) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let buf = encode_frame(envelope)?;

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}
