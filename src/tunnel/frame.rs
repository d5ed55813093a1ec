//! Frame encoding/decoding for the tunnel wire protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+------------------+
//! |   Length (2B, big endian)          |
//! +--------+--------+------------------+
//! |   Payload (1..=65535 bytes)        |
//! +-----------------------------------+
//! ```
//!
//! The payload is one opaque IP datagram. A zero length header is the
//! end-of-stream marker; a carrier that sees it shuts down. TLS provides
//! integrity, so there is no framing-level checksum.

use super::TunnelError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header size in bytes
pub const FRAME_HEADER_LEN: usize = 2;

/// Maximum payload size (largest value a 16-bit length can carry)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Encode one datagram into a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, TunnelError> {
    if payload.is_empty() {
        return Err(TunnelError::EmptyFrame);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TunnelError::FrameTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame from a carrier stream.
///
/// Returns `Ok(None)` on a zero length header (clean end-of-stream).
/// A stream that ends mid-header or mid-payload is an error, never a
/// short success.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, TunnelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u16::from_be_bytes(header) as usize;
    if len == 0 {
        return Ok(None);
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let payload = b"not actually an IP datagram";
        let frame = encode_frame(payload).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + payload.len());

        let mut stream: &[u8] = &frame;
        let decoded = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(&decoded[..], payload);
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_sizes() {
        for size in [1usize, 2, 1400, MAX_PAYLOAD_SIZE] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(&payload).unwrap();
            let mut stream: &[u8] = &frame;
            let decoded = read_frame(&mut stream).await.unwrap().unwrap();
            assert_eq!(decoded.len(), size);
            assert_eq!(&decoded[..], &payload[..]);
        }
    }

    #[test]
    fn test_encode_rejects_empty() {
        assert!(matches!(encode_frame(&[]), Err(TunnelError::EmptyFrame)));
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(TunnelError::FrameTooLarge(_, _))
        ));
    }

    #[tokio::test]
    async fn test_zero_length_terminates() {
        let mut stream: &[u8] = &[0x00, 0x00, 0xde, 0xad];
        let decoded = read_frame(&mut stream).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn test_partial_header_is_error() {
        let mut stream: &[u8] = &[0x01];
        assert!(read_frame(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_partial_payload_is_error() {
        // Header promises 16 bytes, stream carries 4.
        let mut stream: &[u8] = &[0x00, 0x10, 1, 2, 3, 4];
        assert!(read_frame(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_back_to_back_frames_keep_boundaries() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"second").unwrap());

        let mut stream: &[u8] = &wire;
        assert_eq!(&read_frame(&mut stream).await.unwrap().unwrap()[..], b"first");
        assert_eq!(&read_frame(&mut stream).await.unwrap().unwrap()[..], b"second");
    }
}
