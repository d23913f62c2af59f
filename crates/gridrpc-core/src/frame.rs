//! Length-prefixed frame envelope: encoding, two-phase reading, parsing.
//!
//! # Wire Format
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! [4-byte total length, u32 big-endian]   length of everything that follows
//! [4-byte magic "hrpc"]
//! [1-byte protocol version]
//! [2-byte flags region, reserved]
//! [4-byte header length, u32 big-endian]
//! [postcard-encoded header]
//! [body bytes]
//! [optional raw sidecar blocks]           lengths listed in the header
//! ```
//!
//! Reading is two-phase: the 4-byte length is read and validated first, then
//! exactly that many bytes are accumulated before any parsing happens. This
//! bounds memory use and lets a read resume after a partial delivery.
//! Parsing yields [`bytes::Bytes`] views sharing the received allocation, so
//! a body or sidecar slice stays valid for as long as the caller holds it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RpcError};
use crate::message::{CURRENT_VERSION, MAGIC};

/// Maximum accepted frame size (100 MB). Frames announcing a larger length
/// are rejected before any allocation.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Bytes between the length prefix and the serialized header:
/// magic + version + flags + header length.
const PREAMBLE_LEN: usize = 4 + 1 + 2 + 4;

/// Encode one frame into a single contiguous buffer, ready for a single
/// write. Header, body and sidecars are laid down back to back so the OS
/// can emit the whole message without further copies.
pub fn encode_frame<H: Serialize>(header: &H, body: &[u8], sidecars: &[Bytes]) -> Result<Bytes> {
    let header_buf = postcard::to_allocvec(header)?;
    let sidecar_len: usize = sidecars.iter().map(|s| s.len()).sum();
    let total = PREAMBLE_LEN + header_buf.len() + body.len() + sidecar_len;
    if total > MAX_FRAME_SIZE {
        return Err(RpcError::InvalidFrame(format!(
            "frame too large to encode: {} bytes (max {})",
            total, MAX_FRAME_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32(total as u32);
    buf.put_slice(&MAGIC);
    buf.put_u8(CURRENT_VERSION);
    buf.put_u16(0); // flags, reserved
    buf.put_u32(header_buf.len() as u32);
    buf.put_slice(&header_buf);
    buf.put_slice(body);
    for sidecar in sidecars {
        buf.put_slice(sidecar);
    }
    Ok(buf.freeze())
}

/// Accumulates bytes off a socket into whole frames.
///
/// State survives across await points, so `receive` may be used inside a
/// `select!` arm: a cancelled poll leaves any partially read frame parked in
/// the internal buffer and the next call resumes where it left off.
pub struct InboundTransfer {
    buf: BytesMut,
    total_len: Option<usize>,
}

impl InboundTransfer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            total_len: None,
        }
    }

    /// Read the next complete frame, excluding the length prefix.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF in the
    /// middle of a frame is a network error.
    pub async fn receive<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        loop {
            match self.total_len {
                Some(total) if self.buf.len() >= total => {
                    let frame = self.buf.split_to(total).freeze();
                    self.total_len = None;
                    return Ok(Some(frame));
                }
                None if self.buf.len() >= 4 => {
                    let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                        as usize;
                    self.buf.advance(4);
                    if len < PREAMBLE_LEN {
                        return Err(RpcError::InvalidFrame(format!(
                            "frame length {} shorter than preamble",
                            len
                        )));
                    }
                    if len > MAX_FRAME_SIZE {
                        return Err(RpcError::InvalidFrame(format!(
                            "frame too large: {} bytes (max {})",
                            len, MAX_FRAME_SIZE
                        )));
                    }
                    self.total_len = Some(len);
                    continue;
                }
                _ => {}
            }

            let n = self
                .reader_fill(reader)
                .await
                .map_err(|e| RpcError::Network(format!("failed to read frame: {}", e)))?;
            if n == 0 {
                if self.buf.is_empty() && self.total_len.is_none() {
                    return Ok(None);
                }
                return Err(RpcError::Network(
                    "connection closed mid-frame".to_string(),
                ));
            }
        }
    }

    async fn reader_fill<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> std::io::Result<usize> {
        reader.read_buf(&mut self.buf).await
    }
}

impl Default for InboundTransfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate the preamble of a received frame and split off the serialized
/// header, returning `(header bytes, remainder)`.
pub fn split_transfer(mut buf: Bytes) -> Result<(Bytes, Bytes)> {
    if buf.remaining() < PREAMBLE_LEN {
        return Err(RpcError::InvalidFrame("truncated frame preamble".to_string()));
    }
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(RpcError::InvalidFrame(format!(
            "bad magic bytes {:02x?}",
            magic
        )));
    }
    let version = buf.get_u8();
    if version != CURRENT_VERSION {
        return Err(RpcError::InvalidFrame(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    let _flags = buf.get_u16();
    let header_len = buf.get_u32() as usize;
    if header_len > buf.remaining() {
        return Err(RpcError::InvalidFrame(format!(
            "header length {} exceeds frame remainder {}",
            header_len,
            buf.remaining()
        )));
    }
    let header = buf.split_to(header_len);
    Ok((header, buf))
}

pub fn decode_header<H: DeserializeOwned>(header: &[u8]) -> Result<H> {
    Ok(postcard::from_bytes(header)?)
}

/// Split the post-header remainder into the body and its trailing sidecar
/// blocks, as described by the header's sidecar lengths.
pub fn split_sidecars(mut rest: Bytes, lens: &[u32]) -> Result<(Bytes, Vec<Bytes>)> {
    let sidecar_total: usize = lens.iter().map(|l| *l as usize).sum();
    if sidecar_total > rest.len() {
        return Err(RpcError::InvalidFrame(format!(
            "sidecar lengths total {} exceed frame remainder {}",
            sidecar_total,
            rest.len()
        )));
    }
    let body = rest.split_to(rest.len() - sidecar_total);
    let mut sidecars = Vec::with_capacity(lens.len());
    for len in lens {
        sidecars.push(rest.split_to(*len as usize));
    }
    Ok((body, sidecars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RemoteMethod, RequestHeader, SUPPORTED_FEATURES};

    fn request_header(sidecar_lens: Vec<u32>) -> RequestHeader {
        RequestHeader {
            call_id: 7,
            method: RemoteMethod::new("EchoService", "Echo"),
            required_features: SUPPORTED_FEATURES,
            timeout_ms: 5000,
            sidecar_lens,
        }
    }

    async fn receive_all(data: &[u8]) -> Result<Option<Bytes>> {
        let mut reader = std::io::Cursor::new(data.to_vec());
        InboundTransfer::new().receive(&mut reader).await
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let header = request_header(vec![]);
        let body = b"hello worker";
        let encoded = encode_frame(&header, body, &[]).unwrap();

        let frame = receive_all(&encoded).await.unwrap().unwrap();
        let (header_buf, rest) = split_transfer(frame).unwrap();
        let decoded: RequestHeader = decode_header(&header_buf).unwrap();
        assert_eq!(decoded.call_id, 7);
        assert_eq!(decoded.method, RemoteMethod::new("EchoService", "Echo"));
        assert_eq!(decoded.timeout_ms, 5000);

        let (body_out, sidecars) = split_sidecars(rest, &decoded.sidecar_lens).unwrap();
        assert_eq!(&body_out[..], body);
        assert!(sidecars.is_empty());
    }

    #[tokio::test]
    async fn test_frame_round_trip_with_sidecars() {
        let sidecars = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defgh")];
        let lens: Vec<u32> = sidecars.iter().map(|s| s.len() as u32).collect();
        let header = request_header(lens);
        let encoded = encode_frame(&header, b"body", &sidecars).unwrap();

        let frame = receive_all(&encoded).await.unwrap().unwrap();
        let (header_buf, rest) = split_transfer(frame).unwrap();
        let decoded: RequestHeader = decode_header(&header_buf).unwrap();
        let (body, out) = split_sidecars(rest, &decoded.sidecar_lens).unwrap();
        assert_eq!(&body[..], b"body");
        assert_eq!(out, sidecars);
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        assert!(receive_all(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let header = request_header(vec![]);
        let encoded = encode_frame(&header, b"payload", &[]).unwrap();
        let truncated = &encoded[..encoded.len() - 3];
        let err = receive_all(truncated).await.unwrap_err();
        assert!(matches!(err, RpcError::Network(_)));
    }

    #[tokio::test]
    async fn test_receive_resumes_across_partial_reads() {
        // Feed the frame one byte at a time through a reader that stalls
        // after every byte; the transfer must pick up where it left off.
        struct OneByte(std::io::Cursor<Vec<u8>>);
        impl AsyncRead for OneByte {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let pos = self.0.position() as usize;
                let data = self.0.get_ref().clone();
                if pos < data.len() {
                    buf.put_slice(&data[pos..pos + 1]);
                    self.0.set_position((pos + 1) as u64);
                }
                std::task::Poll::Ready(Ok(()))
            }
        }

        let header = request_header(vec![]);
        let encoded = encode_frame(&header, b"slow", &[]).unwrap();
        let mut reader = OneByte(std::io::Cursor::new(encoded.to_vec()));
        let mut transfer = InboundTransfer::new();
        let frame = transfer.receive(&mut reader).await.unwrap().unwrap();
        let (header_buf, rest) = split_transfer(frame).unwrap();
        let decoded: RequestHeader = decode_header(&header_buf).unwrap();
        let (body, _) = split_sidecars(rest, &decoded.sidecar_lens).unwrap();
        assert_eq!(&body[..], b"slow");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_allocation() {
        let mut data = Vec::new();
        data.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        data.extend_from_slice(&[0u8; 32]);
        let err = receive_all(&data).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame(_)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let header = request_header(vec![]);
        let encoded = encode_frame(&header, b"x", &[]).unwrap();
        let mut raw = encoded.to_vec();
        raw[4] = b'X'; // corrupt magic, after the length prefix
        let err = split_transfer(Bytes::from(raw[4..].to_vec())).unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame(_)));
    }

    #[test]
    fn test_bad_version_rejected() {
        let header = request_header(vec![]);
        let encoded = encode_frame(&header, b"x", &[]).unwrap();
        let mut raw = encoded[4..].to_vec();
        raw[4] = CURRENT_VERSION + 1; // version byte follows the magic
        let err = split_transfer(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame(_)));
    }

    #[test]
    fn test_header_length_overflow_rejected() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&MAGIC);
        raw.push(CURRENT_VERSION);
        raw.extend_from_slice(&0u16.to_be_bytes());
        raw.extend_from_slice(&1000u32.to_be_bytes()); // claims more header than exists
        raw.extend_from_slice(&[0u8; 8]);
        let err = split_transfer(Bytes::from(raw)).unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame(_)));
    }

    #[test]
    fn test_sidecar_lengths_exceeding_frame_rejected() {
        let rest = Bytes::from_static(b"short");
        let err = split_sidecars(rest, &[100]).unwrap_err();
        assert!(matches!(err, RpcError::InvalidFrame(_)));
    }
}
