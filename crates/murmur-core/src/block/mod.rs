//! Typed block payloads and the helpers shared by every variant.
//!
//! A block is a header plus a payload of exactly `payload_length` bytes.
//! Buffered variants implement [`BlockPayload`]; the file variant streams
//! and lives in [`file`].

pub mod chat;
pub mod cipher;
pub mod codec;
pub mod contact;
pub mod file;
pub mod keepalive;
pub mod push_status;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::BundleCipher;
use crate::wire::{BlockHeader, BlockType, ProtocolError, HEADER_SIZE};

pub use cipher::{CipherBlock, SuiteSelectors};
pub use file::{MimeType, ReceivedFile};
pub use keepalive::KeepAlive;

/// A fully buffered block payload with declared size bounds.
pub trait BlockPayload: Sized {
    const BLOCK_TYPE: BlockType;
    const MIN_PAYLOAD: u64;
    const MAX_PAYLOAD: u64;

    /// Parse a payload that already passed [`BlockPayload::sanity_check`].
    fn decode(payload: &[u8]) -> Result<Self, ProtocolError>;

    /// Append the payload encoding to `out`.
    fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Validate the header's block type and the cleartext payload length.
    fn sanity_check(block_type: BlockType, payload_length: u64) -> Result<(), ProtocolError> {
        if block_type != Self::BLOCK_TYPE {
            return Err(ProtocolError::malformed(
                format!("expected {:?} block, got {block_type:?}", Self::BLOCK_TYPE),
                0,
            ));
        }
        if payload_length < Self::MIN_PAYLOAD || payload_length > Self::MAX_PAYLOAD {
            return Err(ProtocolError::malformed(
                format!(
                    "{:?} payload length {payload_length} outside [{}, {}]",
                    Self::BLOCK_TYPE,
                    Self::MIN_PAYLOAD,
                    Self::MAX_PAYLOAD
                ),
                0,
            ));
        }
        Ok(())
    }
}

/// Sanity-check then decode a cleartext payload.
pub fn decode_block<T: BlockPayload>(payload: &[u8]) -> Result<T, ProtocolError> {
    T::sanity_check(T::BLOCK_TYPE, payload.len() as u64)?;
    T::decode(payload)
}

/// Encode a payload and check it against the variant's bounds.
pub fn encode_block<T: BlockPayload>(block: &T) -> Result<Bytes, ProtocolError> {
    let mut out = BytesMut::new();
    block.encode(&mut out)?;
    T::sanity_check(T::BLOCK_TYPE, out.len() as u64)?;
    Ok(out.freeze())
}

/// Read exactly `len` payload bytes.
///
/// Ending before the first byte is `EndOfStream`; ending part-way is
/// `Truncated`, the peer having promised more than it sent.
pub async fn read_exact_payload<R>(input: &mut R, len: u64) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::EndOfStream
            } else {
                ProtocolError::Truncated {
                    expected: len,
                    got: filled as u64,
                }
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Consume and drop `len` payload bytes without buffering them.
pub async fn discard_payload<R>(input: &mut R, len: u64) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *input).take(len), &mut tokio::io::sink()).await?;
    if copied != len {
        return Err(ProtocolError::Truncated {
            expected: len,
            got: copied,
        });
    }
    Ok(())
}

/// Write a header and its payload, sealing the payload window when a
/// bundle cipher is active. Returns the bytes written, header included.
pub async fn write_block_bytes<W>(
    out: &mut W,
    mut header: BlockHeader,
    payload: &[u8],
    cipher: Option<&mut BundleCipher>,
) -> Result<u64, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let sealed;
    let body = match cipher {
        Some(cipher) => {
            sealed = cipher.seal(payload)?;
            header.encrypted = true;
            sealed.as_slice()
        }
        None => {
            header.encrypted = false;
            payload
        }
    };
    header.payload_length = body.len() as u64;
    header.write(out).await?;
    out.write_all(body).await?;
    Ok((HEADER_SIZE + body.len()) as u64)
}

/// Encode `block` and write it as one block.
pub async fn write_block<W, T>(
    out: &mut W,
    block: &T,
    last_block: bool,
    cipher: Option<&mut BundleCipher>,
) -> Result<u64, ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: BlockPayload,
{
    let payload = encode_block(block)?;
    let mut header = BlockHeader::new(T::BLOCK_TYPE);
    header.last_block = last_block;
    write_block_bytes(out, header, &payload, cipher).await
}
