//! Murmur wire format — the block header and the protocol error taxonomy.
//!
//! Every block on the wire is an 11-byte header followed by exactly
//! `payload_length` payload bytes. Headers are never encrypted: when a
//! block carries the ENCRYPTED flag only its payload window is ciphertext,
//! which keeps the stream aligned even when the payload cannot be decoded.
//!
//! Header layout (all integers big-endian):
//!
//! ```text
//!   byte 0     : version (high nibble) | transaction type (low nibble)
//!   byte 1     : flags   bit0 = last block, bit1 = encrypted, bits 2-7 zero
//!   byte 2     : block type
//!   bytes 3-10 : payload length (u64)
//! ```

use std::path::PathBuf;

use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::{BigEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::crypto::CryptoError;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current protocol version. Must fit in four bits.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of a serialized header.
pub const HEADER_SIZE: usize = 11;

/// Flag bit: this block closes the bundle.
pub const FLAG_LAST_BLOCK: u8 = 0x01;

/// Flag bit: the payload window is ciphertext.
pub const FLAG_ENCRYPTED: u8 = 0x02;

const FLAG_RESERVED: u8 = !(FLAG_LAST_BLOCK | FLAG_ENCRYPTED);

// ── Raw header ────────────────────────────────────────────────────────────────

/// The on-wire header exactly as it is laid out in the byte stream.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RawHeader {
    pub version_transaction: u8,
    pub flags: u8,
    pub block_type: u8,
    pub length: U64<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RawHeader, [u8; HEADER_SIZE]);

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Role of a block within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransactionType {
    #[default]
    Undefined = 0x00,
    Request = 0x01,
    Response = 0x02,
    Push = 0x03,
}

impl TryFrom<u8> for TransactionType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(TransactionType::Undefined),
            0x01 => Ok(TransactionType::Request),
            0x02 => Ok(TransactionType::Response),
            0x03 => Ok(TransactionType::Push),
            other => Err(ProtocolError::MalformedHeader(format!(
                "unknown transaction type 0x{other:x}"
            ))),
        }
    }
}

/// Type of the payload following a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    KeepAlive = 0x00,
    PushStatus = 0x01,
    File = 0x02,
    Contact = 0x03,
    ChatMessage = 0x04,
    Cipher = 0x05,
    /// Reserved marker. Never a valid block to receive.
    Null = 0xFF,
}

impl TryFrom<u8> for BlockType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(BlockType::KeepAlive),
            0x01 => Ok(BlockType::PushStatus),
            0x02 => Ok(BlockType::File),
            0x03 => Ok(BlockType::Contact),
            0x04 => Ok(BlockType::ChatMessage),
            0x05 => Ok(BlockType::Cipher),
            0xFF => Ok(BlockType::Null),
            other => Err(ProtocolError::UnknownBlockType(other)),
        }
    }
}

impl From<BlockType> for u8 {
    fn from(t: BlockType) -> u8 {
        t as u8
    }
}

// ── Block header ──────────────────────────────────────────────────────────────

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub transaction: TransactionType,
    pub last_block: bool,
    pub encrypted: bool,
    pub block_type: BlockType,
    /// Exact number of payload bytes following the header.
    pub payload_length: u64,
}

impl BlockHeader {
    /// A header for a pushed block of the given type. Length is filled in
    /// by the block writer once the payload size is known.
    pub fn new(block_type: BlockType) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            transaction: TransactionType::Push,
            last_block: false,
            encrypted: false,
            block_type,
            payload_length: 0,
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.last_block {
            flags |= FLAG_LAST_BLOCK;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        flags
    }

    pub fn to_raw(&self) -> RawHeader {
        RawHeader {
            version_transaction: (self.version << 4) | (self.transaction as u8 & 0x0F),
            flags: self.flags(),
            block_type: self.block_type.into(),
            length: U64::new(self.payload_length),
        }
    }

    pub fn from_raw(raw: &RawHeader) -> Result<Self, ProtocolError> {
        let version = raw.version_transaction >> 4;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::MalformedHeader(format!(
                "unsupported version {version}"
            )));
        }
        let transaction = TransactionType::try_from(raw.version_transaction & 0x0F)?;
        if raw.flags & FLAG_RESERVED != 0 {
            return Err(ProtocolError::MalformedHeader(format!(
                "reserved flags are non-zero: 0x{:02x}",
                raw.flags
            )));
        }
        Ok(Self {
            version,
            transaction,
            last_block: raw.flags & FLAG_LAST_BLOCK != 0,
            encrypted: raw.flags & FLAG_ENCRYPTED != 0,
            block_type: BlockType::try_from(raw.block_type)?,
            payload_length: raw.length.get(),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(self.to_raw().as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let raw = RawHeader::read_from_prefix(bytes).ok_or_else(|| {
            ProtocolError::MalformedHeader(format!(
                "need {HEADER_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Self::from_raw(&raw)
    }

    /// Write the header and return the number of bytes written.
    pub async fn write<W>(&self, out: &mut W) -> Result<usize, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        out.write_all(&self.to_bytes()).await?;
        Ok(HEADER_SIZE)
    }

    /// Read one header.
    ///
    /// A stream that ends before the first byte is `EndOfStream`; a stream
    /// that ends part-way through the header is `MalformedHeader`.
    pub async fn read<R>(input: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = input.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    ProtocolError::EndOfStream
                } else {
                    ProtocolError::MalformedHeader(format!(
                        "stream ended after {filled} header bytes"
                    ))
                });
            }
            filled += n;
        }
        Self::from_bytes(&buf)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while reading or writing blocks.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed block payload at offset {offset}: {reason}")]
    MalformedBlockPayload { reason: String, offset: u64 },

    #[error("end of stream")]
    EndOfStream,

    #[error("stream ended inside a payload: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("unknown block type: 0x{0:02x}")]
    UnknownBlockType(u8),

    #[error("cryptographic failure: {0}")]
    CryptographicFailure(#[from] CryptoError),

    #[error("attached file does not exist: {}", .0.display())]
    AttachmentMissing(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(reason: impl Into<String>, offset: u64) -> Self {
        ProtocolError::MalformedBlockPayload {
            reason: reason.into(),
            offset,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
