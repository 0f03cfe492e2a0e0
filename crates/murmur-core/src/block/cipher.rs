//! Cipher block — opens or closes the encrypted region of a bundle.
//!
//! A `Group` cipher block is always written in the clear so the receiver can
//! set up decryption; a `Clear` cipher block marks the end of the region.

use bytes::{BufMut, BytesMut};

use super::codec::PayloadReader;
use super::BlockPayload;
use crate::crypto::{Algorithm, BlockMode, CipherSuite, CryptoError, Padding, MAX_IV_SIZE};
use crate::ids::{GroupId, ID_SIZE};
use crate::wire::{BlockType, ProtocolError};

const TYPE_CLEAR: u8 = 0x00;
const TYPE_GROUP: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherBlock {
    /// No encryption from here on.
    Clear,
    /// Following blocks are encrypted with the key of `group`.
    Group {
        suite: SuiteSelectors,
        group: GroupId,
        iv: Vec<u8>,
    },
}

/// The three selector bytes of a Cipher(group) block, kept as read.
///
/// A peer may announce a suite this build cannot run. That is a crypto
/// failure for the receiver to degrade from, not a framing error, so the
/// bytes are only resolved when decryption is set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteSelectors {
    pub algorithm: u8,
    pub mode: u8,
    pub padding: u8,
}

impl SuiteSelectors {
    pub fn resolve(&self) -> Result<CipherSuite, CryptoError> {
        CipherSuite::from_selectors(
            Algorithm::try_from(self.algorithm)?,
            BlockMode::try_from(self.mode)?,
            Padding::try_from(self.padding)?,
        )
    }
}

impl From<CipherSuite> for SuiteSelectors {
    fn from(suite: CipherSuite) -> Self {
        let (algorithm, mode, padding) = suite.selectors();
        Self {
            algorithm: algorithm as u8,
            mode: mode as u8,
            padding: padding as u8,
        }
    }
}

impl BlockPayload for CipherBlock {
    const BLOCK_TYPE: BlockType = BlockType::Cipher;
    const MIN_PAYLOAD: u64 = 1;
    const MAX_PAYLOAD: u64 = 1 + 3 + ID_SIZE as u64 + 1 + MAX_IV_SIZE as u64;

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let block = match r.u8("cipher_type")? {
            TYPE_CLEAR => CipherBlock::Clear,
            TYPE_GROUP => {
                let suite = SuiteSelectors {
                    algorithm: r.u8("algorithm")?,
                    mode: r.u8("block_mode")?,
                    padding: r.u8("padding")?,
                };
                let group = GroupId(r.id("group_id")?);
                let iv_len = r.u8("iv_len")? as usize;
                if iv_len == 0 || iv_len > MAX_IV_SIZE {
                    return Err(ProtocolError::malformed(
                        format!("iv length {iv_len} outside 1..={MAX_IV_SIZE}"),
                        r.offset(),
                    ));
                }
                let iv = r.take(iv_len, "iv")?.to_vec();
                CipherBlock::Group { suite, group, iv }
            }
            other => {
                return Err(ProtocolError::malformed(
                    format!("unknown cipher type 0x{other:02x}"),
                    0,
                ));
            }
        };
        r.finish("cipher")?;
        Ok(block)
    }

    fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            CipherBlock::Clear => out.put_u8(TYPE_CLEAR),
            CipherBlock::Group { suite, group, iv } => {
                if iv.is_empty() || iv.len() > MAX_IV_SIZE {
                    return Err(ProtocolError::malformed(
                        format!("iv length {} outside 1..={MAX_IV_SIZE}", iv.len()),
                        out.len() as u64,
                    ));
                }
                out.put_u8(TYPE_GROUP);
                out.put_u8(suite.algorithm);
                out.put_u8(suite.mode);
                out.put_u8(suite.padding);
                out.put_slice(group.as_bytes());
                out.put_u8(iv.len() as u8);
                out.put_slice(iv);
            }
        }
        Ok(())
    }
}
