//! KeepAlive block — an empty payload that keeps a quiet link open.

use bytes::BytesMut;

use super::BlockPayload;
use crate::wire::{BlockType, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeepAlive;

impl BlockPayload for KeepAlive {
    const BLOCK_TYPE: BlockType = BlockType::KeepAlive;
    const MIN_PAYLOAD: u64 = 0;
    const MAX_PAYLOAD: u64 = 0;

    fn decode(_payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(KeepAlive)
    }

    fn encode(&self, _out: &mut BytesMut) -> Result<(), ProtocolError> {
        Ok(())
    }
}
