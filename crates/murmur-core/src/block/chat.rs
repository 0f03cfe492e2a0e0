//! ChatMessage block — a direct message between two devices.

use bytes::{BufMut, BytesMut};

use super::codec::{put_string_u16, put_string_u8, PayloadReader};
use super::BlockPayload;
use crate::ids::{ChatId, UserId, ID_SIZE};
use crate::message::ChatMessage;
use crate::wire::{BlockType, ProtocolError};

pub const MAX_AUTHOR_NAME: usize = 255;
pub const MAX_CHAT_TEXT: usize = 10_000;

const FIXED: u64 = (2 * ID_SIZE) as u64 + 1 + 2 + 8;

impl BlockPayload for ChatMessage {
    const BLOCK_TYPE: BlockType = BlockType::ChatMessage;
    const MIN_PAYLOAD: u64 = FIXED + 2;
    const MAX_PAYLOAD: u64 = FIXED + (MAX_AUTHOR_NAME + MAX_CHAT_TEXT) as u64;

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let id = ChatId(r.id("message_id")?);
        let author = UserId(r.id("author_id")?);
        let author_name = r
            .string_u8("author_name", MAX_AUTHOR_NAME, true)?
            .unwrap_or_default();
        let text = r.string_u16("text", MAX_CHAT_TEXT)?;
        let created_at = r.u64("created_at")?;
        r.finish("chat message")?;
        Ok(ChatMessage {
            id,
            author,
            author_name,
            text,
            created_at,
        })
    }

    fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_slice(self.id.as_bytes());
        out.put_slice(self.author.as_bytes());
        put_string_u8(out, "author_name", Some(&self.author_name), MAX_AUTHOR_NAME, true)?;
        put_string_u16(out, "text", &self.text, MAX_CHAT_TEXT)?;
        out.put_u64(self.created_at);
        Ok(())
    }
}
