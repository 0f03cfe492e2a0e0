//! PushStatus block — one status, optionally announcing an attached file
//! that follows as the next block of the same bundle.

use bytes::{BufMut, BytesMut};

use super::codec::{put_string_u16, put_string_u8, PayloadReader};
use super::BlockPayload;
use crate::ids::{GroupId, StatusId, UserId, ID_SIZE};
use crate::message::PushStatus;
use crate::wire::{BlockType, ProtocolError};

pub const MAX_AUTHOR_NAME: usize = 255;
pub const MAX_POST: usize = 10_000;
pub const MAX_FILENAME: usize = 255;

/// Bytes taken by fixed-width fields and the three length prefixes.
const FIXED: u64 = (4 * ID_SIZE) as u64 + 1 + 2 + 1 + 8 + 8 + 2 + 2 + 4 + 4;

impl BlockPayload for PushStatus {
    const BLOCK_TYPE: BlockType = BlockType::PushStatus;
    const MIN_PAYLOAD: u64 = FIXED + 2;
    const MAX_PAYLOAD: u64 = FIXED + (MAX_AUTHOR_NAME + MAX_POST + MAX_FILENAME) as u64;

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let id = StatusId(r.id("status_id")?);
        let group = GroupId(r.id("group_id")?);
        let sender = UserId(r.id("sender_id")?);
        let author = UserId(r.id("author_id")?);
        let author_name = r
            .string_u8("author_name", MAX_AUTHOR_NAME, true)?
            .unwrap_or_default();
        let post = r.string_u16("post", MAX_POST)?;
        let filename = r.string_u8("filename", MAX_FILENAME, false)?;
        let created_at = r.u64("created_at")?;
        let ttl = r.i64("ttl")?;
        let hop_count = r.u16("hop_count")?;
        let hop_limit = r.u16("hop_limit")?;
        let replication = r.u32("replication")?;
        let like = r.u32("like")?;
        r.finish("push status")?;

        Ok(PushStatus {
            id,
            group,
            sender,
            author,
            author_name,
            post,
            filename,
            created_at,
            ttl,
            hop_count,
            hop_limit,
            replication,
            like,
        })
    }

    fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        out.put_slice(self.id.as_bytes());
        out.put_slice(self.group.as_bytes());
        out.put_slice(self.sender.as_bytes());
        out.put_slice(self.author.as_bytes());
        put_string_u8(out, "author_name", Some(&self.author_name), MAX_AUTHOR_NAME, true)?;
        put_string_u16(out, "post", &self.post, MAX_POST)?;
        if self.filename.as_deref() == Some("") {
            // Length 0 on the wire already means "no attachment".
            return Err(ProtocolError::malformed("filename present but empty", out.len() as u64));
        }
        put_string_u8(out, "filename", self.filename.as_deref(), MAX_FILENAME, false)?;
        out.put_u64(self.created_at);
        out.put_i64(self.ttl);
        out.put_u16(self.hop_count);
        out.put_u16(self.hop_limit);
        out.put_u32(self.replication);
        out.put_u32(self.like);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{decode_block, encode_block};

    fn status() -> PushStatus {
        PushStatus {
            id: StatusId::from_bytes([1; 16]),
            group: GroupId::from_bytes([2; 16]),
            sender: UserId::from_bytes([3; 16]),
            author: UserId::from_bytes([4; 16]),
            author_name: "ann".into(),
            post: "hello #news".into(),
            filename: Some("cat.jpg".into()),
            created_at: 1_700_000_000_000,
            ttl: -1,
            hop_count: 2,
            hop_limit: 10,
            replication: 7,
            like: 3,
        }
    }

    #[test]
    fn round_trip() {
        let original = status();
        let bytes = encode_block(&original).unwrap();
        assert_eq!(PushStatus::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn minimum_payload_decodes() {
        let mut s = status();
        s.author_name = "a".into();
        s.post = "p".into();
        s.filename = None;
        let bytes = encode_block(&s).unwrap();
        assert_eq!(bytes.len() as u64, PushStatus::MIN_PAYLOAD);
        assert_eq!(decode_block::<PushStatus>(&bytes).unwrap(), s);
    }

    #[test]
    fn post_length_boundaries() {
        for len in [1, MAX_POST - 1, MAX_POST] {
            let mut s = status();
            s.post = "x".repeat(len);
            let bytes = encode_block(&s).unwrap();
            assert_eq!(decode_block::<PushStatus>(&bytes).unwrap().post.len(), len);
        }
        for len in [0, MAX_POST + 1] {
            let mut s = status();
            s.post = "x".repeat(len);
            assert!(matches!(
                encode_block(&s),
                Err(ProtocolError::MalformedBlockPayload { .. })
            ));
        }
    }

    #[test]
    fn author_name_boundaries() {
        for len in [1, MAX_AUTHOR_NAME - 1, MAX_AUTHOR_NAME] {
            let mut s = status();
            s.author_name = "n".repeat(len);
            let bytes = encode_block(&s).unwrap();
            assert_eq!(decode_block::<PushStatus>(&bytes).unwrap(), s);
        }
        for len in [0, MAX_AUTHOR_NAME + 1] {
            let mut s = status();
            s.author_name = "n".repeat(len);
            assert!(encode_block(&s).is_err());
        }
    }

    #[test]
    fn filename_boundaries() {
        let mut s = status();
        s.filename = None;
        let bytes = encode_block(&s).unwrap();
        assert_eq!(bytes.len() as u64, FIXED + 3 + 11);
        assert_eq!(decode_block::<PushStatus>(&bytes).unwrap().filename, None);

        for len in [1, MAX_FILENAME - 1, MAX_FILENAME] {
            let mut s = status();
            s.filename = Some("f".repeat(len));
            let bytes = encode_block(&s).unwrap();
            assert_eq!(decode_block::<PushStatus>(&bytes).unwrap(), s);
        }
        for name in [String::new(), "f".repeat(MAX_FILENAME + 1)] {
            let mut s = status();
            s.filename = Some(name);
            assert!(matches!(
                encode_block(&s),
                Err(ProtocolError::MalformedBlockPayload { .. })
            ));
        }
    }

    #[test]
    fn forged_post_prefix_rejected() {
        let s = status();
        let mut bytes = encode_block(&s).unwrap().to_vec();
        // post length prefix sits after four ids and the author name
        let at = 4 * ID_SIZE + 1 + s.author_name.len();
        bytes[at] = 0xFF;
        bytes[at + 1] = 0xFF;
        match PushStatus::decode(&bytes) {
            Err(ProtocolError::MalformedBlockPayload { offset, .. }) => {
                assert_eq!(offset as usize, at + 2)
            }
            other => panic!("expected malformed payload, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_rejected() {
        let bytes = encode_block(&status()).unwrap();
        assert!(PushStatus::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
