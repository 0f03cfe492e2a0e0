//! Contact block — a user's identity, joined groups and hashtag interests.
//!
//! After the fixed part the payload carries `entry_count` tagged entries:
//!
//! ```text
//!   0x01 group membership  : group_id[16]
//!   0x02 hashtag interest  : tag_len u8, tag bytes, level u8
//! ```

use bytes::{BufMut, BytesMut};

use super::codec::{put_string_u8, PayloadReader};
use super::BlockPayload;
use crate::ids::{GroupId, UserId, ID_SIZE};
use crate::message::{normalize_tag, Contact, MAX_INTEREST};
use crate::wire::{BlockType, ProtocolError};

pub const MAX_NAME: usize = 255;
pub const MAX_HASHTAG: usize = 64;
pub const MAX_ENTRIES: usize = 1024;

const ENTRY_GROUP: u8 = 0x01;
const ENTRY_INTEREST: u8 = 0x02;

const FIXED: u64 = ID_SIZE as u64 + 1 + 2;
/// Largest single entry: tag byte, length prefix, tag, level.
const MAX_ENTRY: u64 = 1 + 1 + MAX_HASHTAG as u64 + 1;

impl BlockPayload for Contact {
    const BLOCK_TYPE: BlockType = BlockType::Contact;
    const MIN_PAYLOAD: u64 = FIXED + 1;
    const MAX_PAYLOAD: u64 = FIXED + MAX_NAME as u64 + MAX_ENTRIES as u64 * MAX_ENTRY;

    fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        let uid = UserId(r.id("user_id")?);
        let name = r.string_u8("name", MAX_NAME, true)?.unwrap_or_default();
        let count = r.u16("entry_count")? as usize;
        if count > MAX_ENTRIES {
            return Err(ProtocolError::malformed(
                format!("entry_count {count} exceeds maximum {MAX_ENTRIES}"),
                r.offset(),
            ));
        }

        let mut contact = Contact::new(uid, &name);
        for _ in 0..count {
            let at = r.offset();
            match r.u8("entry_type")? {
                ENTRY_GROUP => {
                    contact.groups.insert(GroupId(r.id("group_id")?));
                }
                ENTRY_INTEREST => {
                    let tag = r
                        .string_u8("hashtag", MAX_HASHTAG, true)?
                        .unwrap_or_default();
                    let level = r.u8("interest_level")?;
                    if level > MAX_INTEREST {
                        return Err(ProtocolError::malformed(
                            format!("interest level {level} exceeds {MAX_INTEREST}"),
                            r.offset(),
                        ));
                    }
                    contact.interests.insert(normalize_tag(&tag), level);
                }
                other => {
                    return Err(ProtocolError::malformed(
                        format!("unknown contact entry type 0x{other:02x}"),
                        at,
                    ));
                }
            }
        }
        r.finish("contact")?;
        Ok(contact)
    }

    fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let count = self.groups.len() + self.interests.len();
        if count > MAX_ENTRIES {
            return Err(ProtocolError::malformed(
                format!("{count} entries exceed maximum {MAX_ENTRIES}"),
                out.len() as u64,
            ));
        }
        for (tag, level) in &self.interests {
            if *level > MAX_INTEREST {
                return Err(ProtocolError::malformed(
                    format!("interest level {level} for {tag:?} exceeds {MAX_INTEREST}"),
                    out.len() as u64,
                ));
            }
            if *tag != normalize_tag(tag) {
                return Err(ProtocolError::malformed(
                    format!("interest key {tag:?} is not normalized"),
                    out.len() as u64,
                ));
            }
        }
        out.put_slice(self.uid.as_bytes());
        put_string_u8(out, "name", Some(&self.name), MAX_NAME, true)?;
        out.put_u16(count as u16);
        for group in &self.groups {
            out.put_u8(ENTRY_GROUP);
            out.put_slice(group.as_bytes());
        }
        for (tag, level) in &self.interests {
            out.put_u8(ENTRY_INTEREST);
            put_string_u8(out, "hashtag", Some(tag), MAX_HASHTAG, true)?;
            out.put_u8(*level);
        }
        Ok(())
    }
}
