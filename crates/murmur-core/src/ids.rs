//! Fixed-size identifiers carried on the wire.
//!
//! Every identifier is 16 raw bytes inside a block. Outside the protocol
//! (storage keys, logs, exports) they travel as standard base64 text.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire size of every identifier.
pub const ID_SIZE: usize = 16;

macro_rules! wire_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; ID_SIZE]);

        impl $name {
            /// A fresh random identifier.
            pub fn random() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            /// Base64 text form used by storage and logs.
            pub fn to_base64(&self) -> String {
                STANDARD.encode(self.0)
            }

            /// Parse the base64 text form. Returns None on bad input or length.
            pub fn from_base64(text: &str) -> Option<Self> {
                let bytes = STANDARD.decode(text).ok()?;
                let arr: [u8; ID_SIZE] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            /// Short hex prefix for log fields.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..8])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base64())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_base64(&s)
                    .ok_or_else(|| serde::de::Error::custom("expected 16 base64-encoded bytes"))
            }
        }
    };
}

wire_id!(
    /// Globally unique identifier of a status, assigned by its author.
    StatusId
);
wire_id!(
    /// Identifier of a group. Private groups additionally carry a shared key.
    GroupId
);
wire_id!(
    /// Stable identifier of a user (a contact, when seen from another device).
    UserId
);
wire_id!(
    /// Identifier of a direct chat message.
    ChatId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let id = GroupId::from_bytes([0x5a; ID_SIZE]);
        let text = id.to_base64();
        assert_eq!(GroupId::from_base64(&text), Some(id));
    }

    #[test]
    fn base64_rejects_wrong_length() {
        let text = STANDARD.encode([1u8; 15]);
        assert_eq!(UserId::from_base64(&text), None);
        assert_eq!(UserId::from_base64("not base64!"), None);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(StatusId::random(), StatusId::random());
    }

    #[test]
    fn serde_uses_text_form() {
        let id = UserId::from_bytes([7u8; ID_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base64()));
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
