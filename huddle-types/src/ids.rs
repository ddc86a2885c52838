//! Identity types for the huddle protocol.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of the random identifiers.
pub const ID_LEN: usize = 16;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Create a new random identifier.
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_LEN];
                getrandom::getrandom(&mut bytes).expect("getrandom failed");
                Self(bytes)
            }

            /// Create an identifier from raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                if bytes.len() == ID_LEN {
                    let mut arr = [0u8; ID_LEN];
                    arr.copy_from_slice(bytes);
                    Some(Self(arr))
                } else {
                    None
                }
            }

            /// Get the raw bytes of this identifier.
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_string()[..8])
            }
        }

        impl FromStr for $name {
            type Err = crate::error::CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = URL_SAFE_NO_PAD
                    .decode(s)
                    .map_err(|_| crate::error::CodecError::MalformedFrame("bad id encoding"))?;
                Self::from_bytes(&bytes)
                    .ok_or(crate::error::CodecError::MalformedFrame("bad id length"))
            }
        }

        // Ids travel as their base64 text in JSON and MessagePack; the
        // envelope codec carries the raw bytes itself.
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = <String as serde::Deserialize>::deserialize(deserializer)?;
                text.parse()
                    .map_err(|_| serde::de::Error::custom(concat!("invalid ", stringify!($name))))
            }
        }
    };
}

opaque_id! {
    /// Identifies one connected peer within its room.
    ///
    /// Assigned by the server during the join handshake.
    PeerId
}

opaque_id! {
    /// Identifies a collaboration room for its lifetime.
    RoomId
}

opaque_id! {
    /// Durable identifier for an authenticated user.
    UserId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrip() {
        let original = PeerId::random();
        let restored = PeerId::from_bytes(original.as_bytes()).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn peer_id_display_parses_back() {
        let id = RoomId::random();
        let parsed: RoomId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_display_is_url_safe_base64() {
        let id = UserId::random();
        let display = id.to_string();
        assert_eq!(display.len(), 22); // 16 bytes, no padding
        assert!(!display.contains('+'));
        assert!(!display.contains('/'));
    }

    #[test]
    fn id_from_invalid_length_fails() {
        assert!(PeerId::from_bytes(&[0u8; 8]).is_none());
        assert!(PeerId::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn id_from_bad_text_fails() {
        assert!("not base64!!".parse::<RoomId>().is_err());
        assert!("AAAA".parse::<RoomId>().is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(PeerId::random(), PeerId::random());
    }

    #[test]
    fn ids_serialize_as_text() {
        let id = PeerId::random();
        let bytes = rmp_serde::to_vec_named(&id).unwrap();
        let text: String = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(text, id.to_string());

        let back: PeerId = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, id);
    }
}
