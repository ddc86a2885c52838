//! Binary envelope codec.
//!
//! Framing: `[u32 BE length][payload]`. The payload starts with the
//! kind byte, then kind-specific fields. Variable fields are `u32 BE`
//! length-prefixed byte strings; fixed-width fields (ids, nonce,
//! fingerprints, signatures) are raw; integers are big-endian.
//!
//! ```text
//! Request       := 1 id:u64 origin target body
//! Response      := 2 id:u64 origin target body
//! ResponseError := 3 id:u64 origin target body
//! Notification  := 4 origin target body
//! Broadcast     := 5 origin body
//! Error         := 6 origin body
//!
//! origin := len:u32 bytes          (len is 0 or 16)
//! target := 0 | 1 peer_id:16 | 2
//! body   := 0 plain:bytes
//!         | 1 slots:u16 { fpr:32 wrapped:bytes }* nonce:24 ct:bytes sig:64
//! ```
//!
//! Decoding is total: every malformed input yields
//! [`CodecError::MalformedFrame`], never a panic, and
//! `decode(encode(m)) == m` for every well-formed envelope.

use crate::envelope::{
    Envelope, KeySlot, Payload, SealedPayload, Target, FINGERPRINT_LEN, NONCE_LEN, SIGNATURE_LEN,
};
use crate::error::CodecError;
use crate::ids::{PeerId, ID_LEN};

/// Upper bound on a frame, including the length prefix.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Sanity bound on sealed key slots per message (one per recipient).
const MAX_KEY_SLOTS: usize = 1024;

/// Sanity bound on a single wrapped content key.
const MAX_WRAPPED_LEN: usize = 4096;

/// Encode an envelope into a complete frame (length prefix included).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new();
    w.put_u8(envelope.kind());

    match envelope {
        Envelope::Request {
            id,
            origin,
            target,
            payload,
        }
        | Envelope::Response {
            id,
            origin,
            target,
            payload,
        }
        | Envelope::ResponseError {
            id,
            origin,
            target,
            payload,
        } => {
            w.put_u64(*id);
            w.put_origin(origin);
            w.put_target(target);
            w.put_payload(payload)?;
        }
        Envelope::Notification {
            origin,
            target,
            payload,
        } => {
            w.put_origin(origin);
            w.put_target(target);
            w.put_payload(payload)?;
        }
        Envelope::Broadcast { origin, payload } | Envelope::Error { origin, payload } => {
            w.put_origin(origin);
            w.put_payload(payload)?;
        }
    }

    w.into_frame()
}

/// Decode exactly one complete frame (length prefix included).
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::MalformedFrame("frame shorter than prefix"));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared != frame.len() - 4 {
        return Err(CodecError::MalformedFrame("length prefix mismatch"));
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::MalformedFrame("frame exceeds size limit"));
    }

    let mut r = Reader::new(&frame[4..]);
    let kind = r.get_u8()?;

    let envelope = match kind {
        1 | 2 | 3 => {
            let id = r.get_u64()?;
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let payload = r.get_payload()?;
            match kind {
                1 => Envelope::Request {
                    id,
                    origin,
                    target,
                    payload,
                },
                2 => Envelope::Response {
                    id,
                    origin,
                    target,
                    payload,
                },
                _ => Envelope::ResponseError {
                    id,
                    origin,
                    target,
                    payload,
                },
            }
        }
        4 => {
            let origin = r.get_origin()?;
            let target = r.get_target()?;
            let payload = r.get_payload()?;
            Envelope::Notification {
                origin,
                target,
                payload,
            }
        }
        5 => {
            let origin = r.get_origin()?;
            let payload = r.get_payload()?;
            Envelope::Broadcast { origin, payload }
        }
        6 => {
            let origin = r.get_origin()?;
            let payload = r.get_payload()?;
            Envelope::Error { origin, payload }
        }
        _ => return Err(CodecError::MalformedFrame("unknown message kind")),
    };

    if !r.is_empty() {
        return Err(CodecError::MalformedFrame("trailing bytes"));
    }
    Ok(envelope)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        // Reserve the length prefix up front.
        Self { buf: vec![0u8; 4] }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    fn put_origin(&mut self, origin: &Option<PeerId>) {
        match origin {
            Some(id) => self.put_bytes(id.as_bytes()),
            None => self.put_u32(0),
        }
    }

    fn put_target(&mut self, target: &Target) {
        match target {
            Target::Server => self.put_u8(0),
            Target::Peer(id) => {
                self.put_u8(1);
                self.put_raw(id.as_bytes());
            }
            Target::Broadcast => self.put_u8(2),
        }
    }

    fn put_payload(&mut self, payload: &Payload) -> Result<(), CodecError> {
        match payload {
            Payload::Plain(bytes) => {
                self.put_u8(0);
                self.put_bytes(bytes);
            }
            Payload::Sealed(sealed) => {
                if sealed.slots.is_empty() {
                    return Err(CodecError::MalformedFrame("sealed payload without slots"));
                }
                if sealed.slots.len() > MAX_KEY_SLOTS {
                    return Err(CodecError::MalformedFrame("too many key slots"));
                }
                self.put_u8(1);
                self.put_u16(sealed.slots.len() as u16);
                for slot in &sealed.slots {
                    self.put_raw(&slot.fingerprint);
                    self.put_bytes(&slot.wrapped);
                }
                self.put_raw(&sealed.nonce);
                self.put_bytes(&sealed.ciphertext);
                self.put_raw(&sealed.signature);
            }
        }
        Ok(())
    }

    fn into_frame(mut self) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: self.buf.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        let len = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&len.to_be_bytes());
        Ok(self.buf)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::MalformedFrame("truncated frame"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn get_bytes(&mut self, limit: usize) -> Result<Vec<u8>, CodecError> {
        let len = self.get_u32()? as usize;
        if len > limit {
            return Err(CodecError::MalformedFrame("declared length exceeds limit"));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn get_origin(&mut self) -> Result<Option<PeerId>, CodecError> {
        let bytes = self.get_bytes(ID_LEN)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        PeerId::from_bytes(&bytes)
            .map(Some)
            .ok_or(CodecError::MalformedFrame("bad origin length"))
    }

    fn get_target(&mut self) -> Result<Target, CodecError> {
        match self.get_u8()? {
            0 => Ok(Target::Server),
            1 => {
                let bytes = self.take(ID_LEN)?;
                let id = PeerId::from_bytes(bytes)
                    .ok_or(CodecError::MalformedFrame("bad target id"))?;
                Ok(Target::Peer(id))
            }
            2 => Ok(Target::Broadcast),
            _ => Err(CodecError::MalformedFrame("unknown target tag")),
        }
    }

    fn get_payload(&mut self) -> Result<Payload, CodecError> {
        match self.get_u8()? {
            0 => Ok(Payload::Plain(self.get_bytes(MAX_FRAME_SIZE)?)),
            1 => {
                let count = self.get_u16()? as usize;
                if count == 0 {
                    return Err(CodecError::MalformedFrame("sealed payload without slots"));
                }
                if count > MAX_KEY_SLOTS {
                    return Err(CodecError::MalformedFrame("too many key slots"));
                }
                let mut slots = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut fingerprint = [0u8; FINGERPRINT_LEN];
                    fingerprint.copy_from_slice(self.take(FINGERPRINT_LEN)?);
                    let wrapped = self.get_bytes(MAX_WRAPPED_LEN)?;
                    slots.push(KeySlot {
                        fingerprint,
                        wrapped,
                    });
                }
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(self.take(NONCE_LEN)?);
                let ciphertext = self.get_bytes(MAX_FRAME_SIZE)?;
                let mut signature = [0u8; SIGNATURE_LEN];
                signature.copy_from_slice(self.take(SIGNATURE_LEN)?);
                Ok(Payload::Sealed(SealedPayload {
                    slots,
                    nonce,
                    ciphertext,
                    signature,
                }))
            }
            _ => Err(CodecError::MalformedFrame("unknown payload tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(slots: usize) -> Payload {
        Payload::Sealed(SealedPayload {
            slots: (0..slots)
                .map(|i| KeySlot {
                    fingerprint: [i as u8; FINGERPRINT_LEN],
                    wrapped: vec![0xAB; 104],
                })
                .collect(),
            nonce: [7u8; NONCE_LEN],
            ciphertext: vec![1, 2, 3, 4, 5],
            signature: [9u8; SIGNATURE_LEN],
        })
    }

    fn all_shapes() -> Vec<Envelope> {
        let peer = PeerId::random();
        let other = PeerId::random();
        vec![
            Envelope::Request {
                id: 1,
                origin: None,
                target: Target::Server,
                payload: Payload::Plain(b"hello".to_vec()),
            },
            Envelope::Request {
                id: u64::MAX,
                origin: Some(peer),
                target: Target::Peer(other),
                payload: sealed(3),
            },
            Envelope::Response {
                id: 42,
                origin: Some(other),
                target: Target::Peer(peer),
                payload: sealed(1),
            },
            Envelope::ResponseError {
                id: 43,
                origin: Some(other),
                target: Target::Server,
                payload: sealed(1),
            },
            Envelope::Notification {
                origin: None,
                target: Target::Peer(peer),
                payload: sealed(1),
            },
            Envelope::Notification {
                origin: Some(peer),
                target: Target::Broadcast,
                payload: sealed(2),
            },
            Envelope::Broadcast {
                origin: Some(peer),
                payload: sealed(2),
            },
            Envelope::Error {
                origin: None,
                payload: Payload::Plain(b"no such recipient".to_vec()),
            },
        ]
    }

    #[test]
    fn roundtrip_all_shapes() {
        for envelope in all_shapes() {
            let frame = encode(&envelope).unwrap();
            let decoded = decode(&frame).unwrap();
            assert_eq!(envelope, decoded, "roundtrip failed for {envelope:?}");
        }
    }

    #[test]
    fn kind_byte_is_first_payload_byte() {
        for envelope in all_shapes() {
            let frame = encode(&envelope).unwrap();
            assert_eq!(frame[4], envelope.kind());
        }
    }

    #[test]
    fn length_prefix_is_big_endian_payload_length() {
        let frame = encode(&Envelope::Error {
            origin: None,
            payload: Payload::Plain(vec![]),
        })
        .unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(matches!(
            decode(&[]),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut frame = encode(&Envelope::Error {
            origin: None,
            payload: Payload::Plain(vec![]),
        })
        .unwrap();
        frame[4] = 99;
        assert!(matches!(decode(&frame), Err(CodecError::MalformedFrame(_))));
    }

    #[test]
    fn truncated_frame_is_malformed() {
        let frame = encode(&Envelope::Broadcast {
            origin: Some(PeerId::random()),
            payload: sealed(2),
        })
        .unwrap();
        for cut in 1..frame.len() {
            let mut short = frame[..cut].to_vec();
            // Fix the prefix so only the body is truncated.
            if short.len() >= 4 {
                let len = (short.len() - 4) as u32;
                short[..4].copy_from_slice(&len.to_be_bytes());
            }
            assert!(
                decode(&short).is_err(),
                "truncation at {cut} decoded successfully"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut frame = encode(&Envelope::Error {
            origin: None,
            payload: Payload::Plain(b"x".to_vec()),
        })
        .unwrap();
        frame.push(0);
        let len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&len.to_be_bytes());
        assert_eq!(
            decode(&frame),
            Err(CodecError::MalformedFrame("trailing bytes"))
        );
    }

    #[test]
    fn mismatched_length_prefix_is_malformed() {
        let mut frame = encode(&Envelope::Error {
            origin: None,
            payload: Payload::Plain(b"x".to_vec()),
        })
        .unwrap();
        frame[3] = frame[3].wrapping_add(1);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn zero_slot_sealed_payload_rejected_both_ways() {
        let envelope = Envelope::Broadcast {
            origin: Some(PeerId::random()),
            payload: Payload::Sealed(SealedPayload {
                slots: vec![],
                nonce: [0u8; NONCE_LEN],
                ciphertext: vec![],
                signature: [0u8; SIGNATURE_LEN],
            }),
        };
        assert!(encode(&envelope).is_err());

        // Hand-build the same thing on the wire.
        let mut frame = vec![0u8; 4];
        frame.push(5); // Broadcast
        frame.extend_from_slice(&0u32.to_be_bytes()); // no origin
        frame.push(1); // sealed
        frame.extend_from_slice(&0u16.to_be_bytes()); // zero slots
        let len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&len.to_be_bytes());
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn oversized_declared_length_is_malformed() {
        let mut frame = vec![0u8; 4];
        frame.push(6); // Error
        frame.extend_from_slice(&0u32.to_be_bytes()); // no origin
        frame.push(0); // plain
        frame.extend_from_slice(&u32::MAX.to_be_bytes()); // absurd length
        let len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&len.to_be_bytes());
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn decode_never_panics_on_mutations() {
        // Flip every byte of a valid frame one at a time; decode must
        // return (Ok or Err), never panic.
        let frame = encode(&Envelope::Request {
            id: 7,
            origin: Some(PeerId::random()),
            target: Target::Broadcast,
            payload: sealed(2),
        })
        .unwrap();
        for i in 0..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0xFF;
            let _ = decode(&mutated);
        }
    }

    #[test]
    fn oversized_frame_rejected_on_encode() {
        let envelope = Envelope::Broadcast {
            origin: None,
            payload: Payload::Plain(vec![0u8; MAX_FRAME_SIZE]),
        };
        assert!(matches!(
            encode(&envelope),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
