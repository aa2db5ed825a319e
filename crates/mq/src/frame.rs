//! Wire framing: the 16-byte header every frame carries, and the bit layout
//! of its type byte.
//!
//! ```text
//! offset 0..5   : magic "MQmsg"
//! offset 5..7   : reserved, must be zero
//! offset 7      : type byte, bits 2-7 must be zero
//! offset 8..16  : payload length, big-endian u64
//! ```
//!
//! The header is read/written through a fixed `[u8; HEADER_LEN]` array with
//! an explicit cursor rather than overlaid on adjacent struct fields — see
//! DESIGN.md for why the C source's layout trick isn't reproduced here.

use crate::error::MqError;

pub const MAGIC: [u8; 5] = *b"MQmsg";
pub const HEADER_LEN: usize = 16;
/// Largest payload carried by a single frame.
pub const CHUNK: usize = 1 << 16;

const TYPE_START: u8 = 1 << 0;
const TYPE_END: u8 = 1 << 1;
const TYPE_RESERVED_MASK: u8 = !(TYPE_START | TYPE_END);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType(u8);

impl FrameType {
    pub const SINGLE: Self = Self(TYPE_START | TYPE_END);
    pub const START: Self = Self(TYPE_START);
    pub const CONT: Self = Self(0);
    pub const END: Self = Self(TYPE_END);

    pub fn is_start(self) -> bool {
        self.0 & TYPE_START != 0
    }

    pub fn is_end(self) -> bool {
        self.0 & TYPE_END != 0
    }

    pub fn with_end(self) -> Self {
        Self(self.0 | TYPE_END)
    }

    fn to_byte(self) -> u8 {
        self.0
    }

    fn from_byte(byte: u8) -> Option<Self> {
        if byte & TYPE_RESERVED_MASK != 0 { None } else { Some(Self(byte)) }
    }
}

/// Encodes a header into `out`. `out` must be `HEADER_LEN` bytes.
pub fn encode_header(out: &mut [u8; HEADER_LEN], ty: FrameType, len: u64) {
    out[0..5].copy_from_slice(&MAGIC);
    out[5] = 0;
    out[6] = 0;
    out[7] = ty.to_byte();
    out[8..16].copy_from_slice(&len.to_be_bytes());
}

/// A parsed, not-yet-validated header.
pub struct RawHeader {
    pub ty: u8,
    pub len: u64,
    magic_ok: bool,
    reserved_ok: bool,
}

pub fn parse_header(buf: &[u8; HEADER_LEN]) -> RawHeader {
    RawHeader {
        magic_ok: buf[0..5] == MAGIC,
        reserved_ok: buf[5] == 0 && buf[6] == 0,
        ty: buf[7],
        len: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
    }
}

/// Validates a parsed header against the receive-side `seen_initial` flag
/// (invariant 7 in spec.md §3: exactly one `START`, consistent with whether
/// a logical message is already in progress).
pub fn validate_header(raw: &RawHeader, seen_initial: bool) -> Result<FrameType, MqError> {
    if !raw.magic_ok || !raw.reserved_ok {
        return Err(MqError::BadFrame);
    }
    let Some(ty) = FrameType::from_byte(raw.ty) else {
        return Err(MqError::BadFrame);
    };
    if ty.is_start() == seen_initial {
        return Err(MqError::BadFrame);
    }
    Ok(ty)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_frame_has_start_and_end() {
        assert!(FrameType::SINGLE.is_start());
        assert!(FrameType::SINGLE.is_end());
    }

    #[test]
    fn cont_has_neither() {
        assert!(!FrameType::CONT.is_start());
        assert!(!FrameType::CONT.is_end());
    }

    #[test]
    fn roundtrip_header() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::START, 12345);
        let raw = parse_header(&buf);
        let ty = validate_header(&raw, false).unwrap();
        assert!(ty.is_start());
        assert_eq!(raw.len, 12345);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::SINGLE, 0);
        buf[0] = b'X';
        let raw = parse_header(&buf);
        assert!(matches!(validate_header(&raw, false), Err(MqError::BadFrame)));
    }

    #[test]
    fn single_bit_mutation_of_reserved_bytes_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::SINGLE, 0);
        for bit in 0..8 {
            let mut mutated = buf;
            mutated[5] ^= 1 << bit;
            let raw = parse_header(&mutated);
            assert!(validate_header(&raw, false).is_err());
        }
    }

    #[test]
    fn single_bit_mutation_of_magic_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::SINGLE, 0);
        for byte in 0..5 {
            for bit in 0..8 {
                let mut mutated = buf;
                mutated[byte] ^= 1 << bit;
                let raw = parse_header(&mutated);
                assert!(validate_header(&raw, false).is_err());
            }
        }
    }

    #[test]
    fn reserved_type_bits_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::SINGLE, 0);
        buf[7] |= 1 << 2;
        let raw = parse_header(&buf);
        assert!(validate_header(&raw, false).is_err());
    }

    #[test]
    fn start_consistency_enforced() {
        let mut buf = [0u8; HEADER_LEN];
        encode_header(&mut buf, FrameType::START, 0);
        let raw = parse_header(&buf);
        // seen_initial already true -> a second START is invalid.
        assert!(validate_header(&raw, true).is_err());
        // seen_initial false -> a CONT/END is invalid.
        encode_header(&mut buf, FrameType::CONT, 0);
        let raw = parse_header(&buf);
        assert!(validate_header(&raw, false).is_err());
    }
}
