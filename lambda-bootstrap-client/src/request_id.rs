use rand::RngCore;
use std::fmt;

const LOWER: &[u8; 16] = b"0123456789abcdef";
const UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// The request ID, which identifies the request that triggered the function
/// invocation. The control plane renders it as a canonical 8-4-4-4-12
/// lowercase UUID; completion of an invocation is reported against it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Generate a fresh version-4 UUID from the thread-local OS-seeded RNG.
    pub fn generate() -> RequestId {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // RFC 4122 section 4.4: version nibble 0100, variant bits 10.
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        RequestId(bytes)
    }

    /// Build a request ID from raw bytes, bypassing the version/variant
    /// stamping. Used by the local server to mint clock-derived IDs.
    pub const fn from_bytes(bytes: [u8; 16]) -> RequestId {
        RequestId(bytes)
    }

    /// The raw 16 bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parse the canonical lowercase rendering. Wrong length, uppercase
    /// hex, a misplaced dash, or a non-hex byte all reject.
    pub fn parse(s: &str) -> Option<RequestId> {
        let input = s.as_bytes();
        if input.len() != 36 {
            return None;
        }
        let mut bytes = [0u8; 16];
        let mut out = 0;
        let mut i = 0;
        while i < 36 {
            if matches!(i, 8 | 13 | 18 | 23) {
                if input[i] != b'-' {
                    return None;
                }
                i += 1;
                continue;
            }
            let hi = hex_value(input[i])?;
            let lo = hex_value(input[i + 1])?;
            bytes[out] = (hi << 4) | lo;
            out += 1;
            i += 2;
        }
        Some(RequestId(bytes))
    }

    /// Render the lowercase form into a caller-owned buffer. Single pass,
    /// no allocation.
    pub fn write_lower(&self, buf: &mut [u8; 36]) {
        self.render(buf, LOWER)
    }

    /// Render the uppercase form into a caller-owned buffer.
    pub fn write_upper(&self, buf: &mut [u8; 36]) {
        self.render(buf, UPPER)
    }

    fn render(&self, buf: &mut [u8; 36], table: &[u8; 16]) {
        let mut pos = 0;
        for (i, byte) in self.0.iter().enumerate() {
            buf[pos] = table[usize::from(byte >> 4)];
            buf[pos + 1] = table[usize::from(byte & 0x0f)];
            pos += 2;
            if matches!(i, 3 | 5 | 7 | 9) {
                buf[pos] = b'-';
                pos += 1;
            }
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; 36];
        self.write_lower(&mut buf);
        // the rendering is pure ASCII
        f.write_str(std::str::from_utf8(&buf).expect("ascii rendering"))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_round_trip() {
        for _ in 0..64 {
            let id = RequestId::generate();
            let rendered = id.to_string();
            assert_eq!(rendered.len(), 36);
            assert_eq!(RequestId::parse(&rendered), Some(id));
        }
    }

    #[test]
    fn generated_ids_carry_version_and_variant() {
        for _ in 0..64 {
            let id = RequestId::generate();
            assert_eq!(id.as_bytes()[6] >> 4, 0x4, "version nibble");
            assert_eq!(id.as_bytes()[8] >> 6, 0b10, "variant bits");
        }
    }

    #[test]
    fn parse_accepts_canonical_form() {
        let id = RequestId::parse("8476a536-e9f4-11e8-9739-2dfe598c3fcd").unwrap();
        assert_eq!(id.to_string(), "8476a536-e9f4-11e8-9739-2dfe598c3fcd");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(RequestId::parse("").is_none());
        assert!(RequestId::parse("8476a536-e9f4-11e8-9739-2dfe598c3fc").is_none());
        assert!(RequestId::parse("8476a536-e9f4-11e8-9739-2dfe598c3fcd0").is_none());
    }

    #[test]
    fn parse_rejects_uppercase() {
        assert!(RequestId::parse("8476A536-e9f4-11e8-9739-2dfe598c3fcd").is_none());
    }

    #[test]
    fn parse_rejects_misplaced_dash() {
        assert!(RequestId::parse("8476a536e-9f4-11e8-9739-2dfe598c3fcd").is_none());
        assert!(RequestId::parse("8476a536-e9f4-11e8-9739-2dfe598c3fc-").is_none());
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert!(RequestId::parse("8476g536-e9f4-11e8-9739-2dfe598c3fcd").is_none());
    }

    #[test]
    fn uppercase_rendering_uses_the_alternate_table() {
        let id = RequestId::parse("8476a536-e9f4-11e8-9739-2dfe598c3fcd").unwrap();
        let mut buf = [0u8; 36];
        id.write_upper(&mut buf);
        assert_eq!(&buf[..], b"8476A536-E9F4-11E8-9739-2DFE598C3FCD");
    }

    #[test]
    fn equality_is_byte_equality() {
        let a = RequestId::from_bytes([7; 16]);
        let b = RequestId::from_bytes([7; 16]);
        let c = RequestId::from_bytes([8; 16]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
