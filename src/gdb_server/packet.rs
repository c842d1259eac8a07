//! Raw RSP packet framing primitives.
//!
//! A packet travels as `$` payload `#` checksum, where the checksum is
//! the modulo-256 sum of the payload bytes as transmitted. Bytes that
//! collide with framing characters are escaped as `}` followed by the
//! byte XOR 0x20; inbound payloads may additionally use `*` run-length
//! encoding.

use crate::error::Error;

pub const PACKET_START: u8 = b'$';
pub const PACKET_END: u8 = b'#';
pub const PACKET_ACK: u8 = b'+';
pub const PACKET_NACK: u8 = b'-';
pub const INTERRUPT_BYTE: u8 = 0x03;
const ESCAPE: u8 = b'}';
const RUN_LENGTH_START: u8 = b'*';

/// One decoded inbound packet. The interrupt byte is synthesised into
/// a packet holding the single byte 0x03.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub data: Vec<u8>,
}

impl RawPacket {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn interrupt() -> Self {
        Self {
            data: vec![INTERRUPT_BYTE],
        }
    }

    pub fn is_interrupt(&self) -> bool {
        self.data == [INTERRUPT_BYTE]
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Frame an outbound payload, escaping where required.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len());

    for &byte in payload {
        if matches!(byte, PACKET_START | PACKET_END | ESCAPE | RUN_LENGTH_START) {
            escaped.push(ESCAPE);
            escaped.push(byte ^ 0x20);
        } else {
            escaped.push(byte);
        }
    }

    let mut out = Vec::with_capacity(escaped.len() + 4);
    out.push(PACKET_START);
    out.extend_from_slice(&escaped);
    out.push(PACKET_END);
    out.extend_from_slice(format!("{:02x}", checksum(&escaped)).as_bytes());
    out
}

/// Decode an inbound payload: resolve escapes and expand run-length
/// sequences. The input is the raw bytes between `$` and `#`.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(raw.len());
    let mut index = 0;

    while index < raw.len() {
        match raw[index] {
            ESCAPE => {
                let escaped = raw.get(index + 1).ok_or_else(|| {
                    Error::InvalidArgument("packet ends in the middle of an escape".into())
                })?;
                out.push(escaped ^ 0x20);
                index += 2;
            }
            RUN_LENGTH_START => {
                let count_byte = raw.get(index + 1).ok_or_else(|| {
                    Error::InvalidArgument("packet ends in the middle of a run-length".into())
                })?;
                let repeated = *out.last().ok_or_else(|| {
                    Error::InvalidArgument("run-length with no preceding character".into())
                })?;

                let count = count_byte.wrapping_sub(29) as usize;
                out.extend(std::iter::repeat(repeated).take(count));
                index += 2;
            }
            byte => {
                out.push(byte);
                index += 1;
            }
        }
    }

    Ok(out)
}

pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

pub fn decode_hex(data: &[u8]) -> Result<Vec<u8>, Error> {
    hex::decode(data).map_err(|_| Error::InvalidArgument("malformed hex data in packet".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_modulo_256_sum() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b""), 0x00);
        assert_eq!(checksum(b"c"), 0x63);
    }

    #[test]
    fn encode_frames_payload() {
        assert_eq!(encode(b"OK"), b"$OK#9a".to_vec());
        assert_eq!(encode(b""), b"$#00".to_vec());
    }

    #[test]
    fn encode_escapes_framing_bytes() {
        let framed = encode(b"a#b");
        assert_eq!(&framed[..framed.len() - 2], b"$a}\x03b#");

        // Checksum is computed over the escaped form
        let escaped = &framed[1..framed.len() - 3];
        let sum: String = String::from_utf8(framed[framed.len() - 2..].to_vec()).unwrap();
        assert_eq!(sum, format!("{:02x}", checksum(escaped)));
    }

    #[test]
    fn decode_resolves_escapes() {
        assert_eq!(decode(b"a}\x03b").unwrap(), b"a#b".to_vec());
        assert_eq!(decode(b"}]").unwrap(), b"}".to_vec());
    }

    #[test]
    fn decode_expands_run_length() {
        // '0' repeated: count byte ' ' (0x20) means 3 repeats
        assert_eq!(decode(b"0* ").unwrap(), b"0000".to_vec());
    }

    #[test]
    fn decode_rejects_dangling_escape() {
        assert!(decode(b"abc}").is_err());
        assert!(decode(b"*!").is_err());
    }

    #[test]
    fn round_trip_preserves_framing() {
        let payloads: &[&[u8]] = &[b"", b"OK", b"m100,10", b"binary\x00\x03$#}*data"];

        for payload in payloads {
            let framed = encode(payload);
            assert_eq!(framed[0], PACKET_START);

            let end = framed.len() - 3;
            assert_eq!(framed[end], PACKET_END);

            let body = &framed[1..end];
            let sum =
                u8::from_str_radix(std::str::from_utf8(&framed[end + 1..]).unwrap(), 16).unwrap();
            assert_eq!(sum, checksum(body));
            assert_eq!(&decode(body).unwrap(), payload);
        }
    }
}
