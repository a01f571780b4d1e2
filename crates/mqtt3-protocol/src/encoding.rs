//! Primitive encodings shared by every control packet: the base-128 remaining
//! length and length-prefixed UTF-8 strings and binary fields.

use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Largest value a four byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Largest length-prefixed field.
pub const MAX_STRING_LENGTH: usize = 65_535;

/// Encodes `value` as an MQTT variable byte integer.
///
/// # Errors
/// Returns `MalformedPacket` if the value exceeds [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(MqttError::MalformedPacket(format!(
            "Remaining length {value} exceeds maximum {MAX_REMAINING_LENGTH}"
        )));
    }

    let mut remaining = value;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

#[must_use]
pub fn remaining_length_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Reads a remaining length from the start of `data` without consuming it.
///
/// Returns `Ok(None)` while the continuation chain is still incomplete and
/// `Ok(Some((value, bytes_used)))` once it terminates.
///
/// # Errors
/// Returns `MalformedPacket` if the chain runs past four bytes.
pub fn peek_remaining_length(data: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value: u32 = 0;
    let mut multiplier: u32 = 1;

    for (index, byte) in data.iter().enumerate() {
        if index >= 4 {
            return Err(MqttError::MalformedPacket(
                "Remaining length exceeds four bytes".to_string(),
            ));
        }
        value += u32::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if data.len() >= 4 {
        return Err(MqttError::MalformedPacket(
            "Remaining length exceeds four bytes".to_string(),
        ));
    }
    Ok(None)
}

/// # Errors
/// Returns an error if the string is longer than 65535 bytes.
pub fn encode_string<B: BufMut>(buf: &mut B, value: &str) -> Result<()> {
    encode_binary(buf, value.as_bytes())
}

/// # Errors
/// Returns `MalformedPacket` on truncation, invalid UTF-8 or an embedded NUL.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = decode_binary(buf)?;
    let value = String::from_utf8(bytes)
        .map_err(|_| MqttError::MalformedPacket("String is not valid UTF-8".to_string()))?;
    if value.contains('\0') {
        return Err(MqttError::MalformedPacket(
            "String contains U+0000".to_string(),
        ));
    }
    Ok(value)
}

/// # Errors
/// Returns an error if the field is longer than 65535 bytes.
pub fn encode_binary<B: BufMut>(buf: &mut B, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| MqttError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

/// # Errors
/// Returns `MalformedPacket` if the declared length runs past the buffer.
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Missing length prefix".to_string(),
        ));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Field declares {len} bytes but only {} remain",
            buf.remaining()
        )));
    }
    let mut value = vec![0u8; len];
    buf.copy_to_slice(&mut value);
    Ok(value)
}

#[must_use]
pub fn string_len(value: &str) -> usize {
    2 + value.len()
}

/// # Errors
/// Returns `MalformedPacket` if fewer than two bytes remain.
pub fn decode_u16<B: Buf>(buf: &mut B, what: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(format!("Missing {what}")));
    }
    Ok(buf.get_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_remaining_length_boundaries() {
        let cases: [(u32, &[u8]); 8] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (16_384, &[0x80, 0x80, 0x01]),
            (2_097_151, &[0xFF, 0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];

        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            encode_remaining_length(&mut buf, value).unwrap();
            assert_eq!(&buf[..], expected, "encoding {value}");
            assert_eq!(remaining_length_len(value), expected.len());
            assert_eq!(
                peek_remaining_length(expected).unwrap(),
                Some((value, expected.len()))
            );
        }
    }

    #[test]
    fn test_remaining_length_too_large() {
        let mut buf = BytesMut::new();
        assert!(encode_remaining_length(&mut buf, MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn test_remaining_length_incomplete() {
        assert_eq!(peek_remaining_length(&[]).unwrap(), None);
        assert_eq!(peek_remaining_length(&[0x80]).unwrap(), None);
        assert_eq!(peek_remaining_length(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_remaining_length_five_bytes_rejected() {
        assert!(peek_remaining_length(&[0x80, 0x80, 0x80, 0x80]).is_err());
        assert!(peek_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "a/b/c").unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x05]);
        let decoded = decode_string(&mut buf).unwrap();
        assert_eq!(decoded, "a/b/c");
    }

    #[test]
    fn test_string_rejects_nul_and_invalid_utf8() {
        let mut buf = BytesMut::from(&[0x00, 0x02, b'a', 0x00][..]);
        assert!(decode_string(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0x00, 0x02, 0xC3, 0x28][..]);
        assert!(decode_string(&mut buf).is_err());
    }

    #[test]
    fn test_string_truncated() {
        let mut buf = BytesMut::from(&[0x00, 0x05, b'a', b'b'][..]);
        assert!(decode_string(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn prop_remaining_length_peek_matches_encode(value in 0u32..=MAX_REMAINING_LENGTH) {
            let mut buf = BytesMut::new();
            encode_remaining_length(&mut buf, value).unwrap();
            let (decoded, used) = peek_remaining_length(&buf).unwrap().unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(used, buf.len());
            for cut in 0..buf.len() {
                prop_assert_eq!(peek_remaining_length(&buf[..cut]).unwrap(), None);
            }
        }
    }
}
