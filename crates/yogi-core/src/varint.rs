//! The message size-field codec used to frame every message on the wire.
//!
//! A base-128 varint, most-significant group first, spanning 1 to 5
//! bytes and covering sizes in `[0, 2^35)`. Written from scratch since
//! no off-the-shelf varint crate implements this exact group order
//! (most varint crates, including `prost`'s, are
//! least-significant-group-first).

use yogi_transport::error::{YogiError, YogiErrorCode};

/// Largest size field this codec can represent: `2^35 - 1`, i.e. five
/// 7-bit groups.
pub const MAX_ENCODABLE_SIZE: u64 = (1u64 << 35) - 1;

/// Encodes `size` as a most-significant-group-first base-128 varint.
/// Returns `Err` if `size` exceeds [`MAX_ENCODABLE_SIZE`].
pub fn encode(size: u64) -> Result<Vec<u8>, YogiError> {
    if size > MAX_ENCODABLE_SIZE {
        return Err(YogiError::new(
            YogiErrorCode::PayloadTooLarge,
            format!("message size {size} exceeds the 5-byte size field limit"),
        ));
    }

    // Find how many 7-bit groups are needed, most significant first.
    let mut groups = [0u8; 5];
    let mut n = 0usize;
    let mut remaining = size;
    loop {
        groups[n] = (remaining & 0x7f) as u8;
        remaining >>= 7;
        n += 1;
        if remaining == 0 {
            break;
        }
    }
    // `groups[0..n]` is least-significant-group-first; reverse it and set
    // the continuation bit on every group except the last one emitted.
    let mut out = Vec::with_capacity(n);
    for i in (0..n).rev() {
        let mut byte = groups[i];
        if i != 0 {
            byte |= 0x80;
        }
        out.push(byte);
    }
    Ok(out)
}

/// Decodes a most-significant-group-first base-128 varint from the front
/// of `bytes`. Returns the decoded size and the number of bytes consumed,
/// or `Ok(None)` if `bytes` doesn't yet contain a complete size field
/// (the caller should wait for more bytes and retry). Returns `Err` if
/// five groups are consumed without the continuation bit clearing (the
/// field would encode a value larger than [`MAX_ENCODABLE_SIZE`]).
pub fn decode(bytes: &[u8]) -> Result<Option<(u64, usize)>, YogiError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == 5 {
            return Err(YogiError::new(
                YogiErrorCode::DeserializeMsgFailed,
                "size field exceeds the maximum of 5 groups",
            ));
        }
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 5 {
        return Err(YogiError::new(
            YogiErrorCode::DeserializeMsgFailed,
            "size field exceeds the maximum of 5 groups",
        ));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_zero_as_single_zero_byte() {
        assert_eq!(encode(0).unwrap(), vec![0x00]);
    }

    #[test]
    fn encodes_small_values_in_one_byte() {
        assert_eq!(encode(127).unwrap(), vec![0x7f]);
    }

    #[test]
    fn encodes_boundary_values_correctly() {
        // 128 needs two groups: high group = 1, low group = 0.
        assert_eq!(encode(128).unwrap(), vec![0x81, 0x00]);
        // 16383 = 2^14 - 1 fits in two groups.
        assert_eq!(encode(16383).unwrap(), vec![0xff, 0x7f]);
        // 16384 = 2^14 needs three groups.
        assert_eq!(encode(16384).unwrap(), vec![0x81, 0x80, 0x00]);
    }

    #[test]
    fn rejects_values_above_max() {
        assert!(encode(MAX_ENCODABLE_SIZE + 1).is_err());
    }

    #[test]
    fn decode_accepts_max_encodable_size() {
        let bytes = encode(MAX_ENCODABLE_SIZE).unwrap();
        assert_eq!(bytes.len(), 5);
        let (value, consumed) = decode(&bytes).unwrap().unwrap();
        assert_eq!(value, MAX_ENCODABLE_SIZE);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn decode_returns_none_on_incomplete_field() {
        let bytes = encode(16384).unwrap();
        assert!(decode(&bytes[..1]).unwrap().is_none());
        assert!(decode(&bytes[..2]).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_six_continuation_bytes() {
        let bytes = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0x00];
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn decode_ignores_trailing_bytes_past_the_field() {
        let mut bytes = encode(42).unwrap();
        bytes.extend_from_slice(b"payload");
        let (value, consumed) = decode(&bytes).unwrap().unwrap();
        assert_eq!(value, 42);
        assert_eq!(consumed, 1);
    }

    proptest::proptest! {
        #[test]
        fn roundtrip_any_encodable_size(size in 0u64..=MAX_ENCODABLE_SIZE) {
            let bytes = encode(size).unwrap();
            proptest::prop_assert!(bytes.len() <= 5);
            let (decoded, consumed) = decode(&bytes).unwrap().unwrap();
            proptest::prop_assert_eq!(decoded, size);
            proptest::prop_assert_eq!(consumed, bytes.len());
        }
    }
}
