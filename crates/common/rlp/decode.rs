use bytes::Bytes;
use ethereum_types::{H256, U256};

use super::{constants::RLP_NULL, error::RLPDecodeError};

/// Trait for decoding RLP encoded slices of data.
/// Implementors provide [`decode_unfinished`](RLPDecode::decode_unfinished), which
/// returns the decoded value along with the bytes remaining after it.
pub trait RLPDecode: Sized {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError>;

    fn decode(rlp: &[u8]) -> Result<Self, RLPDecodeError> {
        let (decoded, remaining) = Self::decode_unfinished(rlp)?;
        if !remaining.is_empty() {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok(decoded)
    }
}

/// Splits an RLP item off the front of `buf`, returning whether it is a list,
/// its payload, and the bytes after the item.
pub fn decode_rlp_item(buf: &[u8]) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let first = *buf.first().ok_or(RLPDecodeError::InvalidLength)?;
    match first {
        0..=0x7f => Ok((false, &buf[..1], &buf[1..])),
        0x80..=0xb7 => {
            let len = (first - RLP_NULL) as usize;
            split_payload(buf, 1, len, false)
        }
        0xb8..=0xbf => {
            let len_len = (first - 0xb7) as usize;
            let len = decode_payload_length(buf, len_len)?;
            split_payload(buf, 1 + len_len, len, false)
        }
        0xc0..=0xf7 => {
            let len = (first - 0xc0) as usize;
            split_payload(buf, 1, len, true)
        }
        0xf8..=0xff => {
            let len_len = (first - 0xf7) as usize;
            let len = decode_payload_length(buf, len_len)?;
            split_payload(buf, 1 + len_len, len, true)
        }
    }
}

/// Returns the next RLP item including its prefix, plus the bytes after it.
pub fn get_item_with_prefix(buf: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    let (_, _, rest) = decode_rlp_item(buf)?;
    let item_len = buf.len() - rest.len();
    Ok((&buf[..item_len], rest))
}

fn decode_payload_length(buf: &[u8], len_len: usize) -> Result<usize, RLPDecodeError> {
    let len_bytes = buf.get(1..1 + len_len).ok_or(RLPDecodeError::InvalidLength)?;
    if len_bytes.first() == Some(&0) {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut len = 0usize;
    for b in len_bytes {
        len = len.checked_mul(256).ok_or(RLPDecodeError::InvalidLength)? + *b as usize;
    }
    if len < 56 {
        return Err(RLPDecodeError::MalformedData);
    }
    Ok(len)
}

fn split_payload(
    buf: &[u8],
    offset: usize,
    len: usize,
    is_list: bool,
) -> Result<(bool, &[u8], &[u8]), RLPDecodeError> {
    let payload = buf
        .get(offset..offset + len)
        .ok_or(RLPDecodeError::InvalidLength)?;
    Ok((is_list, payload, &buf[offset + len..]))
}

/// Decodes a byte-string item, rejecting lists.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], &[u8]), RLPDecodeError> {
    match decode_rlp_item(buf)? {
        (false, payload, rest) => Ok((payload, rest)),
        (true, _, _) => Err(RLPDecodeError::UnexpectedList),
    }
}

fn static_left_pad<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RLPDecodeError> {
    if bytes.len() > N {
        return Err(RLPDecodeError::InvalidLength);
    }
    if bytes.first() == Some(&0) {
        return Err(RLPDecodeError::MalformedData);
    }
    let mut padded = [0u8; N];
    padded[N - bytes.len()..].copy_from_slice(bytes);
    Ok(padded)
}

impl RLPDecode for bool {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let first = *buf.first().ok_or(RLPDecodeError::InvalidLength)?;
        let value = match first {
            RLP_NULL => false,
            0x01 => true,
            b => return Err(RLPDecodeError::MalformedBoolean(b)),
        };
        Ok((value, &buf[1..]))
    }
}

impl RLPDecode for u8 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        let padded: [u8; 1] = static_left_pad(bytes)?;
        Ok((padded[0], rest))
    }
}

impl RLPDecode for u32 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((u32::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for u64 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((u64::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for usize {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((usize::from_be_bytes(static_left_pad(bytes)?), rest))
    }
}

impl RLPDecode for U256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        if bytes.len() > 32 || bytes.first() == Some(&0) {
            return Err(RLPDecodeError::MalformedData);
        }
        Ok((U256::from_big_endian(bytes), rest))
    }
}

impl RLPDecode for H256 {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        if bytes.len() != 32 {
            return Err(RLPDecodeError::InvalidLength);
        }
        Ok((H256::from_slice(bytes), rest))
    }
}

impl RLPDecode for Vec<u8> {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((bytes.to_vec(), rest))
    }
}

impl RLPDecode for Bytes {
    fn decode_unfinished(rlp: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
        let (bytes, rest) = decode_bytes(rlp)?;
        Ok((Bytes::copy_from_slice(bytes), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::RLPEncode;

    #[test]
    fn decode_integers() {
        assert_eq!(u64::decode(&[0x80]).unwrap(), 0);
        assert_eq!(u64::decode(&[0x7f]).unwrap(), 0x7f);
        assert_eq!(u64::decode(&[0x82, 0x04, 0x00]).unwrap(), 0x0400);
    }

    #[test]
    fn decode_rejects_leading_zeros() {
        assert!(u64::decode(&[0x82, 0x00, 0x01]).is_err());
    }

    #[test]
    fn integer_round_trip() {
        for value in [0u64, 1, 127, 128, 255, 1024, u64::MAX] {
            assert_eq!(u64::decode(&value.encode_to_vec()).unwrap(), value);
        }
    }

    #[test]
    fn hash_round_trip() {
        let hash = H256::repeat_byte(0x5a);
        assert_eq!(H256::decode(&hash.encode_to_vec()).unwrap(), hash);
    }
}
