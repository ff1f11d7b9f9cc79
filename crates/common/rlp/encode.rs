use bytes::{BufMut, Bytes};
use ethereum_types::{H256, U256};

use super::constants::RLP_NULL;

/// Trait for encoding a value in RLP format.
/// See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/> for
/// the encoding rules.
pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Writes the length prefix of an RLP list payload.
pub fn encode_length(payload_len: usize, buf: &mut dyn BufMut) {
    if payload_len < 56 {
        buf.put_u8(0xc0 + payload_len as u8);
    } else {
        let be_len: Vec<u8> = payload_len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        buf.put_u8(0xf7 + be_len.len() as u8);
        buf.put_slice(&be_len);
    }
}

fn encode_unsigned_be(value_be: &[u8], buf: &mut dyn BufMut) {
    let mut i = 0;
    while i < value_be.len() && value_be[i] == 0 {
        i += 1;
    }
    // zero encodes as the empty string
    if i == value_be.len() {
        buf.put_u8(RLP_NULL);
        return;
    }
    let first = value_be[i];
    if i == value_be.len() - 1 && first <= 0x7f {
        buf.put_u8(first);
        return;
    }
    let len = value_be.len() - i;
    buf.put_u8(RLP_NULL + len as u8);
    buf.put_slice(&value_be[i..]);
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        if *self {
            buf.put_u8(0x01);
        } else {
            buf.put_u8(RLP_NULL);
        }
    }
}

impl RLPEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for u32 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for usize {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_be_bytes(), buf);
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_unsigned_be(&self.to_big_endian(), buf);
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_bytes().encode(buf)
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        if self.len() == 1 && self[0] <= 0x7f {
            buf.put_u8(self[0]);
        } else if self.len() < 56 {
            buf.put_u8(RLP_NULL + self.len() as u8);
            buf.put_slice(self);
        } else {
            let be_len: Vec<u8> = self
                .len()
                .to_be_bytes()
                .into_iter()
                .skip_while(|b| *b == 0)
                .collect();
            buf.put_u8(0xb7 + be_len.len() as u8);
            buf.put_slice(&be_len);
            buf.put_slice(self);
        }
    }
}

impl RLPEncode for Vec<u8> {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_slice().encode(buf)
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        self.as_ref().encode(buf)
    }
}

impl<T: RLPEncode> RLPEncode for &T {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self).encode(buf)
    }
}
