use bytes::BufMut;

use super::{
    decode::{decode_rlp_item, RLPDecode},
    encode::{encode_length, RLPEncode},
    error::RLPDecodeError,
};

/// Helper for decoding a struct encoded as an RLP list. Fields are decoded in
/// the order they are passed to [`Decoder::decode_field`].
#[derive(Debug)]
#[must_use = "`Decoder` must be consumed with `finish` to perform decoding checks"]
pub struct Decoder<'a> {
    payload: &'a [u8],
    remaining: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RLPDecodeError> {
        match decode_rlp_item(buf)? {
            (true, payload, remaining) => Ok(Self { payload, remaining }),
            (false, _, _) => Err(RLPDecodeError::UnexpectedString),
        }
    }

    pub fn decode_field<T: RLPDecode>(self, name: &str) -> Result<(T, Self), RLPDecodeError> {
        let (field, rest) = <T as RLPDecode>::decode_unfinished(self.payload)
            .map_err(|err| field_decode_error::<T>(name, err))?;
        Ok((
            field,
            Self {
                payload: rest,
                ..self
            },
        ))
    }

    /// Finishes decoding and returns the bytes after the list.
    /// Fails if the list payload was not fully consumed.
    pub const fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if self.payload.is_empty() {
            Ok(self.remaining)
        } else {
            Err(RLPDecodeError::MalformedData)
        }
    }
}

fn field_decode_error<T>(field_name: &str, err: RLPDecodeError) -> RLPDecodeError {
    let typ = std::any::type_name::<T>();
    RLPDecodeError::Custom(format!(
        "Error decoding field '{field_name}' of type {typ}: {err}"
    ))
}

/// Helper for encoding a struct as an RLP list. Fields are encoded in the
/// order they are passed to [`Encoder::encode_field`].
#[must_use = "`Encoder` must be consumed with `finish` to perform the encoding"]
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    temp_buf: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            temp_buf: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode>(mut self, value: &T) -> Self {
        <T as RLPEncode>::encode(value, &mut self.temp_buf);
        self
    }

    /// Encodes a field as a byte string, bypassing the `Vec<T>` impl.
    pub fn encode_bytes(mut self, value: &[u8]) -> Self {
        <[u8] as RLPEncode>::encode(value, &mut self.temp_buf);
        self
    }

    /// Finishes encoding the list and writes the result to the buffer.
    pub fn finish(self) {
        encode_length(self.temp_buf.len(), self.buf);
        self.buf.put_slice(&self.temp_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Simple {
        a: u8,
        b: u64,
    }

    #[test]
    fn encode_decode_struct_as_list() {
        let mut buf = vec![];
        Encoder::new(&mut buf)
            .encode_field(&61u8)
            .encode_field(&75u64)
            .finish();
        assert_eq!(buf, vec![0xc2, 61, 75]);

        let decoder = Decoder::new(&buf).unwrap();
        let (a, decoder) = decoder.decode_field::<u8>("a").unwrap();
        let (b, decoder) = decoder.decode_field::<u64>("b").unwrap();
        decoder.finish().unwrap();
        assert_eq!(Simple { a, b }, Simple { a: 61, b: 75 });
    }

    #[test]
    fn finish_rejects_trailing_payload() {
        let mut buf = vec![];
        Encoder::new(&mut buf)
            .encode_field(&1u8)
            .encode_field(&2u8)
            .finish();
        let decoder = Decoder::new(&buf).unwrap();
        let (_, decoder) = decoder.decode_field::<u8>("a").unwrap();
        assert!(decoder.finish().is_err());
    }
}
