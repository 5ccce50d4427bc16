//! Name-value pair encoding.
//!
//! PARAMS, GET_VALUES and GET_VALUES_RESULT records carry their content as
//! a sequence of name-value pairs. Each pair is a name length, a value
//! length, the name bytes, then the value bytes. A length is one byte when
//! it fits in 7 bits; otherwise it is four bytes with the high bit of the
//! first byte set and the remaining 31 bits holding the length, Big Endian.

use bytes::BufMut;
use bytes::BytesMut;

use crate::error::{FcgiError, Result};

/// Largest length the 31-bit wire encoding can express.
const MAX_NV_LEN: usize = 0x7FFF_FFFF;

/// Wire size of one encoded length field.
#[inline]
fn len_field_size(len: usize) -> usize {
    if len < 128 {
        1
    } else {
        4
    }
}

/// Wire size of one encoded pair.
#[inline]
pub fn encoded_nv_len(key: &[u8], value: &[u8]) -> usize {
    len_field_size(key.len()) + len_field_size(value.len()) + key.len() + value.len()
}

/// Append one encoded name-value pair to `buf`.
///
/// # Errors
///
/// `OversizedName` when either length exceeds the 31-bit limit.
pub fn encode_nv(buf: &mut BytesMut, key: &[u8], value: &[u8]) -> Result<()> {
    put_len(buf, key.len())?;
    put_len(buf, value.len())?;
    buf.put_slice(key);
    buf.put_slice(value);
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    if len < 128 {
        buf.put_u8(len as u8);
    } else if len <= MAX_NV_LEN {
        buf.put_u32(len as u32 | 0x8000_0000);
    } else {
        return Err(FcgiError::OversizedName(len));
    }
    Ok(())
}

/// Cursor-style reader over the name-value pairs of one record's content.
///
/// Tracks the remaining declared content; every pair read shrinks it by
/// exactly the bytes consumed.
pub struct NvReader<'a> {
    buf: &'a [u8],
}

impl<'a> NvReader<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self { buf: content }
    }

    /// Declared content bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Read the next pair, or `None` when the content is exhausted.
    ///
    /// # Errors
    ///
    /// `TruncatedFrame` when a length field or the announced bytes run past
    /// the end of the content.
    pub fn next_pair(&mut self) -> Result<Option<(&'a [u8], &'a [u8])>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let key_len = self.read_len()?;
        let value_len = self.read_len()?;

        if self.buf.len() < key_len + value_len {
            return Err(FcgiError::TruncatedFrame);
        }

        let (key, rest) = self.buf.split_at(key_len);
        let (value, rest) = rest.split_at(value_len);
        self.buf = rest;

        Ok(Some((key, value)))
    }

    fn read_len(&mut self) -> Result<usize> {
        let (&first, rest) = self.buf.split_first().ok_or(FcgiError::TruncatedFrame)?;
        if first & 0x80 == 0 {
            self.buf = rest;
            return Ok(first as usize);
        }
        if rest.len() < 3 {
            return Err(FcgiError::TruncatedFrame);
        }
        let len = u32::from_be_bytes([first & 0x7F, rest[0], rest[1], rest[2]]);
        self.buf = &rest[3..];
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_pair(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_nv(&mut buf, key, value).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_short_name_and_value() {
        let encoded = encode_pair(b"HOST", b"localhost");
        let mut expected = vec![0x04, 0x09];
        expected.extend_from_slice(b"HOST");
        expected.extend_from_slice(b"localhost");
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_long_name_and_value_use_four_byte_lengths() {
        let name = vec![b'N'; 130];
        let value = vec![b'V'; 135];
        let encoded = encode_pair(&name, &value);

        assert_eq!(&encoded[0..4], &[0x80, 0x00, 0x00, 0x82]);
        assert_eq!(&encoded[4..8], &[0x80, 0x00, 0x00, 0x87]);
        assert_eq!(&encoded[8..8 + 130], &name[..]);
        assert_eq!(&encoded[8 + 130..], &value[..]);
    }

    #[test]
    fn test_one_byte_length_boundary_at_127() {
        // 127 still fits one byte; 128 needs four.
        let encoded = encode_pair(&vec![b'a'; 127], b"v");
        assert_eq!(encoded[0], 0x7F);
        assert_eq!(encoded.len(), 1 + 1 + 127 + 1);

        let encoded = encode_pair(&vec![b'a'; 128], b"v");
        assert_eq!(&encoded[0..4], &[0x80, 0x00, 0x00, 0x80]);
        assert_eq!(encoded.len(), 4 + 1 + 128 + 1);
    }

    #[test]
    fn test_empty_name_and_value() {
        assert_eq!(encode_pair(b"", b""), vec![0x00, 0x00]);
    }

    #[test]
    fn test_encoded_nv_len_matches_encoding() {
        for (k, v) in [
            (&b""[..], &b""[..]),
            (b"key", b"value"),
            (&[b'x'; 127][..], &[b'y'; 128][..]),
            (&[b'x'; 300][..], &[b'y'; 4][..]),
        ] {
            assert_eq!(encoded_nv_len(k, v), encode_pair(k, v).len());
        }
    }

    #[test]
    fn test_roundtrip_through_reader() {
        let mut buf = BytesMut::new();
        encode_nv(&mut buf, b"REQUEST_METHOD", b"POST").unwrap();
        encode_nv(&mut buf, &[b'k'; 200], &[b'v'; 5000]).unwrap();
        encode_nv(&mut buf, b"EMPTY", b"").unwrap();

        let mut reader = NvReader::new(&buf);
        let (k, v) = reader.next_pair().unwrap().unwrap();
        assert_eq!((k, v), (&b"REQUEST_METHOD"[..], &b"POST"[..]));

        let (k, v) = reader.next_pair().unwrap().unwrap();
        assert_eq!(k.len(), 200);
        assert_eq!(v.len(), 5000);

        let (k, v) = reader.next_pair().unwrap().unwrap();
        assert_eq!((k, v), (&b"EMPTY"[..], &b""[..]));

        assert!(reader.next_pair().unwrap().is_none());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_remaining_shrinks_by_consumed_bytes() {
        let mut buf = BytesMut::new();
        encode_nv(&mut buf, b"AB", b"CDE").unwrap();
        encode_nv(&mut buf, b"F", b"").unwrap();

        let mut reader = NvReader::new(&buf);
        assert_eq!(reader.remaining(), 7 + 3);
        reader.next_pair().unwrap();
        assert_eq!(reader.remaining(), 3);
        reader.next_pair().unwrap();
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_length_field() {
        // High bit set announces a 4-byte length, but only 2 bytes follow.
        let mut reader = NvReader::new(&[0x80, 0x00]);
        assert!(matches!(
            reader.next_pair(),
            Err(FcgiError::TruncatedFrame)
        ));
    }

    #[test]
    fn test_truncated_value_bytes() {
        // Declares a 4-byte name and 4-byte value but supplies only the name.
        let mut reader = NvReader::new(&[0x04, 0x04, b'n', b'a', b'm', b'e']);
        assert!(matches!(
            reader.next_pair(),
            Err(FcgiError::TruncatedFrame)
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let huge = MAX_NV_LEN + 1;
        let mut buf = BytesMut::new();
        let err = put_len(&mut buf, huge).unwrap_err();
        assert!(matches!(err, FcgiError::OversizedName(n) if n == huge));
    }
}
