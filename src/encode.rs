//! Serialize requests into the wire format.
//!
//! Integers are big-endian and fixed width, strings carry an `i16`
//! length prefix, byte blobs and arrays an `i32` one.
use bytes::{BufMut, Bytes};

use crate::error::{Error, Result};

// Convert a usize length into the signed width the protocol asks for,
// bailing out with `EncodingError` when it does not fit.
macro_rules! try_usize_to_int {
    ($value:expr, $ttype:ident) => {{
        let x: usize = $value;
        match $ttype::try_from(x) {
            Ok(v) => v,
            Err(_) => return Err(Error::EncodingError),
        }
    }};
}

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for i8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self);
        Ok(())
    }
}

impl ToByte for i16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let l = try_usize_to_int!(self.len(), i16);
        buffer.put_i16(l);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        let l = try_usize_to_int!(self.len(), i32);
        buffer.put_i32(l);
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs[..].encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

/// Renders a slice of `&str` or `String` as a protocol array of strings.
pub struct AsStrings<'a, T>(pub &'a [T]);

impl<'a, T: AsRef<str> + 'a> ToByte for AsStrings<'a, T> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_as_array(buffer, self.0, |buffer, x| x.as_ref().encode(buffer))
    }
}

/// Writes the `i32` element count of `xs`, then each element via `f`.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    let l = try_usize_to_int!(xs.len(), i32);
    buffer.put_i32(l);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_too_long() {
        let s = "a".repeat(i16::MAX as usize + 1);
        let mut buf: Vec<u8> = Vec::new();
        assert_eq!(s.encode(&mut buf), Err(Error::EncodingError));
        assert!(buf.is_empty());
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf: Vec<u8> = vec![];
        5i8.encode(&mut buf).unwrap();
        5i16.encode(&mut buf).unwrap();
        5i32.encode(&mut buf).unwrap();
        5i64.encode(&mut buf).unwrap();
        assert_eq!(buf, [5, 0, 5, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn string_has_short_prefix() {
        let mut buf: Vec<u8> = vec![];
        "test".encode(&mut buf).unwrap();
        assert_eq!(buf, [0, 4, 116, 101, 115, 116]);
    }

    #[test]
    fn nullable_bytes() {
        let mut buf: Vec<u8> = vec![];
        Some(Bytes::from_static(&[1, 2, 3])).encode(&mut buf).unwrap();
        None::<Bytes>.encode(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 3, 1, 2, 3, 255, 255, 255, 255]);
    }

    #[test]
    fn array_of_strings() {
        let expected = [0, 0, 0, 2, 0, 3, b'a', b'b', b'c', 0, 4, b'd', b'e', b'f', b'g'];

        let mut buf: Vec<u8> = Vec::new();
        AsStrings(&["abc", "defg"][..]).encode(&mut buf).unwrap();
        assert_eq!(buf, expected);

        let owned = vec!["abc".to_owned(), "defg".to_owned()];
        let mut buf: Vec<u8> = Vec::new();
        AsStrings(&owned[..]).encode(&mut buf).unwrap();
        assert_eq!(buf, expected);
    }

    #[test]
    fn array_of_ints() {
        let mut buf: Vec<u8> = Vec::new();
        [7i32, 9][..].encode(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 2, 0, 0, 0, 7, 0, 0, 0, 9]);
    }
}
