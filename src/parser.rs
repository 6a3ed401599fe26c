//! Deserialize responses from the wire format.
//!
//! Every length or count prefix is checked against the remaining input
//! before anything is consumed, so a truncated or lying response fails
//! to parse instead of reading past the end of the buffer.
use bytes::Bytes;
use nom::{
    bytes::complete::take,
    combinator::map,
    error::{ErrorKind, ParseError},
    multi::many_m_n,
    number::complete::{be_i16, be_i32},
    Err::Error,
    IResult,
};
use nombytes::NomBytes;
use num_traits::FromPrimitive;

use crate::error::KafkaCode;

pub fn parse_kafka_code(s: NomBytes) -> IResult<NomBytes, KafkaCode> {
    map(be_i16, |n| {
        KafkaCode::from_i16(n).unwrap_or(KafkaCode::Other(n))
    })(s)
}

pub fn parse_string(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_i16(s)?;
    if length < 0 || length as usize > s.to_bytes().len() {
        return Err(Error(nom::error::Error::from_error_kind(s, ErrorKind::Eof)));
    }
    let (s, string) = take(length as usize)(s)?;
    Ok((s, string.into_bytes()))
}

/// Parse an `i32` counted array of `f`.
///
/// A count of `-1` is the null array and parses as empty. Any other
/// negative count, or a count larger than the bytes left, is rejected.
pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (i, length) = be_i32(input)?;
        if length == -1 {
            return Ok((i, vec![]));
        }
        if length < 0 || length as usize > i.to_bytes().len() {
            return Err(Error(E::from_error_kind(i, ErrorKind::TooLarge)));
        }
        many_m_n(length as usize, length as usize, f)(i)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_string() {
        let buf = NomBytes::from(b"\x00\x04\x72\x75\x73\x74" as &[u8]);

        assert_eq!(
            parse_string(buf).unwrap().1,
            NomBytes::from(b"\x72\x75\x73\x74" as &[u8]).to_bytes()
        );
    }

    #[test]
    fn string_longer_than_input() {
        let buf = NomBytes::from(b"\x00\x09local" as &[u8]);
        assert!(parse_string(buf).is_err());
    }

    #[test]
    fn test_parse_array() {
        let buf = NomBytes::from(
            [
                0, 0, 0, 2, // array size
                0, 4, 114, 117, 115, 116, // string
                0, 4, 114, 117, 115, 116, // string
                0, 0, 0, // leftover input
            ]
            .as_slice(),
        );

        assert_eq!(
            parse_array(parse_string)(buf).unwrap().1,
            vec![Bytes::from("rust"), Bytes::from("rust")]
        );
    }

    #[test]
    fn null_array_is_empty() {
        let buf = NomBytes::from([255, 255, 255, 255].as_slice());
        let (_, parsed) = parse_array::<_, nom::error::Error<NomBytes>, _>(be_i32)(buf).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn array_count_past_end() {
        // claims a billion elements with four bytes left
        let buf = NomBytes::from([0x40, 0, 0, 0, 0, 0, 0, 1].as_slice());
        assert!(parse_array::<_, nom::error::Error<NomBytes>, _>(be_i32)(buf).is_err());
    }

    #[test]
    fn unnamed_kafka_code_is_kept() {
        let buf = NomBytes::from([0x03, 0xe7].as_slice());
        assert_eq!(parse_kafka_code(buf).unwrap().1, KafkaCode::Other(999));

        let buf = NomBytes::from([0xff, 0xff].as_slice());
        assert_eq!(parse_kafka_code(buf).unwrap().1, KafkaCode::Unknown);
    }
}
