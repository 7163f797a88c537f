use nom::sequence::terminated;
use nom::{IResult, Parser, bytes, number};

use crate::parser::gc_record::{FieldType, FieldValue};

// Streaming parsers for the file header, where the input window may be
// shorter than the header itself (truncated file).

pub fn parse_c_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(
        bytes::streaming::take_until("\0"),
        bytes::streaming::tag("\0"),
    )
    .parse(i)
}

pub fn parse_u32(i: &[u8]) -> IResult<&[u8], u32> {
    number::streaming::be_u32(i)
}

pub fn parse_u64(i: &[u8]) -> IResult<&[u8], u64> {
    number::streaming::be_u64(i)
}

// Complete parsers for record bodies, always handed a fully bounded slice.

pub fn parse_id(id_size: u32) -> impl Fn(&[u8]) -> IResult<&[u8], u64> {
    move |i| {
        if id_size == 4 {
            number::complete::be_u32(i).map(|(rest, v)| (rest, u64::from(v)))
        } else {
            number::complete::be_u64(i)
        }
    }
}

pub fn parse_field_value(
    field_type: FieldType,
    id_size: u32,
) -> impl Fn(&[u8]) -> IResult<&[u8], FieldValue> {
    use nom::combinator::map;
    move |i| match field_type {
        FieldType::Object => map(parse_id(id_size), FieldValue::Object).parse(i),
        FieldType::Bool => map(number::complete::be_u8, |b| FieldValue::Bool(b != 0)).parse(i),
        FieldType::Char => map(number::complete::be_u16, FieldValue::Char).parse(i),
        FieldType::Float => map(number::complete::be_f32, FieldValue::Float).parse(i),
        FieldType::Double => map(number::complete::be_f64, FieldValue::Double).parse(i),
        FieldType::Byte => map(number::complete::be_i8, FieldValue::Byte).parse(i),
        FieldType::Short => map(number::complete::be_i16, FieldValue::Short).parse(i),
        FieldType::Int => map(number::complete::be_i32, FieldValue::Int).parse(i),
        FieldType::Long => map(number::complete::be_i64, FieldValue::Long).parse(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_width_switches_on_header_declaration() {
        let bytes = [0, 0, 0, 0, 0, 0, 0, 9];
        let (_, narrow) = parse_id(4)(&bytes).unwrap();
        assert_eq!(narrow, 0);
        let (_, wide) = parse_id(8)(&bytes).unwrap();
        assert_eq!(wide, 9);
    }

    #[test]
    fn field_values_decode_big_endian() {
        let (_, v) = parse_field_value(FieldType::Int, 8)(&[0, 0, 1, 0]).unwrap();
        assert_eq!(v, FieldValue::Int(256));
        let (_, v) = parse_field_value(FieldType::Char, 8)(&[0x00, 0x41]).unwrap();
        assert_eq!(v, FieldValue::Char(65));
        let (_, v) = parse_field_value(FieldType::Object, 4)(&[0, 0, 0, 5]).unwrap();
        assert_eq!(v, FieldValue::Object(5));
    }
}
