//! Encode/decode between [`Value`] trees and the binary wire form.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use weft_model::value::{Port, PortProtocol, Subnet, Timespan, Timestamp};
use weft_model::{Value, ValueTag};

use crate::error::CodecError;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

// -- varbyte ------------------------------------------------------------------

/// Writes an unsigned integer in base-128 groups, least significant first,
/// MSB set on every byte but the last.
pub fn write_varbyte(out: &mut Vec<u8>, mut x: u64) {
    loop {
        let low = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

/// Reads a varbyte integer, consuming from `input`.
pub fn read_varbyte(input: &mut &[u8]) -> Result<u64, CodecError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let &byte = input.first().ok_or(CodecError::Truncated)?;
        *input = &input[1..];
        if shift == 63 && byte > 1 {
            return Err(CodecError::BadVarbyte);
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::BadVarbyte);
        }
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn read_u8(input: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(take(input, 1)?[0])
}

fn read_u16_le(input: &mut &[u8]) -> Result<u16, CodecError> {
    let bytes = take(input, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u64_le(input: &mut &[u8]) -> Result<u64, CodecError> {
    let bytes = take(input, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().expect("8 bytes")))
}

fn read_i64_le(input: &mut &[u8]) -> Result<i64, CodecError> {
    Ok(read_u64_le(input)? as i64)
}

/// Writes a varbyte length prefix followed by the raw bytes.
pub fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varbyte(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Reads a varbyte-length-prefixed byte span.
pub fn read_bytes<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = read_varbyte(input)?;
    if len > input.len() as u64 {
        return Err(CodecError::Truncated);
    }
    take(input, len as usize)
}

// -- scalar payloads ----------------------------------------------------------

pub(crate) fn write_address(out: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            out.push(FAMILY_V4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(FAMILY_V6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

pub(crate) fn read_address(input: &mut &[u8]) -> Result<IpAddr, CodecError> {
    match read_u8(input)? {
        FAMILY_V4 => {
            let bytes = take(input, 4)?;
            let octets: [u8; 4] = bytes.try_into().expect("4 bytes");
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        FAMILY_V6 => {
            let bytes = take(input, 16)?;
            let octets: [u8; 16] = bytes.try_into().expect("16 bytes");
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(CodecError::BadFamily(other)),
    }
}

pub(crate) fn read_subnet(input: &mut &[u8]) -> Result<Subnet, CodecError> {
    let address = read_address(input)?;
    let length = read_u8(input)?;
    Subnet::new(address, length).ok_or(CodecError::BadPrefix(length))
}

pub(crate) fn read_port(input: &mut &[u8]) -> Result<Port, CodecError> {
    let number = read_u16_le(input)?;
    let raw = read_u8(input)?;
    let protocol = PortProtocol::from_u8(raw).ok_or(CodecError::BadProtocol(raw))?;
    Ok(Port { number, protocol })
}

// -- encoding -----------------------------------------------------------------

/// Appends the wire form of `value` to `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    out.push(value.tag() as u8);
    match value {
        Value::None => {}
        Value::Boolean(x) => out.push(u8::from(*x)),
        Value::Count(x) => out.extend_from_slice(&x.to_le_bytes()),
        Value::Integer(x) => out.extend_from_slice(&x.to_le_bytes()),
        Value::Real(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
        Value::String(x) => write_bytes(out, x.as_bytes()),
        Value::Address(x) => write_address(out, x),
        Value::Subnet(x) => {
            write_address(out, &x.address);
            out.push(x.length);
        }
        Value::Port(x) => {
            out.extend_from_slice(&x.number.to_le_bytes());
            out.push(x.protocol as u8);
        }
        Value::Timestamp(x) => out.extend_from_slice(&x.0.to_le_bytes()),
        Value::Timespan(x) => out.extend_from_slice(&x.0.to_le_bytes()),
        Value::EnumValue(x) => write_bytes(out, x.as_bytes()),
        Value::Set(xs) => {
            write_varbyte(out, xs.len() as u64);
            for x in xs {
                encode(x, out);
            }
        }
        Value::Table(xs) => {
            write_varbyte(out, xs.len() as u64);
            for (k, v) in xs {
                encode(k, out);
                encode(v, out);
            }
        }
        Value::List(xs) => {
            write_varbyte(out, xs.len() as u64);
            for x in xs {
                encode(x, out);
            }
        }
    }
}

/// Convenience wrapper around [`encode`].
pub fn encode_to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode(value, &mut out);
    out
}

// -- decoding -----------------------------------------------------------------

/// Decodes exactly one value from `bytes`, rejecting trailing input.
///
/// The full decode checks canonical container ordering; the view layer skips
/// that check on the hot path but always detects truncation.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut input = bytes;
    let value = decode_one(&mut input)?;
    if !input.is_empty() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(value)
}

pub(crate) fn decode_one(input: &mut &[u8]) -> Result<Value, CodecError> {
    let raw = read_u8(input)?;
    let tag = ValueTag::from_u8(raw).ok_or(CodecError::BadTag(raw))?;
    match tag {
        ValueTag::None => Ok(Value::None),
        ValueTag::Boolean => Ok(Value::Boolean(read_u8(input)? != 0)),
        ValueTag::Count => Ok(Value::Count(read_u64_le(input)?)),
        ValueTag::Integer => Ok(Value::Integer(read_i64_le(input)?)),
        ValueTag::Real => Ok(Value::Real(f64::from_bits(read_u64_le(input)?))),
        ValueTag::String => {
            let bytes = read_bytes(input)?;
            let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?;
            Ok(Value::String(text.to_string()))
        }
        ValueTag::Address => Ok(Value::Address(read_address(input)?)),
        ValueTag::Subnet => Ok(Value::Subnet(read_subnet(input)?)),
        ValueTag::Port => Ok(Value::Port(read_port(input)?)),
        ValueTag::Timestamp => Ok(Value::Timestamp(Timestamp(read_i64_le(input)?))),
        ValueTag::Timespan => Ok(Value::Timespan(Timespan(read_i64_le(input)?))),
        ValueTag::EnumValue => {
            let bytes = read_bytes(input)?;
            let text = std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8)?;
            Ok(Value::EnumValue(text.to_string()))
        }
        ValueTag::Set => {
            let count = read_varbyte(input)?;
            let mut set = BTreeSet::new();
            let mut previous: Option<Value> = None;
            for _ in 0..count {
                let element = decode_one(input)?;
                if let Some(prev) = &previous {
                    if *prev >= element {
                        return Err(CodecError::NonCanonicalOrder);
                    }
                }
                previous = Some(element.clone());
                set.insert(element);
            }
            Ok(Value::Set(set))
        }
        ValueTag::Table => {
            let count = read_varbyte(input)?;
            let mut table = BTreeMap::new();
            let mut previous: Option<Value> = None;
            for _ in 0..count {
                let key = decode_one(input)?;
                let value = decode_one(input)?;
                if let Some(prev) = &previous {
                    if *prev >= key {
                        return Err(CodecError::NonCanonicalOrder);
                    }
                }
                previous = Some(key.clone());
                table.insert(key, value);
            }
            Ok(Value::Table(table))
        }
        ValueTag::List => {
            let count = read_varbyte(input)?;
            let mut list = Vec::new();
            for _ in 0..count {
                list.push(decode_one(input)?);
            }
            Ok(Value::List(list))
        }
    }
}

/// Advances `input` past one encoded value, validating structure and
/// truncation but not container ordering.
pub(crate) fn skip_value(input: &mut &[u8]) -> Result<(), CodecError> {
    let raw = read_u8(input)?;
    let tag = ValueTag::from_u8(raw).ok_or(CodecError::BadTag(raw))?;
    match tag {
        ValueTag::None => Ok(()),
        ValueTag::Boolean => take(input, 1).map(drop),
        ValueTag::Count | ValueTag::Integer | ValueTag::Real => take(input, 8).map(drop),
        ValueTag::Timestamp | ValueTag::Timespan => take(input, 8).map(drop),
        ValueTag::String | ValueTag::EnumValue => read_bytes(input).map(drop),
        ValueTag::Address => read_address(input).map(drop),
        ValueTag::Subnet => read_subnet(input).map(drop),
        ValueTag::Port => read_port(input).map(drop),
        ValueTag::Set | ValueTag::List => {
            let count = read_varbyte(input)?;
            for _ in 0..count {
                skip_value(input)?;
            }
            Ok(())
        }
        ValueTag::Table => {
            let count = read_varbyte(input)?;
            for _ in 0..count {
                skip_value(input)?;
                skip_value(input)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let bytes = encode_to_vec(&value);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, value, "mismatch for {value}");
    }

    fn sample_values() -> Vec<Value> {
        vec![
            Value::None,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Count(0),
            Value::Count(u64::MAX),
            Value::Integer(-1),
            Value::Integer(i64::MIN),
            Value::Real(3.25),
            Value::Real(-0.0),
            Value::Real(f64::NAN),
            Value::String(String::new()),
            Value::String("hello \u{1F980} world".into()),
            Value::Address("192.168.1.1".parse().unwrap()),
            Value::Address("2001:db8::1".parse().unwrap()),
            Value::Subnet(Subnet::new("10.0.0.0".parse().unwrap(), 8).unwrap()),
            Value::Port(Port::new(443, PortProtocol::Tcp)),
            Value::Timestamp(Timestamp(1_700_000_000_000_000_000)),
            Value::Timespan(Timespan(-5)),
            Value::EnumValue("Notice::LOG".into()),
            Value::Set([Value::Count(1), Value::Count(2)].into_iter().collect()),
            Value::Table(
                [
                    (Value::from("a"), Value::Count(1)),
                    (Value::from("b"), Value::List(vec![Value::None])),
                ]
                .into_iter()
                .collect(),
            ),
            Value::List(vec![
                Value::Boolean(true),
                Value::Set([Value::from("x")].into_iter().collect()),
            ]),
        ]
    }

    #[test]
    fn structural_roundtrip() {
        for value in sample_values() {
            roundtrip(value);
        }
    }

    #[test]
    fn varbyte_roundtrip() {
        for x in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut out = Vec::new();
            write_varbyte(&mut out, x);
            let mut input = out.as_slice();
            assert_eq!(read_varbyte(&mut input).unwrap(), x);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn varbyte_rejects_overlong() {
        // The tenth byte may only carry one remaining bit.
        let bytes = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut input = bytes.as_slice();
        assert_eq!(read_varbyte(&mut input), Err(CodecError::BadVarbyte));
    }

    #[test]
    fn truncation_is_detected() {
        for value in sample_values() {
            let bytes = encode_to_vec(&value);
            for cut in 0..bytes.len() {
                let err = decode(&bytes[..cut]);
                assert!(err.is_err(), "truncated {value} at {cut} decoded");
            }
        }
    }

    #[test]
    fn bad_tag_is_rejected() {
        assert_eq!(decode(&[0x7f]), Err(CodecError::BadTag(0x7f)));
    }

    #[test]
    fn length_beyond_input_is_rejected() {
        // String claiming 100 bytes with only 2 present.
        let bytes = [ValueTag::String as u8, 100, b'h', b'i'];
        assert_eq!(decode(&bytes), Err(CodecError::Truncated));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_to_vec(&Value::Count(7));
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(CodecError::TrailingBytes));
    }

    #[test]
    fn non_canonical_set_order_is_rejected() {
        let mut bytes = vec![ValueTag::Set as u8, 2];
        encode(&Value::Count(2), &mut bytes);
        encode(&Value::Count(1), &mut bytes);
        assert_eq!(decode(&bytes), Err(CodecError::NonCanonicalOrder));
    }

    #[test]
    fn duplicate_set_elements_are_rejected() {
        let mut bytes = vec![ValueTag::Set as u8, 2];
        encode(&Value::Count(1), &mut bytes);
        encode(&Value::Count(1), &mut bytes);
        assert_eq!(decode(&bytes), Err(CodecError::NonCanonicalOrder));
    }

    #[test]
    fn skip_matches_decode_span() {
        for value in sample_values() {
            let bytes = encode_to_vec(&value);
            let mut input = bytes.as_slice();
            skip_value(&mut input).unwrap();
            assert!(input.is_empty(), "skip left bytes for {value}");
        }
    }
}
