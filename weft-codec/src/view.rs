//! Zero-copy variant views over encoded values.
//!
//! A [`ValueView`] validates the structure of its span once at construction
//! (every container fully inside the buffer, every tag known) and then hands
//! out typed accessors and sub-views without materializing a `Value` tree.
//! Views borrow the underlying bytes and live no longer than they do.

use std::net::IpAddr;

use weft_model::value::{Port, Subnet, Timespan, Timestamp};
use weft_model::{Value, ValueTag};

use crate::error::CodecError;
use crate::wire;

#[derive(Clone, Copy)]
pub struct ValueView<'a> {
    bytes: &'a [u8],
}

impl<'a> ValueView<'a> {
    /// Wraps `bytes`, which must hold exactly one encoded value.
    pub fn new(bytes: &'a [u8]) -> Result<Self, CodecError> {
        let mut cursor = bytes;
        wire::skip_value(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self { bytes })
    }

    /// Wraps bytes already known to hold exactly one well-formed value.
    pub(crate) fn new_unchecked(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// The raw encoded span backing this view.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn tag(&self) -> ValueTag {
        ValueTag::from_u8(self.bytes[0]).expect("validated at construction")
    }

    fn payload(&self) -> &'a [u8] {
        &self.bytes[1..]
    }

    pub fn is_none(&self) -> bool {
        self.tag() == ValueTag::None
    }

    pub fn as_boolean(&self) -> Option<bool> {
        (self.tag() == ValueTag::Boolean).then(|| self.payload()[0] != 0)
    }

    pub fn as_count(&self) -> Option<u64> {
        (self.tag() == ValueTag::Count).then(|| le_u64(self.payload()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        (self.tag() == ValueTag::Integer).then(|| le_u64(self.payload()) as i64)
    }

    pub fn as_real(&self) -> Option<f64> {
        (self.tag() == ValueTag::Real).then(|| f64::from_bits(le_u64(self.payload())))
    }

    pub fn as_str(&self) -> Option<&'a str> {
        if self.tag() != ValueTag::String {
            return None;
        }
        let mut input = self.payload();
        let bytes = wire::read_bytes(&mut input).ok()?;
        std::str::from_utf8(bytes).ok()
    }

    pub fn as_enum_name(&self) -> Option<&'a str> {
        if self.tag() != ValueTag::EnumValue {
            return None;
        }
        let mut input = self.payload();
        let bytes = wire::read_bytes(&mut input).ok()?;
        std::str::from_utf8(bytes).ok()
    }

    pub fn as_address(&self) -> Option<IpAddr> {
        if self.tag() != ValueTag::Address {
            return None;
        }
        let mut input = self.payload();
        wire::read_address(&mut input).ok()
    }

    pub fn as_subnet(&self) -> Option<Subnet> {
        if self.tag() != ValueTag::Subnet {
            return None;
        }
        let mut input = self.payload();
        wire::read_subnet(&mut input).ok()
    }

    pub fn as_port(&self) -> Option<Port> {
        if self.tag() != ValueTag::Port {
            return None;
        }
        let mut input = self.payload();
        wire::read_port(&mut input).ok()
    }

    pub fn as_timestamp(&self) -> Option<Timestamp> {
        (self.tag() == ValueTag::Timestamp).then(|| Timestamp(le_u64(self.payload()) as i64))
    }

    pub fn as_timespan(&self) -> Option<Timespan> {
        (self.tag() == ValueTag::Timespan).then(|| Timespan(le_u64(self.payload()) as i64))
    }

    /// Iterates the elements of a set or list.
    pub fn as_elements(&self) -> Option<ElementsView<'a>> {
        if !matches!(self.tag(), ValueTag::Set | ValueTag::List) {
            return None;
        }
        let mut input = self.payload();
        let count = wire::read_varbyte(&mut input).ok()?;
        Some(ElementsView {
            rest: input,
            remaining: count,
        })
    }

    /// Iterates the key/value pairs of a table.
    pub fn as_table(&self) -> Option<TableView<'a>> {
        if self.tag() != ValueTag::Table {
            return None;
        }
        let mut input = self.payload();
        let count = wire::read_varbyte(&mut input).ok()?;
        Some(TableView {
            rest: input,
            remaining: count,
        })
    }

    /// Number of elements in a container view.
    pub fn container_len(&self) -> Option<u64> {
        if !matches!(
            self.tag(),
            ValueTag::Set | ValueTag::List | ValueTag::Table
        ) {
            return None;
        }
        let mut input = self.payload();
        wire::read_varbyte(&mut input).ok()
    }

    /// Full decode into an owned tree, including the canonical-order check.
    pub fn materialize(&self) -> Result<Value, CodecError> {
        wire::decode(self.bytes)
    }
}

impl std::fmt::Debug for ValueView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueView({:?}, {} bytes)", self.tag(), self.bytes.len())
    }
}

fn le_u64(payload: &[u8]) -> u64 {
    u64::from_le_bytes(payload[..8].try_into().expect("validated at construction"))
}

fn split_value<'a>(rest: &mut &'a [u8]) -> ValueView<'a> {
    let start = *rest;
    wire::skip_value(rest).expect("validated at construction");
    let span = &start[..start.len() - rest.len()];
    ValueView::new_unchecked(span)
}

/// Iterator over the elements of an encoded set or list.
pub struct ElementsView<'a> {
    rest: &'a [u8],
    remaining: u64,
}

impl<'a> Iterator for ElementsView<'a> {
    type Item = ValueView<'a>;

    fn next(&mut self) -> Option<ValueView<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(split_value(&mut self.rest))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Iterator over the entries of an encoded table.
pub struct TableView<'a> {
    rest: &'a [u8],
    remaining: u64,
}

impl<'a> Iterator for TableView<'a> {
    type Item = (ValueView<'a>, ValueView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let key = split_value(&mut self.rest);
        let value = split_value(&mut self.rest);
        Some((key, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_to_vec;
    use std::collections::BTreeMap;

    #[test]
    fn scalar_accessors() {
        let bytes = encode_to_vec(&Value::Count(42));
        let view = ValueView::new(&bytes).unwrap();
        assert_eq!(view.tag(), ValueTag::Count);
        assert_eq!(view.as_count(), Some(42));
        assert_eq!(view.as_integer(), None);
    }

    #[test]
    fn string_without_copy() {
        let bytes = encode_to_vec(&Value::from("topic/data"));
        let view = ValueView::new(&bytes).unwrap();
        assert_eq!(view.as_str(), Some("topic/data"));
    }

    #[test]
    fn list_iteration_yields_subviews() {
        let bytes = encode_to_vec(&Value::List(vec![
            Value::Count(1),
            Value::from("two"),
            Value::List(vec![Value::Boolean(true)]),
        ]));
        let view = ValueView::new(&bytes).unwrap();
        assert_eq!(view.container_len(), Some(3));

        let items: Vec<_> = view.as_elements().unwrap().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_count(), Some(1));
        assert_eq!(items[1].as_str(), Some("two"));
        let nested: Vec<_> = items[2].as_elements().unwrap().collect();
        assert_eq!(nested[0].as_boolean(), Some(true));
    }

    #[test]
    fn table_iteration() {
        let table: BTreeMap<Value, Value> = [
            (Value::from("a"), Value::Count(1)),
            (Value::from("b"), Value::Count(2)),
        ]
        .into_iter()
        .collect();
        let bytes = encode_to_vec(&Value::Table(table));
        let view = ValueView::new(&bytes).unwrap();
        let entries: Vec<_> = view.as_table().unwrap().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.as_str(), Some("a"));
        assert_eq!(entries[1].1.as_count(), Some(2));
    }

    #[test]
    fn construction_rejects_truncation() {
        let bytes = encode_to_vec(&Value::List(vec![Value::Count(1)]));
        assert!(ValueView::new(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn materialize_matches_decode() {
        let value = Value::List(vec![Value::from("x"), Value::None]);
        let bytes = encode_to_vec(&value);
        let view = ValueView::new(&bytes).unwrap();
        assert_eq!(view.materialize().unwrap(), value);
    }
}
