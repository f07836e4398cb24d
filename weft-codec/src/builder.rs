//! Streaming builders for sets, tables, and lists.
//!
//! Builders append encoded elements directly into an owned buffer; nesting a
//! builder into another splices its bytes without materializing a `Value`.
//! Builders never reorder or deduplicate: the caller supplies set elements
//! and table keys in total order and without duplicates, otherwise the
//! resulting encoding is ill-formed and decoders may reject it.
//!
//! `build()` consumes the builder and moves the buffer into the returned
//! [`OwnedValue`]; buffer and views over it are never shared with a live
//! builder.

use std::net::IpAddr;

use weft_model::value::{Port, Subnet, Timespan, Timestamp};
use weft_model::{Value, ValueTag};

use crate::view::ValueView;
use crate::wire;

/// Types that know how to append their encoded form to a buffer.
pub trait Encode {
    fn encode_into(self, out: &mut Vec<u8>);
}

impl Encode for &Value {
    fn encode_into(self, out: &mut Vec<u8>) {
        wire::encode(self, out);
    }
}

impl Encode for bool {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Boolean as u8);
        out.push(u8::from(self));
    }
}

impl Encode for u64 {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Count as u8);
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Encode for i64 {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Integer as u8);
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Encode for f64 {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Real as u8);
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl Encode for &str {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::String as u8);
        wire::write_bytes(out, self.as_bytes());
    }
}

impl Encode for IpAddr {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Address as u8);
        wire::write_address(out, &self);
    }
}

impl Encode for Subnet {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Subnet as u8);
        wire::write_address(out, &self.address);
        out.push(self.length);
    }
}

impl Encode for Port {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Port as u8);
        out.extend_from_slice(&self.number.to_le_bytes());
        out.push(self.protocol as u8);
    }
}

impl Encode for Timestamp {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Timestamp as u8);
        out.extend_from_slice(&self.0.to_le_bytes());
    }
}

impl Encode for Timespan {
    fn encode_into(self, out: &mut Vec<u8>) {
        out.push(ValueTag::Timespan as u8);
        out.extend_from_slice(&self.0.to_le_bytes());
    }
}

macro_rules! container_builder {
    ($name:ident, $tag:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Default)]
        pub struct $name {
            bytes: Vec<u8>,
            len: u64,
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn len(&self) -> u64 {
                self.len
            }

            pub fn is_empty(&self) -> bool {
                self.len == 0
            }

            /// Finalizes the container: the buffer moves into the returned
            /// value and the builder is gone.
            pub fn build(self) -> OwnedValue {
                OwnedValue::from_parts($tag, self.len, self.bytes)
            }
        }

        impl Encode for $name {
            fn encode_into(self, out: &mut Vec<u8>) {
                out.push($tag as u8);
                wire::write_varbyte(out, self.len);
                out.extend_from_slice(&self.bytes);
            }
        }
    };
}

container_builder!(
    ListBuilder,
    ValueTag::List,
    "Builds an encoded list, preserving insertion order."
);
container_builder!(
    SetBuilder,
    ValueTag::Set,
    "Builds an encoded set. Elements must arrive in ascending order."
);
container_builder!(
    TableBuilder,
    ValueTag::Table,
    "Builds an encoded table. Keys must arrive in ascending order."
);

impl ListBuilder {
    pub fn add(&mut self, element: impl Encode) -> &mut Self {
        element.encode_into(&mut self.bytes);
        self.len += 1;
        self
    }
}

impl SetBuilder {
    pub fn add(&mut self, element: impl Encode) -> &mut Self {
        element.encode_into(&mut self.bytes);
        self.len += 1;
        self
    }
}

impl TableBuilder {
    pub fn add(&mut self, key: impl Encode, value: impl Encode) -> &mut Self {
        key.encode_into(&mut self.bytes);
        value.encode_into(&mut self.bytes);
        self.len += 1;
        self
    }
}

/// An encoded value owning its buffer, produced by a builder.
#[derive(Clone, PartialEq, Eq)]
pub struct OwnedValue {
    bytes: Vec<u8>,
}

impl OwnedValue {
    fn from_parts(tag: ValueTag, len: u64, body: Vec<u8>) -> Self {
        let mut bytes = Vec::with_capacity(body.len() + 11);
        bytes.push(tag as u8);
        wire::write_varbyte(&mut bytes, len);
        bytes.extend_from_slice(&body);
        Self { bytes }
    }

    /// Encodes an arbitrary value tree.
    pub fn from_value(value: &Value) -> Self {
        Self {
            bytes: wire::encode_to_vec(value),
        }
    }

    pub fn view(&self) -> ValueView<'_> {
        ValueView::new_unchecked(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl std::fmt::Debug for OwnedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnedValue({} bytes)", self.bytes.len())
    }
}
