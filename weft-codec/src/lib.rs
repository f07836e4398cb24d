//! Weft Codec
//!
//! The binary wire form of [`weft_model::Value`]: one tag byte followed by a
//! payload, with varbyte (base-128) length prefixes and containers encoded
//! in canonical value order. The encoding is self-describing and stable; it
//! is part of the protocol contract.
//!
//! Three layers:
//! - [`wire`]: encode/decode between `Value` trees and bytes.
//! - [`view`]: typed accessors over an encoded span without materializing.
//! - [`builder`]: construct encoded containers element by element, without a
//!   round-trip through a `Value` tree.

pub mod builder;
pub mod error;
pub mod view;
pub mod wire;

pub use builder::{Encode, ListBuilder, OwnedValue, SetBuilder, TableBuilder};
pub use error::CodecError;
pub use view::{ElementsView, TableView, ValueView};
pub use wire::{decode, encode, encode_to_vec};
