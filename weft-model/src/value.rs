//! The universal value type carried by data messages and store commands.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transport protocol component of a [`Port`] value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PortProtocol {
    Unknown = 0,
    Tcp = 1,
    Udp = 2,
    Icmp = 3,
}

impl PortProtocol {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unknown),
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            3 => Some(Self::Icmp),
            _ => None,
        }
    }
}

impl fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "?",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        };
        f.write_str(name)
    }
}

/// A transport-layer port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Port {
    pub number: u16,
    pub protocol: PortProtocol,
}

impl Port {
    pub fn new(number: u16, protocol: PortProtocol) -> Self {
        Self { number, protocol }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

/// An IP network given as base address plus prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subnet {
    pub address: IpAddr,
    pub length: u8,
}

impl Subnet {
    /// Builds a subnet, rejecting prefix lengths beyond the address width.
    pub fn new(address: IpAddr, length: u8) -> Option<Self> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        (length <= max).then_some(Self { address, length })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.length)
    }
}

/// Nanoseconds since the UNIX epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(elapsed.as_nanos() as i64)
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }
}

/// A duration in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespan(pub i64);

impl Timespan {
    pub fn nanos(&self) -> i64 {
        self.0
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms * 1_000_000)
    }
}

impl std::ops::Add<Timespan> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timespan) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.0))
    }
}

/// Wire tag of a [`Value`] variant. The numeric values are part of the wire
/// contract and double as the first ordering criterion between values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueTag {
    None = 0,
    Boolean = 1,
    Count = 2,
    Integer = 3,
    Real = 4,
    String = 5,
    Address = 6,
    Subnet = 7,
    Port = 8,
    Timestamp = 9,
    Timespan = 10,
    EnumValue = 11,
    Set = 12,
    Table = 13,
    List = 14,
}

impl ValueTag {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Boolean),
            2 => Some(Self::Count),
            3 => Some(Self::Integer),
            4 => Some(Self::Real),
            5 => Some(Self::String),
            6 => Some(Self::Address),
            7 => Some(Self::Subnet),
            8 => Some(Self::Port),
            9 => Some(Self::Timestamp),
            10 => Some(Self::Timespan),
            11 => Some(Self::EnumValue),
            12 => Some(Self::Set),
            13 => Some(Self::Table),
            14 => Some(Self::List),
            _ => None,
        }
    }
}

/// The tagged union all payloads are made of.
///
/// Values are totally ordered: first by tag, then by natural order within a
/// tag (reals by IEEE total order). Sets and table keys iterate and
/// serialize in this order, which makes the encoding canonical.
#[derive(Clone)]
pub enum Value {
    None,
    Boolean(bool),
    Count(u64),
    Integer(i64),
    Real(f64),
    String(String),
    Address(IpAddr),
    Subnet(Subnet),
    Port(Port),
    Timestamp(Timestamp),
    Timespan(Timespan),
    EnumValue(String),
    Set(BTreeSet<Value>),
    Table(BTreeMap<Value, Value>),
    List(Vec<Value>),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::None => ValueTag::None,
            Value::Boolean(_) => ValueTag::Boolean,
            Value::Count(_) => ValueTag::Count,
            Value::Integer(_) => ValueTag::Integer,
            Value::Real(_) => ValueTag::Real,
            Value::String(_) => ValueTag::String,
            Value::Address(_) => ValueTag::Address,
            Value::Subnet(_) => ValueTag::Subnet,
            Value::Port(_) => ValueTag::Port,
            Value::Timestamp(_) => ValueTag::Timestamp,
            Value::Timespan(_) => ValueTag::Timespan,
            Value::EnumValue(_) => ValueTag::EnumValue,
            Value::Set(_) => ValueTag::Set,
            Value::Table(_) => ValueTag::Table,
            Value::List(_) => ValueTag::List,
        }
    }

    /// The neutral element of a tag, used to initialize absent keys on `add`.
    pub fn neutral(tag: ValueTag) -> Value {
        match tag {
            ValueTag::None => Value::None,
            ValueTag::Boolean => Value::Boolean(false),
            ValueTag::Count => Value::Count(0),
            ValueTag::Integer => Value::Integer(0),
            ValueTag::Real => Value::Real(0.0),
            ValueTag::String => Value::String(String::new()),
            ValueTag::Address => Value::Address(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            ValueTag::Subnet => Value::Subnet(Subnet {
                address: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                length: 0,
            }),
            ValueTag::Port => Value::Port(Port::new(0, PortProtocol::Unknown)),
            ValueTag::Timestamp => Value::Timestamp(Timestamp(0)),
            ValueTag::Timespan => Value::Timespan(Timespan(0)),
            ValueTag::EnumValue => Value::EnumValue(String::new()),
            ValueTag::Set => Value::Set(BTreeSet::new()),
            ValueTag::Table => Value::Table(BTreeMap::new()),
            ValueTag::List => Value::List(Vec::new()),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Value::Count(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(x) => Some(x),
            _ => None,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Count(a), Count(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Address(a), Address(b)) => a.cmp(b),
            (Subnet(a), Subnet(b)) => a.cmp(b),
            (Port(a), Port(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Timespan(a), Timespan(b)) => a.cmp(b),
            (EnumValue(a), EnumValue(b)) => a.cmp(b),
            (Set(a), Set(b)) => a.cmp(b),
            (Table(a), Table(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Equality is derived from the total order so that reals compare
// consistently inside sets and table keys (IEEE total order, not `==`).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("nil"),
            Value::Boolean(x) => f.write_str(if *x { "T" } else { "F" }),
            Value::Count(x) => write!(f, "{x}"),
            Value::Integer(x) => write!(f, "{x}"),
            Value::Real(x) => write!(f, "{x}"),
            Value::String(x) => f.write_str(x),
            Value::Address(x) => write!(f, "{x}"),
            Value::Subnet(x) => write!(f, "{x}"),
            Value::Port(x) => write!(f, "{x}"),
            Value::Timestamp(x) => write!(f, "{}ns", x.0),
            Value::Timespan(x) => write!(f, "{}ns", x.0),
            Value::EnumValue(x) => f.write_str(x),
            Value::Set(xs) => {
                f.write_str("{")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("}")
            }
            Value::Table(xs) => {
                f.write_str("(")?;
                for (i, (k, v)) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                f.write_str(")")
            }
            Value::List(xs) => {
                f.write_str("{")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Self {
        Value::Boolean(x)
    }
}

impl From<u64> for Value {
    fn from(x: u64) -> Self {
        Value::Count(x)
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Self {
        Value::Integer(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Real(x)
    }
}

impl From<&str> for Value {
    fn from(x: &str) -> Self {
        Value::String(x.to_string())
    }
}

impl From<String> for Value {
    fn from(x: String) -> Self {
        Value::String(x)
    }
}

impl From<IpAddr> for Value {
    fn from(x: IpAddr) -> Self {
        Value::Address(x)
    }
}

impl From<Vec<Value>> for Value {
    fn from(xs: Vec<Value>) -> Self {
        Value::List(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(ValueTag::from_u8(0), Some(ValueTag::None));
        assert_eq!(ValueTag::from_u8(14), Some(ValueTag::List));
        assert_eq!(ValueTag::from_u8(15), None);
        assert_eq!(Value::Count(1).tag() as u8, 2);
    }

    #[test]
    fn order_ranks_by_tag_first() {
        assert!(Value::None < Value::Boolean(false));
        assert!(Value::Boolean(true) < Value::Count(0));
        assert!(Value::Count(u64::MAX) < Value::Integer(i64::MIN));
        assert!(Value::String("z".into()) < Value::List(vec![]));
    }

    #[test]
    fn reals_use_total_order() {
        assert!(Value::Real(-0.0) < Value::Real(0.0));
        assert_eq!(Value::Real(f64::NAN), Value::Real(f64::NAN));
        assert!(Value::Real(1.0) < Value::Real(f64::NAN));
    }

    #[test]
    fn containers_order_lexicographically() {
        let a = Value::List(vec![Value::Count(1), Value::Count(2)]);
        let b = Value::List(vec![Value::Count(1), Value::Count(3)]);
        assert!(a < b);

        let s1: Value = Value::Set([Value::Count(1)].into_iter().collect());
        let s2: Value = Value::Set([Value::Count(1), Value::Count(2)].into_iter().collect());
        assert!(s1 < s2);
    }

    #[test]
    fn neutral_matches_tag() {
        for raw in 0..=14u8 {
            let tag = ValueTag::from_u8(raw).unwrap();
            assert_eq!(Value::neutral(tag).tag(), tag);
        }
    }

    #[test]
    fn subnet_rejects_oversized_prefix() {
        let v4 = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        assert!(Subnet::new(v4, 32).is_some());
        assert!(Subnet::new(v4, 33).is_none());
    }

    #[test]
    fn display_is_compact() {
        let table: BTreeMap<Value, Value> =
            [(Value::from("k"), Value::Count(1))].into_iter().collect();
        assert_eq!(Value::Table(table).to_string(), "(k -> 1)");
        assert_eq!(Value::Boolean(true).to_string(), "T");
        assert_eq!(Value::None.to_string(), "nil");
    }
}
