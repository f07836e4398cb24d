//! Hierarchical topics and prefix filters.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between topic segments.
pub const SEPARATOR: char = '/';

/// Prefix of topics reserved for fabric-internal control traffic.
pub const RESERVED: &str = "$_broker";

/// Final segment of the command topic addressed to a store master.
pub const MASTER_SUFFIX: &str = "_master";

/// Final segment of the command topic carrying a master's command stream.
pub const CLONE_SUFFIX: &str = "_clone";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic contains an empty segment")]
    EmptySegment,
}

/// An ordered sequence of non-empty segments, stored in canonical
/// `a/b/c` string form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Topic(String);

impl Topic {
    /// Parses and validates a topic from its canonical form.
    pub fn parse(text: impl Into<String>) -> Result<Self, TopicError> {
        let text = text.into();
        if text.is_empty() {
            return Err(TopicError::Empty);
        }
        if text.split(SEPARATOR).any(str::is_empty) {
            return Err(TopicError::EmptySegment);
        }
        Ok(Self(text))
    }

    /// Returns `self` with `child` appended as additional segment(s).
    pub fn append(&self, child: &str) -> Result<Self, TopicError> {
        if child.is_empty() {
            return Err(TopicError::Empty);
        }
        if child.split(SEPARATOR).any(str::is_empty) {
            return Err(TopicError::EmptySegment);
        }
        Ok(Self(format!("{}{}{}", self.0, SEPARATOR, child)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Segment-boundary prefix test: `a/b` is a prefix of `a/b` and of
    /// `a/b/c`, but not of `a/bc`.
    pub fn prefix_of(&self, other: &Topic) -> bool {
        let mine = self.0.as_str();
        let theirs = other.0.as_str();
        if !theirs.starts_with(mine) {
            return false;
        }
        theirs.len() == mine.len() || theirs.as_bytes()[mine.len()] == SEPARATOR as u8
    }

    /// True for fabric-internal control topics.
    pub fn is_reserved(&self) -> bool {
        self.segments().next() == Some(RESERVED)
    }

    /// The command topic addressed to the master of `name`.
    pub fn store_master(name: &str) -> Result<Self, TopicError> {
        Topic::parse(name)?.append(MASTER_SUFFIX)
    }

    /// The command topic carrying the command stream of `name`'s master.
    pub fn store_clone(name: &str) -> Result<Self, TopicError> {
        Topic::parse(name)?.append(CLONE_SUFFIX)
    }

    /// If this is a store command topic, returns `(store name, suffix)`.
    pub fn store_parts(&self) -> Option<(&str, &str)> {
        let (name, suffix) = self.0.rsplit_once(SEPARATOR)?;
        if suffix == MASTER_SUFFIX || suffix == CLONE_SUFFIX {
            Some((name, suffix))
        } else {
            None
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

/// A set of topic prefixes an endpoint is willing to receive.
///
/// Kept sorted and deduplicated so that two filters with the same contents
/// compare equal and serialize identically.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Filter(Vec<Topic>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a prefix. Returns `true` if the filter changed.
    pub fn insert(&mut self, prefix: Topic) -> bool {
        match self.0.binary_search(&prefix) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, prefix);
                true
            }
        }
    }

    /// Removes a prefix. Returns `true` if the filter changed.
    pub fn remove(&mut self, prefix: &Topic) -> bool {
        match self.0.binary_search(prefix) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Adds every prefix of `other`. Returns `true` if the filter changed.
    pub fn extend(&mut self, other: &Filter) -> bool {
        let mut changed = false;
        for prefix in &other.0 {
            changed |= self.insert(prefix.clone());
        }
        changed
    }

    /// True iff some prefix in the filter covers `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.0.iter().any(|prefix| prefix.prefix_of(topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl FromIterator<Topic> for Filter {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        let mut filter = Filter::new();
        for topic in iter {
            filter.insert(topic);
        }
        filter
    }
}
