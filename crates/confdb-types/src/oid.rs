use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A slash-delimited hierarchical object identifier.
///
/// Object identifiers name schema nodes (`/net/interface`) while instance
/// identifiers carry a key part in every segment (`/net:eth/interface:0`).
/// The root object is `/` and the root instance is `/:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    /// Parses an identifier, rejecting empty or non-rooted text.
    pub fn new(text: impl Into<String>) -> Result<Self, Error> {
        let text = text.into();
        if text.is_empty() {
            return Err(Error::Invalid("empty object identifier".into()));
        }
        if !text.starts_with('/') {
            return Err(Error::Invalid(format!(
                "object identifier '{text}' is not rooted"
            )));
        }
        if text.len() > 1 && text.ends_with('/') {
            return Err(Error::Invalid(format!(
                "object identifier '{text}' has a trailing separator"
            )));
        }
        if text.contains("//") {
            return Err(Error::Invalid(format!(
                "object identifier '{text}' has an empty segment"
            )));
        }
        Ok(Oid(text))
    }

    /// The root object identifier (`/`).
    pub fn root() -> Self {
        Oid("/".into())
    }

    /// The root instance identifier (`/:`).
    pub fn root_instance() -> Self {
        Oid("/:".into())
    }

    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Whether this is the root object identifier.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The `/`-separated segments, root excluded.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        let rest = if self.is_root() { "" } else { &self.0[1..] };
        rest.split('/').filter(|s| !s.is_empty())
    }

    /// Number of separators in the identifier; the root and its direct
    /// children are at depth 1.
    pub fn depth(&self) -> usize {
        self.0.bytes().filter(|b| *b == b'/').count()
    }

    /// The identifier of the enclosing level, `None` at depth 1 (the level
    /// directly under the root) and for the root itself.
    pub fn parent(&self) -> Option<Oid> {
        if self.depth() <= 1 {
            return None;
        }
        let cut = self.0.rfind('/').unwrap_or(0);
        Some(Oid(self.0[..cut].to_owned()))
    }

    /// Whether every segment carries a key part, making this an instance
    /// identifier. The root instance `/:` qualifies.
    pub fn is_instance_oid(&self) -> bool {
        !self.is_root() && self.segments().all(|seg| seg.contains(':'))
    }

    /// Whether no segment carries a key part, making this an object
    /// identifier. The root `/` qualifies.
    pub fn is_object_oid(&self) -> bool {
        !self.0.contains(':')
    }

    /// The object identifier obtained by stripping the key part of every
    /// segment (`/net:eth/interface:0` becomes `/net/interface`).
    pub fn object_oid(&self) -> Oid {
        if self.is_object_oid() {
            return self.clone();
        }
        let mut out = String::with_capacity(self.0.len());
        for seg in self.segments() {
            out.push('/');
            out.push_str(seg.split(':').next().unwrap_or(""));
        }
        if out.is_empty() {
            out.push('/');
        }
        Oid(out)
    }

    /// Segment-wise prefix test: `self` is a prefix of `other` iff `other`
    /// begins with `self` and the following character is absent or `/`.
    /// Equal identifiers count as prefixes; the root is a prefix of
    /// everything.
    pub fn is_prefix_of(&self, other: &Oid) -> bool {
        if self.is_root() {
            return true;
        }
        match other.0.strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// The child-first total order.
    ///
    /// Byte comparison, except that a position holding `/` on one side and
    /// any other character on the other orders the `/` side first. An
    /// identifier is therefore followed by its whole subtree before any
    /// sibling whose name merely shares a prefix:
    /// `/a/b/c` < `/a/b/c/y` < `/a/b/c-d`.
    pub fn child_first_cmp(&self, other: &Oid) -> Ordering {
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        for (x, y) in a.iter().zip(b.iter()) {
            if x == y {
                continue;
            }
            return match (*x, *y) {
                (b'/', _) => Ordering::Less,
                (_, b'/') => Ordering::Greater,
                (x, y) => x.cmp(&y),
            };
        }
        a.len().cmp(&b.len())
    }
}

/// Subtree filter test: an empty filter matches everything, otherwise any
/// filter entry must be a segment prefix of `oid`.
pub fn subtree_contains(filter: &[Oid], oid: &Oid) -> bool {
    filter.is_empty() || filter.iter().any(|sub| sub.is_prefix_of(oid))
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for Oid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Oid::new(s)
    }
}

impl TryFrom<String> for Oid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Oid::new(value)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> String {
        oid.0
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}
