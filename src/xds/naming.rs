//! Resource identity.
//!
//! A [`ResourceName`] is derived only from where an object lives and what it is
//! called, so a replaced object (same key, new identity) takes over its
//! predecessor's slot in the store. A [`ResourceVersion`] is read straight from
//! object metadata and orders writes to one name.

use std::cmp::Ordering;
use std::fmt;

use crate::xds::kinds::Kind;

/// Separator between the namespace, kind and name components.
pub const SEPARATOR: char = '/';

/// Globally unique store key: lower-cased `namespace/kind/name`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName(String);

impl ResourceName {
    pub fn new(namespace: &str, kind: Kind, name: &str) -> Self {
        Self(
            format!("{namespace}{SEPARATOR}{}{SEPARATOR}{name}", kind.as_str())
                .to_ascii_lowercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the name back into `(namespace, kind, name)`.
    pub fn parts(&self) -> Option<(&str, Kind, &str)> {
        let mut parts = self.0.splitn(3, SEPARATOR);
        let namespace = parts.next()?;
        let kind = parts.next()?.parse().ok()?;
        let name = parts.next()?;
        Some((namespace, kind, name))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `(identity, version)` pair copied from an object's metadata.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion {
    /// Stable for the lifetime of an object; changes on delete and recreate.
    pub identity: String,
    /// Changes on every write to the object.
    pub version: String,
}

impl ResourceVersion {
    pub fn new(identity: impl Into<String>, version: impl Into<String>) -> Self {
        Self { identity: identity.into(), version: version.into() }
    }

    /// Whether `self` is an older write of the same object than `other`.
    ///
    /// Only comparable when both belong to the same identity and both version
    /// tokens are decimal counters; anything else is never considered stale.
    pub fn is_older_than(&self, other: &ResourceVersion) -> bool {
        if self.identity != other.identity {
            return false;
        }
        match (self.version.parse::<u64>(), other.version.parse::<u64>()) {
            (Ok(mine), Ok(theirs)) => mine.cmp(&theirs) == Ordering::Less,
            _ => false,
        }
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.version)
    }
}
