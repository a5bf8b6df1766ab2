use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Globally unique identifier of a persistent object.
///
/// A `Guid` is a random UUID (v4) rendered in its hyphenated lowercase form.
/// It is stable for the whole lifetime of the object it identifies and is the
/// last component of the object's row key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(uuid::Uuid);

impl Guid {
    /// Generate a fresh random guid.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a guid from its string form.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TypeError::InvalidGuid(format!("{s}: {e}")))
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Guid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.short())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl From<uuid::Uuid> for Guid {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_guids_are_unique() {
        let a = Guid::new();
        let b = Guid::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_parse_roundtrip() {
        let guid = Guid::new();
        let parsed: Guid = guid.to_string().parse().unwrap();
        assert_eq!(guid, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = Guid::parse("not-a-guid").unwrap_err();
        assert!(matches!(err, TypeError::InvalidGuid(_)));
    }

    #[test]
    fn serializes_as_plain_string() {
        let guid = Guid::new();
        let json = serde_json::to_value(guid).unwrap();
        assert_eq!(json, serde_json::Value::String(guid.to_string()));
    }

    #[test]
    fn short_is_8_chars() {
        assert_eq!(Guid::new().short().len(), 8);
    }
}
