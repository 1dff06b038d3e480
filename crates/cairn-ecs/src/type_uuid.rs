//! Stable type identifiers.
//!
//! Every reflected or component type carries a [`TypeUuid`] that stays the
//! same across builds and processes, so serialized data and module boundaries
//! can refer to types without relying on `std::any::TypeId`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Build-stable identifier of a reflected type.
///
/// Displays in the braced upper-case form `{6D43E9E1-...}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeUuid(Uuid);

impl TypeUuid {
    /// The all-zero identifier. Never assigned to a real type.
    pub const NULL: TypeUuid = TypeUuid(Uuid::nil());

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Parse with or without surrounding braces.
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text.trim().trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(inner).ok().map(Self)
    }

    /// A random identifier, for types created at run time.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TypeUuid {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for TypeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:X}}}", self.0.hyphenated())
    }
}

impl fmt::Debug for TypeUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeUuid({self})")
    }
}

impl FromStr for TypeUuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s.trim().trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(inner).map(Self)
    }
}

/// Compile-time identity of a type.
pub trait TypeInfo {
    const TYPE_UUID: TypeUuid;
    const TYPE_NAME: &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: TypeUuid = TypeUuid::from_u128(0x6d43e9e1_4f5a_4c6e_9b3e_0123456789ab);

    #[test]
    fn display_is_braced_upper_case() {
        assert_eq!(SAMPLE.to_string(), "{6D43E9E1-4F5A-4C6E-9B3E-0123456789AB}");
    }

    #[test]
    fn parse_accepts_braces_and_case() {
        assert_eq!(TypeUuid::parse("{6D43E9E1-4F5A-4C6E-9B3E-0123456789AB}"), Some(SAMPLE));
        assert_eq!(TypeUuid::parse("6d43e9e1-4f5a-4c6e-9b3e-0123456789ab"), Some(SAMPLE));
        assert_eq!("{6d43e9e1-4f5a-4c6e-9b3e-0123456789ab}".parse::<TypeUuid>().ok(), Some(SAMPLE));
        assert_eq!(TypeUuid::parse("not a uuid"), None);
    }

    #[test]
    fn null_and_random() {
        assert!(TypeUuid::NULL.is_null());
        assert!(TypeUuid::default().is_null());
        assert_ne!(TypeUuid::random(), TypeUuid::random());
    }
}
