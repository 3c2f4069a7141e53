//! Newtype IDs for type-safe entity references.
//!
//! Use the `define_id!` macro to create type-safe ID wrappers that prevent
//! accidentally mixing IDs from different entity types.
//!
//! Remote services and older local payloads disagree on whether identities
//! are strings or integers. Every ID accepts both on input (via [`RawId`]) and
//! is canonicalised to a trimmed, non-empty string.

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing an ID.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input is empty or whitespace only.
    #[error("id cannot be empty")]
    Empty,
}

/// An identity as it appears on the wire: either a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    /// Integer identity, rendered in decimal once canonicalised.
    Number(i64),
    /// String identity.
    Text(String),
}

/// Macro to define a type-safe ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize` as a plain string, `Deserialize` from a string or integer
///   (through [`RawId`])
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Conversion methods: `parse()`, `as_str()`, `into_inner()`
/// - `FromStr`, `Display`, `From<i64>` and `TryFrom<RawId>` implementations
///
/// # Example
///
/// ```rust
/// # use cartwright_core::define_id;
/// define_id!(BookingId);
/// define_id!(VoucherId);
///
/// let booking = BookingId::from(42);
/// assert_eq!(booking.as_str(), "42");
///
/// // These are different types, so this won't compile:
/// // let _: BookingId = VoucherId::from(42);
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Parse an ID from a string, trimming surrounding whitespace.
            ///
            /// # Errors
            ///
            /// Returns `IdError::Empty` if the input is empty after trimming.
            pub fn parse(s: &str) -> ::core::result::Result<Self, $crate::IdError> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                Ok(Self(trimmed.to_owned()))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID and returns its inner string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ::core::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> ::core::result::Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id.to_string())
            }
        }

        impl TryFrom<$crate::RawId> for $name {
            type Error = $crate::IdError;

            fn try_from(raw: $crate::RawId) -> ::core::result::Result<Self, Self::Error> {
                match raw {
                    $crate::RawId::Number(n) => Ok(Self::from(n)),
                    $crate::RawId::Text(s) => Self::parse(&s),
                }
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                let raw = <$crate::RawId as ::serde::Deserialize>::deserialize(deserializer)?;
                Self::try_from(raw).map_err(::serde::de::Error::custom)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Define standard entity IDs
define_id!(ProductId);
define_id!(SellerId);
define_id!(OfferId);
define_id!(UserId);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let id = ProductId::parse("  sku-1 ").unwrap();
        assert_eq!(id.as_str(), "sku-1");
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(ProductId::parse(""), Err(IdError::Empty));
        assert_eq!(ProductId::parse("   "), Err(IdError::Empty));
    }

    #[test]
    fn test_numeric_and_string_ids_coincide() {
        let from_number: ProductId = serde_json::from_str("42").unwrap();
        let from_text: ProductId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_number, from_text);
        assert_eq!(from_number, ProductId::from(42));
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&ProductId::from(7)).unwrap();
        assert_eq!(json, "\"7\"");
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        let result: Result<ProductId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_display() {
        let id = SellerId::parse("store-9").unwrap();
        assert_eq!(format!("{id}"), "store-9");
    }
}
