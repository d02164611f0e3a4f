//! Type-safe identifier newtypes for certgate.
//!
//! A caller is known by its [`Address`]; everything stored on disk or held in
//! the issuance lock table is keyed by the shorter [`IdentityKey`] derived
//! from it. Keeping them as distinct types stops a raw address from being
//! used as a path segment by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Number of hex digits in a 20-byte address.
pub const ADDRESS_HEX_LEN: usize = 40;

/// Default length of a derived [`IdentityKey`].
pub const DEFAULT_IDENTITY_KEY_LEN: usize = 16;

/// Errors produced when parsing an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 0x")]
    MissingPrefix,

    #[error("address must contain {expected} hex digits, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("address contains non-hex character {0:?}")]
    NotHex(char),
}

/// A 20-byte account address, stored as lowercase `0x`-prefixed hex.
///
/// Comparison is case-insensitive by construction: mixed-case (checksummed)
/// input is normalized when parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Parse a `0x`-prefixed, 40 hex digit address.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let digits = s.strip_prefix("0x").ok_or(AddressError::MissingPrefix)?;

        if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex(bad));
        }
        if digits.len() != ADDRESS_HEX_LEN {
            return Err(AddressError::WrongLength {
                expected: ADDRESS_HEX_LEN,
                actual: digits.len(),
            });
        }

        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    /// Build an address from its raw 20 bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Full lowercase form including the `0x` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex digits without the `0x` prefix.
    pub fn hex_digits(&self) -> &str {
        &self.0[2..]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Filesystem- and lock-table-safe key derived from an [`Address`].
///
/// The key is the first `len` lowercase hex digits of the address. It is
/// deterministic and only ever contains `[0-9a-f]`, so it can be used as a
/// single path segment without escaping. Short keys trade collision
/// resistance for readable hostnames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Derive the key for `address`, truncated to `len` hex digits.
    ///
    /// `len` is clamped to the number of digits in an address.
    pub fn derive(address: &Address, len: usize) -> Self {
        let digits = address.hex_digits();
        let len = len.min(digits.len());
        Self(digits[..len].to_string())
    }

    /// Wrap an existing key, e.g. a directory name read back from disk.
    ///
    /// Only non-empty, lowercase hex strings up to address length are keys.
    pub fn new(key: impl Into<String>) -> Result<Self, AddressError> {
        let key = key.into();
        if let Some(bad) = key
            .chars()
            .find(|c| !c.is_ascii_hexdigit() || c.is_ascii_uppercase())
        {
            return Err(AddressError::NotHex(bad));
        }
        if key.is_empty() || key.len() > ADDRESS_HEX_LEN {
            return Err(AddressError::WrongLength {
                expected: ADDRESS_HEX_LEN,
                actual: key.len(),
            });
        }
        Ok(Self(key))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<std::path::Path> for IdentityKey {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

/// Unique request ID for log correlation.
///
/// Generated per inbound request and attached to the request span.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new random request ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str = "0x5A0b54D5dc17e0AadC383d2db43B0a0D3E029c4c";

    #[test]
    fn test_address_normalizes_case() {
        let addr = Address::parse(SAMPLE).unwrap();
        assert_eq!(addr.as_str(), "0x5a0b54d5dc17e0aadc383d2db43b0a0d3e029c4c");
        assert_eq!(addr.hex_digits().len(), ADDRESS_HEX_LEN);
    }

    #[test]
    fn test_address_rejects_malformed() {
        assert_eq!(
            Address::parse("5a0b54d5dc17e0aadc383d2db43b0a0d3e029c4c"),
            Err(AddressError::MissingPrefix)
        );
        assert_eq!(
            Address::parse("0x5a0b"),
            Err(AddressError::WrongLength {
                expected: 40,
                actual: 4
            })
        );
        assert_eq!(
            Address::parse("0x5a0b54d5dc17e0aadc383d2db43b0a0d3e029c4z"),
            Err(AddressError::NotHex('z'))
        );
        assert!(Address::parse("0x../../etc/passwd").is_err());
    }

    #[test]
    fn test_address_from_bytes() {
        let addr = Address::from_bytes([0xab; 20]);
        assert_eq!(addr.as_str(), format!("0x{}", "ab".repeat(20)));
    }

    #[test]
    fn test_address_from_bytes_pads_each_byte() {
        let mut bytes = [0u8; 20];
        bytes[1] = 0x0f;
        bytes[19] = 0xa0;
        let addr = Address::from_bytes(bytes);
        assert_eq!(addr.as_str(), "0x000f0000000000000000000000000000000000a0");
        assert_eq!(Address::parse(addr.as_str()).unwrap(), addr);
    }

    #[test]
    fn test_identity_key_matches_reference_layout() {
        let addr = Address::parse(SAMPLE).unwrap();
        let key = IdentityKey::derive(&addr, DEFAULT_IDENTITY_KEY_LEN);
        assert_eq!(key.as_str(), "5a0b54d5dc17e0aa");
    }

    #[test]
    fn test_identity_key_length_is_clamped() {
        let addr = Address::parse(SAMPLE).unwrap();
        let key = IdentityKey::derive(&addr, 64);
        assert_eq!(key.as_str(), addr.hex_digits());
    }

    #[test]
    fn test_identity_key_new_validates() {
        assert_eq!(IdentityKey::new("5a0b54d5").unwrap().as_str(), "5a0b54d5");
        assert_eq!(IdentityKey::new("../etc"), Err(AddressError::NotHex('.')));
        assert_eq!(IdentityKey::new("ABCD"), Err(AddressError::NotHex('A')));
        assert!(IdentityKey::new("").is_err());
        assert!(IdentityKey::new("a".repeat(41)).is_err());
    }

    #[test]
    fn test_request_id_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    proptest! {
        #[test]
        fn prop_identity_key_is_deterministic_and_path_safe(
            bytes in proptest::array::uniform20(any::<u8>()),
            len in 1usize..=40,
        ) {
            let addr = Address::from_bytes(bytes);
            let upper = format!("0x{}", addr.hex_digits().to_ascii_uppercase());
            let reparsed = Address::parse(&upper).unwrap();

            let a = IdentityKey::derive(&addr, len);
            let b = IdentityKey::derive(&reparsed, len);

            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.as_str().len(), len);
            prop_assert!(!a.as_str().contains('/'));
            prop_assert!(!a.as_str().contains('\\'));
            prop_assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
