//! Common types for certgate.
//!
//! Holds the identifier newtypes that flow between the authentication layer,
//! the certificate store and the issuance lock table.

pub mod ids;

pub use ids::{Address, AddressError, IdentityKey, RequestId, DEFAULT_IDENTITY_KEY_LEN};
