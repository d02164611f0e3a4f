//! Signer recovery for secp256k1 signatures.
//!
//! Callers sign `keccak256(message)` with the key behind their address and
//! send the 65-byte `r || s || v` signature. Recovering the public key from
//! the signature and hashing it back into an address lets us authenticate
//! the caller without holding any per-caller state.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use certgate_common::Address;

/// Length of an `r || s || v` signature.
pub const SIGNATURE_LEN: usize = 65;

/// Why a signer could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("signature must be {SIGNATURE_LEN} bytes, got {0}")]
    Length(usize),

    #[error("invalid recovery id {0}")]
    RecoveryId(u8),

    #[error("signature does not encode a valid curve point")]
    Malformed,
}

/// Recovers the address that produced a signature over a 32-byte hash.
pub trait SignatureVerifier: Send + Sync {
    fn recover(&self, hash: &[u8; 32], signature: &[u8]) -> Result<Address, RecoveryError>;
}

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Address of a public key: the last 20 bytes of the Keccak-256 of its
/// uncompressed encoding, without the leading `0x04` tag.
pub fn address_from_key(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);

    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

/// secp256k1 recovery as used by Ethereum-style wallets.
///
/// Accepts both `v ∈ {0, 1}` and the legacy `v ∈ {27, 28}` encodings.
/// High-`s` signatures are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl SignatureVerifier for Secp256k1Verifier {
    fn recover(&self, hash: &[u8; 32], signature: &[u8]) -> Result<Address, RecoveryError> {
        if signature.len() != SIGNATURE_LEN {
            return Err(RecoveryError::Length(signature.len()));
        }

        let sig = Signature::from_slice(&signature[..64]).map_err(|_| RecoveryError::Malformed)?;

        let v = signature[64];
        let normalized = match v {
            0 | 1 => v,
            27 | 28 => v - 27,
            other => return Err(RecoveryError::RecoveryId(other)),
        };
        let recovery_id = RecoveryId::from_byte(normalized).ok_or(RecoveryError::RecoveryId(v))?;

        let key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
            .map_err(|_| RecoveryError::Malformed)?;

        Ok(address_from_key(&key))
    }
}
