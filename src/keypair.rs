/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An Ed25519-backed [`ValidatorKey`] for deployments that want cryptographic commit seals.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;

use crate::backend::{BackendError, ValidatorKey};
use crate::types::NodeID;

/// A [`ValidatorKey`] whose node identifier is the base64 encoding of an Ed25519 verifying key,
/// and whose commit seals are Ed25519 signatures over the proposal digest.
pub struct Ed25519Key {
    signing: SigningKey,
}

impl Ed25519Key {
    pub fn new(signing: SigningKey) -> Self {
        Self { signing }
    }

    /// Generate a fresh key from the given cryptographically secure RNG.
    pub fn generate<R: CryptoRngCore + ?Sized>(csprng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(csprng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The node identifier corresponding to a verifying key, as produced by
    /// [`ValidatorKey::node_id`].
    pub fn node_id_of(verifying_key: &VerifyingKey) -> NodeID {
        NodeID::from(STANDARD_NO_PAD.encode(verifying_key.to_bytes()))
    }
}

impl ValidatorKey for Ed25519Key {
    fn node_id(&self) -> NodeID {
        Self::node_id_of(&self.signing.verifying_key())
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, BackendError> {
        Ok(self.signing.sign(digest).to_bytes().to_vec())
    }
}

/// Check a commit seal produced by [`Ed25519Key::sign`]. Suitable for use inside
/// [`Backend::validate_commit`](crate::backend::Backend::validate_commit).
pub fn verify_seal(verifying_key: &VerifyingKey, digest: &[u8], seal: &[u8]) -> bool {
    match Signature::from_slice(seal) {
        Ok(signature) => verifying_key.verify(digest, &signature).is_ok(),
        Err(_) => false,
    }
}
