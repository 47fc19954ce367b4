//! Ed25519 cryptographic operations for the Keel protocol.
//!
//! Transaction inputs are signed over a **sighash** that commits to:
//! - Transaction version and lock_time
//! - All input outpoints and sequences
//! - All outputs (value + pubkey_hash)
//! - The index of the input being signed
//!
//! Signatures and public keys are excluded from the sighash to avoid
//! circularity and allow inputs to be signed independently in any order.

use ed25519_dalek::{Signer, Verifier};
use std::fmt;

use crate::error::CryptoError;
use crate::types::{Hash256, Transaction};

/// Ed25519 keypair for signing transactions.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Sign the sighash for one input, returning the raw 64-byte signature.
    pub fn sign_input(&self, tx: &Transaction, input_index: usize) -> Result<[u8; 64], CryptoError> {
        let hash = sighash(tx, input_index)?;
        Ok(self.signing_key.sign(hash.as_bytes()).to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key for verifying signatures and deriving addresses.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.verifying_key.as_bytes()
    }

    /// BLAKE3 hash of the raw 32-byte key, used in [`TxOutput`](crate::types::TxOutput).
    pub fn pubkey_hash(&self) -> Hash256 {
        Hash256(blake3::hash(self.verifying_key.as_bytes()).into())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let sig_arr: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig_arr);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.verifying_key.as_bytes()))
    }
}

/// Compute the sighash for one input.
pub fn sighash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(&tx.version.to_le_bytes());
    hasher.update(&tx.lock_time.to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.previous_output.txid.as_bytes());
        hasher.update(&input.previous_output.index.to_le_bytes());
        hasher.update(&input.sequence.to_le_bytes());
    }
    for output in &tx.outputs {
        hasher.update(&output.value.to_le_bytes());
        hasher.update(output.pubkey_hash.as_bytes());
    }
    hasher.update(&(input_index as u64).to_le_bytes());
    Ok(Hash256(hasher.finalize().into()))
}

/// Verify one input's signature and pubkey against the output it spends.
///
/// Checks that the carried public key hashes to `expected_pubkey_hash` and
/// that the signature covers this input's sighash.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    expected_pubkey_hash: &Hash256,
) -> Result<(), CryptoError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        })?;
    let pubkey = PublicKey::from_bytes(&input.public_key)?;
    if pubkey.pubkey_hash() != *expected_pubkey_hash {
        return Err(CryptoError::PubkeyHashMismatch);
    }
    let hash = sighash(tx, input_index)?;
    pubkey.verify(hash.as_bytes(), &input.signature)
}
