//! Core protocol types: transactions, blocks, UTXOs.
//!
//! All monetary values are in keels (1 KEEL = 10^8 keels).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::TransactionError;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3) and block header hashes (SHA-256).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Ed25519 signature (64 bytes). Empty for coinbase inputs.
    pub signature: Vec<u8>,
    /// Ed25519 public key (32 bytes). Empty for coinbase inputs.
    pub public_key: Vec<u8>,
    /// Relative sequence. At or above [`FINAL_SEQUENCE`](crate::constants::FINAL_SEQUENCE)
    /// the input opts out of replacement.
    pub sequence: u32,
}

impl TxInput {
    /// Whether this input opts out of replace-by-fee.
    pub fn is_final(&self) -> bool {
        self.sequence >= crate::constants::FINAL_SEQUENCE
    }
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in keels.
    pub value: u64,
    /// BLAKE3 hash of the recipient's Ed25519 public key.
    pub pubkey_hash: Hash256,
}

/// A transaction transferring value between addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    ///
    /// Uses bincode with standard config for deterministic serialization.
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = self.encode()?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Canonical serialized form.
    pub fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Size metric used for fee-rate math: the serialized byte length.
    pub fn weight(&self) -> Result<u64, TransactionError> {
        Ok(self.encode()?.len() as u64)
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Whether any input opts out of replacement.
    pub fn is_final(&self) -> bool {
        self.inputs.iter().any(TxInput::is_final)
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u32,
    /// Hash of the previous block header.
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root of the block's transactions.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Compact difficulty target.
    pub difficulty_target: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    const HASH_SIZE: usize = 4 + 3 * 8 + 2 * 32;

    /// Compute the block header hash (double SHA-256) over a fixed
    /// little-endian byte layout.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header with proof-of-work.
    pub header: BlockHeader,
    /// Ordered list of transactions. First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Get the coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// An entry in the unspent transaction output set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    /// The unspent output.
    pub output: TxOutput,
    /// Height of the block containing this UTXO.
    pub block_height: u64,
    /// Whether this output is from a coinbase transaction.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Check if this UTXO has matured and can be spent.
    ///
    /// Coinbase outputs require [`COINBASE_MATURITY`](crate::constants::COINBASE_MATURITY)
    /// confirmations. Non-coinbase outputs are always mature.
    pub fn is_mature(&self, current_height: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        current_height + 1 - self.block_height >= crate::constants::COINBASE_MATURITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([7; 32]), 0),
                signature: vec![0; 64],
                public_key: vec![0; 32],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 50,
                pubkey_hash: Hash256::ZERO,
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn txid_is_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.txid().unwrap(), tx.txid().unwrap());
    }

    #[test]
    fn txid_changes_with_content() {
        let tx = sample_tx();
        let mut tx2 = tx.clone();
        tx2.lock_time = 1;
        assert_ne!(tx.txid().unwrap(), tx2.txid().unwrap());
    }

    #[test]
    fn weight_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(tx.weight().unwrap(), tx.encode().unwrap().len() as u64);
    }

    #[test]
    fn null_outpoint_round_trip() {
        let op = OutPoint::null();
        assert!(op.is_null());
        assert!(!OutPoint::new(Hash256([1; 32]), 0).is_null());
    }

    #[test]
    fn final_input_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_final());
        tx.inputs[0].sequence = u32::MAX;
        assert!(tx.is_final());
        tx.inputs[0].sequence = 0xffff_fffe;
        assert!(tx.is_final());
        tx.inputs[0].sequence = 0xffff_fffd;
        assert!(!tx.is_final());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.inputs[0].previous_output = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn coinbase_maturity() {
        let entry = UtxoEntry {
            output: TxOutput { value: 50, pubkey_hash: Hash256::ZERO },
            block_height: 10,
            is_coinbase: true,
        };
        assert!(!entry.is_mature(10));
        assert!(!entry.is_mature(108));
        assert!(entry.is_mature(109));
        let regular = UtxoEntry { is_coinbase: false, ..entry };
        assert!(regular.is_mature(10));
    }

    #[test]
    fn total_output_value_overflow() {
        let mut tx = sample_tx();
        tx.outputs = vec![
            TxOutput { value: u64::MAX, pubkey_hash: Hash256::ZERO },
            TxOutput { value: 1, pubkey_hash: Hash256::ZERO },
        ];
        assert!(tx.total_output_value().is_none());
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            difficulty_target: u64::MAX,
            nonce: 0,
        };
        let mut other = header.clone();
        other.nonce = 1;
        assert_ne!(header.hash(), other.hash());
    }
}
