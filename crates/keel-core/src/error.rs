//! Error types for the Keel protocol.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("invalid signature on input {index}")] InvalidSignature { index: usize },
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("oversized: {size} > {max}")] OversizedTransaction { size: u64, max: u64 },
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
    #[error("value overflow")] ValueOverflow,
    #[error("serialization: {0}")] Serialization(String),
    #[error("immature coinbase UTXO at input {index}")] ImmatureCoinbase { index: usize },
    #[error("null outpoint in non-coinbase input {0}")] NullOutpointInRegularTx(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match expected")] PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("storage: {0}")] Storage(String),
}

#[derive(Error, Debug)]
pub enum KeelError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Chain(#[from] ChainError),
}
