//! Trait interfaces for the Keel protocol.
//!
//! These traits define the contracts between crates:
//! - [`UtxoView`] — read-only chain/UTXO state (the full node implements)
//! - [`ScriptVerifier`] — input authorization checks (Ed25519 in production)
//! - [`RelayNotifier`] — transaction announcement to peers (the wire layer implements)

use crate::error::{CryptoError, KeelError};
use crate::types::{Hash256, OutPoint, Transaction, UtxoEntry};

/// Read-only view of the confirmed chain state.
///
/// The mempool resolves inputs and checks coinbase maturity through this
/// trait; it never mutates chain state.
pub trait UtxoView: Send + Sync {
    /// Look up a UTXO by outpoint. Returns `None` if spent or unknown.
    fn resolve_output(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, KeelError>;

    /// Whether a transaction with this id is already confirmed in a block.
    fn tx_confirmed(&self, txid: &Hash256) -> Result<bool, KeelError>;

    /// Current chain tip height.
    fn tip_height(&self) -> u64;
}

/// Per-input authorization check.
///
/// Must be safe to invoke concurrently: the mempool fans verification out
/// across worker threads, one call per input.
pub trait ScriptVerifier: Send + Sync {
    /// Verify that input `input_index` of `tx` is entitled to spend `spent`.
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &UtxoEntry,
    ) -> Result<(), CryptoError>;
}

/// Production verifier: Ed25519 signature over the input sighash plus
/// pubkey-hash binding to the spent output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl ScriptVerifier for Ed25519Verifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        spent: &UtxoEntry,
    ) -> Result<(), CryptoError> {
        crate::crypto::verify_input(tx, input_index, &spent.output.pubkey_hash)
    }
}

/// Transaction announcement hook.
///
/// The mempool calls this after accepting a routable transaction; the wire
/// layer turns it into inv messages. Returns the number of peers notified.
pub trait RelayNotifier: Send + Sync {
    fn announce_tx(&self, txid: &Hash256, origin_peer: Option<u32>, fee_rate_per_kw: u64) -> usize;
}
