//! Shared fixtures for the pool test suites.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use keel_core::error::{CryptoError, KeelError};
use keel_core::types::{
    Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput, UtxoEntry,
};
use keel_core::traits::{RelayNotifier, ScriptVerifier, UtxoView};
use parking_lot::RwLock;

use crate::config::MempoolConfig;
use crate::state::MempoolState;

/// In-memory UTXO view backed by a map the test mutates directly.
#[derive(Default)]
pub struct MockChain {
    utxos: RwLock<std::collections::HashMap<OutPoint, UtxoEntry>>,
    confirmed: RwLock<std::collections::HashSet<Hash256>>,
    tip: AtomicU64,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_utxo(&self, outpoint: OutPoint, value: u64) {
        self.utxos.write().insert(
            outpoint,
            UtxoEntry {
                output: TxOutput {
                    value,
                    pubkey_hash: Hash256::ZERO,
                },
                block_height: 0,
                is_coinbase: false,
            },
        );
    }

    pub fn add_coinbase_utxo(&self, outpoint: OutPoint, value: u64, block_height: u64) {
        self.utxos.write().insert(
            outpoint,
            UtxoEntry {
                output: TxOutput {
                    value,
                    pubkey_hash: Hash256::ZERO,
                },
                block_height,
                is_coinbase: true,
            },
        );
    }

    pub fn remove_utxo(&self, outpoint: &OutPoint) {
        self.utxos.write().remove(outpoint);
    }

    pub fn set_tip(&self, height: u64) {
        self.tip.store(height, Ordering::Relaxed);
    }

    pub fn mark_confirmed(&self, txid: Hash256) {
        self.confirmed.write().insert(txid);
    }
}

impl UtxoView for MockChain {
    fn resolve_output(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, KeelError> {
        Ok(self.utxos.read().get(outpoint).cloned())
    }

    fn tx_confirmed(&self, txid: &Hash256) -> Result<bool, KeelError> {
        Ok(self.confirmed.read().contains(txid))
    }

    fn tip_height(&self) -> u64 {
        self.tip.load(Ordering::Relaxed)
    }
}

/// Verifier that approves every input, for tests not about signatures.
pub struct AcceptAllScripts;

impl ScriptVerifier for AcceptAllScripts {
    fn verify_input(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _spent: &UtxoEntry,
    ) -> Result<(), CryptoError> {
        Ok(())
    }
}

/// Verifier that fails every input.
pub struct RejectAllScripts;

impl ScriptVerifier for RejectAllScripts {
    fn verify_input(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _spent: &UtxoEntry,
    ) -> Result<(), CryptoError> {
        Err(CryptoError::VerificationFailed)
    }
}

/// Relay stub counting announcements.
#[derive(Default)]
pub struct CountingRelay {
    pub announced: AtomicUsize,
}

impl RelayNotifier for CountingRelay {
    fn announce_tx(&self, _txid: &Hash256, _origin_peer: Option<u32>, _fee_rate: u64) -> usize {
        self.announced.fetch_add(1, Ordering::Relaxed);
        1
    }
}

/// A pool state over a fresh mock chain, both returned for steering.
pub fn state_with_chain(cfg: MempoolConfig) -> (MempoolState, Arc<MockChain>) {
    let chain = Arc::new(MockChain::new());
    let state = MempoolState::new(cfg, chain.clone(), Arc::new(AcceptAllScripts), None);
    (state, chain)
}

/// Build a transaction spending `inputs` into outputs of the given values.
pub fn make_tx(inputs: &[OutPoint], outputs: &[u64]) -> Transaction {
    make_tx_seq(inputs, outputs, 0)
}

/// Same, with an explicit sequence on every input.
pub fn make_tx_seq(inputs: &[OutPoint], outputs: &[u64], sequence: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|op| TxInput {
                previous_output: *op,
                signature: vec![0; 64],
                public_key: vec![0; 32],
                sequence,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|value| TxOutput {
                value: *value,
                pubkey_hash: Hash256::ZERO,
            })
            .collect(),
        lock_time: 0,
    }
}

/// Pad a transaction's weight by growing its first input's signature.
pub fn pad_tx(tx: &mut Transaction, extra: usize) {
    if let Some(input) = tx.inputs.first_mut() {
        input.signature.extend(std::iter::repeat_n(0u8, extra));
    }
}

/// A confirmed outpoint funded on the chain, derived from a seed byte.
pub fn funded_outpoint(chain: &MockChain, seed: u8, value: u64) -> OutPoint {
    let op = OutPoint::new(Hash256([seed; 32]), 0);
    chain.add_utxo(op, value);
    op
}

pub fn make_coinbase(value: u64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: vec![tag],
            public_key: vec![],
            sequence: 0,
        }],
        outputs: vec![TxOutput {
            value,
            pubkey_hash: Hash256([tag; 32]),
        }],
        lock_time: 0,
    }
}

/// Wrap transactions into a block behind a fresh coinbase.
pub fn make_block(txs: Vec<Transaction>, tag: u8) -> Block {
    let mut transactions = vec![make_coinbase(50 * 100_000_000, tag)];
    transactions.extend(txs);
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256([tag; 32]),
            timestamp: 0,
            difficulty_target: u64::MAX,
            nonce: tag as u64,
        },
        transactions,
    }
}
