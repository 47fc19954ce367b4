//! The shared, lock-guarded pool handle.

use std::sync::Arc;
use std::time::Instant;

use keel_core::error::KeelError;
use keel_core::types::{Block, Hash256, OutPoint, Transaction};
use keel_core::traits::{RelayNotifier, ScriptVerifier, UtxoView};
use parking_lot::Mutex;

use crate::admit::{AdmitOutcome, TxKnowledge};
use crate::config::MempoolConfig;
use crate::entry::PooledTx;
use crate::packages::{FeeBand, FeePackage};
use crate::state::MempoolState;

/// The transaction pool as the rest of the node sees it: one mutex around
/// [`MempoolState`], every operation a single critical section.
pub struct Mempool {
    state: Mutex<MempoolState>,
}

impl Mempool {
    pub fn new(
        cfg: MempoolConfig,
        chain: Arc<dyn UtxoView>,
        verifier: Arc<dyn ScriptVerifier>,
        relay: Option<Arc<dyn RelayNotifier>>,
    ) -> Self {
        Self {
            state: Mutex::new(MempoolState::new(cfg, chain, verifier, relay)),
        }
    }

    /// Offer a transaction received from the network.
    pub fn admit(
        &self,
        tx: Transaction,
        trusted: bool,
        local: bool,
    ) -> Result<AdmitOutcome, KeelError> {
        self.state.lock().admit(tx, trusted, local)
    }

    /// Submit a wallet transaction: trusted and local, so it bypasses
    /// script verification, network size and fee policy, and the
    /// replacement safeguards that only bind third-party offers.
    pub fn submit_local_tx(&self, tx: Transaction) -> Result<AdmitOutcome, KeelError> {
        self.state.lock().admit(tx, true, true)
    }

    /// Whether an announced txid should be downloaded.
    pub fn need_this_tx(&self, txid: &Hash256) -> Result<bool, KeelError> {
        self.state.lock().need_this_tx(txid)
    }

    pub fn tx_knowledge(&self, txid: &Hash256) -> Result<TxKnowledge, KeelError> {
        self.state.lock().tx_knowledge(txid)
    }

    pub fn unmark_pending(&self, txid: &Hash256) {
        self.state.lock().unmark_pending(txid);
    }

    pub fn block_mined(&self, block: &Block) {
        self.state.lock().block_mined(block);
    }

    pub fn block_undone(&self, block: &Block) {
        self.state.lock().block_undone(block);
    }

    /// Pause incremental sort maintenance around a chain of block commits.
    pub fn suppress_sorting(&self, suppress: bool) {
        self.state.lock().suppress_sorting(suppress);
    }

    /// Every pooled txid, best fee rate first, parents before children.
    pub fn sorted(&self) -> Vec<Hash256> {
        self.state.lock().sorted()
    }

    /// The block-template order, with CPFP packages pulled forward.
    pub fn sorted_with_cpfp(&self) -> Vec<Hash256> {
        self.state.lock().sorted_with_cpfp()
    }

    pub fn template_order(&self, max_weight: u64) -> Vec<Hash256> {
        self.state.lock().template_order(max_weight)
    }

    pub fn fee_histogram(&self, band_weight: u64) -> Vec<FeeBand> {
        self.state.lock().fee_histogram(band_weight)
    }

    pub fn packages_snapshot(&self) -> Vec<FeePackage> {
        self.state.lock().packages_snapshot()
    }

    /// Clone of a pooled entry, if present.
    pub fn get(&self, txid: &Hash256) -> Option<PooledTx> {
        self.state.lock().get(txid).cloned()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.state.lock().contains(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.state.lock().spender_of(outpoint)
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size()
    }

    pub fn total_weight(&self) -> u64 {
        self.state.lock().total_weight()
    }

    pub fn fee_floor_per_kw(&self) -> u64 {
        self.state.lock().fee_floor_per_kw()
    }

    /// Periodic maintenance; drive from the node's housekeeping timer.
    pub fn tick(&self, now: Instant) {
        self.state.lock().tick(now);
    }

    /// Count and log cross-index inconsistencies.
    pub fn consistency_check(&self) -> usize {
        self.state.lock().consistency_check()
    }

    pub fn counters(&self) -> std::collections::BTreeMap<String, u64> {
        self.state.lock().counters().clone()
    }

    /// Run a closure under the pool lock. For callers needing a compound
    /// read snapshot without re-locking per query.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MempoolState) -> R) -> R {
        f(&mut self.state.lock())
    }
}
