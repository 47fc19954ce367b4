//! Rejected-transaction quarantine.
//!
//! Every rejection is remembered in a fixed-capacity circular index so the
//! same txid is not fetched and re-validated over and over. Recoverable
//! rejections (reason code 200 and up) keep the serialized payload around:
//! a transaction parked on a missing parent can be retried the moment the
//! parent shows up, without a network round trip.

use std::fmt;
use std::time::Instant;

use keel_core::types::{Hash256, Transaction};
use tracing::error;

use crate::state::MempoolState;

/// Accounted overhead per rejected entry, on top of any retained payload.
pub const REJECTED_TX_OVERHEAD: u64 = 80;

/// Why a transaction was refused, with its wire code.
///
/// Codes below 200 are permanent verdicts and the payload is dropped.
/// Codes at 200 and above are circumstantial: the payload is retained and
/// the transaction may be admitted later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    /// Relay is administratively disabled.
    Disabled = 1,
    /// Exceeds the network transaction weight limit.
    TooBig = 101,
    /// Structurally malformed (no outputs, value overflow, bad encoding).
    Format = 102,
    /// Declared and actual payload lengths disagree.
    LenMismatch = 103,
    /// No inputs at all.
    EmptyInput = 104,
    /// Outputs exceed inputs.
    Overspend = 154,
    /// Input references a nonexistent output index or duplicates another.
    BadInput = 157,
    /// Signature verification failed.
    ScriptFail = 158,
    /// Retained payload was purged to stay within budget.
    DataPurged = 200,
    /// An input's source transaction is unknown; parked until it arrives.
    NoTxou = 202,
    /// An ancestor of this transaction was itself rejected.
    BadParent = 203,
    /// Fee rate below the current floor.
    LowFee = 205,
    /// Spends an unconfirmed output while that is not accepted.
    NotMined = 208,
    /// Spends a coinbase output that has not matured.
    CbImmature = 209,
    /// Replacement does not pay more than what it displaces.
    RbfLowFee = 210,
    /// Replacement conflicts with a transaction marked final.
    RbfFinal = 211,
    /// Replacement would displace too many transactions.
    RbfLimit = 212,
    /// Displaced by a better-paying replacement.
    Replaced = 213,
}

impl RejectReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Recoverable rejections retain the payload for a later retry.
    pub fn is_recoverable(self) -> bool {
        self.code() >= 200
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disabled => "DISABLED",
            Self::TooBig => "TOO_BIG",
            Self::Format => "FORMAT",
            Self::LenMismatch => "LEN_MISMATCH",
            Self::EmptyInput => "EMPTY_INPUT",
            Self::Overspend => "OVERSPEND",
            Self::BadInput => "BAD_INPUT",
            Self::ScriptFail => "SCRIPT_FAIL",
            Self::DataPurged => "DATA_PURGED",
            Self::NoTxou => "NO_TXOU",
            Self::BadParent => "BAD_PARENT",
            Self::LowFee => "LOW_FEE",
            Self::NotMined => "NOT_MINED",
            Self::CbImmature => "CB_INMATURE",
            Self::RbfLowFee => "RBF_LOWFEE",
            Self::RbfFinal => "RBF_FINAL",
            Self::RbfLimit => "RBF_100",
            Self::Replaced => "REPLACED",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.label(), self.code())
    }
}

/// One quarantined transaction.
#[derive(Debug, Clone)]
pub struct RejectedTx {
    pub txid: Hash256,
    pub reason: RejectReason,
    /// Retained only for recoverable reasons.
    pub tx: Option<Transaction>,
    /// The missing parent this entry waits on, when reason is `NoTxou`.
    pub waiting_for: Option<Hash256>,
    /// Bytes charged against the rejected budget.
    pub footprint: u64,
    /// Slot in the circular ring.
    pub(crate) slot: usize,
    pub since: Instant,
}

impl MempoolState {
    /// Quarantine a transaction that failed admission.
    ///
    /// Recoverable reasons keep the payload; `missing_parent` additionally
    /// registers the entry on the waiting list keyed by that parent.
    pub(crate) fn quarantine_tx(
        &mut self,
        txid: Hash256,
        tx: Transaction,
        reason: RejectReason,
        missing_parent: Option<Hash256>,
    ) {
        let raw_size = tx.encode().map(|b| b.len() as u64).unwrap_or(0);
        let (payload, footprint) = if reason.is_recoverable() {
            (Some(tx), REJECTED_TX_OVERHEAD + raw_size)
        } else {
            (None, REJECTED_TX_OVERHEAD)
        };
        self.bump_reason("TxRejected", reason);
        self.add_rejected(RejectedTx {
            txid,
            reason,
            tx: payload,
            waiting_for: missing_parent,
            footprint,
            slot: 0,
            since: Instant::now(),
        });
    }

    /// Insert into the rejected index, claiming the next ring slot.
    ///
    /// Slots are claimed strictly in arrival order, so the first live slot
    /// at or after the head is always the oldest entry; wrapping onto an
    /// occupied slot displaces it.
    pub(crate) fn add_rejected(&mut self, mut txr: RejectedTx) {
        if self.rejected.contains_key(&txr.txid) {
            self.delete_rejected(&txr.txid);
        }
        if let Some(occupant) = self.ring[self.ring_head] {
            self.delete_rejected(&occupant);
        }
        txr.slot = self.ring_head;
        self.ring[self.ring_head] = Some(txr.txid);
        self.ring_head = (self.ring_head + 1) % self.ring.len();

        self.rejected_size += txr.footprint;
        if txr.tx.is_some() {
            if let Some(tx) = &txr.tx {
                for input in &tx.inputs {
                    self.rejected_spends
                        .entry(input.previous_output)
                        .or_default()
                        .push(txr.txid);
                }
            }
            if let Some(parent) = txr.waiting_for {
                self.waiting.entry(parent).or_default().push(txr.txid);
                self.waiting_size += txr.footprint;
            }
        }
        self.rejected.insert(txr.txid, txr);
        self.enforce_rejected_budgets();
    }

    /// Remove one entry from the rejected index, unhooking every back
    /// reference. Returns the entry so a retry can reuse its payload.
    pub(crate) fn delete_rejected(&mut self, txid: &Hash256) -> Option<RejectedTx> {
        let txr = self.rejected.remove(txid)?;
        self.rejected_size -= txr.footprint;
        if let Some(tx) = &txr.tx {
            for input in &tx.inputs {
                if let Some(ids) = self.rejected_spends.get_mut(&input.previous_output) {
                    ids.retain(|id| id != txid);
                    if ids.is_empty() {
                        self.rejected_spends.remove(&input.previous_output);
                    }
                }
            }
            if let Some(parent) = txr.waiting_for {
                self.waiting_size -= txr.footprint;
                if let Some(ids) = self.waiting.get_mut(&parent) {
                    ids.retain(|id| id != txid);
                    if ids.is_empty() {
                        self.waiting.remove(&parent);
                    }
                }
            }
        }
        if txr.slot < self.ring.len() && self.ring[txr.slot] == Some(txr.txid) {
            self.ring[txr.slot] = None;
        }
        Some(txr)
    }

    /// Evict oldest-first until the waiting and rejected byte budgets hold.
    pub(crate) fn enforce_rejected_budgets(&mut self) {
        while self.waiting_size > self.cfg.waiting_max_bytes {
            match self.oldest_rejected(|txr| txr.waiting_for.is_some()) {
                Some(id) => {
                    self.delete_rejected(&id);
                    self.bump("TxRejectedWaitingPurged");
                }
                None => {
                    error!(
                        waiting_size = self.waiting_size,
                        "waiting budget exceeded with no waiting entries"
                    );
                    self.waiting_size = 0;
                    break;
                }
            }
        }
        while self.rejected_size > self.cfg.rejected_max_bytes {
            match self.oldest_rejected(|_| true) {
                Some(id) => {
                    self.delete_rejected(&id);
                    self.bump("TxRejectedPurged");
                }
                None => {
                    error!(
                        rejected_size = self.rejected_size,
                        "rejected budget exceeded with an empty ring"
                    );
                    self.rejected_size = 0;
                    break;
                }
            }
        }
    }

    /// The oldest live entry matching the filter, scanning forward from
    /// the head.
    fn oldest_rejected(&self, keep: impl Fn(&RejectedTx) -> bool) -> Option<Hash256> {
        for id in self.ring_in_age_order() {
            if self.rejected.get(&id).is_some_and(&keep) {
                return Some(id);
            }
        }
        None
    }

    /// Live entries, oldest first.
    fn ring_in_age_order(&self) -> Vec<Hash256> {
        let len = self.ring.len();
        (0..len)
            .filter_map(|i| self.ring[(self.ring_head + i) % len])
            .collect()
    }

    /// Grow or shrink the ring. Shrinking discards the oldest entries; live
    /// entries are re-packed in age order.
    pub fn resize_rejected_ring(&mut self, new_slots: usize) {
        let new_slots = new_slots.max(2);
        let mut live = self.ring_in_age_order();
        // Keep one slot vacant so the next insert displaces nothing.
        while live.len() >= new_slots {
            let oldest = live.remove(0);
            self.delete_rejected(&oldest);
        }
        self.ring = vec![None; new_slots];
        for (i, id) in live.iter().enumerate() {
            self.ring[i] = Some(*id);
            if let Some(txr) = self.rejected.get_mut(id) {
                txr.slot = i;
            }
        }
        self.ring_head = live.len() % new_slots;
    }

    /// Whether a txid is currently quarantined.
    pub fn is_rejected(&self, txid: &Hash256) -> bool {
        self.rejected.contains_key(txid)
    }

    pub fn rejected_entry(&self, txid: &Hash256) -> Option<&RejectedTx> {
        self.rejected.get(txid)
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn rejected_bytes(&self) -> u64 {
        self.rejected_size
    }

    pub fn waiting_bytes(&self) -> u64 {
        self.waiting_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MempoolConfig;
    use crate::testing::{make_tx, state_with_chain};
    use keel_core::types::OutPoint;

    // A waiting parent only belongs on NO_TXOU entries, so callers pass
    // some other recoverable reason when they just need a quarantined tx.
    fn reject_one(state: &mut MempoolState, seed: u8, reason: RejectReason) -> Hash256 {
        let tx = make_tx(&[OutPoint::new(Hash256([seed; 32]), 0)], &[1_000]);
        let txid = tx.txid().unwrap();
        state.quarantine_tx(txid, tx, reason, None);
        txid
    }

    #[test]
    fn reason_codes_match_the_wire() {
        assert_eq!(RejectReason::TooBig.code(), 101);
        assert_eq!(RejectReason::Overspend.code(), 154);
        assert_eq!(RejectReason::ScriptFail.code(), 158);
        assert_eq!(RejectReason::NoTxou.code(), 202);
        assert_eq!(RejectReason::LowFee.code(), 205);
        assert_eq!(RejectReason::Replaced.code(), 213);
        assert!(!RejectReason::ScriptFail.is_recoverable());
        assert!(RejectReason::NoTxou.is_recoverable());
        assert!(RejectReason::DataPurged.is_recoverable());
    }

    #[test]
    fn recoverable_rejections_keep_the_payload() {
        let (mut state, _chain) = state_with_chain(MempoolConfig::default());
        let kept = reject_one(&mut state, 1, RejectReason::CbImmature);
        let dropped = reject_one(&mut state, 2, RejectReason::ScriptFail);
        assert!(state.rejected_entry(&kept).unwrap().tx.is_some());
        assert!(state.rejected_entry(&dropped).unwrap().tx.is_none());
        assert!(state.rejected_entry(&kept).unwrap().footprint > REJECTED_TX_OVERHEAD);
        assert_eq!(
            state.rejected_entry(&dropped).unwrap().footprint,
            REJECTED_TX_OVERHEAD
        );
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn ring_displaces_the_oldest_when_full() {
        let cfg = MempoolConfig {
            rejected_slots: 4,
            ..MempoolConfig::default()
        };
        let (mut state, _chain) = state_with_chain(cfg);
        let first = reject_one(&mut state, 1, RejectReason::ScriptFail);
        for seed in 2u8..=6 {
            reject_one(&mut state, seed, RejectReason::ScriptFail);
        }
        assert!(!state.is_rejected(&first), "oldest entry must be displaced");
        assert!(state.rejected_count() <= 4);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn waiting_budget_purges_parked_entries() {
        let cfg = MempoolConfig {
            waiting_max_bytes: 300,
            ..MempoolConfig::default()
        };
        let (mut state, _chain) = state_with_chain(cfg);
        let parent = Hash256([200; 32]);
        for seed in 1u8..=8 {
            let tx = make_tx(&[OutPoint::new(Hash256([seed; 32]), 0)], &[1_000]);
            let txid = tx.txid().unwrap();
            state.quarantine_tx(txid, tx, RejectReason::NoTxou, Some(parent));
        }
        assert!(state.waiting_bytes() <= 300);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn rejected_budget_is_enforced() {
        let cfg = MempoolConfig {
            rejected_max_bytes: 500,
            ..MempoolConfig::default()
        };
        let (mut state, _chain) = state_with_chain(cfg);
        for seed in 1u8..=20 {
            reject_one(&mut state, seed, RejectReason::CbImmature);
        }
        assert!(state.rejected_bytes() <= 500);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn delete_unhooks_every_back_reference() {
        let (mut state, _chain) = state_with_chain(MempoolConfig::default());
        let parent = Hash256([200; 32]);
        let tx = make_tx(&[OutPoint::new(parent, 0)], &[1_000]);
        let txid = tx.txid().unwrap();
        state.quarantine_tx(txid, tx, RejectReason::NoTxou, Some(parent));
        assert!(state.waiting_bytes() > 0);

        state.delete_rejected(&txid);
        assert!(!state.is_rejected(&txid));
        assert_eq!(state.waiting_bytes(), 0);
        assert_eq!(state.rejected_bytes(), 0);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn resize_repacks_live_entries() {
        let cfg = MempoolConfig {
            rejected_slots: 16,
            ..MempoolConfig::default()
        };
        let (mut state, _chain) = state_with_chain(cfg);
        let mut ids = Vec::new();
        for seed in 1u8..=6 {
            ids.push(reject_one(&mut state, seed, RejectReason::CbImmature));
        }
        state.resize_rejected_ring(4);
        // Three newest survive; one slot stays vacant.
        assert_eq!(state.rejected_count(), 3);
        for id in &ids[3..] {
            assert!(state.is_rejected(id));
        }
        assert_eq!(state.consistency_check(), 0);
    }
}
