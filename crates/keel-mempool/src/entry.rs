//! The pooled transaction record and the fee ordering predicate.

use std::time::Instant;

use keel_core::types::{Hash256, Transaction};

use crate::packages::PackageId;
use crate::reject::RejectReason;

/// Accounted bookkeeping overhead per pooled transaction, on top of the
/// serialized weight. Covers the record itself plus its share of the index
/// maps.
pub const POOLED_TX_OVERHEAD: u64 = 192;

/// A transaction held in the pool, together with its bookkeeping.
///
/// Sort linkage (`better`/`worse`/`sort_rank`) is owned by the ordering
/// index and only touched through it.
#[derive(Debug, Clone)]
pub struct PooledTx {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Total input value minus total output value, in keels.
    pub fee: u64,
    /// Serialized size, in weight units.
    pub weight: u64,
    /// Total input value, in keels.
    pub input_value: u64,
    /// Signature operations charged against block templates.
    pub sigop_cost: u64,
    /// Bytes charged against the pool size ceiling. Fixed at admission.
    pub footprint: u64,
    pub first_seen: Instant,
    /// Refreshed every time the transaction is re-offered; expiry keys off it.
    pub last_seen: Instant,
    pub last_sent: Option<Instant>,
    /// Peers the txid was announced to.
    pub inv_sent_cnt: u32,
    /// Peers the full transaction was served to.
    pub sent_cnt: u32,
    /// Per-input flag: does this input spend another pooled transaction.
    /// `None` once every parent has confirmed.
    pub mem_inputs: Option<Vec<bool>>,
    /// Count of set flags in `mem_inputs`.
    pub mem_input_cnt: u32,
    /// Submitted by the local wallet rather than received from a peer.
    pub local: bool,
    /// Any input carries a final sequence, opting out of replacement.
    pub is_final: bool,
    /// Why this transaction is held back from relay, if it is.
    pub blocked: Option<RejectReason>,
    pub(crate) better: Option<Hash256>,
    pub(crate) worse: Option<Hash256>,
    pub(crate) sort_rank: u64,
    pub(crate) in_packages: Vec<PackageId>,
}

impl PooledTx {
    /// Fee rate in keels per 1000 weight units.
    pub fn fee_rate_per_kw(&self) -> u64 {
        if self.weight == 0 {
            return 0;
        }
        self.fee.saturating_mul(1000) / self.weight
    }

    /// Bytes a transaction of the given weight is charged against the pool.
    pub fn expected_footprint(weight: u64) -> u64 {
        weight + POOLED_TX_OVERHEAD
    }

    /// Whether input `index` spends a still-unconfirmed pooled output.
    pub fn spends_mem_input(&self, index: usize) -> bool {
        self.mem_inputs
            .as_ref()
            .and_then(|flags| flags.get(index))
            .copied()
            .unwrap_or(false)
    }
}

/// The total order over pooled transactions, best first.
///
/// Fee rates are compared by cross-multiplication so no precision is lost:
/// `a` outranks `b` iff `a.fee * b.weight > b.fee * a.weight`. Ties fall to
/// fewer unconfirmed inputs, then to txid bytes, so the order is total over
/// distinct transactions.
pub fn ranks_better(a: &PooledTx, b: &PooledTx) -> bool {
    let lhs = u128::from(a.fee) * u128::from(b.weight);
    let rhs = u128::from(b.fee) * u128::from(a.weight);
    if lhs != rhs {
        return lhs > rhs;
    }
    if a.mem_input_cnt != b.mem_input_cnt {
        return a.mem_input_cnt < b.mem_input_cnt;
    }
    a.txid.0 > b.txid.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::types::{OutPoint, TxInput, TxOutput};

    fn entry(fee: u64, weight: u64, mem_input_cnt: u32, txid_byte: u8) -> PooledTx {
        let now = Instant::now();
        PooledTx {
            tx: Transaction {
                version: 1,
                inputs: vec![TxInput {
                    previous_output: OutPoint::new(Hash256([txid_byte; 32]), 0),
                    signature: vec![],
                    public_key: vec![],
                    sequence: 0,
                }],
                outputs: vec![TxOutput {
                    value: 1,
                    pubkey_hash: Hash256::ZERO,
                }],
                lock_time: 0,
            },
            txid: Hash256([txid_byte; 32]),
            fee,
            weight,
            input_value: fee + 1,
            sigop_cost: 1,
            footprint: PooledTx::expected_footprint(weight),
            first_seen: now,
            last_seen: now,
            last_sent: None,
            inv_sent_cnt: 0,
            sent_cnt: 0,
            mem_inputs: None,
            mem_input_cnt,
            local: false,
            is_final: false,
            blocked: None,
            better: None,
            worse: None,
            sort_rank: 0,
            in_packages: Vec::new(),
        }
    }

    #[test]
    fn higher_fee_rate_ranks_better() {
        let a = entry(200, 100, 0, 1);
        let b = entry(100, 100, 0, 2);
        assert!(ranks_better(&a, &b));
        assert!(!ranks_better(&b, &a));
    }

    #[test]
    fn cross_multiplication_avoids_truncation() {
        // 1001/1000 beats 1/1 truncated to the same integer rate.
        let a = entry(1001, 1000, 0, 1);
        let b = entry(1, 1, 0, 2);
        assert!(ranks_better(&a, &b));
    }

    #[test]
    fn equal_rate_prefers_fewer_mem_inputs() {
        let a = entry(100, 100, 0, 1);
        let b = entry(100, 100, 2, 2);
        assert!(ranks_better(&a, &b));
    }

    #[test]
    fn full_tie_breaks_on_txid() {
        let a = entry(100, 100, 0, 9);
        let b = entry(100, 100, 0, 3);
        assert!(ranks_better(&a, &b));
        assert!(!ranks_better(&b, &a));
    }

    #[test]
    fn fee_rate_per_kw_rounds_down() {
        let a = entry(1, 1000, 0, 1);
        assert_eq!(a.fee_rate_per_kw(), 1);
        let b = entry(1, 1001, 0, 2);
        assert_eq!(b.fee_rate_per_kw(), 0);
    }
}
