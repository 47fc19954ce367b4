//! Keeping the pool consistent across block commits and reorgs.

use keel_core::types::{Block, Hash256, Transaction};
use tracing::{debug, error, info};

use crate::state::MempoolState;

impl MempoolState {
    /// A block was committed to the chain: drop every mined transaction,
    /// everything that conflicts with the block, and every quarantine entry
    /// the block settles, then retry whatever was parked on a mined parent.
    pub fn block_mined(&mut self, block: &Block) {
        if block.transactions.len() < 2 {
            return;
        }
        self.invalidate_packages();
        let was_suppressed = self.sorting_suppressed;
        self.sorting_suppressed = true;

        let mut mined = 0usize;
        let mut conflicted = 0usize;
        // Highest index first, so children leave before their parents.
        for tx in block.transactions.iter().skip(1).rev() {
            self.tx_mined(tx, &mut mined, &mut conflicted);
        }

        self.sorting_suppressed = was_suppressed;
        self.sort_dirty = true;

        for tx in block.transactions.iter().skip(1) {
            if let Ok(txid) = tx.txid() {
                if self.waiting.contains_key(&txid) {
                    self.retry_waiting_for(txid);
                }
            }
        }
        info!(
            mined,
            conflicted,
            remaining = self.pool.len(),
            "pool reconciled with a mined block"
        );
    }

    fn tx_mined(&mut self, tx: &Transaction, mined: &mut usize, conflicted: &mut usize) {
        let Ok(txid) = tx.txid() else {
            error!("unencodable transaction in a mined block");
            return;
        };
        if self.pool.contains_key(&txid) {
            // Children keep living; their inputs just confirmed.
            self.mark_inputs_confirmed(txid);
            self.delete_entry(txid, false, None);
            *mined += 1;
            self.bump("TxMined");
        } else {
            // Not ours. Anything spending the same outpoints is now
            // conflicted and goes, descendants included.
            for input in &tx.inputs {
                let op = input.previous_output;
                if let Some(&spender) = self.spent_outputs.get(&op) {
                    debug!(%spender, outpoint = %op, "dropping double spend of a mined input");
                    self.delete_entry(spender, true, None);
                    *conflicted += 1;
                    self.bump("TxMinedConflict");
                }
                if let Some(ids) = self.rejected_spends.get(&op) {
                    for id in ids.clone() {
                        self.delete_rejected(&id);
                        self.bump("TxRejectedMinedConflict");
                    }
                }
            }
        }
        self.delete_rejected(&txid);
        self.pending.remove(&txid);
    }

    /// Clear the mem-input flag on every pooled child of a transaction that
    /// just confirmed, then re-place the children in the fee order.
    pub(crate) fn mark_inputs_confirmed(&mut self, parent: Hash256) {
        let children = self.children_of(parent);
        for child in &children {
            let Some(entry) = self.pool.get_mut(child) else {
                continue;
            };
            let Some(flags) = entry.mem_inputs.as_mut() else {
                error!(%child, %parent, "pooled child with no mem-input flags");
                continue;
            };
            for (i, input) in entry.tx.inputs.iter().enumerate() {
                if input.previous_output.txid == parent && flags[i] {
                    flags[i] = false;
                    entry.mem_input_cnt -= 1;
                }
            }
            if entry.mem_input_cnt == 0 {
                entry.mem_inputs = None;
            }
        }
        self.reposition_children(children);
    }

    /// Set the mem-input flag on every pooled child of a transaction that
    /// came back from an undone block, then re-place the children so none
    /// sits above the restored parent.
    pub(crate) fn mark_inputs_unconfirmed(&mut self, parent: Hash256) {
        let children = self.children_of(parent);
        for child in &children {
            let Some(entry) = self.pool.get_mut(child) else {
                continue;
            };
            let input_count = entry.tx.inputs.len();
            let flags = entry.mem_inputs.get_or_insert_with(|| vec![false; input_count]);
            for (i, input) in entry.tx.inputs.iter().enumerate() {
                if input.previous_output.txid == parent && !flags[i] {
                    flags[i] = true;
                    entry.mem_input_cnt += 1;
                }
            }
        }
        self.reposition_children(children);
    }

    fn reposition_children(&mut self, children: Vec<Hash256>) {
        if children.is_empty() {
            return;
        }
        if self.sorting_suppressed {
            self.sort_dirty = true;
            return;
        }
        for child in children {
            self.resort_with_children(child);
        }
    }

    /// A block was undone in a reorg: return its transactions to the pool.
    ///
    /// They were valid under full verification when first admitted, so they
    /// come back trusted and exempt from fee policy; losing them to a floor
    /// raise mid-reorg would corrupt wallets tracking them. The caller must
    /// roll the UTXO view back first.
    pub fn block_undone(&mut self, block: &Block) {
        self.invalidate_packages();
        let mut restored = 0usize;
        for tx in block.transactions.iter().skip(1) {
            let Ok(txid) = tx.txid() else {
                error!("unencodable transaction in an undone block");
                continue;
            };
            self.delete_rejected(&txid);
            match self.admit_inner(tx.clone(), true, true, false) {
                Ok(outcome) if outcome.is_accepted() => {
                    self.mark_inputs_unconfirmed(txid);
                    restored += 1;
                    self.bump("TxUnMined");
                }
                Ok(outcome) => {
                    error!(%txid, ?outcome, "failed to restore an undone transaction");
                    self.bump("TxUnMinedLost");
                }
                Err(err) => {
                    error!(%txid, %err, "error restoring an undone transaction");
                    self.bump("TxUnMinedLost");
                }
            }
        }
        self.remove_excessive();
        info!(restored, remaining = self.pool.len(), "pool reconciled with an undone block");
    }

    /// Greedy block-template order: the CPFP order cut off at `max_weight`.
    pub fn template_order(&mut self, max_weight: u64) -> Vec<Hash256> {
        let mut weight = 0u64;
        let mut out = Vec::new();
        for txid in self.sorted_with_cpfp() {
            let Some(entry) = self.pool.get(&txid) else {
                continue;
            };
            if weight + entry.weight > max_weight {
                break;
            }
            weight += entry.weight;
            out.push(txid);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MempoolConfig;
    use crate::testing::{funded_outpoint, make_block, make_tx, state_with_chain};
    use keel_core::types::OutPoint;

    #[test]
    fn mining_a_parent_keeps_and_reflags_the_child() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let op = funded_outpoint(&chain, 1, 1_000_000);
        let parent = make_tx(&[op], &[995_000]);
        let parent_id = parent.txid().unwrap();
        let child = make_tx(&[OutPoint::new(parent_id, 0)], &[990_000]);
        let child_id = child.txid().unwrap();
        assert!(state.admit(parent.clone(), false, false).unwrap().is_accepted());
        assert!(state.admit(child, false, false).unwrap().is_accepted());

        // The chain applies the block, then the pool reconciles.
        chain.remove_utxo(&op);
        chain.add_utxo(OutPoint::new(parent_id, 0), 995_000);
        chain.mark_confirmed(parent_id);
        state.block_mined(&make_block(vec![parent], 1));

        assert!(!state.contains(&parent_id));
        let entry = state.get(&child_id).unwrap();
        assert_eq!(entry.mem_input_cnt, 0);
        assert!(entry.mem_inputs.is_none());
        state.sorted();
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn mined_double_spend_drops_the_conflicting_cluster() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let op = funded_outpoint(&chain, 1, 1_000_000);
        let ours = make_tx(&[op], &[995_000]);
        let ours_id = ours.txid().unwrap();
        let child = make_tx(&[OutPoint::new(ours_id, 0)], &[990_000]);
        let child_id = child.txid().unwrap();
        assert!(state.admit(ours, false, false).unwrap().is_accepted());
        assert!(state.admit(child, false, false).unwrap().is_accepted());

        // Someone else's spend of the same outpoint confirms.
        let theirs = make_tx(&[op], &[994_000, 1]);
        chain.remove_utxo(&op);
        state.block_mined(&make_block(vec![theirs], 2));

        assert!(!state.contains(&ours_id));
        assert!(!state.contains(&child_id));
        assert!(state.is_empty());
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn mined_parent_releases_parked_children() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let op = funded_outpoint(&chain, 1, 1_000_000);
        let parent = make_tx(&[op], &[995_000]);
        let parent_id = parent.txid().unwrap();
        let child = make_tx(&[OutPoint::new(parent_id, 0)], &[990_000]);
        let child_id = child.txid().unwrap();

        // The child arrives first and parks; the parent then confirms
        // straight into a block, never touching the pool.
        assert!(matches!(
            state.admit(child, false, false).unwrap(),
            crate::admit::AdmitOutcome::Parked { .. }
        ));
        chain.remove_utxo(&op);
        chain.add_utxo(OutPoint::new(parent_id, 0), 995_000);
        chain.mark_confirmed(parent_id);
        state.block_mined(&make_block(vec![parent], 3));

        assert!(state.contains(&child_id));
        assert_eq!(state.rejected_count(), 0);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn undoing_a_block_restores_its_transactions() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let op = funded_outpoint(&chain, 1, 1_000_000);
        let parent = make_tx(&[op], &[995_000]);
        let parent_id = parent.txid().unwrap();
        let child = make_tx(&[OutPoint::new(parent_id, 0)], &[990_000]);
        let child_id = child.txid().unwrap();
        assert!(state.admit(parent.clone(), false, false).unwrap().is_accepted());
        assert!(state.admit(child, false, false).unwrap().is_accepted());

        let block = make_block(vec![parent], 4);
        chain.remove_utxo(&op);
        chain.mark_confirmed(parent_id);
        state.block_mined(&block);
        assert!(!state.contains(&parent_id));
        assert_eq!(state.get(&child_id).unwrap().mem_input_cnt, 0);

        // Reorg: the chain rolls the block back, then the pool restores.
        chain.add_utxo(op, 1_000_000);
        state.block_undone(&block);

        assert!(state.contains(&parent_id));
        assert!(state.contains(&child_id));
        let entry = state.get(&child_id).unwrap();
        assert_eq!(entry.mem_input_cnt, 1, "child depends on the parent again");
        state.sorted();
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn template_order_respects_the_weight_budget() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        for seed in 1u8..=5 {
            let op = funded_outpoint(&chain, seed, 1_000_000);
            let tx = make_tx(&[op], &[1_000_000 - 2_000 * seed as u64]);
            assert!(state.admit(tx, false, false).unwrap().is_accepted());
        }
        let best = state.sorted()[0];
        let one = state.get(&best).unwrap().weight;
        let order = state.template_order(one * 3);
        assert_eq!(order.len(), 3);
        let total: u64 = order
            .iter()
            .map(|id| state.get(id).unwrap().weight)
            .sum();
        assert!(total <= one * 3);
    }
}
