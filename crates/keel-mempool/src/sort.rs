//! Fee ordering over the pool.
//!
//! The order lives in a doubly linked list threaded through the pooled
//! records, best paying first, with a sparse numeric rank on every node so
//! "does A outrank B" is a single integer comparison. Insertions take a
//! rank halfway between their neighbors; when a gap closes, only the
//! affected run of nodes is relabeled. A transaction is never placed above
//! its worst-ranked unconfirmed parent, so walking the list best to worst
//! always yields parents before children.

use std::collections::{HashMap, HashSet};

use keel_core::types::Hash256;
use tracing::error;

use crate::entry::ranks_better;
use crate::state::MempoolState;

/// Rank given to the head of an empty list, leaving room above it.
pub(crate) const SORT_START_RANK: u64 = 1 << 60;
/// Gap left between appended nodes.
pub(crate) const SORT_RANK_STEP: u64 = 10_000_000_000;

impl MempoolState {
    /// Place a newly pooled transaction into the order.
    ///
    /// The scan starts just below the worst-ranked unconfirmed parent, or
    /// at the head when every input is confirmed.
    pub(crate) fn add_to_sort(&mut self, txid: Hash256) {
        // A dirty list has stale links; touching it waits for the rebuild.
        if self.sorting_suppressed || self.sort_dirty {
            self.sort_dirty = true;
            return;
        }
        let Some(best) = self.best else {
            self.best = Some(txid);
            self.worst = Some(txid);
            if let Some(e) = self.pool.get_mut(&txid) {
                e.better = None;
                e.worse = None;
                e.sort_rank = SORT_START_RANK;
            }
            return;
        };
        let start = match self.find_worst_parent(txid) {
            None => Some(best),
            Some(parent) => self.pool.get(&parent).and_then(|e| e.worse),
        };
        self.insert_down_from(txid, start);
    }

    /// Walk down from `cur` to the first node the new transaction outranks
    /// and splice in before it, or append at the tail.
    fn insert_down_from(&mut self, txid: Hash256, mut cur: Option<Hash256>) {
        while let Some(c) = cur {
            let outranks = match (self.pool.get(&txid), self.pool.get(&c)) {
                (Some(a), Some(b)) => ranks_better(a, b),
                _ => {
                    error!(%txid, "sort insert against a missing entry");
                    return;
                }
            };
            if outranks {
                self.insert_before(txid, c);
                return;
            }
            cur = self.pool.get(&c).and_then(|e| e.worse);
        }
        let Some(old_worst) = self.worst else {
            return;
        };
        let mut base = self.rank_of(old_worst);
        if base > u64::MAX - SORT_RANK_STEP {
            self.reindex_everything();
            base = self.rank_of(old_worst);
        }
        let rank = base + SORT_RANK_STEP;
        if let Some(e) = self.pool.get_mut(&old_worst) {
            e.worse = Some(txid);
        }
        if let Some(e) = self.pool.get_mut(&txid) {
            e.better = Some(old_worst);
            e.worse = None;
            e.sort_rank = rank;
        }
        self.worst = Some(txid);
    }

    /// Splice `txid` in directly above `at`, then give it a rank.
    fn insert_before(&mut self, txid: Hash256, at: Hash256) {
        let at_better = self.pool.get(&at).and_then(|e| e.better);
        match at_better {
            None => {
                self.best = Some(txid);
                if let Some(e) = self.pool.get_mut(&txid) {
                    e.better = None;
                }
            }
            Some(b) => {
                if let Some(e) = self.pool.get_mut(&b) {
                    e.worse = Some(txid);
                }
                if let Some(e) = self.pool.get_mut(&txid) {
                    e.better = Some(b);
                }
            }
        }
        if let Some(e) = self.pool.get_mut(&txid) {
            e.worse = Some(at);
        }
        if let Some(e) = self.pool.get_mut(&at) {
            e.better = Some(txid);
        }
        self.fix_rank(txid);
    }

    /// Assign a rank between the neighbors of an already linked node,
    /// relabeling a run of successors when the gap has closed.
    fn fix_rank(&mut self, txid: Hash256) {
        let (better, worse) = match self.pool.get(&txid) {
            Some(e) => (e.better, e.worse),
            None => return,
        };
        let Some(better) = better else {
            let Some(worse) = worse else {
                self.set_rank(txid, SORT_START_RANK);
                return;
            };
            let worse_rank = self.rank_of(worse);
            if worse_rank > SORT_RANK_STEP {
                self.set_rank(txid, worse_rank - SORT_RANK_STEP);
            } else if worse_rank > 0 {
                self.set_rank(txid, worse_rank / 2);
            } else {
                // No room below zero; push the successors down instead.
                self.set_rank(txid, SORT_START_RANK);
                self.reindex_down(txid, SORT_RANK_STEP);
            }
            return;
        };
        let better_rank = self.rank_of(better);
        let Some(worse) = worse else {
            match better_rank.checked_add(SORT_RANK_STEP) {
                Some(rank) => self.set_rank(txid, rank),
                None => self.reindex_everything(),
            }
            return;
        };
        let diff = self.rank_of(worse).saturating_sub(better_rank);
        if diff >= 2 {
            self.set_rank(txid, better_rank + diff / 2);
            return;
        }
        // Neighbors are adjacent; relabel downward from the predecessor.
        self.reindex_down(better, SORT_RANK_STEP / 4);
    }

    /// Push ranks downward from `from` until the existing labels regain
    /// enough slack. Stops at the first node already far enough down.
    fn reindex_down(&mut self, from: Hash256, step: u64) {
        let mut index = self.rank_of(from);
        let mut cur = self.pool.get(&from).and_then(|e| e.worse);
        while let Some(c) = cur {
            index = match index.checked_add(step) {
                Some(i) => i,
                None => {
                    self.reindex_everything();
                    return;
                }
            };
            let next = match self.pool.get_mut(&c) {
                Some(e) => {
                    if e.sort_rank >= index {
                        return;
                    }
                    e.sort_rank = index;
                    e.worse
                }
                None => return,
            };
            cur = next;
        }
    }

    /// Relabel the whole list with a step sized to the pool, restoring
    /// maximal slack between every pair of neighbors.
    pub(crate) fn reindex_everything(&mut self) {
        let n = self.pool.len() as u64 + 2;
        let step = ((u64::MAX - SORT_START_RANK) / n).max(1);
        let mut rank = SORT_START_RANK;
        let mut cur = self.best;
        while let Some(c) = cur {
            match self.pool.get_mut(&c) {
                Some(e) => {
                    e.sort_rank = rank;
                    cur = e.worse;
                }
                None => break,
            }
            rank = rank.saturating_add(step);
        }
    }

    /// Unlink a node, leaving its neighbors connected.
    pub(crate) fn del_from_sort(&mut self, txid: Hash256) {
        if self.sorting_suppressed || self.sort_dirty {
            self.sort_dirty = true;
            return;
        }
        let (better, worse) = match self.pool.get(&txid) {
            Some(e) => (e.better, e.worse),
            None => return,
        };
        match better {
            None => self.best = worse,
            Some(b) => {
                if let Some(e) = self.pool.get_mut(&b) {
                    e.worse = worse;
                }
            }
        }
        match worse {
            None => self.worst = better,
            Some(w) => {
                if let Some(e) = self.pool.get_mut(&w) {
                    e.better = better;
                }
            }
        }
        if let Some(e) = self.pool.get_mut(&txid) {
            e.better = None;
            e.worse = None;
        }
    }

    /// Re-place a transaction whose effective fee rate or parent set
    /// changed, then every descendant, parents first.
    pub(crate) fn resort_with_children(&mut self, txid: Hash256) {
        if self.sorting_suppressed || self.sort_dirty {
            self.sort_dirty = true;
            return;
        }
        let mut queue = vec![txid];
        let mut qi = 0;
        while qi < queue.len() {
            let id = queue[qi];
            qi += 1;
            if !self.pool.contains_key(&id) {
                continue;
            }
            self.del_from_sort(id);
            self.add_to_sort(id);
            for child in self.children_of(id) {
                if !queue.contains(&child) {
                    queue.push(child);
                }
            }
        }
    }

    /// The unconfirmed parent ranked worst, bounding how high this
    /// transaction may sit.
    pub(crate) fn find_worst_parent(&self, txid: Hash256) -> Option<Hash256> {
        let entry = self.pool.get(&txid)?;
        let flags = entry.mem_inputs.as_ref()?;
        let mut worst: Option<(u64, Hash256)> = None;
        for (i, set) in flags.iter().enumerate() {
            if !set {
                continue;
            }
            let parent = entry.tx.inputs[i].previous_output.txid;
            let Some(parent_entry) = self.pool.get(&parent) else {
                error!(%txid, %parent, "mem-input flag points outside the pool");
                continue;
            };
            if worst.is_none_or(|(rank, _)| parent_entry.sort_rank > rank) {
                worst = Some((parent_entry.sort_rank, parent));
            }
        }
        worst.map(|(_, id)| id)
    }

    fn rank_of(&self, txid: Hash256) -> u64 {
        self.pool.get(&txid).map(|e| e.sort_rank).unwrap_or(0)
    }

    fn set_rank(&mut self, txid: Hash256, rank: u64) {
        if let Some(e) = self.pool.get_mut(&txid) {
            e.sort_rank = rank;
        }
    }

    /// Pause incremental order maintenance during bulk mutation. The list
    /// is rebuilt lazily on the next ordered read.
    pub fn suppress_sorting(&mut self, suppress: bool) {
        self.sorting_suppressed = suppress;
    }

    /// Every pooled txid, best fee rate first, parents before children.
    pub fn sorted(&mut self) -> Vec<Hash256> {
        if self.sort_dirty {
            if self.sorting_suppressed {
                return self.sorted_slow();
            }
            self.rebuild_sorted_list();
        }
        let mut out = Vec::with_capacity(self.pool.len());
        let mut cur = self.best;
        while let Some(c) = cur {
            out.push(c);
            cur = self.pool.get(&c).and_then(|e| e.worse);
        }
        out
    }

    /// Recompute the order from scratch: comparison sort, then a
    /// topological pass holding back any transaction until all of its
    /// in-pool parents have been emitted.
    pub(crate) fn sorted_slow(&self) -> Vec<Hash256> {
        let mut ids: Vec<Hash256> = self.pool.keys().copied().collect();
        ids.sort_by(|a, b| {
            match (self.pool.get(a), self.pool.get(b)) {
                (Some(x), Some(y)) => {
                    if ranks_better(x, y) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                }
                _ => std::cmp::Ordering::Equal,
            }
        });

        let mut result = Vec::with_capacity(ids.len());
        let mut placed: HashSet<Hash256> = HashSet::with_capacity(ids.len());
        let mut blocked_on: HashMap<Hash256, Vec<Hash256>> = HashMap::new();
        let mut stack: Vec<Hash256> = Vec::new();
        for id in ids {
            let missing = self.missing_parents_for(id, &placed);
            if !missing.is_empty() {
                for parent in missing {
                    blocked_on.entry(parent).or_default().push(id);
                }
                continue;
            }
            stack.push(id);
            while let Some(cur) = stack.pop() {
                if !placed.insert(cur) {
                    continue;
                }
                result.push(cur);
                if let Some(waiters) = blocked_on.remove(&cur) {
                    for waiter in waiters.into_iter().rev() {
                        if placed.contains(&waiter) {
                            continue;
                        }
                        if self.missing_parents_for(waiter, &placed).is_empty() {
                            stack.push(waiter);
                        }
                        // Still blocked waiters stay registered under their
                        // other missing parents and wake later.
                    }
                }
            }
        }
        result
    }

    fn missing_parents_for(&self, txid: Hash256, placed: &HashSet<Hash256>) -> Vec<Hash256> {
        let mut missing = Vec::new();
        let Some(entry) = self.pool.get(&txid) else {
            return missing;
        };
        let Some(flags) = &entry.mem_inputs else {
            return missing;
        };
        for (i, set) in flags.iter().enumerate() {
            if !set {
                continue;
            }
            let parent = entry.tx.inputs[i].previous_output.txid;
            if !placed.contains(&parent) && !missing.contains(&parent) {
                missing.push(parent);
            }
        }
        missing
    }

    /// Rebuild links and ranks from a full recompute, clearing the dirty
    /// flag.
    pub(crate) fn rebuild_sorted_list(&mut self) {
        self.sort_dirty = false;
        let order = self.sorted_slow();
        self.best = None;
        self.worst = None;
        let mut rank = SORT_START_RANK;
        let mut prev: Option<Hash256> = None;
        for id in order {
            if let Some(e) = self.pool.get_mut(&id) {
                e.sort_rank = rank;
                e.better = prev;
                e.worse = None;
            }
            match prev {
                None => self.best = Some(id),
                Some(p) => {
                    if let Some(pe) = self.pool.get_mut(&p) {
                        pe.worse = Some(id);
                    }
                }
            }
            prev = Some(id);
            rank += SORT_RANK_STEP;
        }
        self.worst = prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MempoolConfig;
    use crate::testing::{funded_outpoint, make_tx, state_with_chain};
    use keel_core::types::OutPoint;

    fn fee_of(state: &MempoolState, txid: &Hash256) -> u64 {
        state.get(txid).map(|e| e.fee).unwrap_or(0)
    }

    #[test]
    fn sorted_runs_best_to_worst() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let mut ids = Vec::new();
        for (seed, fee) in [(1u8, 3_000u64), (2, 9_000), (3, 6_000)] {
            let op = funded_outpoint(&chain, seed, 100_000);
            let tx = make_tx(&[op], &[100_000 - fee]);
            let outcome = state.admit(tx, false, false).unwrap();
            assert!(outcome.is_accepted());
            ids.push(outcome);
        }
        let order = state.sorted();
        assert_eq!(order.len(), 3);
        for pair in order.windows(2) {
            assert!(fee_of(&state, &pair[0]) >= fee_of(&state, &pair[1]));
        }
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn child_never_outranks_its_parent() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let op = funded_outpoint(&chain, 1, 1_000_000);
        let parent = make_tx(&[op], &[999_000]);
        let parent_id = parent.txid().unwrap();
        state.admit(parent, false, false).unwrap();
        // Child pays a far better rate but must still sit below the parent.
        let child = make_tx(&[OutPoint::new(parent_id, 0)], &[900_000]);
        let child_id = child.txid().unwrap();
        state.admit(child, false, false).unwrap();

        let order = state.sorted();
        let parent_pos = order.iter().position(|id| *id == parent_id).unwrap();
        let child_pos = order.iter().position(|id| *id == child_id).unwrap();
        assert!(parent_pos < child_pos);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn ranks_stay_strictly_increasing() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        for seed in 1u8..=8 {
            let op = funded_outpoint(&chain, seed, 100_000);
            let tx = make_tx(&[op], &[100_000 - 1_000 * seed as u64]);
            state.admit(tx, false, false).unwrap();
        }
        let order = state.sorted();
        let mut prev = None;
        for id in order {
            let rank = state.get(&id).unwrap().sort_rank;
            if let Some(p) = prev {
                assert!(rank > p, "ranks must grow down the list");
            }
            prev = Some(rank);
        }
    }

    #[test]
    fn adjacent_ranks_trigger_a_relabel() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let mut ids = Vec::new();
        for (seed, fee) in [(1u8, 9_000u64), (2, 3_000)] {
            let op = funded_outpoint(&chain, seed, 100_000);
            let tx = make_tx(&[op], &[100_000 - fee]);
            let id = tx.txid().unwrap();
            state.admit(tx, false, false).unwrap();
            ids.push(id);
        }
        // Close the gap between the two neighbors by hand.
        let base = state.get(&ids[0]).unwrap().sort_rank;
        state.get_mut(&ids[1]).unwrap().sort_rank = base + 1;
        // A mid-fee insertion now has no room and must relabel.
        let op = funded_outpoint(&chain, 3, 100_000);
        let tx = make_tx(&[op], &[100_000 - 6_000]);
        state.admit(tx, false, false).unwrap();

        let order = state.sorted();
        let mut prev = None;
        for id in order {
            let rank = state.get(&id).unwrap().sort_rank;
            if let Some(p) = prev {
                assert!(rank > p);
            }
            prev = Some(rank);
        }
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn suppressed_sorting_serves_a_slow_snapshot() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        state.suppress_sorting(true);
        for (seed, fee) in [(1u8, 2_000u64), (2, 8_000), (3, 5_000)] {
            let op = funded_outpoint(&chain, seed, 100_000);
            state
                .admit(make_tx(&[op], &[100_000 - fee]), false, false)
                .unwrap();
        }
        assert!(state.sort_dirty);
        let order = state.sorted();
        assert_eq!(order.len(), 3);
        for pair in order.windows(2) {
            assert!(fee_of(&state, &pair[0]) >= fee_of(&state, &pair[1]));
        }
        // Restoring maintenance rebuilds the links on the next read.
        state.suppress_sorting(false);
        let rebuilt = state.sorted();
        assert_eq!(rebuilt, order);
        assert!(!state.sort_dirty);
        assert_eq!(state.consistency_check(), 0);
    }

    #[test]
    fn reindex_everything_restores_slack() {
        let (mut state, chain) = state_with_chain(MempoolConfig::default());
        let mut ids = Vec::new();
        for (seed, fee) in [(1u8, 9_000u64), (2, 6_000), (3, 3_000)] {
            let op = funded_outpoint(&chain, seed, 100_000);
            let tx = make_tx(&[op], &[100_000 - fee]);
            let id = tx.txid().unwrap();
            state.admit(tx, false, false).unwrap();
            ids.push(id);
        }
        state.get_mut(&ids[2]).unwrap().sort_rank = u64::MAX;
        state.reindex_everything();
        let order = state.sorted();
        assert_eq!(order, ids);
        let last = state.get(&ids[2]).unwrap().sort_rank;
        assert!(last < u64::MAX - SORT_RANK_STEP);
    }
}
