//! Cross-index consistency verification.
//!
//! Walks every structure and counts disagreements instead of panicking, so
//! a damaged index surfaces in logs and counters while the node keeps
//! serving. Meant for debug builds, tests, and an operator RPC.

use std::collections::{HashMap, HashSet};

use keel_core::types::{Hash256, OutPoint};
use tracing::error;

use crate::entry::{ranks_better, PooledTx};
use crate::state::MempoolState;

impl MempoolState {
    /// Verify every invariant across the pool's indexes. Returns the number
    /// of defects found; each one is logged.
    pub fn consistency_check(&self) -> usize {
        let mut defects = 0usize;
        defects += self.check_pool_accounting();
        defects += self.check_spent_outputs();
        defects += self.check_mem_inputs();
        defects += self.check_rejected();
        if !self.packages_dirty {
            defects += self.check_packages();
        }
        if !self.sort_dirty {
            defects += self.check_sort_order();
        }
        defects
    }

    fn check_pool_accounting(&self) -> usize {
        let mut defects = 0;
        let mut size = 0u64;
        let mut weight = 0u64;
        for (txid, entry) in &self.pool {
            if entry.txid != *txid {
                error!(%txid, "entry keyed under a foreign txid");
                defects += 1;
            }
            if entry.footprint != PooledTx::expected_footprint(entry.weight) {
                error!(%txid, footprint = entry.footprint, "footprint drifted");
                defects += 1;
            }
            size += entry.footprint;
            weight += entry.weight;
        }
        if size != self.pool_size {
            error!(accounted = self.pool_size, actual = size, "pool size counter drifted");
            defects += 1;
        }
        if weight != self.pool_weight {
            error!(accounted = self.pool_weight, actual = weight, "pool weight counter drifted");
            defects += 1;
        }
        defects
    }

    fn check_spent_outputs(&self) -> usize {
        let mut defects = 0;
        let mut total_inputs = 0usize;
        for (txid, entry) in &self.pool {
            total_inputs += entry.tx.inputs.len();
            for input in &entry.tx.inputs {
                match self.spent_outputs.get(&input.previous_output) {
                    Some(spender) if spender == txid => {}
                    Some(spender) => {
                        error!(%txid, %spender, outpoint = %input.previous_output,
                            "spent-outputs entry points at the wrong spender");
                        defects += 1;
                    }
                    None => {
                        error!(%txid, outpoint = %input.previous_output,
                            "pooled input missing from spent-outputs");
                        defects += 1;
                    }
                }
            }
        }
        if total_inputs != self.spent_outputs.len() {
            error!(
                indexed = self.spent_outputs.len(),
                actual = total_inputs,
                "spent-outputs index holds stale entries"
            );
            defects += 1;
        }
        defects
    }

    fn check_mem_inputs(&self) -> usize {
        let mut defects = 0;
        for (txid, entry) in &self.pool {
            match &entry.mem_inputs {
                None => {
                    if entry.mem_input_cnt != 0 {
                        error!(%txid, "mem-input count without flags");
                        defects += 1;
                    }
                    for input in &entry.tx.inputs {
                        if self.pool.contains_key(&input.previous_output.txid) {
                            error!(%txid, "unflagged input spends a pooled parent");
                            defects += 1;
                        }
                    }
                }
                Some(flags) => {
                    if flags.len() != entry.tx.inputs.len() {
                        error!(%txid, "mem-input flags length mismatch");
                        defects += 1;
                        continue;
                    }
                    let mut cnt = 0u32;
                    let mut any = false;
                    for (i, set) in flags.iter().enumerate() {
                        let parent_pooled =
                            self.pool.contains_key(&entry.tx.inputs[i].previous_output.txid);
                        if *set != parent_pooled {
                            error!(%txid, input = i, "mem-input flag out of date");
                            defects += 1;
                        }
                        if *set {
                            cnt += 1;
                            any = true;
                        }
                    }
                    if cnt != entry.mem_input_cnt {
                        error!(%txid, "mem-input count drifted");
                        defects += 1;
                    }
                    if !any {
                        error!(%txid, "all-clear mem-input flags should be dropped");
                        defects += 1;
                    }
                }
            }
        }
        defects
    }

    fn check_rejected(&self) -> usize {
        let mut defects = 0;
        let mut size = 0u64;
        let mut waiting_size = 0u64;
        let mut spends: HashMap<OutPoint, usize> = HashMap::new();
        for (txid, txr) in &self.rejected {
            if txr.txid != *txid {
                error!(%txid, "rejected entry keyed under a foreign txid");
                defects += 1;
            }
            size += txr.footprint;
            if txr.reason.is_recoverable() != txr.tx.is_some() {
                error!(%txid, reason = %txr.reason, "payload retention disagrees with reason");
                defects += 1;
            }
            if txr.waiting_for.is_some() != (txr.reason == crate::reject::RejectReason::NoTxou) {
                error!(%txid, reason = %txr.reason, "waiting mark disagrees with reason");
                defects += 1;
            }
            if let Some(parent) = txr.waiting_for {
                waiting_size += txr.footprint;
                let listed = self
                    .waiting
                    .get(&parent)
                    .is_some_and(|ids| ids.contains(txid));
                if !listed {
                    error!(%txid, %parent, "parked entry missing from the waiting list");
                    defects += 1;
                }
            }
            if let Some(tx) = &txr.tx {
                for input in &tx.inputs {
                    *spends.entry(input.previous_output).or_insert(0) += 1;
                }
            }
            if self.ring.get(txr.slot).copied().flatten() != Some(*txid) {
                error!(%txid, slot = txr.slot, "rejected entry lost its ring slot");
                defects += 1;
            }
        }
        if size != self.rejected_size {
            error!(accounted = self.rejected_size, actual = size, "rejected size counter drifted");
            defects += 1;
        }
        if waiting_size != self.waiting_size {
            error!(accounted = self.waiting_size, actual = waiting_size,
                "waiting size counter drifted");
            defects += 1;
        }
        for (parent, ids) in &self.waiting {
            if ids.is_empty() {
                error!(%parent, "empty waiting list left behind");
                defects += 1;
            }
            for id in ids {
                let ok = self
                    .rejected
                    .get(id)
                    .is_some_and(|txr| txr.waiting_for == Some(*parent));
                if !ok {
                    error!(txid = %id, %parent, "waiting list points at a wrong entry");
                    defects += 1;
                }
            }
        }
        for (outpoint, ids) in &self.rejected_spends {
            let expected = spends.get(outpoint).copied().unwrap_or(0);
            if ids.len() != expected {
                error!(%outpoint, indexed = ids.len(), actual = expected,
                    "rejected-spends index out of date");
                defects += 1;
            }
        }
        let live_slots = self.ring.iter().flatten().count();
        if live_slots != self.rejected.len() {
            error!(ring = live_slots, map = self.rejected.len(), "ring and map disagree");
            defects += 1;
        }
        defects
    }

    fn check_packages(&self) -> usize {
        let mut defects = 0;
        for (pid, pkg) in &self.packages {
            if pkg.txs.len() < 2 {
                error!(package = pid, "package below two members");
                defects += 1;
            }
            let mut fee = 0u64;
            let mut weight = 0u64;
            let mut seen: HashSet<Hash256> = HashSet::new();
            for member in &pkg.txs {
                if !seen.insert(*member) {
                    error!(package = pid, txid = %member, "duplicate package member");
                    defects += 1;
                }
                match self.pool.get(member) {
                    Some(entry) => {
                        fee += entry.fee;
                        weight += entry.weight;
                        if !entry.in_packages.contains(pid) {
                            error!(package = pid, txid = %member,
                                "member lacks its package back reference");
                            defects += 1;
                        }
                    }
                    None => {
                        error!(package = pid, txid = %member, "package member is not pooled");
                        defects += 1;
                    }
                }
            }
            if let Some(root) = pkg.txs.first() {
                if self.pool.get(root).is_some_and(|e| e.mem_input_cnt != 0) {
                    error!(package = pid, txid = %root, "package root has unconfirmed parents");
                    defects += 1;
                }
            }
            if fee != pkg.fee || weight != pkg.weight {
                error!(package = pid, "package aggregates drifted");
                defects += 1;
            }
        }
        for (txid, entry) in &self.pool {
            for pid in &entry.in_packages {
                let ok = self
                    .packages
                    .get(pid)
                    .is_some_and(|pkg| pkg.txs.contains(txid));
                if !ok {
                    error!(%txid, package = pid, "back reference to a package not holding it");
                    defects += 1;
                }
            }
        }
        defects
    }

    fn check_sort_order(&self) -> usize {
        let mut defects = 0;
        let mut position: HashMap<Hash256, usize> = HashMap::new();
        let mut prev: Option<Hash256> = None;
        let mut cur = self.best;
        while let Some(c) = cur {
            let Some(entry) = self.pool.get(&c) else {
                error!(txid = %c, "sort link to a transaction not pooled");
                return defects + 1;
            };
            if entry.better != prev {
                error!(txid = %c, "backward sort link broken");
                defects += 1;
            }
            if let Some(p) = prev {
                let prev_entry = self.pool.get(&p);
                if let Some(pe) = prev_entry {
                    if pe.sort_rank >= entry.sort_rank {
                        error!(txid = %c, "sort ranks not strictly increasing");
                        defects += 1;
                    }
                    // Adjacent out-of-order pairs are legal only when the
                    // later one waits on a pooled parent above it.
                    if ranks_better(entry, pe) && entry.mem_input_cnt == 0 {
                        error!(txid = %c, "fee order violated without a parent constraint");
                        defects += 1;
                    }
                }
            }
            if position.insert(c, position.len()).is_some() {
                error!(txid = %c, "sort list visits a transaction twice");
                return defects + 1;
            }
            prev = Some(c);
            cur = entry.worse;
        }
        if self.worst != prev {
            error!("worst pointer does not close the sort list");
            defects += 1;
        }
        if position.len() != self.pool.len() {
            error!(
                listed = position.len(),
                pooled = self.pool.len(),
                "sort list does not cover the pool"
            );
            defects += 1;
        }
        // Parents must precede their children.
        for (txid, entry) in &self.pool {
            let Some(flags) = &entry.mem_inputs else {
                continue;
            };
            let Some(child_pos) = position.get(txid) else {
                continue;
            };
            for (i, set) in flags.iter().enumerate() {
                if !set {
                    continue;
                }
                let parent = entry.tx.inputs[i].previous_output.txid;
                if let Some(parent_pos) = position.get(&parent) {
                    if parent_pos > child_pos {
                        error!(%txid, %parent, "child sorted above its parent");
                        defects += 1;
                    }
                }
            }
        }
        defects
    }
}
