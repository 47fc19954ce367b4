//! The mempool state: every index and counter behind the pool lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use keel_core::types::{Hash256, OutPoint};
use keel_core::traits::{RelayNotifier, ScriptVerifier, UtxoView};
use tracing::error;

use crate::config::MempoolConfig;
use crate::entry::PooledTx;
use crate::packages::{FeePackage, PackageId};
use crate::reject::{RejectReason, RejectedTx};

/// All mempool data. Single-threaded by construction; [`Mempool`]
/// (crate::pool::Mempool) wraps it in a lock for shared use.
pub struct MempoolState {
    pub(crate) cfg: MempoolConfig,
    pub(crate) chain: Arc<dyn UtxoView>,
    pub(crate) verifier: Arc<dyn ScriptVerifier>,
    pub(crate) relay: Option<Arc<dyn RelayNotifier>>,

    /// Pooled transactions by txid.
    pub(crate) pool: HashMap<Hash256, PooledTx>,
    /// Accounted footprint of the pool, in bytes.
    pub(crate) pool_size: u64,
    /// Total weight of pooled transactions.
    pub(crate) pool_weight: u64,
    /// Every outpoint spent by a pooled transaction, mapped to the spender.
    pub(crate) spent_outputs: HashMap<OutPoint, Hash256>,
    /// Txids announced by peers and awaiting download.
    pub(crate) pending: HashSet<Hash256>,

    // Fee-ordered doubly linked list over the pool.
    pub(crate) best: Option<Hash256>,
    pub(crate) worst: Option<Hash256>,
    pub(crate) sorting_suppressed: bool,
    pub(crate) sort_dirty: bool,

    // CPFP fee packages.
    pub(crate) packages: HashMap<PackageId, FeePackage>,
    pub(crate) package_order: Vec<PackageId>,
    pub(crate) next_package_id: PackageId,
    pub(crate) packages_dirty: bool,
    pub(crate) packages_resort: bool,

    // Rejected-transaction quarantine.
    pub(crate) rejected: HashMap<Hash256, RejectedTx>,
    pub(crate) rejected_size: u64,
    /// Circular slot ring over `rejected`; the next slot to claim is
    /// `ring_head`, so the first live slot after it is the oldest entry.
    pub(crate) ring: Vec<Option<Hash256>>,
    pub(crate) ring_head: usize,
    /// Missing parent txid to the rejected entries waiting on it.
    pub(crate) waiting: HashMap<Hash256, Vec<Hash256>>,
    pub(crate) waiting_size: u64,
    /// Outpoints spent by retained rejected payloads.
    pub(crate) rejected_spends: HashMap<OutPoint, Vec<Hash256>>,

    /// Eviction-driven fee floor, keels per 1000 weight units. Zero until
    /// the first size eviction.
    pub(crate) dynamic_floor: u64,
    pub(crate) next_floor_relax: Instant,
    pub(crate) next_expiry: Instant,

    pub(crate) counters: BTreeMap<String, u64>,
}

impl MempoolState {
    pub fn new(
        cfg: MempoolConfig,
        chain: Arc<dyn UtxoView>,
        verifier: Arc<dyn ScriptVerifier>,
        relay: Option<Arc<dyn RelayNotifier>>,
    ) -> Self {
        let now = Instant::now();
        let slots = cfg.rejected_slots.max(2);
        let next_expiry = now + cfg.expire_interval;
        let next_floor_relax = now + cfg.floor_relax_interval;
        Self {
            cfg,
            chain,
            verifier,
            relay,
            pool: HashMap::new(),
            pool_size: 0,
            pool_weight: 0,
            spent_outputs: HashMap::new(),
            pending: HashSet::new(),
            best: None,
            worst: None,
            sorting_suppressed: false,
            sort_dirty: false,
            packages: HashMap::new(),
            package_order: Vec::new(),
            next_package_id: 0,
            packages_dirty: false,
            packages_resort: false,
            rejected: HashMap::new(),
            rejected_size: 0,
            ring: vec![None; slots],
            ring_head: 0,
            waiting: HashMap::new(),
            waiting_size: 0,
            rejected_spends: HashMap::new(),
            dynamic_floor: 0,
            next_floor_relax,
            next_expiry,
            counters: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Accounted pool footprint in bytes.
    pub fn total_size(&self) -> u64 {
        self.pool_size
    }

    /// Total weight of pooled transactions.
    pub fn total_weight(&self) -> u64 {
        self.pool_weight
    }

    /// The fee floor currently applied to admissions, keels per 1000
    /// weight units.
    pub fn fee_floor_per_kw(&self) -> u64 {
        self.cfg.min_fee_per_kw.max(self.dynamic_floor)
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.cfg
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.pool.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&PooledTx> {
        self.pool.get(txid)
    }

    pub fn get_mut(&mut self, txid: &Hash256) -> Option<&mut PooledTx> {
        self.pool.get_mut(txid)
    }

    /// Which pooled transaction spends this outpoint, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent_outputs.get(outpoint).copied()
    }

    pub(crate) fn bump(&mut self, name: &str) {
        *self.counters.entry(name.to_owned()).or_insert(0) += 1;
    }

    pub(crate) fn bump_reason(&mut self, prefix: &str, reason: RejectReason) {
        let key = format!("{}-{}", prefix, reason.label());
        *self.counters.entry(key).or_insert(0) += 1;
    }

    /// Monotonic event counters, keyed by name.
    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    /// Wire a freshly validated transaction into every index.
    pub(crate) fn link_new_entry(&mut self, entry: PooledTx) {
        let txid = entry.txid;
        let weight = entry.weight;
        let footprint = entry.footprint;
        let mem_input_cnt = entry.mem_input_cnt;
        for input in &entry.tx.inputs {
            self.spent_outputs.insert(input.previous_output, txid);
        }
        self.pool.insert(txid, entry);
        self.pool_weight += weight;
        self.pool_size += footprint;
        self.add_to_sort(txid);
        if !self.packages_dirty && mem_input_cnt > 0 {
            self.extend_packages_for(txid);
        }
    }

    /// Unwire a transaction from every index.
    ///
    /// With `with_children` the whole descendant cone goes too, since a
    /// child cannot outlive an unconfirmed parent. A reason quarantines
    /// each removed transaction.
    pub(crate) fn delete_entry(
        &mut self,
        txid: Hash256,
        with_children: bool,
        reason: Option<RejectReason>,
    ) {
        if !self.pool.contains_key(&txid) {
            error!(%txid, "delete of a transaction that is not pooled");
            return;
        }
        let has_packages = self
            .pool
            .get(&txid)
            .is_some_and(|e| !e.in_packages.is_empty());
        if !self.packages_dirty && has_packages {
            self.remove_member_from_packages(txid);
        }
        if with_children {
            let n_out = self
                .pool
                .get(&txid)
                .map(|e| e.tx.outputs.len() as u32)
                .unwrap_or(0);
            for vout in 0..n_out {
                if let Some(&child) = self.spent_outputs.get(&OutPoint::new(txid, vout)) {
                    if self.pool.contains_key(&child) {
                        self.delete_entry(child, true, reason);
                    }
                }
            }
        }
        self.del_from_sort(txid);
        let Some(entry) = self.pool.remove(&txid) else {
            return;
        };
        for input in &entry.tx.inputs {
            self.spent_outputs.remove(&input.previous_output);
        }
        self.pool_size -= entry.footprint;
        self.pool_weight -= entry.weight;
        if let Some(reason) = reason {
            self.quarantine_tx(txid, entry.tx, reason, None);
        }
    }

    /// Pooled transactions spending any output of `txid`, deduplicated.
    pub(crate) fn children_of(&self, txid: Hash256) -> Vec<Hash256> {
        let Some(entry) = self.pool.get(&txid) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for vout in 0..entry.tx.outputs.len() as u32 {
            if let Some(&child) = self.spent_outputs.get(&OutPoint::new(txid, vout)) {
                if !out.contains(&child) {
                    out.push(child);
                }
            }
        }
        out
    }

    /// Distinct pooled parents of `txid`, per its mem-input flags.
    pub(crate) fn direct_pool_parents(&self, txid: Hash256) -> Vec<Hash256> {
        let Some(entry) = self.pool.get(&txid) else {
            return Vec::new();
        };
        let Some(flags) = &entry.mem_inputs else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (i, set) in flags.iter().enumerate() {
            if !set {
                continue;
            }
            let parent = entry.tx.inputs[i].previous_output.txid;
            if !out.contains(&parent) {
                out.push(parent);
            }
        }
        out
    }

    /// The transaction plus its entire descendant cone, ordered so every
    /// transaction appears after all of its in-pool ancestors. Unrelated
    /// ancestors of descendants are pulled in as well, so the result is a
    /// self-contained valid ordering.
    pub(crate) fn with_all_descendants(&self, txid: Hash256) -> Vec<Hash256> {
        let mut included: HashSet<Hash256> = HashSet::new();
        included.insert(txid);
        let mut result = vec![txid];
        let mut idx = 0;
        while idx < result.len() {
            let parent = result[idx];
            for child in self.children_of(parent) {
                if included.contains(&child) {
                    continue;
                }
                for anc in self.all_parents_except(child, Some(parent)) {
                    if included.insert(anc) {
                        result.push(anc);
                    }
                }
                included.insert(child);
                result.push(child);
            }
            idx += 1;
        }
        result
    }

    /// Every pooled descendant of `txid`, excluding `txid` itself.
    pub(crate) fn all_descendants(&self, txid: Hash256) -> Vec<Hash256> {
        let mut seen: HashSet<Hash256> = HashSet::new();
        seen.insert(txid);
        let mut queue = vec![txid];
        let mut out = Vec::new();
        let mut qi = 0;
        while qi < queue.len() {
            let cur = queue[qi];
            qi += 1;
            for child in self.children_of(cur) {
                if seen.insert(child) {
                    out.push(child);
                    queue.push(child);
                }
            }
        }
        out
    }

    /// In-pool ancestors of `txid`, oldest first, skipping the `except`
    /// branch.
    pub(crate) fn all_parents_except(
        &self,
        txid: Hash256,
        except: Option<Hash256>,
    ) -> Vec<Hash256> {
        let mut already: HashSet<Hash256> = HashSet::new();
        already.insert(txid);
        let mut out = Vec::new();
        self.collect_parents(txid, except, &mut already, &mut out);
        out.retain(|id| *id != txid);
        out
    }

    fn collect_parents(
        &self,
        txid: Hash256,
        except: Option<Hash256>,
        already: &mut HashSet<Hash256>,
        out: &mut Vec<Hash256>,
    ) {
        let Some(entry) = self.pool.get(&txid) else {
            return;
        };
        if let Some(flags) = &entry.mem_inputs {
            for (i, set) in flags.iter().enumerate() {
                if !set {
                    continue;
                }
                let parent = entry.tx.inputs[i].previous_output.txid;
                if Some(parent) == except || already.contains(&parent) {
                    continue;
                }
                self.collect_parents(parent, except, already, out);
                if already.insert(parent) {
                    out.push(parent);
                }
            }
        }
    }
}
