//! CPFP fee packages.
//!
//! A package groups a parentless pooled transaction with its descendant
//! cone and carries the aggregate fee and weight, so a cheap parent pulled
//! up by an expensive child is priced at the group rate. Packages are
//! maintained incrementally as transactions come and go; after bulk
//! mutation (block commit or undo) the whole set is rebuilt lazily.

use keel_core::types::Hash256;
use tracing::error;

use crate::state::MempoolState;

pub type PackageId = u64;

/// A root transaction and its descendant cone, priced together.
#[derive(Debug, Clone)]
pub struct FeePackage {
    /// Members in dependency order; the root comes first.
    pub txs: Vec<Hash256>,
    /// Aggregate fee in keels.
    pub fee: u64,
    /// Aggregate weight.
    pub weight: u64,
}

impl FeePackage {
    /// Aggregate fee rate in keels per 1000 weight units.
    pub fn fee_rate_per_kw(&self) -> u64 {
        if self.weight == 0 {
            return 0;
        }
        self.fee.saturating_mul(1000) / self.weight
    }
}

/// One band of the projected-fee histogram.
#[derive(Debug, Clone)]
pub struct FeeBand {
    /// Total weight in the band.
    pub weight: u64,
    /// Total fee in the band, in keels.
    pub fee: u64,
    /// Members, best first.
    pub txs: Vec<Hash256>,
}

impl MempoolState {
    /// Rebuild every package from the current order. No-op unless the set
    /// was invalidated by bulk mutation.
    pub(crate) fn build_packages(&mut self) {
        if self.sort_dirty && !self.sorting_suppressed {
            self.rebuild_sorted_list();
        }
        if !self.packages_dirty {
            self.sort_packages();
            return;
        }
        self.packages.clear();
        self.package_order.clear();
        let roots: Vec<Hash256> = {
            let mut out = Vec::new();
            for c in self.base_order() {
                let Some(e) = self.pool.get_mut(&c) else { continue };
                e.in_packages.clear();
                if e.mem_input_cnt == 0 {
                    out.push(c);
                }
            }
            out
        };
        for root in roots {
            let members = self.with_all_descendants(root);
            if members.len() > 1 {
                self.create_package(members);
            }
        }
        self.packages_dirty = false;
        self.packages_resort = true;
        self.sort_packages();
    }

    /// The pool order package construction runs over: the linked list when
    /// it is current, a full recompute while suppression leaves it stale.
    fn base_order(&self) -> Vec<Hash256> {
        if self.sort_dirty {
            return self.sorted_slow();
        }
        let mut out = Vec::with_capacity(self.pool.len());
        let mut cur = self.best;
        while let Some(c) = cur {
            out.push(c);
            cur = self.pool.get(&c).and_then(|e| e.worse);
        }
        out
    }

    /// Register a new package over `members` (root first).
    pub(crate) fn create_package(&mut self, members: Vec<Hash256>) {
        let mut fee = 0u64;
        let mut weight = 0u64;
        for id in &members {
            let Some(e) = self.pool.get(id) else {
                error!(txid = %id, "package member is not pooled");
                self.packages_dirty = true;
                return;
            };
            fee += e.fee;
            weight += e.weight;
        }
        let pid = self.next_package_id;
        self.next_package_id += 1;
        for id in &members {
            if let Some(e) = self.pool.get_mut(id) {
                e.in_packages.push(pid);
            }
        }
        self.packages.insert(pid, FeePackage { txs: members, fee, weight });
        self.package_order.push(pid);
        self.packages_resort = true;
    }

    /// Re-sort the package order by aggregate fee rate, best first.
    pub(crate) fn sort_packages(&mut self) {
        if !self.packages_resort {
            return;
        }
        self.packages_resort = false;
        let mut order = std::mem::take(&mut self.package_order);
        order.sort_by(|a, b| {
            let (pa, pb) = match (self.packages.get(a), self.packages.get(b)) {
                (Some(x), Some(y)) => (x, y),
                _ => return std::cmp::Ordering::Equal,
            };
            let lhs = u128::from(pa.fee) * u128::from(pb.weight);
            let rhs = u128::from(pb.fee) * u128::from(pa.weight);
            rhs.cmp(&lhs).then_with(|| {
                let ra = pa.txs.first().map(|t| t.0).unwrap_or_default();
                let rb = pb.txs.first().map(|t| t.0).unwrap_or_default();
                rb.cmp(&ra)
            })
        });
        self.package_order = order;
    }

    /// Fold a freshly admitted child into the packages rooted above it.
    pub(crate) fn extend_packages_for(&mut self, txid: Hash256) {
        for parent in self.direct_pool_parents(txid) {
            self.extend_parent_packages(parent, txid);
        }
    }

    fn extend_parent_packages(&mut self, parent: Hash256, child: Hash256) {
        let (parent_pkgs, parent_is_root) = match self.pool.get(&parent) {
            Some(e) => (e.in_packages.clone(), e.mem_input_cnt == 0),
            None => return,
        };
        if parent_pkgs.is_empty() {
            if !parent_is_root {
                // The parent should already sit inside its root's package.
                error!(%parent, %child, "non-root parent outside any package");
                self.packages_dirty = true;
                return;
            }
            let members = self.with_all_descendants(parent);
            if members.len() > 1 {
                self.create_package(members);
                self.bump("TxPackageNew");
            } else {
                error!(%parent, %child, "new child yields a single-member package");
                self.packages_dirty = true;
            }
            return;
        }
        for pid in parent_pkgs {
            let already_in = match self.packages.get(&pid) {
                Some(pkg) => pkg.txs.contains(&child),
                None => {
                    self.packages_dirty = true;
                    continue;
                }
            };
            if already_in || !self.package_has_all_pool_parents(pid, child) {
                continue;
            }
            let Some((fee, weight)) = self.pool.get(&child).map(|e| (e.fee, e.weight)) else {
                continue;
            };
            if let Some(pkg) = self.packages.get_mut(&pid) {
                pkg.txs.push(child);
                pkg.fee += fee;
                pkg.weight += weight;
            }
            if let Some(e) = self.pool.get_mut(&child) {
                e.in_packages.push(pid);
            }
            self.packages_resort = true;
            self.bump("TxPackageExtended");
        }
    }

    /// A child may only join a package that already holds every one of its
    /// in-pool parents, otherwise the group rate would price in a subsidy
    /// the package cannot deliver.
    fn package_has_all_pool_parents(&self, pid: PackageId, child: Hash256) -> bool {
        let Some(pkg) = self.packages.get(&pid) else {
            return false;
        };
        let Some(entry) = self.pool.get(&child) else {
            return false;
        };
        let Some(flags) = &entry.mem_inputs else {
            return true;
        };
        for (i, set) in flags.iter().enumerate() {
            if *set && !pkg.txs.contains(&entry.tx.inputs[i].previous_output.txid) {
                return false;
            }
        }
        true
    }

    /// Withdraw a transaction from every package holding it. Removing the
    /// root, or shrinking a package to one member, drops the package.
    pub(crate) fn remove_member_from_packages(&mut self, txid: Hash256) {
        let pids = self
            .pool
            .get(&txid)
            .map(|e| e.in_packages.clone())
            .unwrap_or_default();
        for pid in pids {
            let Some(pkg) = self.packages.get(&pid) else {
                continue;
            };
            if pkg.txs.len() < 2 {
                error!(package = pid, "package shrank below two members");
                self.packages_dirty = true;
                continue;
            }
            if pkg.txs.first() == Some(&txid) || pkg.txs.len() == 2 {
                self.drop_package(pid);
            } else {
                let (fee, weight) = self
                    .pool
                    .get(&txid)
                    .map(|e| (e.fee, e.weight))
                    .unwrap_or((0, 0));
                if let Some(pkg) = self.packages.get_mut(&pid) {
                    pkg.txs.retain(|t| *t != txid);
                    pkg.fee -= fee;
                    pkg.weight -= weight;
                }
                self.packages_resort = true;
            }
        }
        if let Some(e) = self.pool.get_mut(&txid) {
            e.in_packages.clear();
        }
    }

    fn drop_package(&mut self, pid: PackageId) {
        if let Some(pkg) = self.packages.remove(&pid) {
            for member in pkg.txs {
                if let Some(e) = self.pool.get_mut(&member) {
                    e.in_packages.retain(|p| *p != pid);
                }
            }
        }
        self.package_order.retain(|p| *p != pid);
        self.packages_resort = true;
    }

    /// Invalidate the package set; the next ordered read rebuilds it.
    pub(crate) fn invalidate_packages(&mut self) {
        self.packages_dirty = true;
    }

    /// The pool order with CPFP applied: wherever a package's aggregate
    /// rate beats the next standalone transaction, the whole package is
    /// emitted first, parents leading. This is the order block templates
    /// and the eviction scan use.
    pub fn sorted_with_cpfp(&mut self) -> Vec<Hash256> {
        self.build_packages();
        let base = self.base_order();
        let order = self.package_order.clone();
        let mut result = Vec::with_capacity(base.len());
        let mut included: std::collections::HashSet<Hash256> =
            std::collections::HashSet::with_capacity(base.len());
        let mut next_pkg = 0usize;
        for txid in base {
            let (tx_fee, tx_weight) = match self.pool.get(&txid) {
                Some(e) => (e.fee, e.weight),
                None => continue,
            };
            while next_pkg < order.len() {
                let Some(pkg) = self.packages.get(&order[next_pkg]) else {
                    next_pkg += 1;
                    continue;
                };
                let pkg_beats = u128::from(pkg.fee) * u128::from(tx_weight)
                    > u128::from(tx_fee) * u128::from(pkg.weight);
                if !pkg_beats {
                    break;
                }
                next_pkg += 1;
                if pkg.txs.iter().any(|t| included.contains(t)) {
                    continue;
                }
                for member in &pkg.txs {
                    included.insert(*member);
                    result.push(*member);
                }
            }
            if included.insert(txid) {
                result.push(txid);
            }
        }
        result
    }

    /// Histogram of the CPFP order cut into bands of at most `band_weight`,
    /// projecting what upcoming blocks would earn.
    pub fn fee_histogram(&mut self, band_weight: u64) -> Vec<FeeBand> {
        let order = self.sorted_with_cpfp();
        let mut bands: Vec<FeeBand> = Vec::new();
        let mut current = FeeBand { weight: 0, fee: 0, txs: Vec::new() };
        for txid in order {
            let Some(e) = self.pool.get(&txid) else { continue };
            if current.weight > 0 && current.weight + e.weight > band_weight {
                bands.push(std::mem::replace(
                    &mut current,
                    FeeBand { weight: 0, fee: 0, txs: Vec::new() },
                ));
            }
            current.weight += e.weight;
            current.fee += e.fee;
            current.txs.push(txid);
        }
        if current.weight > 0 {
            bands.push(current);
        }
        bands
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Snapshot of every package, best aggregate rate first.
    pub fn packages_snapshot(&mut self) -> Vec<FeePackage> {
        self.build_packages();
        self.package_order
            .iter()
            .filter_map(|pid| self.packages.get(pid))
            .cloned()
            .collect()
    }
}
