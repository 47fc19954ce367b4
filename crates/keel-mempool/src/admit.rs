//! Transaction admission.
//!
//! One synchronous pipeline decides the fate of every offered transaction:
//! structural checks, input resolution against the pool and the confirmed
//! UTXO set, conflict collection for replace-by-fee, fee floor, replacement
//! economics, then script verification fanned out across worker threads.
//! Admission of a transaction other entries were parked on retries those
//! entries immediately, cascading down the dependency chain.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use keel_core::error::KeelError;
use keel_core::types::{Hash256, Transaction, UtxoEntry};
use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::entry::PooledTx;
use crate::reject::RejectReason;
use crate::state::MempoolState;

/// What the pool knows about a txid, checked before requesting a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKnowledge {
    /// Never seen; worth fetching.
    Unknown,
    /// Already in the pool.
    Pooled,
    /// Quarantined after a rejection.
    Rejected,
    /// Download already requested.
    Pending,
    /// Confirmed in the chain.
    Confirmed,
}

/// Verdict of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Accepted {
        txid: Hash256,
    },
    /// Idempotent re-offer of a pooled transaction.
    AlreadyPooled {
        txid: Hash256,
    },
    /// Parked in quarantine until `missing_parent` shows up.
    Parked {
        txid: Hash256,
        missing_parent: Hash256,
    },
    Rejected {
        txid: Hash256,
        reason: RejectReason,
    },
}

impl AdmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

impl MempoolState {
    /// Offer a transaction to the pool.
    ///
    /// `trusted` skips script verification and replacement safeguards (the
    /// transaction was valid in a recently undone block); `local` exempts
    /// wallet submissions from network size and fee policy.
    pub fn admit(
        &mut self,
        tx: Transaction,
        trusted: bool,
        local: bool,
    ) -> Result<AdmitOutcome, KeelError> {
        self.admit_inner(tx, trusted, local, false)
    }

    pub(crate) fn admit_inner(
        &mut self,
        tx: Transaction,
        trusted: bool,
        local: bool,
        from_retry: bool,
    ) -> Result<AdmitOutcome, KeelError> {
        let txid = tx.txid()?;
        self.pending.remove(&txid);
        if from_retry {
            self.delete_rejected(&txid);
        }

        if let Some(entry) = self.pool.get_mut(&txid) {
            entry.last_seen = Instant::now();
            self.bump("TxAlreadyPooled");
            return Ok(AdmitOutcome::AlreadyPooled { txid });
        }
        if let Some(prior) = self.rejected.get(&txid) {
            let reason = prior.reason;
            self.bump("TxRejectedAgain");
            return Ok(AdmitOutcome::Rejected { txid, reason });
        }

        // Structural sanity.
        if tx.inputs.is_empty() {
            return Ok(self.refuse(txid, tx, RejectReason::EmptyInput));
        }
        if tx.is_coinbase() || tx.outputs.is_empty() {
            return Ok(self.refuse(txid, tx, RejectReason::Format));
        }
        let Some(total_out) = tx.total_output_value() else {
            return Ok(self.refuse(txid, tx, RejectReason::Format));
        };
        let mut outpoints = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !outpoints.insert(input.previous_output) {
                self.bump("TxDuplicateInput");
                return Ok(self.refuse(txid, tx, RejectReason::BadInput));
            }
        }
        drop(outpoints);
        let weight = tx.weight()?;
        if !local && weight > self.cfg.max_tx_weight {
            return Ok(self.refuse(txid, tx, RejectReason::TooBig));
        }

        // Resolve every input, collecting replacement conflicts on the way.
        let tip = self.chain.tip_height();
        let input_count = tx.inputs.len();
        let mut resolved: Vec<UtxoEntry> = Vec::with_capacity(input_count);
        let mut mem_inputs = vec![false; input_count];
        let mut mem_input_cnt = 0u32;
        let mut input_value = 0u64;
        let mut is_final = false;
        let mut rbf_ids: Vec<Hash256> = Vec::new();
        let mut rbf_seen: HashSet<Hash256> = HashSet::new();
        for i in 0..input_count {
            let op = tx.inputs[i].previous_output;
            if !self.cfg.full_rbf && tx.inputs[i].is_final() {
                is_final = true;
            }

            if let Some(&conflicting) = self.spent_outputs.get(&op) {
                let mut victims = vec![conflicting];
                victims.extend(self.all_descendants(conflicting));
                for victim in victims {
                    if !rbf_seen.insert(victim) {
                        continue;
                    }
                    if !trusted {
                        if self.pool.get(&victim).is_some_and(|e| e.is_final) {
                            return Ok(self.refuse(txid, tx, RejectReason::RbfFinal));
                        }
                        if rbf_seen.len() > self.cfg.rbf_replace_limit {
                            return Ok(self.refuse(txid, tx, RejectReason::RbfLimit));
                        }
                    }
                    rbf_ids.push(victim);
                }
            }

            let parent_txid = op.txid;
            if let Some(parent) = self.pool.get(&parent_txid) {
                let from_parent = parent.tx.outputs.get(op.index as usize).cloned();
                let Some(output) = from_parent else {
                    return Ok(self.refuse(txid, tx, RejectReason::BadInput));
                };
                if !trusted && !self.cfg.accept_mem_inputs {
                    return Ok(self.refuse(txid, tx, RejectReason::NotMined));
                }
                resolved.push(UtxoEntry {
                    output,
                    block_height: 0,
                    is_coinbase: false,
                });
                mem_inputs[i] = true;
                mem_input_cnt += 1;
            } else {
                match self.chain.resolve_output(&op)? {
                    Some(utxo) => {
                        if utxo.is_coinbase && !utxo.is_mature(tip) {
                            return Ok(self.refuse(txid, tx, RejectReason::CbImmature));
                        }
                        resolved.push(utxo);
                    }
                    None => {
                        if !self.cfg.accept_mem_inputs {
                            return Ok(self.refuse(txid, tx, RejectReason::NotMined));
                        }
                        if let Some(parent_rej) = self.rejected.get(&parent_txid) {
                            // A parent rejected on policy will not arrive;
                            // waiting on it would leak quarantine space.
                            if parent_rej.reason.code() > 200
                                && parent_rej.waiting_for.is_none()
                            {
                                self.bump("TxParentRejected");
                                return Ok(self.refuse(txid, tx, RejectReason::BadParent));
                            }
                        }
                        debug!(%txid, parent = %parent_txid, "parking on a missing parent");
                        self.bump("TxParked");
                        self.quarantine_tx(txid, tx, RejectReason::NoTxou, Some(parent_txid));
                        return Ok(AdmitOutcome::Parked {
                            txid,
                            missing_parent: parent_txid,
                        });
                    }
                }
            }
            input_value = match input_value.checked_add(resolved[i].output.value) {
                Some(v) => v,
                None => return Ok(self.refuse(txid, tx, RejectReason::Format)),
            };
        }

        let Some(fee) = input_value.checked_sub(total_out) else {
            return Ok(self.refuse(txid, tx, RejectReason::Overspend));
        };

        // Fee floor, static policy raised by the eviction controller.
        let floor = self.fee_floor_per_kw();
        if !local && u128::from(fee) * 1000 < u128::from(weight) * u128::from(floor) {
            self.bump_reason("TxRejected", RejectReason::LowFee);
            return Ok(AdmitOutcome::Rejected {
                txid,
                reason: RejectReason::LowFee,
            });
        }

        // A replacement must beat the aggregate rate of everything it
        // displaces, not just the direct conflict.
        if !rbf_ids.is_empty() && !trusted && !local {
            let mut tot_fee = 0u64;
            let mut tot_weight = 0u64;
            for victim in &rbf_ids {
                if let Some(e) = self.pool.get(victim) {
                    tot_fee += e.fee;
                    tot_weight += e.weight;
                }
            }
            if u128::from(tot_fee) * u128::from(weight)
                >= u128::from(fee) * u128::from(tot_weight)
            {
                return Ok(self.refuse(txid, tx, RejectReason::RbfLowFee));
            }
        }

        // Script verification, one input per worker.
        if !trusted {
            let verifier = Arc::clone(&self.verifier);
            let bad_input = (0..input_count)
                .into_par_iter()
                .try_for_each(|i| verifier.verify_input(&tx, i, &resolved[i]).map_err(|_| i));
            if let Err(index) = bad_input {
                debug!(%txid, input = index, "script verification failed");
                self.bump_reason("TxRejected", RejectReason::ScriptFail);
                return Ok(AdmitOutcome::Rejected {
                    txid,
                    reason: RejectReason::ScriptFail,
                });
            }
        }

        // Commit: displace the conflicts, wire the new entry in.
        for victim in rbf_ids {
            if self.pool.contains_key(&victim) {
                info!(replaced = %victim, by = %txid, "replacing pooled transaction");
                self.delete_entry(victim, false, Some(RejectReason::Replaced));
                self.bump("TxReplaced");
            }
        }
        let now = Instant::now();
        let entry = PooledTx {
            txid,
            fee,
            weight,
            input_value,
            sigop_cost: input_count as u64,
            footprint: PooledTx::expected_footprint(weight),
            first_seen: now,
            last_seen: now,
            last_sent: None,
            inv_sent_cnt: 0,
            sent_cnt: 0,
            mem_inputs: (mem_input_cnt > 0).then_some(mem_inputs),
            mem_input_cnt,
            local,
            is_final,
            blocked: None,
            better: None,
            worse: None,
            sort_rank: 0,
            in_packages: Vec::new(),
            tx,
        };
        self.link_new_entry(entry);
        self.bump("TxAccepted");
        debug!(%txid, fee, weight, mem_input_cnt, "transaction accepted");

        self.maybe_relay(txid, local);
        if self.waiting.contains_key(&txid) {
            self.retry_waiting_for(txid);
        }
        self.remove_excessive();
        Ok(AdmitOutcome::Accepted { txid })
    }

    /// Quarantine and report a rejection.
    fn refuse(&mut self, txid: Hash256, tx: Transaction, reason: RejectReason) -> AdmitOutcome {
        debug!(%txid, %reason, "transaction refused");
        self.quarantine_tx(txid, tx, reason, None);
        AdmitOutcome::Rejected { txid, reason }
    }

    /// Decide whether the freshly accepted transaction goes out to peers,
    /// recording the blocking reason when it does not.
    fn maybe_relay(&mut self, txid: Hash256, local: bool) {
        let Some(entry) = self.pool.get(&txid) else {
            return;
        };
        let (fee, weight, mem_input_cnt) = (entry.fee, entry.weight, entry.mem_input_cnt);
        let blocked = if !self.cfg.relay_enabled {
            Some(RejectReason::Disabled)
        } else if mem_input_cnt > 0 && !self.cfg.route_mem_inputs {
            Some(RejectReason::NotMined)
        } else if weight > self.cfg.route_max_tx_weight {
            Some(RejectReason::TooBig)
        } else if !local
            && u128::from(fee) * 1000 < u128::from(weight) * u128::from(self.cfg.route_min_fee_per_kw)
        {
            Some(RejectReason::LowFee)
        } else {
            None
        };
        match blocked {
            Some(reason) => {
                if let Some(entry) = self.pool.get_mut(&txid) {
                    entry.blocked = Some(reason);
                }
                self.bump_reason("TxRouteBlocked", reason);
            }
            None => {
                if let Some(relay) = self.relay.clone() {
                    let rate = if weight == 0 { 0 } else { fee.saturating_mul(1000) / weight };
                    let notified = relay.announce_tx(&txid, None, rate);
                    if let Some(entry) = self.pool.get_mut(&txid) {
                        entry.inv_sent_cnt += notified as u32;
                        entry.last_sent = Some(Instant::now());
                    }
                    self.bump("TxRouteOK");
                }
            }
        }
    }

    /// Retry everything parked on `parent`, cascading through entries whose
    /// own dependents were waiting on them.
    pub(crate) fn retry_waiting_for(&mut self, parent: Hash256) {
        let ids = self.waiting.get(&parent).cloned().unwrap_or_default();
        for id in ids {
            let Some(txr) = self.rejected.get(&id) else {
                continue;
            };
            if txr.reason != RejectReason::NoTxou {
                error!(txid = %id, reason = %txr.reason, "non-parked entry on a waiting list");
                continue;
            }
            let Some(tx) = txr.tx.clone() else {
                error!(txid = %id, "parked entry lost its payload");
                self.delete_rejected(&id);
                continue;
            };
            self.bump("TxRetry");
            if let Err(err) = self.admit_inner(tx, false, false, true) {
                error!(txid = %id, %err, "retry of a parked transaction failed");
            }
        }
    }

    /// What the pool already knows about a txid. Touches `last_seen` for
    /// pooled entries so expiry tracks continued interest.
    pub fn tx_knowledge(&mut self, txid: &Hash256) -> Result<TxKnowledge, KeelError> {
        if let Some(entry) = self.pool.get_mut(txid) {
            entry.last_seen = Instant::now();
            return Ok(TxKnowledge::Pooled);
        }
        if self.rejected.contains_key(txid) {
            return Ok(TxKnowledge::Rejected);
        }
        if self.pending.contains(txid) {
            return Ok(TxKnowledge::Pending);
        }
        if self.chain.tx_confirmed(txid)? {
            return Ok(TxKnowledge::Confirmed);
        }
        Ok(TxKnowledge::Unknown)
    }

    /// Whether an announced txid is worth downloading. Marks it pending so
    /// duplicate announcements are not fetched twice.
    pub fn need_this_tx(&mut self, txid: &Hash256) -> Result<bool, KeelError> {
        match self.tx_knowledge(txid)? {
            TxKnowledge::Unknown => {
                self.pending.insert(*txid);
                self.bump("TxPending");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Forget a pending download that never arrived.
    pub fn unmark_pending(&mut self, txid: &Hash256) {
        self.pending.remove(txid);
    }
}
