//! Size eviction, the dynamic fee floor, and periodic maintenance.

use std::time::Instant;

use tracing::{debug, info};

use crate::reject::RejectReason;
use crate::state::MempoolState;

impl MempoolState {
    /// Trim the pool back under its size ceiling.
    ///
    /// Victims are taken from the tail of the CPFP order, descendants
    /// included, and quarantined as low-fee so a re-offer is refused
    /// cheaply. The rate of the last victim becomes the new dynamic fee
    /// floor: anything paying no better than what was just thrown out is
    /// not worth admitting.
    pub fn remove_excessive(&mut self) -> usize {
        if self.pool_size <= self.cfg.max_pool_bytes + self.cfg.eviction_hysteresis {
            return 0;
        }
        let order = self.sorted_with_cpfp();
        let mut evicted = 0usize;
        let mut floor_rate: Option<(u64, u64)> = None;
        for victim in order.into_iter().rev() {
            if self.pool_size <= self.cfg.max_pool_bytes {
                break;
            }
            // Descendant cones go together; later entries may be gone.
            let Some(entry) = self.pool.get(&victim) else {
                continue;
            };
            floor_rate = Some((entry.fee, entry.weight));
            self.delete_entry(victim, true, Some(RejectReason::LowFee));
            evicted += 1;
            self.bump("TxPoolSizeEvicted");
        }
        if let Some((fee, weight)) = floor_rate {
            if weight > 0 {
                self.dynamic_floor = fee.saturating_mul(1000) / weight;
            }
            info!(
                evicted,
                pool_size = self.pool_size,
                floor = self.dynamic_floor,
                "pool trimmed to size"
            );
        }
        evicted
    }

    /// Periodic maintenance: expiry of stale transactions, decay of the
    /// dynamic fee floor, and quarantine budget enforcement. Driven by the
    /// owning node's timer; `now` is injected so tests can steer the clock.
    pub fn tick(&mut self, now: Instant) {
        if let Some(horizon) = self.cfg.expire_after {
            if now >= self.next_expiry {
                self.next_expiry = now + self.cfg.expire_interval;
                let stale: Vec<_> = self
                    .pool
                    .iter()
                    .filter(|(_, e)| now.duration_since(e.last_seen) > horizon)
                    .map(|(id, _)| *id)
                    .collect();
                for txid in stale {
                    if self.pool.contains_key(&txid) {
                        debug!(%txid, "expiring a stale transaction");
                        self.delete_entry(txid, true, None);
                        self.bump("TxExpired");
                    }
                }
            }
        }

        // The floor only decays while the pool sits below half capacity, so
        // a fee spike does not linger after the pressure is gone.
        if now >= self.next_floor_relax {
            self.next_floor_relax = now + self.cfg.floor_relax_interval;
            if self.dynamic_floor > 0 && self.pool_size * 2 < self.cfg.max_pool_bytes {
                self.dynamic_floor = self.dynamic_floor.saturating_sub(self.cfg.floor_relax_step);
                debug!(floor = self.dynamic_floor, "dynamic fee floor relaxed");
            }
        }

        self.enforce_rejected_budgets();
        self.remove_excessive();
    }
}
