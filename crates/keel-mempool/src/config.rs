//! Mempool policy configuration.

use std::time::Duration;

use keel_core::constants::{MAX_TX_WEIGHT, MIN_FEE_PER_KW};

/// Policy knobs for the transaction pool.
///
/// Defaults are suitable for a relay node; miners typically raise
/// `max_pool_bytes` and enable `route_mem_inputs`.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Largest transaction accepted from the network, in weight units.
    /// Locally submitted transactions bypass this limit.
    pub max_tx_weight: u64,
    /// Target ceiling for the pool's accounted memory footprint, in bytes.
    pub max_pool_bytes: u64,
    /// Extra slack above `max_pool_bytes` before eviction kicks in, so a
    /// single small admission does not thrash the eviction path.
    pub eviction_hysteresis: u64,
    /// Static fee floor in keels per 1000 weight units.
    pub min_fee_per_kw: u64,
    /// Accept transactions that spend unconfirmed outputs.
    pub accept_mem_inputs: bool,
    /// Treat every transaction as replaceable, ignoring final sequences.
    pub full_rbf: bool,
    /// Most transactions a single replacement may displace.
    pub rbf_replace_limit: usize,
    /// Number of slots in the rejected-transaction ring.
    pub rejected_slots: usize,
    /// Byte budget for the rejected index, retained payloads included.
    pub rejected_max_bytes: u64,
    /// Byte budget for the subset of rejected entries parked on a missing
    /// parent.
    pub waiting_max_bytes: u64,
    /// Drop pooled transactions not re-seen within this horizon.
    /// `None` disables expiry.
    pub expire_after: Option<Duration>,
    /// How often the expiry sweep runs.
    pub expire_interval: Duration,
    /// Announce accepted transactions to peers.
    pub relay_enabled: bool,
    /// Announce transactions that spend unconfirmed outputs.
    pub route_mem_inputs: bool,
    /// Fee floor for relaying, in keels per 1000 weight units.
    pub route_min_fee_per_kw: u64,
    /// Largest transaction we are willing to announce.
    pub route_max_tx_weight: u64,
    /// How much the dynamic fee floor decays per relax interval, in keels
    /// per 1000 weight units.
    pub floor_relax_step: u64,
    /// How often the dynamic fee floor is allowed to decay while the pool
    /// sits below half capacity.
    pub floor_relax_interval: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_tx_weight: MAX_TX_WEIGHT,
            max_pool_bytes: 64 * 1024 * 1024,
            eviction_hysteresis: 1024 * 1024,
            min_fee_per_kw: MIN_FEE_PER_KW,
            accept_mem_inputs: true,
            full_rbf: false,
            rbf_replace_limit: 100,
            rejected_slots: 4096,
            rejected_max_bytes: 8 * 1024 * 1024,
            waiting_max_bytes: 2 * 1024 * 1024,
            expire_after: Some(Duration::from_secs(14 * 24 * 3600)),
            expire_interval: Duration::from_secs(3600),
            relay_enabled: true,
            route_mem_inputs: false,
            route_min_fee_per_kw: MIN_FEE_PER_KW,
            route_max_tx_weight: MAX_TX_WEIGHT,
            floor_relax_step: 100,
            floor_relax_interval: Duration::from_secs(60),
        }
    }
}

impl MempoolConfig {
    /// A small pool with eviction slack disabled, keeping size-boundary
    /// behavior deterministic. Used throughout the test suites.
    pub fn tight(max_pool_bytes: u64) -> Self {
        Self {
            max_pool_bytes,
            eviction_hysteresis: 0,
            ..Self::default()
        }
    }
}
