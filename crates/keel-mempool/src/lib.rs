//! # keel-mempool
//!
//! The unconfirmed transaction pool of a Keel node.
//!
//! One synchronous admission pipeline validates every offered transaction
//! and either pools it, parks it until a missing parent arrives, or
//! quarantines the rejection so it is not fetched again. The pool keeps a
//! fee-ordered list with sparse numeric ranks for cheap rank comparison,
//! groups parents with their paying descendants into CPFP fee packages,
//! supports replace-by-fee against the aggregate rate of the displaced
//! cluster, and trims itself to a size ceiling behind a dynamic fee floor.
//!
//! All state lives in [`MempoolState`]; [`Mempool`] wraps it in a mutex
//! for shared use across the node.

pub mod admit;
pub mod check;
pub mod config;
pub mod entry;
pub mod evict;
pub mod mining;
pub mod packages;
pub mod pool;
pub mod reject;
pub mod sort;
pub mod state;
pub mod testing;

pub use admit::{AdmitOutcome, TxKnowledge};
pub use config::MempoolConfig;
pub use entry::{ranks_better, PooledTx};
pub use packages::{FeeBand, FeePackage, PackageId};
pub use pool::Mempool;
pub use reject::{RejectReason, RejectedTx};
pub use state::MempoolState;
