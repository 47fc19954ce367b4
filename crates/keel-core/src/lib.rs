//! # keel-core
//! Foundation types and traits for the Keel protocol.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod traits;
pub mod types;
