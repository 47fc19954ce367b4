//! Protocol constants. All monetary values in keels (1 KEEL = 10^8 keels).

pub const COIN: u64 = 100_000_000;

/// Number of confirmations a coinbase output needs before it can be spent.
pub const COINBASE_MATURITY: u64 = 100;

/// Maximum serialized transaction size accepted from the network, in bytes.
pub const MAX_TX_WEIGHT: u64 = 400_000;

/// Sequence value at or above which an input opts out of replacement.
///
/// A transaction with any input at or above this sequence is "final":
/// untrusted peers cannot replace it via RBF.
pub const FINAL_SEQUENCE: u32 = 0xffff_fffe;

/// Absolute fee floor in keels per 1000 weight units.
pub const MIN_FEE_PER_KW: u64 = 1_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_is_one_hundred_million() {
        assert_eq!(COIN, 100_000_000);
    }

    #[test]
    fn final_sequence_allows_exactly_two_values() {
        assert!(0xffff_fffe_u32 >= FINAL_SEQUENCE);
        assert!(u32::MAX >= FINAL_SEQUENCE);
        assert!(0xffff_fffd_u32 < FINAL_SEQUENCE);
    }
}
