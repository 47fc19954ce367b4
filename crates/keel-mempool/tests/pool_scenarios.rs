//! End-to-end pool scenarios through the public [`Mempool`] handle.

use std::sync::Arc;

use keel_core::constants::FINAL_SEQUENCE;
use keel_core::types::OutPoint;
use keel_mempool::testing::{
    funded_outpoint, make_block, make_tx, make_tx_seq, AcceptAllScripts, MockChain,
};
use keel_mempool::{AdmitOutcome, Mempool, MempoolConfig, PooledTx, RejectReason};
use proptest::prelude::*;

fn pool_with_chain(cfg: MempoolConfig) -> (Mempool, Arc<MockChain>) {
    let chain = Arc::new(MockChain::default());
    let pool = Mempool::new(cfg, chain.clone(), Arc::new(AcceptAllScripts), None);
    (pool, chain)
}

#[test]
fn cpfp_pulls_a_cheap_parent_ahead_in_the_template() {
    let (pool, chain) = pool_with_chain(MempoolConfig::default());

    let op_parent = funded_outpoint(&chain, 1, 1_000_000);
    let op_bystander = funded_outpoint(&chain, 2, 1_000_000);
    let parent = make_tx(&[op_parent], &[1_000_000 - 400]);
    let parent_id = parent.txid().unwrap();
    let bystander = make_tx(&[op_bystander], &[1_000_000 - 600]);
    let bystander_id = bystander.txid().unwrap();
    let child = make_tx(&[OutPoint::new(parent_id, 0)], &[999_600 - 50_000]);
    let child_id = child.txid().unwrap();

    assert!(pool.admit(parent, false, false).unwrap().is_accepted());
    assert!(pool.admit(bystander, false, false).unwrap().is_accepted());
    assert!(pool.admit(child, false, false).unwrap().is_accepted());

    // Plain fee order: the bystander outbids the parent on its own.
    assert_eq!(pool.sorted(), vec![bystander_id, parent_id, child_id]);

    // With packages, the child's fee carries its parent to the front.
    assert_eq!(pool.sorted_with_cpfp(), vec![parent_id, child_id, bystander_id]);

    let packages = pool.packages_snapshot();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].txs, vec![parent_id, child_id]);
    assert_eq!(pool.consistency_check(), 0);
}

#[test]
fn replacement_boundary_sits_at_the_cluster_aggregate() {
    let (pool, chain) = pool_with_chain(MempoolConfig::default());

    let op = funded_outpoint(&chain, 1, 1_000_000);
    let target = make_tx(&[op], &[1_000_000 - 5_000]);
    let target_id = target.txid().unwrap();
    let child = make_tx(&[OutPoint::new(target_id, 0)], &[995_000 - 20_000]);
    let tot_weight = target.weight().unwrap() + child.weight().unwrap();
    let tot_fee = 25_000u64;
    assert!(pool.admit(target, false, false).unwrap().is_accepted());
    assert!(pool.admit(child, false, false).unwrap().is_accepted());

    // The second output only perturbs the txid; the fee varies with the
    // first output's value, the weight does not.
    let replacement = |fee: u64| make_tx(&[op], &[1_000_000 - fee - 1, 1]);
    let new_weight = replacement(1_000).weight().unwrap();

    // Matching the aggregate rate of the displaced cluster is not enough.
    let boundary = tot_fee * new_weight / tot_weight;
    let outcome = pool.admit(replacement(boundary), false, false).unwrap();
    assert!(matches!(
        outcome,
        AdmitOutcome::Rejected {
            reason: RejectReason::RbfLowFee,
            ..
        }
    ));
    assert_eq!(pool.len(), 2);

    // One keel over the boundary takes both out.
    let winner = replacement(boundary + 1);
    let winner_id = winner.txid().unwrap();
    assert!(pool.admit(winner, false, false).unwrap().is_accepted());
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&winner_id));
    assert_eq!(pool.consistency_check(), 0);
}

#[test]
fn pool_holds_exactly_its_configured_size() {
    let chain = Arc::new(MockChain::default());
    let op_a = funded_outpoint(&chain, 1, 1_000_000);
    let op_b = funded_outpoint(&chain, 2, 1_000_000);
    let cheap = make_tx(&[op_a], &[1_000_000 - 1_000]);
    let cheap_id = cheap.txid().unwrap();
    let rich = make_tx(&[op_b], &[1_000_000 - 50_000]);
    let rich_id = rich.txid().unwrap();
    let both = PooledTx::expected_footprint(cheap.weight().unwrap())
        + PooledTx::expected_footprint(rich.weight().unwrap());

    // Sized to fit both: nothing is evicted.
    let roomy = Mempool::new(
        MempoolConfig::tight(both),
        chain.clone(),
        Arc::new(AcceptAllScripts),
        None,
    );
    assert!(roomy.admit(cheap.clone(), false, false).unwrap().is_accepted());
    assert!(roomy.admit(rich.clone(), false, false).unwrap().is_accepted());
    assert_eq!(roomy.len(), 2);
    assert_eq!(roomy.total_size(), both);

    // One byte short: the cheaper entry goes and its rate becomes the floor.
    let tight = Mempool::new(
        MempoolConfig::tight(both - 1),
        chain.clone(),
        Arc::new(AcceptAllScripts),
        None,
    );
    assert!(tight.admit(cheap, false, false).unwrap().is_accepted());
    assert!(tight.admit(rich, false, false).unwrap().is_accepted());
    assert_eq!(tight.len(), 1);
    assert!(tight.contains(&rich_id));
    assert!(!tight.contains(&cheap_id));
    assert!(tight.fee_floor_per_kw() > MempoolConfig::default().min_fee_per_kw);
    assert_eq!(tight.consistency_check(), 0);
}

#[test]
fn mine_then_undo_restores_the_pool() {
    let (pool, chain) = pool_with_chain(MempoolConfig::default());

    let op = funded_outpoint(&chain, 1, 1_000_000);
    let parent = make_tx(&[op], &[1_000_000 - 5_000]);
    let parent_id = parent.txid().unwrap();
    let child = make_tx(&[OutPoint::new(parent_id, 0)], &[995_000 - 10_000]);
    let child_id = child.txid().unwrap();
    assert!(pool.admit(parent.clone(), false, false).unwrap().is_accepted());
    assert!(pool.admit(child, false, false).unwrap().is_accepted());

    let block = make_block(vec![parent], 7);
    chain.remove_utxo(&op);
    chain.add_utxo(OutPoint::new(parent_id, 0), 995_000);
    chain.mark_confirmed(parent_id);
    pool.block_mined(&block);
    assert!(!pool.contains(&parent_id));
    assert_eq!(pool.get(&child_id).unwrap().mem_input_cnt, 0);

    chain.add_utxo(op, 1_000_000);
    pool.block_undone(&block);
    assert!(pool.contains(&parent_id));
    assert_eq!(pool.get(&child_id).unwrap().mem_input_cnt, 1);
    assert_eq!(pool.sorted(), vec![parent_id, child_id]);
    assert_eq!(pool.consistency_check(), 0);
}

#[test]
fn wallet_replaces_its_own_final_transaction() {
    let (pool, chain) = pool_with_chain(MempoolConfig::default());
    let op = funded_outpoint(&chain, 1, 1_000_000);
    let original = make_tx_seq(&[op], &[1_000_000 - 5_000], FINAL_SEQUENCE);
    let original_id = original.txid().unwrap();
    assert!(pool.submit_local_tx(original).unwrap().is_accepted());
    assert!(pool.get(&original_id).unwrap().is_final);

    // A final sequence only shields against third-party replacement; the
    // wallet may still respend its own inputs.
    let respend = make_tx_seq(&[op], &[1_000_000 - 9_000], FINAL_SEQUENCE);
    let respend_id = respend.txid().unwrap();
    assert!(pool.submit_local_tx(respend).unwrap().is_accepted());
    assert!(pool.contains(&respend_id));
    assert!(!pool.contains(&original_id));
    assert_eq!(pool.consistency_check(), 0);
}

#[test]
fn resubmission_is_idempotent() {
    let (pool, chain) = pool_with_chain(MempoolConfig::default());
    let op = funded_outpoint(&chain, 1, 1_000_000);
    let tx = make_tx(&[op], &[1_000_000 - 5_000]);
    let txid = tx.txid().unwrap();

    assert!(pool.admit(tx.clone(), false, false).unwrap().is_accepted());
    let again = pool.admit(tx, false, false).unwrap();
    assert!(matches!(again, AdmitOutcome::AlreadyPooled { txid: t } if t == txid));
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.total_size(), pool.get(&txid).unwrap().footprint);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Arbitrary interleavings of fresh spends, chained spends, and
    /// conflicts leave every index mutually consistent.
    #[test]
    fn random_admissions_keep_the_pool_consistent(
        steps in prop::collection::vec((1u8..=24, 1_000u64..50_000, any::<bool>()), 1..40)
    ) {
        let (pool, chain) = pool_with_chain(MempoolConfig::default());
        let mut tip: Option<(keel_core::types::Hash256, u64)> = None;

        for (seed, fee, chain_prev) in steps {
            let (tx, value) = match tip {
                Some((parent, value)) if chain_prev && value > fee + 1_000 => {
                    (make_tx(&[OutPoint::new(parent, 0)], &[value - fee]), value - fee)
                }
                _ => {
                    let op = funded_outpoint(&chain, seed, 10_000_000);
                    (make_tx(&[op], &[10_000_000 - fee]), 10_000_000 - fee)
                }
            };
            let txid = tx.txid().unwrap();
            if pool.admit(tx, false, false).unwrap().is_accepted() {
                tip = Some((txid, value));
            } else if tip.is_some_and(|(t, _)| !pool.contains(&t)) {
                tip = None;
            }
            prop_assert_eq!(pool.consistency_check(), 0);
        }

        let order = pool.sorted();
        prop_assert_eq!(order.len(), pool.len());
        let accounted: u64 = order
            .iter()
            .map(|id| pool.get(id).unwrap().footprint)
            .sum();
        prop_assert_eq!(accounted, pool.total_size());
        prop_assert_eq!(pool.sorted_with_cpfp().len(), pool.len());
        prop_assert_eq!(pool.consistency_check(), 0);
    }
}
