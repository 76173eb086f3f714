
use chrono::Utc;
use fixtures::*;
use txm::{
    confirmer::RECEIPT_MISSING_ERROR,
    stuck_detector::TERMINALLY_STUCK_ERROR,
    types::{TxAttemptState, TxState},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receipts_confirm_transactions() {
    setup_tracing();
    let harness = Harness::new();
    let txs = harness.broadcast_txs(&harness.broadcaster(), 2).await;

    harness.chain.set_mined_nonce(harness.account, 2);
    harness
        .chain
        .put_receipt(mined_receipt(txs[0].attempts[0].hash, 18));
    harness
        .chain
        .put_receipt(mined_receipt(txs[1].attempts[0].hash, 19));

    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    for (tx, block) in txs.iter().zip([18u64, 19]) {
        let tx = harness.refreshed(tx.id).await;
        assert_eq!(tx.state, TxState::Confirmed);
        let receipt = tx.receipt.unwrap();
        assert_eq!(receipt.block_number, block);
        assert_eq!(receipt.block_hash, block_hash(block));
        assert!(receipt.status);
        assert_eq!(tx.attempts[0].broadcast_before_block_num, Some(20));
    }
    // Nothing needed rebroadcasting.
    assert_eq!(harness.chain.sent_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reverted_receipt_records_the_reason() {
    setup_tracing();
    let harness = Harness::new();
    let txs = harness.broadcast_txs(&harness.broadcaster(), 1).await;

    harness.chain.set_mined_nonce(harness.account, 1);
    harness
        .chain
        .put_receipt(reverted_receipt(txs[0].attempts[0].hash, 18));
    harness
        .chain
        .set_revert_reason(18, "execution reverted: allowance exceeded");

    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    let tx = harness.refreshed(txs[0].id).await;
    assert_eq!(tx.state, TxState::Confirmed);
    let receipt = tx.receipt.unwrap();
    assert!(!receipt.status);
    assert!(receipt.revert_reason.unwrap().contains("allowance exceeded"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receipt_lookups_wait_for_the_mined_nonce() {
    setup_tracing();
    let harness = Harness::new();
    let txs = harness.broadcast_txs(&harness.broadcaster(), 1).await;
    // A receipt exists, but the node's mined count has not reached the
    // nonce, so no lookup should go out.
    harness
        .chain
        .put_receipt(mined_receipt(txs[0].attempts[0].hash, 18));

    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    assert_eq!(harness.chain.receipt_query_count(), 0);
    assert_eq!(harness.refreshed(txs[0].id).await.state, TxState::Unconfirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nonce_spent_without_receipt_is_eventually_abandoned() {
    setup_tracing();
    let harness = Harness::new();
    let confirmer = harness.confirmer();

    let waiting = harness.queue_tx_with(|tx| tx.signal_callback = true).await;
    harness.queue_tx().await;
    harness.broadcaster().process_queue().await.unwrap();
    let sibling = harness
        .store
        .find_tx_by_nonce(harness.account, 1)
        .await
        .unwrap()
        .unwrap();

    // Only the higher nonce has a receipt: nonce 0 was spent, but by what?
    harness.chain.set_mined_nonce(harness.account, 2);
    harness
        .chain
        .put_receipt(mined_receipt(sibling.attempts[0].hash, 18));

    confirmer.process_head(&head_chain(14, 20)).await.unwrap();
    assert_eq!(
        harness.refreshed(waiting.id).await.state,
        TxState::ConfirmedMissingReceipt
    );

    // Within the finality window the payload is kept alive on the network.
    harness.chain.script_send_error(nonce_too_low_rejection());
    confirmer.process_head(&head_chain(17, 21)).await.unwrap();
    assert_eq!(
        harness.refreshed(waiting.id).await.state,
        TxState::ConfirmedMissingReceipt
    );

    // Past the window the nonce is written off as externally spent.
    harness.chain.script_send_error(nonce_too_low_rejection());
    confirmer.process_head(&head_chain(22, 26)).await.unwrap();

    let abandoned = harness.refreshed(waiting.id).await;
    assert_eq!(abandoned.state, TxState::FatalError);
    assert_eq!(abandoned.error.as_deref(), Some(RECEIPT_MISSING_ERROR));

    let resumed = harness.completions.resumed();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, waiting.id);
    assert_eq!(resumed[0].2.as_deref(), Some(RECEIPT_MISSING_ERROR));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_receipt_transaction_recovers_when_the_receipt_surfaces() {
    setup_tracing();
    let harness = Harness::new();
    let tx = harness
        .seed_with_attempt(
            TxState::ConfirmedMissingReceipt,
            0,
            20 * GWEI,
            Some(10),
            Utc::now(),
        )
        .await;

    harness.chain.set_mined_nonce(harness.account, 1);
    harness.chain.put_receipt(mined_receipt(tx.attempts[0].hash, 12));
    harness.chain.script_send_error(nonce_too_low_rejection());

    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    let tx = harness.refreshed(tx.id).await;
    assert_eq!(tx.state, TxState::Confirmed);
    assert_eq!(tx.receipt.unwrap().block_number, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resend_acceptance_demotes_missing_receipt() {
    setup_tracing();
    let harness = Harness::new();
    let tx = harness
        .seed_with_attempt(
            TxState::ConfirmedMissingReceipt,
            0,
            20 * GWEI,
            Some(18),
            Utc::now(),
        )
        .await;
    harness.chain.set_mined_nonce(harness.account, 1);

    // The node accepts the resend, so it cannot have the nonce mined.
    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Unconfirmed);
    assert_eq!(harness.chain.sent_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_transactions_get_exactly_one_bump() {
    setup_tracing();
    let mut config = test_config();
    config.fee.bump_threshold = 5;
    let harness = Harness::with_config(config);
    let confirmer = harness.confirmer();
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(10), Utc::now())
        .await;

    confirmer.process_head(&head_chain(12, 16)).await.unwrap();

    let bumped = harness.refreshed(tx.id).await;
    assert_eq!(bumped.attempts.len(), 2);
    assert_eq!(bumped.attempts[0].fee.cap(), 25 * GWEI);
    assert_eq!(bumped.attempts[0].state, TxAttemptState::Broadcast);
    assert_eq!(bumped.nonce, Some(0));
    assert_eq!(harness.chain.sent_count(), 1);

    // The replacement is too fresh to bump again.
    confirmer.process_head(&head_chain(13, 17)).await.unwrap();
    assert_eq!(harness.refreshed(tx.id).await.attempts.len(), 2);
    assert_eq!(harness.chain.sent_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bump_at_the_ceiling_keeps_the_previous_attempt_alive() {
    setup_tracing();
    let mut config = test_config();
    config.fee.bump_threshold = 5;
    let harness = Harness::with_config(config);
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 450 * GWEI, Some(10), Utc::now())
        .await;

    harness.confirmer().process_head(&head_chain(12, 16)).await.unwrap();

    let kept = harness.refreshed(tx.id).await;
    assert_eq!(kept.attempts.len(), 1);
    assert_eq!(kept.attempts[0].fee.cap(), 450 * GWEI);
    assert_eq!(
        harness.alerts.count(|e| matches!(
            e,
            AlertEvent::FeeCeilingReached { ceiling: 500_000_000_000, .. }
        )),
        1
    );
    // The previous payload went out verbatim to stay in mempools.
    assert_eq!(harness.chain.sent(), vec![kept.attempts[0].signed_payload.clone()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reorged_receipt_is_rebroadcast_on_the_same_nonce() {
    setup_tracing();
    let harness = Harness::new();
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(12), Utc::now())
        .await;
    // Confirm against a block that will not be canonical.
    harness
        .store
        .save_fetched_receipts(&[txm::types::Receipt {
            block_hash: forked_hash(18),
            ..receipt_at(tx.attempts[0].hash, 18)
        }])
        .await
        .unwrap();
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Confirmed);

    harness.confirmer().process_head(&head_chain(14, 20)).await.unwrap();

    let repaired = harness.refreshed(tx.id).await;
    assert_eq!(repaired.state, TxState::Unconfirmed);
    assert!(repaired.receipt.is_none());
    assert_eq!(repaired.nonce, Some(0));
    assert_eq!(repaired.attempts.len(), 1);
    assert_eq!(repaired.attempts[0].state, TxAttemptState::Broadcast);
    assert_eq!(repaired.attempts[0].broadcast_before_block_num, None);
    assert_eq!(harness.chain.sent(), vec![repaired.attempts[0].signed_payload.clone()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn purged_stuck_transaction_dies_with_its_nonce() {
    setup_tracing();
    let mut config = test_config();
    config.purge.enabled = true;
    config.purge.threshold_blocks = 50;
    config.purge.min_attempts = 2;
    config.fee.bump_threshold = 0;
    let harness = Harness::with_config(config);
    let confirmer = harness.confirmer();

    // Two attempts already priced at or above the market that never landed.
    let tx = harness
        .queue_tx_with(|tx| {
            tx.state = TxState::Unconfirmed;
            tx.nonce = Some(0);
            tx.signal_callback = true;
        })
        .await;
    harness.add_broadcast_attempt(&tx, 20 * GWEI, Some(10), Utc::now()).await;
    harness.add_broadcast_attempt(&tx, 25 * GWEI, Some(12), Utc::now()).await;

    confirmer.process_head(&head_chain(66, 70)).await.unwrap();

    let with_purge = harness.refreshed(tx.id).await;
    assert_eq!(with_purge.attempts.len(), 3);
    let purge = with_purge.attempts[0].clone();
    assert!(purge.is_purge_attempt);
    assert_eq!(purge.state, TxAttemptState::Broadcast);
    assert_eq!(harness.chain.sent_count(), 1);

    // The purge replacement gets mined, burning the nonce.
    harness.chain.set_mined_nonce(harness.account, 1);
    harness.chain.put_receipt(mined_receipt(purge.hash, 71));
    confirmer.process_head(&head_chain(67, 71)).await.unwrap();

    let dead = harness.refreshed(tx.id).await;
    assert_eq!(dead.state, TxState::FatalError);
    assert_eq!(dead.error.as_deref(), Some(TERMINALLY_STUCK_ERROR));
    assert_eq!(dead.receipt.unwrap().block_number, 71);
    assert_eq!(
        harness.alerts.count(|e| matches!(e, AlertEvent::TxPurged { nonce: 0, .. })),
        1
    );
    assert_eq!(
        harness.store.purge_block_num(harness.account).await.unwrap(),
        Some(71)
    );

    let resumed = harness.completions.resumed();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].1.as_ref().unwrap().block_number, 71);
    assert_eq!(resumed[0].2.as_deref(), Some(TERMINALLY_STUCK_ERROR));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_callback_failures_retry_on_the_next_head() {
    setup_tracing();
    let harness = Harness::new();
    let confirmer = harness.confirmer();
    let tx = harness
        .queue_tx_with(|tx| {
            tx.state = TxState::Unconfirmed;
            tx.nonce = Some(0);
            tx.signal_callback = true;
        })
        .await;
    let attempt = harness.add_broadcast_attempt(&tx, 20 * GWEI, Some(15), Utc::now()).await;
    harness
        .store
        .save_fetched_receipts(&[receipt_at(attempt.hash, 18)])
        .await
        .unwrap();

    harness.completions.fail_next(1);
    confirmer.process_head(&head_chain(14, 20)).await.unwrap();
    assert!(harness.completions.resumed().is_empty());
    assert!(!harness.refreshed(tx.id).await.callback_completed);

    confirmer.process_head(&head_chain(15, 21)).await.unwrap();
    let resumed = harness.completions.resumed();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].0, tx.id);
    assert_eq!(resumed[0].1.as_ref().unwrap().block_number, 18);
    assert!(resumed[0].2.is_none());
    assert!(harness.refreshed(tx.id).await.callback_completed);

    // Exactly once: a later head does not signal again.
    confirmer.process_head(&head_chain(16, 22)).await.unwrap();
    assert_eq!(harness.completions.resumed().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn min_confirmations_gate_the_callback() {
    setup_tracing();
    let harness = Harness::new();
    let confirmer = harness.confirmer();
    let tx = harness
        .queue_tx_with(|tx| {
            tx.state = TxState::Unconfirmed;
            tx.nonce = Some(0);
            tx.signal_callback = true;
            tx.min_confirmations = 3;
        })
        .await;
    let attempt = harness.add_broadcast_attempt(&tx, 20 * GWEI, Some(19), Utc::now()).await;
    harness
        .store
        .save_fetched_receipts(&[receipt_at(attempt.hash, 20)])
        .await
        .unwrap();

    confirmer.process_head(&head_chain(16, 20)).await.unwrap();
    assert!(harness.completions.resumed().is_empty());

    confirmer.process_head(&head_chain(17, 21)).await.unwrap();
    assert!(harness.completions.resumed().is_empty());

    confirmer.process_head(&head_chain(18, 22)).await.unwrap();
    assert_eq!(harness.completions.resumed().len(), 1);
}
