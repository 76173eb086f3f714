
use chrono::Utc;
use fixtures::*;
use txm::types::TxState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receipts_below_the_finalized_height_become_final() {
    setup_tracing();
    let harness = Harness::new();
    let finalizer = harness.finalizer();

    let mut confirmed = Vec::new();
    for (nonce, block) in [(0u64, 10u64), (1, 12), (2, 20)] {
        let tx = harness
            .seed_with_attempt(TxState::Unconfirmed, nonce, 20 * GWEI, Some(8), Utc::now())
            .await;
        harness
            .store
            .save_fetched_receipts(&[receipt_at(tx.attempts[0].hash, block)])
            .await
            .unwrap();
        confirmed.push(tx);
    }
    harness.chain.put_canonical_blocks(10, 12);

    finalizer.process_finalized(&head_chain(15, 15)).await.unwrap();

    assert_eq!(harness.refreshed(confirmed[0].id).await.state, TxState::Finalized);
    assert_eq!(harness.refreshed(confirmed[1].id).await.state, TxState::Finalized);
    // Above the finalized height, so still subject to re-orgs.
    assert_eq!(harness.refreshed(confirmed[2].id).await.state, TxState::Confirmed);
    // Both heights fit one header batch.
    assert_eq!(harness.chain.block_query_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivered_chain_answers_without_header_fetches() {
    setup_tracing();
    let harness = Harness::new();
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(8), Utc::now())
        .await;
    harness
        .store
        .save_fetched_receipts(&[receipt_at(tx.attempts[0].hash, 14)])
        .await
        .unwrap();

    harness.finalizer().process_finalized(&head_chain(12, 15)).await.unwrap();

    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Finalized);
    assert_eq!(harness.chain.block_query_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_receipt_hash_is_never_finalized() {
    setup_tracing();
    let harness = Harness::new();
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(8), Utc::now())
        .await;
    harness
        .store
        .save_fetched_receipts(&[txm::types::Receipt {
            block_hash: forked_hash(10),
            ..receipt_at(tx.attempts[0].hash, 10)
        }])
        .await
        .unwrap();
    harness.chain.put_canonical_blocks(10, 10);

    harness.finalizer().process_finalized(&head_chain(15, 15)).await.unwrap();

    // Finality is terminal; a receipt off the canonical chain is left for
    // the confirmer to repair.
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn regressed_or_repeated_heights_are_ignored() {
    setup_tracing();
    let harness = Harness::new();
    let finalizer = harness.finalizer();
    finalizer.process_finalized(&head_chain(15, 15)).await.unwrap();

    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(8), Utc::now())
        .await;
    harness
        .store
        .save_fetched_receipts(&[receipt_at(tx.attempts[0].hash, 10)])
        .await
        .unwrap();
    harness.chain.put_canonical_blocks(10, 10);

    finalizer.process_finalized(&head_chain(12, 12)).await.unwrap();
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Confirmed);
    assert_eq!(harness.chain.block_query_count(), 0);

    finalizer.process_finalized(&head_chain(16, 16)).await.unwrap();
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Finalized);
    assert_eq!(harness.chain.block_query_count(), 1);

    finalizer.process_finalized(&head_chain(16, 16)).await.unwrap();
    assert_eq!(harness.chain.block_query_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_blocks_defer_finalization() {
    setup_tracing();
    let harness = Harness::new();
    let finalizer = harness.finalizer();
    let tx = harness
        .seed_with_attempt(TxState::Unconfirmed, 0, 20 * GWEI, Some(8), Utc::now())
        .await;
    harness
        .store
        .save_fetched_receipts(&[receipt_at(tx.attempts[0].hash, 10)])
        .await
        .unwrap();

    // The node cannot serve the header yet.
    finalizer.process_finalized(&head_chain(15, 15)).await.unwrap();
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Confirmed);

    harness.chain.put_canonical_blocks(10, 10);
    finalizer.process_finalized(&head_chain(16, 16)).await.unwrap();
    assert_eq!(harness.refreshed(tx.id).await.state, TxState::Finalized);
}
