//! End-to-end scenarios through the monitor -> scanner -> executor pipeline
//! with in-memory chain and reputation doubles.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{Address, H256};

use common::{
    temp_file_store, test_config, trade_event, EstimateBehavior, MockChain, MockEvaluator,
};
use room_sniper::config::EvictionPolicy;
use room_sniper::error::TradeError;
use room_sniper::models::{addr_checksum, addr_key, Candidate, CandidateStatus};
use room_sniper::sniper::Sniper;
use room_sniper::storage::Store;
use room_sniper::trading::{CandidateScanner, TradeExecutor};

const SUBJECT: Address = Address::repeat_byte(0x21);
const OTHER_SUBJECT: Address = Address::repeat_byte(0x22);
const OUTSIDER: Address = Address::repeat_byte(0x99);

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn creation_event_becomes_pending_candidate_and_dedups() {
    let (chain, events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let sniper = Sniper::new(
        chain.clone(),
        store.clone(),
        evaluator,
        None,
        Arc::new(test_config()),
    );
    sniper.clone().start().await.unwrap();

    // Scenario A: supply 1 + multiplier 10 creates a pending candidate on
    // curve 2.
    let creation = trade_event(1, 0, OUTSIDER, SUBJECT, true, 1, 10, 1_001);
    events.send(Ok(creation.clone())).await.unwrap();
    settle().await;

    let candidate = store.candidate(&addr_key(SUBJECT)).await.unwrap().unwrap();
    assert_eq!(candidate.status, CandidateStatus::Pending);
    assert_eq!(candidate.curve_index, 2);
    assert_eq!(candidate.multiplier, 10);

    // Same (tx hash, log index) again: no observable effect.
    events.send(Ok(creation)).await.unwrap();
    settle().await;

    let pending = store
        .candidates_with_status(&[CandidateStatus::Pending])
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let status = sniper.status().await.unwrap();
    assert_eq!(status.monitor.events_processed, 1);
    assert_eq!(status.monitor.duplicates_dropped, 1);
    assert_eq!(status.monitor.last_block, 1_001);

    sniper.shutdown().await;
}

#[tokio::test]
async fn unresolvable_room_is_evicted_without_a_buy() {
    // Scenario B, mark-ignored policy.
    let (chain, _events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let config = Arc::new(test_config());

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let scanner = Arc::new(CandidateScanner::new(
        store.clone(),
        evaluator.clone(),
        executor.clone(),
        None,
        config.clone(),
    ));

    let candidate = Candidate::new(SUBJECT, H256::from_low_u64_be(7), 10, Utc::now());
    store.insert_candidate(&candidate).await.unwrap();

    // First pass: one failed poll, still pending.
    scanner.scan_once().await.unwrap();
    let after_one = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(after_one.status, CandidateStatus::Pending);
    assert_eq!(after_one.poll_attempts, 1);
    assert!(after_one.last_checked.is_some());

    // Second pass reaches max_poll_attempts = 2 and evicts.
    scanner.scan_once().await.unwrap();
    let after_two = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(after_two.status, CandidateStatus::Ignored);

    assert_eq!(chain.submission_count().await, 0);
    executor.shutdown().await;
}

#[tokio::test]
async fn delete_policy_removes_the_row() {
    let (chain, _events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let mut config = test_config();
    config.eviction_policy = EvictionPolicy::Delete;
    config.max_poll_attempts = 1;
    let config = Arc::new(config);

    let executor = Arc::new(TradeExecutor::new(chain, store.clone(), &config));
    let scanner = Arc::new(CandidateScanner::new(
        store.clone(),
        evaluator,
        executor.clone(),
        None,
        config,
    ));

    let candidate = Candidate::new(SUBJECT, H256::from_low_u64_be(7), 1, Utc::now());
    store.insert_candidate(&candidate).await.unwrap();

    scanner.scan_once().await.unwrap();
    assert!(store.candidate(&candidate.address).await.unwrap().is_none());
    executor.shutdown().await;
}

#[tokio::test]
async fn admitted_candidate_is_bought_exactly_once() {
    // Scenario C: 15000 followers against a 10000 threshold, unverified,
    // OR policy.
    let (chain, _events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let config = Arc::new(test_config());

    evaluator.set_handle(SUBJECT, Some("cryptochad")).await;
    evaluator.set_profile("cryptochad", 15_000, false).await;

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let scanner = Arc::new(CandidateScanner::new(
        store.clone(),
        evaluator,
        executor.clone(),
        None,
        config.clone(),
    ));

    let candidate = Candidate::new(SUBJECT, H256::from_low_u64_be(7), 10, Utc::now());
    store.insert_candidate(&candidate).await.unwrap();

    scanner.scan_once().await.unwrap();

    let submissions = chain.submissions.lock().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, "buy");
    assert_eq!(submissions[0].amount, config.buy_amount);
    assert_eq!(submissions[0].curve_index, Some(2));
    let buy_tx = submissions[0].tx_hash;
    drop(submissions);

    let bought = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(bought.status, CandidateStatus::Bought);
    assert_eq!(
        bought.bought_tx_hash.as_deref(),
        Some(format!("{:#x}", buy_tx).as_str())
    );
    assert_eq!(bought.follower_count, Some(15_000));
    assert_eq!(bought.is_verified, Some(false));

    let position = store.position(&candidate.address).await.unwrap().unwrap();
    assert_eq!(position.total_amount, config.buy_amount);

    // A second pass finds nothing unresolved; no second buy.
    scanner.scan_once().await.unwrap();
    assert_eq!(chain.submission_count().await, 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn require_verified_switches_or_to_and() {
    let (chain, _events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let mut config = test_config();
    config.require_verified = true;
    let config = Arc::new(config);

    evaluator.set_handle(SUBJECT, Some("cryptochad")).await;
    evaluator.set_profile("cryptochad", 15_000, false).await;

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let scanner = Arc::new(CandidateScanner::new(
        store.clone(),
        evaluator,
        executor.clone(),
        None,
        config,
    ));

    let candidate = Candidate::new(SUBJECT, H256::from_low_u64_be(7), 10, Utc::now());
    store.insert_candidate(&candidate).await.unwrap();

    scanner.scan_once().await.unwrap();

    let ignored = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(ignored.status, CandidateStatus::Ignored);
    // The signals are still persisted even though the policy said no.
    assert_eq!(ignored.follower_count, Some(15_000));
    assert_eq!(chain.submission_count().await, 0);
    executor.shutdown().await;
}

#[tokio::test]
async fn profile_outage_marks_error_then_retries_to_bought() {
    let (chain, _events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let config = Arc::new(test_config());

    evaluator.set_handle(SUBJECT, Some("cryptochad")).await;
    evaluator.set_profile("cryptochad", 15_000, true).await;
    evaluator.profile_unavailable.store(true, Ordering::SeqCst);

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let scanner = Arc::new(CandidateScanner::new(
        store.clone(),
        evaluator.clone(),
        executor.clone(),
        None,
        config,
    ));

    let candidate = Candidate::new(SUBJECT, H256::from_low_u64_be(7), 10, Utc::now());
    store.insert_candidate(&candidate).await.unwrap();

    scanner.scan_once().await.unwrap();
    let errored = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(errored.status, CandidateStatus::Error);
    assert!(errored.last_error.is_some());

    // Error candidates are back in the scan filter; the next pass buys.
    evaluator.profile_unavailable.store(false, Ordering::SeqCst);
    scanner.scan_once().await.unwrap();
    let bought = store.candidate(&candidate.address).await.unwrap().unwrap();
    assert_eq!(bought.status, CandidateStatus::Bought);
    executor.shutdown().await;
}

#[tokio::test]
async fn deferred_sell_clears_on_external_buy() {
    // Scenario D end-to-end through the hooks.
    let (chain, events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let sniper = Sniper::new(
        chain.clone(),
        store.clone(),
        evaluator,
        None,
        Arc::new(test_config()),
    );
    sniper.clone().start().await.unwrap();

    let key = addr_key(SUBJECT);
    store
        .record_purchase(&key, &addr_checksum(SUBJECT), 1, "0x1", Utc::now())
        .await
        .unwrap();
    chain.set_estimate(SUBJECT, EstimateBehavior::LastShare).await;

    let executor = sniper.executor();
    let receipt = executor.sell(SUBJECT, None).await.unwrap();
    assert!(receipt.deferred);
    assert!(receipt.tx_hash.is_none());
    assert!(executor.is_deferred(&key).await);
    assert_eq!(chain.submission_count().await, 0);

    // Someone else buys in: supply grows, the sell becomes possible and
    // the hook exits the position into the new liquidity.
    chain.set_estimate(SUBJECT, EstimateBehavior::Ok).await;
    events
        .send(Ok(trade_event(50, 0, OUTSIDER, SUBJECT, true, 5, 10, 1_002)))
        .await
        .unwrap();
    settle().await;

    assert!(!executor.is_deferred(&key).await);
    assert!(store.position(&key).await.unwrap().is_none());
    let submissions = chain.submissions.lock().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, "sell");
    drop(submissions);

    sniper.shutdown().await;
}

#[tokio::test]
async fn creator_sell_dumps_the_position() {
    let (chain, events) = MockChain::new(Duration::from_millis(1));
    let store = temp_file_store().await;
    let evaluator = Arc::new(MockEvaluator::default());
    let sniper = Sniper::new(
        chain.clone(),
        store.clone(),
        evaluator,
        None,
        Arc::new(test_config()),
    );
    sniper.clone().start().await.unwrap();

    let key = addr_key(SUBJECT);
    store
        .record_purchase(&key, &addr_checksum(SUBJECT), 2, "0x1", Utc::now())
        .await
        .unwrap();

    // The creator sells their own shares.
    events
        .send(Ok(trade_event(60, 0, SUBJECT, SUBJECT, false, 3, 10, 1_003)))
        .await
        .unwrap();
    settle().await;

    assert!(store.position(&key).await.unwrap().is_none());
    let submissions = chain.submissions.lock().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].kind, "sell");
    assert_eq!(submissions[0].amount, 2);
    drop(submissions);

    sniper.shutdown().await;
}

#[tokio::test]
async fn concurrent_sells_serialize_with_distinct_hashes() {
    // Scenario E.
    let (chain, _events) = MockChain::new(Duration::from_millis(50));
    let store = temp_file_store().await;
    let config = test_config();

    for subject in [SUBJECT, OTHER_SUBJECT] {
        store
            .record_purchase(
                &addr_key(subject),
                &addr_checksum(subject),
                1,
                "0x1",
                Utc::now(),
            )
            .await
            .unwrap();
    }

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let (first, second) = tokio::join!(
        executor.sell(SUBJECT, None),
        executor.sell(OTHER_SUBJECT, None)
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert!(!chain.overlapped());
    assert_ne!(first.tx_hash, second.tx_hash);
    assert!(first.tx_hash.is_some() && second.tx_hash.is_some());
    executor.shutdown().await;
}

#[tokio::test]
async fn buy_and_sell_never_run_simultaneously() {
    let (chain, _events) = MockChain::new(Duration::from_millis(50));
    let store = temp_file_store().await;
    let config = test_config();

    store
        .record_purchase(
            &addr_key(OTHER_SUBJECT),
            &addr_checksum(OTHER_SUBJECT),
            1,
            "0x1",
            Utc::now(),
        )
        .await
        .unwrap();

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let (buy, sell) = tokio::join!(
        executor.buy(SUBJECT, 1, 0),
        executor.sell(OTHER_SUBJECT, None)
    );

    assert!(buy.is_ok());
    assert!(sell.is_ok());
    assert!(!chain.overlapped());
    assert_eq!(chain.submission_count().await, 2);
    executor.shutdown().await;
}

#[tokio::test]
async fn second_buy_fails_busy_while_first_is_in_flight() {
    let (chain, _events) = MockChain::new(Duration::from_millis(100));
    let store = temp_file_store().await;
    let executor = Arc::new(TradeExecutor::new(
        chain.clone(),
        store,
        &test_config(),
    ));

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.buy(SUBJECT, 1, 0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = executor.buy(OTHER_SUBJECT, 1, 0).await.unwrap_err();
    assert!(matches!(err, TradeError::Busy));

    assert!(first.await.unwrap().is_ok());
    assert_eq!(chain.submission_count().await, 1);
    executor.shutdown().await;
}

#[tokio::test]
async fn sell_all_walks_every_position_sequentially() {
    let (chain, _events) = MockChain::new(Duration::from_millis(10));
    let store = temp_file_store().await;
    let config = test_config();

    for subject in [SUBJECT, OTHER_SUBJECT] {
        store
            .record_purchase(
                &addr_key(subject),
                &addr_checksum(subject),
                2,
                "0x1",
                Utc::now(),
            )
            .await
            .unwrap();
    }

    let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
    let results = executor.sell_all().await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, outcome)| outcome.is_ok()));
    assert!(!chain.overlapped());
    assert!(store.positions().await.unwrap().is_empty());
    executor.shutdown().await;
}
