/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Credit ledger semantics: two-phase spend, idempotent replay, and the
//! reservation state machine.

use std::time::Duration;

use weir::error::LedgerError;
use weir::ledger::CreditLedger;
use weir::models::TransactionStatus;

use crate::fixtures::test_dal;

#[tokio::test]
async fn test_unknown_user_has_zero_balance() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    assert_eq!(ledger.balance("nobody").await.unwrap(), 0);
}

#[tokio::test]
async fn test_add_credits_is_idempotent_on_reference() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);

    assert_eq!(
        ledger
            .add_credits("alice", 100, "purchase", "payment-1")
            .await
            .unwrap(),
        100
    );
    // Webhook redelivery of the same payment.
    assert_eq!(
        ledger
            .add_credits("alice", 100, "purchase", "payment-1")
            .await
            .unwrap(),
        100
    );
    assert_eq!(
        ledger
            .add_credits("alice", 50, "purchase", "payment-2")
            .await
            .unwrap(),
        150
    );
}

#[tokio::test]
async fn test_reserve_then_confirm_deducts_once() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger
        .add_credits("alice", 10, "grant", "g-1")
        .await
        .unwrap();

    let reservation = ledger.reserve("alice", "generate", 3, "r-1").await.unwrap();
    assert!(reservation.has_credits);
    assert_eq!(reservation.status, TransactionStatus::Reserved);
    // Reservation alone moves nothing.
    assert_eq!(ledger.balance("alice").await.unwrap(), 10);

    assert_eq!(ledger.confirm(reservation.reservation_id).await.unwrap(), 7);
    // Confirm replay (redelivered job) deducts nothing further.
    assert_eq!(ledger.confirm(reservation.reservation_id).await.unwrap(), 7);
    assert_eq!(ledger.balance("alice").await.unwrap(), 7);
}

#[tokio::test]
async fn test_cancel_releases_without_balance_effect() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("bob", 5, "grant", "g-1").await.unwrap();

    let reservation = ledger.reserve("bob", "generate", 5, "r-1").await.unwrap();
    assert!(reservation.has_credits);

    ledger.cancel(reservation.reservation_id).await.unwrap();
    ledger.cancel(reservation.reservation_id).await.unwrap(); // idempotent
    assert_eq!(ledger.balance("bob").await.unwrap(), 5);

    // The released credits are reservable again.
    let second = ledger.reserve("bob", "generate", 5, "r-2").await.unwrap();
    assert!(second.has_credits);
}

#[tokio::test]
async fn test_insufficient_is_recorded_not_an_error() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("carol", 2, "grant", "g-1").await.unwrap();

    let denied = ledger.reserve("carol", "generate", 3, "r-1").await.unwrap();
    assert!(!denied.has_credits);
    assert_eq!(denied.status, TransactionStatus::Insufficient);
    assert_eq!(denied.balance, 2);

    // The denial is on the books.
    let row = ledger.find_by_idempotency_key("r-1").await.unwrap().unwrap();
    assert_eq!(row.status, TransactionStatus::Insufficient);
}

#[tokio::test]
async fn test_reserve_replay_returns_recorded_outcome() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("dave", 10, "grant", "g-1").await.unwrap();

    let first = ledger.reserve("dave", "generate", 4, "r-1").await.unwrap();
    let replay = ledger.reserve("dave", "generate", 4, "r-1").await.unwrap();
    assert_eq!(replay.reservation_id, first.reservation_id);

    // Exactly one reservation holds credits.
    let outstanding = ledger.reserve("dave", "generate", 7, "r-2").await.unwrap();
    assert_eq!(outstanding.status, TransactionStatus::Insufficient);
}

#[tokio::test]
async fn test_outstanding_reservations_reduce_availability() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("erin", 10, "grant", "g-1").await.unwrap();

    let first = ledger.reserve("erin", "generate", 6, "r-1").await.unwrap();
    assert!(first.has_credits);

    // 10 - 6 outstanding leaves 4; a second 6-credit reservation must be
    // denied even though the balance still reads 10.
    let second = ledger.reserve("erin", "generate", 6, "r-2").await.unwrap();
    assert!(!second.has_credits);
    assert_eq!(ledger.balance("erin").await.unwrap(), 10);

    // Cancelling the first frees the credits.
    ledger.cancel(first.reservation_id).await.unwrap();
    let third = ledger.reserve("erin", "generate", 6, "r-3").await.unwrap();
    assert!(third.has_credits);
}

#[tokio::test]
async fn test_stale_reservation_reclaim_frees_availability() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal.clone());
    ledger.add_credits("hank", 10, "grant", "g-1").await.unwrap();

    // A delivery that died mid-handler: reserved, never settled. Its
    // retry reserves under a fresh key, so nothing else touches this row.
    let stranded = ledger.reserve("hank", "generate", 6, "r-dead").await.unwrap();
    assert!(stranded.has_credits);
    let blocked = ledger.reserve("hank", "generate", 6, "r-retry").await.unwrap();
    assert!(!blocked.has_credits);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        dal.ledger()
            .cancel_stale_reserved(Duration::ZERO)
            .await
            .unwrap(),
        1
    );

    let row = ledger
        .find_by_idempotency_key("r-dead")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Cancelled);

    // The held credits are spendable again.
    let freed = ledger.reserve("hank", "generate", 6, "r-after").await.unwrap();
    assert!(freed.has_credits);
    assert_eq!(ledger.balance("hank").await.unwrap(), 10);
}

#[tokio::test]
async fn test_fresh_reservations_survive_the_reclaim_cutoff() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal.clone());
    ledger.add_credits("iris", 10, "grant", "g-1").await.unwrap();

    let live = ledger.reserve("iris", "generate", 4, "r-live").await.unwrap();
    assert!(live.has_credits);

    // An hour-wide cutoff leaves a just-written reservation alone.
    assert_eq!(
        dal.ledger()
            .cancel_stale_reserved(Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );
    let row = ledger
        .find_by_idempotency_key("r-live")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, TransactionStatus::Reserved);
}

#[tokio::test]
async fn test_concurrent_reserves_on_one_key_record_one_row() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("judy", 10, "grant", "g-1").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.reserve("judy", "generate", 3, "r-shared").await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(outcome.has_credits);
        ids.push(outcome.reservation_id);
    }
    // Every racer saw the same recorded reservation.
    assert!(ids.iter().all(|id| *id == ids[0]));

    // Exactly one 3-credit hold is outstanding.
    let over = ledger.reserve("judy", "generate", 8, "r-over").await.unwrap();
    assert!(!over.has_credits);
    let fits = ledger.reserve("judy", "generate", 7, "r-fits").await.unwrap();
    assert!(fits.has_credits);
}

#[tokio::test]
async fn test_racing_reserves_never_overcommit_the_balance() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("kate", 10, "grant", "g-1").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .reserve("kate", "generate", 3, &format!("r-{}", i))
                .await
                .unwrap()
        }));
    }

    let mut admitted = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.has_credits {
            admitted.push(outcome.reservation_id);
        }
    }
    // 10 credits admit three 3-credit holds regardless of interleaving.
    assert_eq!(admitted.len(), 3);

    for id in admitted {
        ledger.confirm(id).await.unwrap();
    }
    assert_eq!(ledger.balance("kate").await.unwrap(), 1);
}

#[tokio::test]
async fn test_confirm_after_cancel_is_invariant_violation() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("frank", 5, "grant", "g-1").await.unwrap();

    let reservation = ledger.reserve("frank", "generate", 2, "r-1").await.unwrap();
    ledger.cancel(reservation.reservation_id).await.unwrap();

    let result = ledger.confirm(reservation.reservation_id).await;
    assert!(matches!(
        result,
        Err(LedgerError::InvalidTransition { .. })
    ));
    assert_eq!(ledger.balance("frank").await.unwrap(), 5);
}

#[tokio::test]
async fn test_cancel_after_confirm_is_invariant_violation() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);
    ledger.add_credits("grace", 5, "grant", "g-1").await.unwrap();

    let reservation = ledger.reserve("grace", "generate", 2, "r-1").await.unwrap();
    ledger.confirm(reservation.reservation_id).await.unwrap();

    let result = ledger.cancel(reservation.reservation_id).await;
    assert!(matches!(
        result,
        Err(LedgerError::InvalidTransition { .. })
    ));
    assert_eq!(ledger.balance("grace").await.unwrap(), 3);
}

#[tokio::test]
async fn test_confirm_unknown_reservation() {
    let dal = test_dal().await;
    let ledger = CreditLedger::new(dal);

    let result = ledger
        .confirm(weir::database::universal_types::UniversalUuid::new_v4())
        .await;
    assert!(matches!(result, Err(LedgerError::ReservationNotFound(_))));
}
