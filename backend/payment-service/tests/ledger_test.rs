mod common;

use chrono::{Duration, Utc};
use common::{Harness, PROCESSOR};
use futures::future::join_all;
use payment_service::domain::{
    NewTransaction, TransactionKind, TransactionMetadata, TransactionStatus,
};
use payment_service::error::ServiceError;
use payment_service::repository::{Completion, LedgerStore};
use payment_service::services::{RequestWithdrawal, SendTip};
use std::sync::Arc;

#[tokio::test]
async fn test_tip_completion_splits_fees_and_credits_creator() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;

    let tx = h
        .payments
        .send_tip(SendTip {
            payer_id: fan,
            recipient_id: creator,
            amount: 999,
            currency: None,
            message: Some("great stream".into()),
            payment_method_id: None,
        })
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.platform_fee_amount, 100);
    assert_eq!(tx.processor_fee_amount, 29);
    assert_eq!(tx.net_amount, Some(870));
    assert_eq!(h.balance(creator).await, 870);
    assert_eq!(h.balance(fan).await, 0);

    let share = h.store.find_revenue_share(tx.id).await.unwrap().unwrap();
    assert_eq!(share.creator_id, creator);
    assert_eq!(
        share.net_amount + share.platform_fee_amount + share.processor_fee_amount,
        share.gross_amount
    );

    let receipts = h.sink.wait_for(1).await;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].transaction_id, tx.id);
    assert_eq!(receipts[0].event_type(), "payment.tip.completed");
}

#[tokio::test]
async fn test_repeated_completion_credits_once() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let tx = h.pending_tip(fan, creator, 999).await;

    let first = h.ledger.mark_completed(tx.id, "ch_once").await.unwrap();
    let second = h.ledger.mark_completed(tx.id, "ch_once").await.unwrap();

    assert!(matches!(first, Completion::Completed { .. }));
    assert!(matches!(second, Completion::AlreadyCompleted(_)));
    assert_eq!(h.balance(creator).await, 870);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_completion_credits_once() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let id = h.pending_tip(fan, creator, 999).await.id;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let ledger = Arc::clone(&h.ledger);
            tokio::spawn(async move { ledger.mark_completed(id, "ch_race").await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let completed = results
        .iter()
        .filter(|r| matches!(r, Ok(Completion::Completed { .. })))
        .count();
    assert_eq!(completed, 1);
    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);
    assert_eq!(h.balance(creator).await, 870);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_rows_racing_for_one_processor_reference() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();

    for round in 0..20 {
        let first = h.pending_tip(fan, creator, 999).await;
        let second = h.pending_tip(fan, creator, 999).await;
        let reference = format!("ch_shared_{}", round);

        let handles: Vec<_> = [first.id, second.id]
            .into_iter()
            .map(|id| {
                let ledger = Arc::clone(&h.ledger);
                let reference = reference.clone();
                tokio::spawn(async move { ledger.mark_completed(id, &reference).await })
            })
            .collect();
        let results: Vec<_> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let winners: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Completion::Completed { transaction, .. } => Some(transaction.id),
                Completion::AlreadyCompleted(_) => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "round {}: {:?}", round, results);
        for result in &results {
            if let Completion::AlreadyCompleted(owner) = result {
                assert_eq!(owner.id, winners[0]);
                assert_eq!(owner.status, TransactionStatus::Completed);
            }
        }
    }
    assert_eq!(h.balance(creator).await, 20 * 870);
}

#[tokio::test]
async fn test_processor_reference_already_used_by_another_row() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let first = h.pending_tip(fan, creator, 999).await;
    let second = h.pending_tip(fan, creator, 999).await;

    h.ledger.mark_completed(first.id, "ch_shared").await.unwrap();
    let outcome = h.ledger.mark_completed(second.id, "ch_shared").await.unwrap();

    match outcome {
        Completion::AlreadyCompleted(owner) => assert_eq!(owner.id, first.id),
        other => panic!("expected AlreadyCompleted, got {:?}", other),
    }
    let second = h.ledger.require_transaction(second.id).await.unwrap();
    assert_eq!(second.status, TransactionStatus::Pending);
    assert_eq!(h.balance(creator).await, 870);
}

#[tokio::test]
async fn test_completing_failed_transaction_is_integrity_error() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let tx = h.pending_tip(fan, creator, 999).await;

    h.ledger.mark_failed(tx.id, "card declined").await.unwrap();
    let err = h.ledger.mark_completed(tx.id, "ch_late").await.unwrap_err();

    assert!(err.is_integrity(), "unexpected error: {:?}", err);
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_self_payment_is_rejected_without_rows() {
    let h = Harness::new();
    let creator = h.creator();

    let err = h
        .ledger
        .create_transaction(NewTransaction {
            payer_id: creator,
            recipient_id: Some(creator),
            kind: TransactionKind::Tip,
            amount: 500,
            currency: "USD".into(),
            processor: PROCESSOR.into(),
            payment_method_id: None,
            metadata: TransactionMetadata::Tip { message: None },
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Validation(_)));
    assert!(h.all_transactions(creator).await.is_empty());
}

#[tokio::test]
async fn test_non_positive_amount_is_rejected() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();

    for amount in [0, -100] {
        let err = h
            .ledger
            .create_transaction(NewTransaction {
                payer_id: fan,
                recipient_id: Some(creator),
                kind: TransactionKind::Tip,
                amount,
                currency: "USD".into(),
                processor: PROCESSOR.into(),
                payment_method_id: None,
                metadata: TransactionMetadata::Tip { message: None },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}

#[tokio::test]
async fn test_chargeback_waits_for_balance_then_applies() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let payout_method = h.card(creator).await;

    let tip = h.pending_tip(fan, creator, 5_000).await;
    h.ledger.mark_completed(tip.id, "ch_big").await.unwrap();
    // 5000 - 500 platform - 145 processor
    assert_eq!(h.balance(creator).await, 4_355);

    h.withdrawals
        .request(RequestWithdrawal {
            creator_id: creator,
            amount: 4_000,
            currency: None,
            payment_method_id: payout_method.id,
        })
        .await
        .unwrap();
    assert_eq!(h.balance(creator).await, 355);

    let reversal = h.ledger.mark_chargeback(tip.id).await.unwrap();
    assert!(reversal.newly_reversed);
    assert_eq!(reversal.original.status, TransactionStatus::Chargeback);
    let pending = reversal.reversal.unwrap();
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.amount, 4_355);
    assert_eq!(h.balance(creator).await, 355);

    // Nothing to apply while the wallet is short
    assert_eq!(h.ledger.retry_pending_reversals(10).await.unwrap(), 0);

    let deposited = h.fund(creator, 5_000).await;
    assert_eq!(deposited, 4_855);
    assert_eq!(h.ledger.retry_pending_reversals(10).await.unwrap(), 1);
    assert_eq!(h.balance(creator).await, 355 + 4_855 - 4_355);

    let applied = h.ledger.require_transaction(pending.id).await.unwrap();
    assert_eq!(applied.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_second_reversal_is_a_no_op() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let tip = h.pending_tip(fan, creator, 999).await;
    h.ledger.mark_completed(tip.id, "ch_rev").await.unwrap();

    let first = h.ledger.mark_refunded(tip.id, "requested").await.unwrap();
    let second = h.ledger.mark_chargeback(tip.id).await.unwrap();

    assert!(first.newly_reversed);
    assert!(!second.newly_reversed);
    assert_eq!(second.original.status, TransactionStatus::Refunded);
    assert_eq!(
        first.reversal.map(|r| r.id),
        second.reversal.map(|r| r.id)
    );
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_earnings_cover_creator_income_only() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();

    let tip = h.pending_tip(fan, creator, 999).await;
    h.ledger.mark_completed(tip.id, "ch_earn").await.unwrap();
    h.pending_tip(fan, creator, 2_000).await;
    h.fund(creator, 1_000).await;

    let earnings = h.ledger.earnings(creator).await.unwrap();
    assert_eq!(earnings.lifetime_net, 870);
    assert_eq!(earnings.monthly_net, 870);
    assert_eq!(earnings.pending_gross, 2_000);
    assert_eq!(earnings.breakdown.len(), 1);
    assert_eq!(earnings.breakdown[0].kind, TransactionKind::Tip);
    assert_eq!(earnings.breakdown[0].count, 1);
    assert_eq!(earnings.balance, 870 + 971);
}

#[tokio::test]
async fn test_transactions_are_private_to_their_parties() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let stranger = h.fan();
    let tip = h.pending_tip(fan, creator, 999).await;

    assert!(h.ledger.get_transaction(fan, tip.id).await.is_ok());
    assert!(h.ledger.get_transaction(creator, tip.id).await.is_ok());
    let err = h.ledger.get_transaction(stranger, tip.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_list_transactions_filters_by_kind() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.pending_tip(fan, creator, 999).await;
    h.fund(fan, 1_000).await;

    let tips = h
        .ledger
        .list_transactions(fan, Some(TransactionKind::Tip), None, None)
        .await
        .unwrap();
    assert_eq!(tips.len(), 1);
    assert_eq!(h.all_transactions(fan).await.len(), 2);

    let err = h
        .ledger
        .list_transactions(fan, None, Some(0), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn test_backdated_row_keeps_other_fields() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let tip = h.pending_tip(fan, creator, 999).await;

    let past = Utc::now() - Duration::days(10);
    assert!(h.store.backdate_transaction(tip.id, past));
    let row = h.ledger.require_transaction(tip.id).await.unwrap();
    assert_eq!(row.created_at, past);
    assert_eq!(row.amount, 999);
}
