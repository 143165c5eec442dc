mod common;

use chrono::{Duration, Utc};
use common::{envelope, Harness, PROCESSOR};
use futures::future::join_all;
use payment_service::domain::{
    BillingCycle, NewTransaction, NormalizedEvent, SubscriptionStatus, TransactionKind,
    TransactionMetadata, TransactionStatus,
};
use payment_service::error::ServiceError;
use payment_service::processors::ProcessorError;
use payment_service::repository::{LedgerStore, StoreError};
use payment_service::services::{
    CreateSubscription, Disposition, RenewalOutcome, SubscriptionStarted, UpdateSubscription,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use uuid::Uuid;

fn request(fan_id: Uuid, creator_id: Uuid, payment_method_id: Uuid) -> CreateSubscription {
    CreateSubscription {
        fan_id,
        creator_id,
        price: 999,
        currency: "USD".into(),
        billing_cycle: BillingCycle::Monthly,
        trial_days: None,
        payment_method_id,
    }
}

async fn subscribed(h: &Harness) -> (Uuid, Uuid, SubscriptionStarted) {
    let fan = h.fan();
    let creator = h.creator();
    let card = h.card(fan).await;
    let started = h
        .subscriptions
        .create(request(fan, creator, card.id))
        .await
        .unwrap();
    (fan, creator, started)
}

#[tokio::test]
async fn test_create_charges_first_period_through_webhook() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;

    let subscription = &started.subscription;
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert!(subscription.auto_renew);
    assert_eq!(
        subscription.processor_subscription_id.as_deref(),
        Some(format!("sub_{}", subscription.id.simple()).as_str())
    );
    assert_eq!(
        subscription.current_period_end,
        BillingCycle::Monthly.advance(subscription.current_period_start)
    );

    let charge = started.initial_charge.clone().unwrap();
    assert_eq!(charge.status, TransactionStatus::Pending);
    assert_eq!(charge.payer_id, fan);
    assert_eq!(charge.recipient_id, Some(creator));
    assert_eq!(charge.subscription_id(), Some(subscription.id));
    assert_eq!(h.balance(creator).await, 0);

    let disposition = h
        .reconciler
        .dispatch(
            PROCESSOR,
            &envelope(
                "evt_first",
                NormalizedEvent::SaleSucceeded {
                    processor_tx_id: "ch_first".into(),
                    amount: 999,
                    user_ref: charge.id.to_string(),
                    subscription_ref: subscription.processor_subscription_id.clone(),
                },
            ),
        )
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Applied);
    assert_eq!(h.balance(creator).await, 870);
}

#[tokio::test]
async fn test_trial_defers_first_charge() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let card = h.card(fan).await;

    let mut req = request(fan, creator, card.id);
    req.trial_days = Some(7);
    let started = h.subscriptions.create(req).await.unwrap();

    assert_eq!(started.subscription.status, SubscriptionStatus::Trial);
    assert!(started.initial_charge.is_none());
    let trial_end = started.subscription.trial_end.unwrap();
    assert_eq!(trial_end, started.subscription.current_period_end);
    assert!(trial_end > Utc::now() + Duration::days(6));
    assert!(started.subscription.grants_access(Utc::now()));
}

#[tokio::test]
async fn test_create_rejections_leave_no_rows() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let card = h.card(fan).await;
    let creator_card = h.card(creator).await;

    let err = h
        .subscriptions
        .create(request(creator, creator, creator_card.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let mut long_trial = request(fan, creator, card.id);
    long_trial.trial_days = Some(91);
    let err = h.subscriptions.create(long_trial).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let mut cheap = request(fan, creator, card.id);
    cheap.price = 50;
    let err = h.subscriptions.create(cheap).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .subscriptions
        .create(request(fan, creator, creator_card.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    let other_fan = h.fan();
    let err = h
        .subscriptions
        .create(request(fan, other_fan, card.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    assert!(h.subscriptions.list(fan, None, None).await.unwrap().is_empty());
    assert!(h.subscriptions.list(creator, None, None).await.unwrap().is_empty());
    assert!(h.all_transactions(fan).await.is_empty());
    assert!(h.all_transactions(creator).await.is_empty());
}

#[tokio::test]
async fn test_second_live_subscription_conflicts() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;

    let err = h
        .subscriptions
        .create(request(fan, creator, started.subscription.payment_method_id.unwrap()))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn test_immediate_cancel_ends_access_now() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let cancelled = h.subscriptions.cancel(fan, id, true).await.unwrap();

    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(!cancelled.auto_renew);
    assert!(cancelled.current_period_end <= Utc::now());
    assert!(!cancelled.grants_access(Utc::now()));
    let calls = h.processor.cancelled_recurring.lock().clone();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1);

    // Cancelling again is a no-op
    let again = h.subscriptions.cancel(fan, id, true).await.unwrap();
    assert_eq!(again.version, cancelled.version);
}

#[tokio::test]
async fn test_deferred_cancel_keeps_access_until_period_end() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let period_end = started.subscription.current_period_end;

    let cancelled = h.subscriptions.cancel(fan, id, false).await.unwrap();

    assert_eq!(cancelled.status, SubscriptionStatus::Active);
    assert!(!cancelled.auto_renew);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(cancelled.current_period_end, period_end);
    assert!(cancelled.grants_access(Utc::now()));

    assert_eq!(h.subscriptions.finalize_expired(Utc::now(), 10).await.unwrap(), 0);
    let later = period_end + Duration::seconds(1);
    assert_eq!(h.subscriptions.finalize_expired(later, 10).await.unwrap(), 1);

    let stored = h.subscriptions.get(fan, id).await.unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn test_only_the_fan_can_cancel() {
    let h = Harness::new();
    let (_fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let err = h.subscriptions.cancel(creator, id, true).await.unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    let stranger = h.fan();
    let err = h.subscriptions.cancel(stranger, id, true).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_renewal_extends_period_and_credits_once() {
    let h = Harness::new();
    let (_fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let first_end = started.subscription.current_period_end;

    let outcome = h.subscriptions.renew(id, 999, "ch_renew_1").await.unwrap();
    let (subscription, transaction) = match outcome {
        RenewalOutcome::Applied {
            subscription,
            transaction,
        } => (subscription, transaction),
        other => panic!("expected Applied, got {:?}", other),
    };
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.current_period_start, first_end);
    assert_eq!(
        subscription.current_period_end,
        BillingCycle::Monthly.advance(first_end)
    );
    assert!(matches!(
        transaction.metadata,
        TransactionMetadata::Subscription { renewal: true, .. }
    ));
    assert_eq!(h.balance(creator).await, 870);

    let repeat = h.subscriptions.renew(id, 999, "ch_renew_1").await.unwrap();
    assert!(matches!(repeat, RenewalOutcome::Duplicate(ref tx) if tx.id == transaction.id));
    assert_eq!(h.balance(creator).await, 870);
    let stored = h
        .subscriptions
        .find_by_processor_id(
            PROCESSOR,
            subscription.processor_subscription_id.as_deref().unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_period_end, subscription.current_period_end);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_distinct_renewals_each_extend() {
    let h = Harness::new();
    let (_fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let first_end = started.subscription.current_period_end;

    let handles: Vec<_> = ["ch_r1", "ch_r2"]
        .into_iter()
        .map(|reference| {
            let subscriptions = Arc::clone(&h.subscriptions);
            tokio::spawn(async move { subscriptions.renew(id, 999, reference).await })
        })
        .collect();
    for joined in join_all(handles).await {
        let outcome = joined.unwrap().unwrap();
        assert!(matches!(outcome, RenewalOutcome::Applied { .. }), "{:?}", outcome);
    }

    let stored = h.subscriptions.get(creator, id).await.unwrap();
    assert_eq!(
        stored.current_period_end,
        BillingCycle::Monthly.advance(BillingCycle::Monthly.advance(first_end))
    );
    assert_eq!(h.balance(creator).await, 2 * 870);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_duplicate_renewals_apply_once() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let first_end = started.subscription.current_period_end;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let subscriptions = Arc::clone(&h.subscriptions);
            tokio::spawn(async move { subscriptions.renew(id, 999, "ch_dup").await })
        })
        .collect();
    let outcomes: Vec<RenewalOutcome> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let applied = outcomes
        .iter()
        .filter(|o| matches!(o, RenewalOutcome::Applied { .. }))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(h.balance(creator).await, 870);

    let stored = h.subscriptions.get(fan, id).await.unwrap();
    assert_eq!(stored.current_period_end, BillingCycle::Monthly.advance(first_end));

    // Losing rows are closed out, not left pending
    let renewals: Vec<_> = h
        .all_transactions(fan)
        .await
        .into_iter()
        .filter(|tx| matches!(tx.metadata, TransactionMetadata::Subscription { renewal: true, .. }))
        .collect();
    assert_eq!(
        renewals
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Completed)
            .count(),
        1
    );
    assert!(renewals
        .iter()
        .all(|tx| matches!(tx.status, TransactionStatus::Completed | TransactionStatus::Failed)));
}

#[tokio::test]
async fn test_renewal_after_cancellation_is_integrity_error() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    h.subscriptions.cancel(fan, id, true).await.unwrap();

    let err = h.subscriptions.renew(id, 999, "ch_late").await.unwrap_err();

    assert!(err.is_integrity(), "unexpected error: {:?}", err);
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_reactivate_reuses_record() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let err = h.subscriptions.reactivate(fan, id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    h.subscriptions.cancel(fan, id, true).await.unwrap();
    let restarted = h.subscriptions.reactivate(fan, id).await.unwrap();

    assert_eq!(restarted.subscription.id, id);
    assert_eq!(restarted.subscription.status, SubscriptionStatus::Active);
    assert!(restarted.subscription.auto_renew);
    assert!(restarted.subscription.cancelled_at.is_none());
    assert!(restarted.subscription.grants_access(Utc::now()));
    let charge = restarted.initial_charge.unwrap();
    assert_eq!(charge.status, TransactionStatus::Pending);
    assert_eq!(charge.subscription_id(), Some(id));

    let listed = h.subscriptions.list(creator, None, None).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_reactivation_opens_one_charge() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    h.subscriptions.cancel(fan, id, true).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let subscriptions = Arc::clone(&h.subscriptions);
            tokio::spawn(async move { subscriptions.reactivate(fan, id).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ServiceError::Conflict(_))));

    // The original first charge plus exactly one for the new period
    let charges = h
        .all_transactions(fan)
        .await
        .into_iter()
        .filter(|tx| tx.kind == TransactionKind::Subscription)
        .count();
    assert_eq!(charges, 2);
}

#[tokio::test]
async fn test_stale_restart_writes_neither_row_nor_charge() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    h.subscriptions.cancel(fan, id, true).await.unwrap();

    let stale = h.store.find_subscription(id).await.unwrap().unwrap();
    h.store.update_subscription(&stale).await.unwrap();
    let before = h.all_transactions(fan).await.len();

    let mut restarted = stale.clone();
    restarted.status = SubscriptionStatus::Active;
    let charge = NewTransaction {
        payer_id: fan,
        recipient_id: Some(stale.creator_id),
        kind: TransactionKind::Subscription,
        amount: stale.price,
        currency: stale.currency.clone(),
        processor: stale.processor.clone(),
        payment_method_id: stale.payment_method_id,
        metadata: TransactionMetadata::Subscription {
            subscription_id: id,
            billing_cycle: stale.billing_cycle,
            renewal: false,
            period_end: None,
        },
    };
    let err = h
        .store
        .restart_subscription(&restarted, Some(charge))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::VersionConflict(v) if v == id));
    assert_eq!(h.all_transactions(fan).await.len(), before);
    let stored = h.store.find_subscription(id).await.unwrap().unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn test_create_after_cancel_reactivates_same_record() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let method = started.subscription.payment_method_id.unwrap();
    h.subscriptions.cancel(fan, id, true).await.unwrap();

    let again = h
        .subscriptions
        .create(request(fan, creator, method))
        .await
        .unwrap();

    assert_eq!(again.subscription.id, id);
    assert_eq!(again.subscription.status, SubscriptionStatus::Active);
    assert_eq!(h.subscriptions.list(fan, None, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_registration_cancels_subscription() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let card = h.card(fan).await;
    h.processor
        .script_recurring(Err(ProcessorError::Declined("card expired".into())));

    let err = h
        .subscriptions
        .create(request(fan, creator, card.id))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Processor(ProcessorError::Declined(_))));

    let subscriptions = h.subscriptions.list(fan, None, None).await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Cancelled);
    let rows = h.all_transactions(fan).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransactionStatus::Failed);
}

#[tokio::test]
async fn test_registration_outage_keeps_subscription() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let card = h.card(fan).await;
    h.processor
        .script_recurring(Err(ProcessorError::Timeout(StdDuration::from_secs(10))));

    let started = h
        .subscriptions
        .create(request(fan, creator, card.id))
        .await
        .unwrap();

    assert_eq!(started.subscription.status, SubscriptionStatus::Active);
    assert!(started.subscription.processor_subscription_id.is_none());
    assert_eq!(
        started.initial_charge.unwrap().status,
        TransactionStatus::Pending
    );
}

#[tokio::test]
async fn test_suspend_only_affects_live_subscriptions() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let suspended = h.subscriptions.suspend(id, "card declined").await.unwrap();
    assert_eq!(suspended.status, SubscriptionStatus::Suspended);

    // A successful renewal brings it back
    let outcome = h.subscriptions.renew(id, 999, "ch_retry").await.unwrap();
    match outcome {
        RenewalOutcome::Applied { subscription, .. } => {
            assert_eq!(subscription.status, SubscriptionStatus::Active)
        }
        other => panic!("expected Applied, got {:?}", other),
    }

    h.subscriptions.cancel(fan, id, true).await.unwrap();
    let unchanged = h.subscriptions.suspend(id, "late failure").await.unwrap();
    assert_eq!(unchanged.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn test_processor_subscription_id_cannot_be_rebound() {
    let h = Harness::new();
    let (_fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let bound = started.subscription.processor_subscription_id.unwrap();

    let same = h
        .subscriptions
        .attach_processor_subscription(id, &bound)
        .await
        .unwrap();
    assert_eq!(same.processor_subscription_id.as_deref(), Some(bound.as_str()));

    let err = h
        .subscriptions
        .attach_processor_subscription(id, "sub_other")
        .await
        .unwrap_err();
    assert!(err.is_integrity());
}

#[tokio::test]
async fn test_update_pushes_new_terms_to_processor() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let updated = h
        .subscriptions
        .update(
            fan,
            id,
            UpdateSubscription {
                price: Some(1_499),
                billing_cycle: Some(BillingCycle::Yearly),
                auto_renew: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.price, 1_499);
    assert_eq!(updated.billing_cycle, BillingCycle::Yearly);
    assert!(updated.auto_renew);
    // The running period keeps the terms it was paid under
    assert_eq!(updated.current_period_end, started.subscription.current_period_end);

    let pushed = h.processor.recurring_updates.lock().clone();
    assert_eq!(pushed.len(), 1);
    assert_eq!(
        Some(pushed[0].0.as_str()),
        started.subscription.processor_subscription_id.as_deref()
    );
    assert_eq!(pushed[0].1.price, 1_499);
    assert_eq!(pushed[0].1.billing_cycle, BillingCycle::Yearly);
    assert_eq!(pushed[0].1.currency, "USD");
    assert!(pushed[0].1.auto_renew);
}

#[tokio::test]
async fn test_update_can_lift_a_deferred_cancel() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    h.subscriptions.cancel(fan, id, false).await.unwrap();

    let resumed = h
        .subscriptions
        .update(
            fan,
            id,
            UpdateSubscription {
                auto_renew: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(resumed.auto_renew);
    assert!(resumed.cancelled_at.is_none());
    assert_eq!(resumed.status, SubscriptionStatus::Active);
    assert!(!resumed.is_logically_cancelled(resumed.current_period_end + Duration::seconds(1)));

    let stopped = h
        .subscriptions
        .update(
            fan,
            id,
            UpdateSubscription {
                auto_renew: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!stopped.auto_renew);
    assert!(stopped.cancelled_at.is_some());
}

#[tokio::test]
async fn test_update_rejections() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    let reprice = || UpdateSubscription {
        price: Some(1_999),
        ..Default::default()
    };

    let err = h
        .subscriptions
        .update(fan, id, UpdateSubscription::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .subscriptions
        .update(
            fan,
            id,
            UpdateSubscription {
                price: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h.subscriptions.update(creator, id, reprice()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    let stranger = h.fan();
    let err = h.subscriptions.update(stranger, id, reprice()).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    h.subscriptions.cancel(fan, id, true).await.unwrap();
    let err = h.subscriptions.update(fan, id, reprice()).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    assert!(h.processor.recurring_updates.lock().is_empty());
    let stored = h.subscriptions.get(fan, id).await.unwrap();
    assert_eq!(stored.price, 999);
}

#[tokio::test]
async fn test_update_refused_by_processor_changes_nothing() {
    let h = Harness::new();
    let (fan, _creator, started) = subscribed(&h).await;
    let id = started.subscription.id;
    h.processor
        .script_update(Err(ProcessorError::Declined("price change not allowed".into())));

    let err = h
        .subscriptions
        .update(
            fan,
            id,
            UpdateSubscription {
                price: Some(1_499),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Processor(ProcessorError::Declined(_))));
    let stored = h.subscriptions.get(fan, id).await.unwrap();
    assert_eq!(stored.price, 999);
    assert_eq!(stored.version, started.subscription.version);
}

#[tokio::test]
async fn test_status_reports_access() {
    let h = Harness::new();
    let (fan, creator, started) = subscribed(&h).await;
    let id = started.subscription.id;

    let access = h.subscriptions.status(fan, id).await.unwrap();
    assert_eq!(access.subscription_id, id);
    assert_eq!(access.status, SubscriptionStatus::Active);
    assert!(access.has_access);
    assert!(access.auto_renew);
    assert!(!access.in_trial);
    assert!(access.days_remaining >= 27);

    h.subscriptions.cancel(fan, id, false).await.unwrap();
    let access = h.subscriptions.status(creator, id).await.unwrap();
    assert!(access.has_access);
    assert!(!access.auto_renew);

    h.subscriptions.cancel(fan, id, true).await.unwrap();
    let access = h.subscriptions.status(fan, id).await.unwrap();
    assert_eq!(access.status, SubscriptionStatus::Cancelled);
    assert!(!access.has_access);
    assert_eq!(access.days_remaining, 0);

    let stranger = h.fan();
    let err = h.subscriptions.status(stranger, id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}
