mod common;

use chrono::{Duration, Utc};
use common::{Harness, PROCESSOR};
use payment_service::directory::AccountRole;
use payment_service::domain::{
    ContentKind, NewPaymentMethod, PaymentMethodKind, TransactionKind, TransactionStatus,
};
use payment_service::error::ServiceError;
use payment_service::processors::{ChargeOutcome, ProcessorError};
use payment_service::repository::LedgerStore;
use payment_service::services::{
    AttachPaymentMethod, Deposit, PurchaseContent, SendTip, UpdatePaymentMethod,
};
use serde_json::json;
use std::time::Duration as StdDuration;
use uuid::Uuid;

fn tip(payer_id: Uuid, recipient_id: Uuid, amount: i64) -> SendTip {
    SendTip {
        payer_id,
        recipient_id,
        amount,
        currency: None,
        message: None,
        payment_method_id: None,
    }
}

#[tokio::test]
async fn test_self_tip_is_rejected_before_any_charge() {
    let h = Harness::new();
    let creator = h.creator();
    h.card(creator).await;

    let err = h.payments.send_tip(tip(creator, creator, 500)).await.unwrap_err();

    assert!(matches!(err, ServiceError::Validation(_)));
    assert_eq!(h.processor.charge_count(), 0);
    assert!(h.all_transactions(creator).await.is_empty());
}

#[tokio::test]
async fn test_tip_bounds_and_recipient_checks() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    let other_fan = h.fan();
    h.card(fan).await;

    for amount in [99, 1_000_001] {
        let err = h.payments.send_tip(tip(fan, creator, amount)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)), "amount {}", amount);
    }

    let err = h.payments.send_tip(tip(fan, other_fan, 500)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payments
        .send_tip(tip(fan, Uuid::new_v4(), 500))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    let mut long = tip(fan, creator, 500);
    long.message = Some("x".repeat(501));
    let err = h.payments.send_tip(long).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    assert_eq!(h.processor.charge_count(), 0);
}

#[tokio::test]
async fn test_tip_without_payment_method_is_rejected() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();

    let err = h.payments.send_tip(tip(fan, creator, 500)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn test_declined_tip_fails_the_row() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    h.processor
        .script_charge(Err(ProcessorError::Declined("insufficient funds".into())));

    let err = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap_err();
    assert!(matches!(err, ServiceError::Processor(ProcessorError::Declined(_))));

    let rows = h.all_transactions(fan).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransactionStatus::Failed);
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_timed_out_tip_stays_pending() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    h.processor
        .script_charge(Err(ProcessorError::Timeout(StdDuration::from_secs(10))));

    let tx = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_accepted_tip_waits_for_confirmation() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    h.processor.script_charge(Ok(ChargeOutcome::Pending {
        processor_transaction_id: "ch_async".into(),
    }));

    let tx = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.processor_transaction_id.as_deref(), Some("ch_async"));
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_purchase_unlocks_content_once() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    let listing = h.listing(creator, Some(1_500));

    let purchase = PurchaseContent {
        payer_id: fan,
        content_id: listing.id,
        content_kind: ContentKind::Post,
        amount: 1_500,
        payment_method_id: None,
    };
    let tx = h.payments.purchase_content(purchase.clone()).await.unwrap();

    assert_eq!(tx.kind, TransactionKind::PpvUnlock);
    assert_eq!(tx.recipient_id, Some(creator));
    assert_eq!(tx.status, TransactionStatus::Completed);
    // 1500 - 150 platform - 44 processor
    assert_eq!(h.balance(creator).await, 1_306);

    let err = h.payments.purchase_content(purchase).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
    assert_eq!(h.processor.charge_count(), 1);
}

#[tokio::test]
async fn test_purchase_rejections() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    h.card(creator).await;
    let priced = h.listing(creator, Some(1_500));
    let free = h.listing(creator, None);

    let request = |payer_id, content_id, amount| PurchaseContent {
        payer_id,
        content_id,
        content_kind: ContentKind::Post,
        amount,
        payment_method_id: None,
    };

    let err = h
        .payments
        .purchase_content(request(fan, priced.id, 999))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payments
        .purchase_content(request(fan, free.id, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payments
        .purchase_content(request(creator, priced.id, 1_500))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payments
        .purchase_content(request(fan, Uuid::new_v4(), 1_500))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    assert_eq!(h.processor.charge_count(), 0);
}

#[tokio::test]
async fn test_deposit_credits_payer_without_platform_fee() {
    let h = Harness::new();
    let fan = h.fan();
    h.card(fan).await;

    let tx = h
        .payments
        .deposit(Deposit {
            payer_id: fan,
            amount: 10_000,
            currency: Some("USD".into()),
            processor: Some(PROCESSOR.into()),
            payment_method_id: None,
        })
        .await
        .unwrap();

    assert_eq!(tx.kind, TransactionKind::Deposit);
    assert_eq!(tx.platform_fee_amount, 0);
    assert_eq!(tx.processor_fee_amount, 290);
    assert_eq!(h.balance(fan).await, 9_710);
}

#[tokio::test]
async fn test_deposit_through_unknown_processor() {
    let h = Harness::new();
    let fan = h.fan();
    h.card(fan).await;

    let err = h
        .payments
        .deposit(Deposit {
            payer_id: fan,
            amount: 10_000,
            currency: None,
            processor: Some("paypal".into()),
            payment_method_id: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::UnknownProcessor(_)));
}

#[tokio::test]
async fn test_refund_reverses_creator_credit() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    let tx = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap();

    let reversal = h
        .payments
        .request_refund(fan, tx.id, "sent by mistake")
        .await
        .unwrap();

    assert!(reversal.newly_reversed);
    assert_eq!(reversal.original.status, TransactionStatus::Refunded);
    let refund = reversal.reversal.unwrap();
    assert_eq!(refund.kind, TransactionKind::Refund);
    assert_eq!(refund.status, TransactionStatus::Completed);
    assert_eq!(refund.amount, 870);
    assert_eq!(h.balance(creator).await, 0);
    assert_eq!(h.processor.refunds.lock().as_slice(), &[tx.id]);

    let err = h
        .payments
        .request_refund(fan, tx.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn test_refund_outside_window_is_rejected() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    let tx = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap();
    h.store
        .backdate_transaction(tx.id, Utc::now() - Duration::days(46));
    h.store
        .backdate_settlement(tx.id, Utc::now() - Duration::days(45));

    let err = h
        .payments
        .request_refund(fan, tx.id, "too late")
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::RefundWindowExpired { days: 30 }));
    assert!(h.processor.refunds.lock().is_empty());
    assert_eq!(h.balance(creator).await, 870);
}

#[tokio::test]
async fn test_refund_window_runs_from_settlement() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    // Created long ago, confirmed by the processor only yesterday
    let tx = h.pending_tip(fan, creator, 999).await;
    h.ledger.mark_completed(tx.id, "ch_slow").await.unwrap();
    h.store
        .backdate_transaction(tx.id, Utc::now() - Duration::days(45));
    h.store
        .backdate_settlement(tx.id, Utc::now() - Duration::days(1));

    let reversal = h
        .payments
        .request_refund(fan, tx.id, "never arrived")
        .await
        .unwrap();

    assert!(reversal.newly_reversed);
    assert_eq!(h.balance(creator).await, 0);
}

#[tokio::test]
async fn test_only_payer_can_request_refund() {
    let h = Harness::new();
    let fan = h.fan();
    let creator = h.creator();
    h.card(fan).await;
    let tx = h.payments.send_tip(tip(fan, creator, 999)).await.unwrap();

    let err = h
        .payments
        .request_refund(creator, tx.id, "not mine")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    let stranger = h.directory.add(AccountRole::Fan);
    let err = h
        .payments
        .request_refund(stranger, tx.id, "not mine")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_attach_payment_method_first_is_default() {
    let h = Harness::new();
    let fan = h.fan();

    let first = h
        .payment_methods
        .attach(AttachPaymentMethod {
            user_id: fan,
            processor: PROCESSOR.into(),
            token: "tok_visa".into(),
            kind: PaymentMethodKind::Card,
            make_default: false,
        })
        .await
        .unwrap();
    let second = h
        .payment_methods
        .attach(AttachPaymentMethod {
            user_id: fan,
            processor: PROCESSOR.into(),
            token: "tok_mastercard".into(),
            kind: PaymentMethodKind::Card,
            make_default: false,
        })
        .await
        .unwrap();

    assert!(first.is_default);
    assert!(!second.is_default);
    assert_eq!(first.processor_reference, "pm_tok_visa");

    let updated = h.payment_methods.set_default(fan, second.id).await.unwrap();
    assert!(updated.is_default);
    let methods = h.payment_methods.list(fan).await.unwrap();
    assert_eq!(methods[0].id, second.id);
    assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
}

#[tokio::test]
async fn test_attach_payment_method_rejections() {
    let h = Harness::new();
    let fan = h.fan();

    let err = h
        .payment_methods
        .attach(AttachPaymentMethod {
            user_id: fan,
            processor: PROCESSOR.into(),
            token: "   ".into(),
            kind: PaymentMethodKind::Card,
            make_default: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payment_methods
        .attach(AttachPaymentMethod {
            user_id: fan,
            processor: PROCESSOR.into(),
            token: "tok_declined".into(),
            kind: PaymentMethodKind::Card,
            make_default: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Processor(ProcessorError::Declined(_))));

    let err = h
        .payment_methods
        .attach(AttachPaymentMethod {
            user_id: fan,
            processor: "paypal".into(),
            token: "tok_visa".into(),
            kind: PaymentMethodKind::Card,
            make_default: true,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnknownProcessor(_)));
    assert!(h.payment_methods.list(fan).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_payment_method_details() {
    let h = Harness::new();
    let fan = h.fan();
    let card = h.card(fan).await;
    let expires_at = Utc::now() + Duration::days(400);

    let updated = h
        .payment_methods
        .update(
            fan,
            card.id,
            UpdatePaymentMethod {
                expires_at: Some(expires_at),
                billing_address: Some(json!({ "country": "US", "postal_code": "94107" })),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.expires_at, Some(expires_at));
    assert_eq!(updated.billing_address.unwrap()["country"], "US");
    assert_eq!(updated.processor_reference, card.processor_reference);

    let err = h
        .payment_methods
        .update(fan, card.id, UpdatePaymentMethod::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let err = h
        .payment_methods
        .update(
            fan,
            card.id,
            UpdatePaymentMethod {
                billing_address: Some(json!("1 Main St")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let stranger = h.fan();
    let err = h
        .payment_methods
        .update(
            stranger,
            card.id,
            UpdatePaymentMethod {
                expires_at: Some(expires_at),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_deleting_default_promotes_remaining_method() {
    let h = Harness::new();
    let fan = h.fan();
    let older = h.card(fan).await;
    let newer = h.card(fan).await;
    assert!(h.store.find_payment_method(newer.id).await.unwrap().unwrap().is_default);

    let stranger = h.fan();
    let err = h.payment_methods.delete(stranger, newer.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(h.processor.detached.lock().is_empty());

    let promoted = h.payment_methods.delete(fan, newer.id).await.unwrap();

    assert_eq!(promoted.map(|m| m.id), Some(older.id));
    assert_eq!(h.processor.detached.lock().as_slice(), &[newer.id]);
    let methods = h.payment_methods.list(fan).await.unwrap();
    assert_eq!(methods.len(), 1);
    assert!(methods[0].is_default);

    // A removed method can no longer fund a payment
    let err = h
        .payments
        .send_tip(SendTip {
            payment_method_id: Some(newer.id),
            ..tip(fan, h.creator(), 500)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_deleting_non_default_keeps_default() {
    let h = Harness::new();
    let fan = h.fan();
    let older = h.card(fan).await;
    let newer = h.card(fan).await;

    let promoted = h.payment_methods.delete(fan, older.id).await.unwrap();

    assert!(promoted.is_none());
    let methods = h.payment_methods.list(fan).await.unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].id, newer.id);
    assert!(methods[0].is_default);
}

#[tokio::test]
async fn test_verify_payment_method() {
    let h = Harness::new();
    let fan = h.fan();
    let method = h
        .store
        .insert_payment_method(NewPaymentMethod {
            user_id: fan,
            processor: PROCESSOR.to_string(),
            kind: PaymentMethodKind::BankAccount,
            processor_reference: "ba_unverified".into(),
            last_four: Some("6789".into()),
            brand: None,
            is_verified: false,
            make_default: true,
        })
        .await
        .unwrap();

    h.processor
        .script_verification(Err(ProcessorError::Declined("micro-deposits not confirmed".into())));
    let err = h.payment_methods.verify(fan, method.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::Processor(ProcessorError::Declined(_))));
    let stored = h.store.find_payment_method(method.id).await.unwrap().unwrap();
    assert!(!stored.is_verified);

    let verified = h.payment_methods.verify(fan, method.id).await.unwrap();
    assert!(verified.is_verified);
}
