//! Shared fixtures: the service graph wired to in-memory stores and a
//! scripted processor.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use payment_service::config::FeeConfig;
use payment_service::directory::{
    AccountRole, ContentListing, MemoryContentCatalog, MemoryUserDirectory,
};
use payment_service::domain::{
    ContentKind, NewPaymentMethod, NewTransaction, NormalizedEvent, PaymentMethod,
    PaymentMethodKind, Transaction, TransactionKind, TransactionMetadata, WebhookEnvelope,
};
use payment_service::notifications::{NotificationSink, Receipt};
use payment_service::processors::{
    AttachedMethod, ChargeOutcome, CircuitBreakerConfig, ProcessorAdapter, ProcessorError,
    ProcessorRegistry, ProcessorResult, RecurringRequest, RecurringUpdate,
};
use payment_service::repository::{Completion, LedgerStore, MemoryLedgerStore};
use payment_service::services::{
    LedgerService, PaymentMethodService, PaymentService, SubscriptionService, WebhookReconciler,
    WithdrawalService,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webhook_inbox::{InboxStore, MemoryInbox, RetryPolicy};

pub const PROCESSOR: &str = "mockpay";
pub const VALID_SIGNATURE: &str = "valid";

// ============================================================================
// Scripted processor
// ============================================================================

/// Processor whose answers are queued by the test. Unscripted charges
/// succeed, unscripted recurring registrations return `sub_<subscription id>`.
#[derive(Default)]
pub struct MockProcessor {
    charges: Mutex<VecDeque<ProcessorResult<ChargeOutcome>>>,
    recurring: Mutex<VecDeque<ProcessorResult<String>>>,
    updates: Mutex<VecDeque<ProcessorResult<()>>>,
    verifications: Mutex<VecDeque<ProcessorResult<()>>>,
    pub refunds: Mutex<Vec<Uuid>>,
    pub detached: Mutex<Vec<Uuid>>,
    pub recurring_updates: Mutex<Vec<(String, RecurringUpdate)>>,
    pub cancelled_recurring: Mutex<Vec<(String, bool)>>,
    pub charged: Mutex<Vec<Uuid>>,
}

impl MockProcessor {
    pub fn script_charge(&self, outcome: ProcessorResult<ChargeOutcome>) {
        self.charges.lock().push_back(outcome);
    }

    pub fn script_recurring(&self, outcome: ProcessorResult<String>) {
        self.recurring.lock().push_back(outcome);
    }

    pub fn script_update(&self, outcome: ProcessorResult<()>) {
        self.updates.lock().push_back(outcome);
    }

    pub fn script_verification(&self, outcome: ProcessorResult<()>) {
        self.verifications.lock().push_back(outcome);
    }

    pub fn charge_count(&self) -> usize {
        self.charged.lock().len()
    }
}

#[async_trait]
impl ProcessorAdapter for MockProcessor {
    fn name(&self) -> &str {
        PROCESSOR
    }

    async fn attach_payment_method(
        &self,
        _user_id: Uuid,
        token: &str,
        kind: PaymentMethodKind,
    ) -> ProcessorResult<AttachedMethod> {
        if token == "tok_declined" {
            return Err(ProcessorError::Declined("card rejected".into()));
        }
        Ok(AttachedMethod {
            processor_reference: format!("pm_{}", token),
            kind,
            last_four: Some("4242".into()),
            brand: Some("visa".into()),
            is_verified: true,
        })
    }

    async fn charge(
        &self,
        transaction: &Transaction,
        _method: &PaymentMethod,
    ) -> ProcessorResult<ChargeOutcome> {
        self.charged.lock().push(transaction.id);
        let scripted = self.charges.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ChargeOutcome::Succeeded {
                processor_transaction_id: format!("ch_{}", transaction.id.simple()),
            })
        })
    }

    async fn refund(&self, transaction: &Transaction, _reason: &str) -> ProcessorResult<()> {
        self.refunds.lock().push(transaction.id);
        Ok(())
    }

    async fn detach_payment_method(&self, method: &PaymentMethod) -> ProcessorResult<()> {
        self.detached.lock().push(method.id);
        Ok(())
    }

    async fn verify_payment_method(&self, _method: &PaymentMethod) -> ProcessorResult<()> {
        let scripted = self.verifications.lock().pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn create_recurring(&self, request: &RecurringRequest) -> ProcessorResult<String> {
        let scripted = self.recurring.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(format!("sub_{}", request.subscription_id.simple())))
    }

    async fn cancel_recurring(
        &self,
        processor_subscription_id: &str,
        immediate: bool,
    ) -> ProcessorResult<()> {
        self.cancelled_recurring
            .lock()
            .push((processor_subscription_id.to_string(), immediate));
        Ok(())
    }

    async fn update_recurring(
        &self,
        processor_subscription_id: &str,
        update: &RecurringUpdate,
    ) -> ProcessorResult<()> {
        let scripted = self.updates.lock().pop_front();
        let outcome = scripted.unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.recurring_updates
                .lock()
                .push((processor_subscription_id.to_string(), update.clone()));
        }
        outcome
    }

    /// Bodies are `WebhookEnvelope` JSON; the signature must be `valid`
    fn decode_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ProcessorResult<WebhookEnvelope> {
        if signature != Some(VALID_SIGNATURE) {
            return Err(ProcessorError::SignatureInvalid);
        }
        serde_json::from_slice(payload).map_err(|e| ProcessorError::MalformedPayload(e.to_string()))
    }
}

// ============================================================================
// Receipt sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    receipts: Mutex<Vec<Receipt>>,
}

impl RecordingSink {
    pub fn receipts(&self) -> Vec<Receipt> {
        self.receipts.lock().clone()
    }

    /// Receipts are sent from a spawned task; poll until `count` arrived
    pub async fn wait_for(&self, count: usize) -> Vec<Receipt> {
        for _ in 0..100 {
            if self.receipts.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.receipts()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_receipt(&self, receipt: &Receipt) -> anyhow::Result<()> {
        self.receipts.lock().push(receipt.clone());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_fees() -> FeeConfig {
    FeeConfig {
        platform_fee_bps: 1000,
        processor_fee_bps: 290,
        processor_fee_overrides: HashMap::new(),
        withdrawal_fee_bps: 200,
    }
}

pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(3600),
        max_attempts: 3,
    }
}

pub struct Harness {
    pub store: Arc<MemoryLedgerStore>,
    pub inbox: Arc<MemoryInbox>,
    pub directory: Arc<MemoryUserDirectory>,
    pub catalog: Arc<MemoryContentCatalog>,
    pub processor: Arc<MockProcessor>,
    pub sink: Arc<RecordingSink>,
    pub ledger: Arc<LedgerService>,
    pub payments: Arc<PaymentService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub payment_methods: Arc<PaymentMethodService>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let inbox = Arc::new(MemoryInbox::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        let catalog = Arc::new(MemoryContentCatalog::new());
        let processor = Arc::new(MockProcessor::default());
        let sink = Arc::new(RecordingSink::default());

        let mut registry = ProcessorRegistry::new();
        registry.register(
            processor.clone(),
            Duration::from_secs(2),
            CircuitBreakerConfig::default(),
        );

        let ledger_store: Arc<dyn LedgerStore> = store.clone();
        let inbox_store: Arc<dyn InboxStore> = inbox.clone();

        let ledger = Arc::new(LedgerService::new(
            Arc::clone(&ledger_store),
            test_fees(),
            sink.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            Arc::clone(&ledger),
            registry.clone(),
            directory.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            Arc::clone(&ledger),
            registry.clone(),
            directory.clone(),
            catalog.clone(),
            "USD",
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            Arc::clone(&ledger_store),
            directory.clone(),
            200,
            "USD",
        ));
        let payment_methods = Arc::new(PaymentMethodService::new(
            Arc::clone(&ledger_store),
            registry.clone(),
        ));
        let reconciler = Arc::new(WebhookReconciler::new(
            Arc::clone(&ledger),
            Arc::clone(&subscriptions),
            registry,
            inbox_store,
            test_retry_policy(),
            Duration::from_secs(60),
        ));

        Self {
            store,
            inbox,
            directory,
            catalog,
            processor,
            sink,
            ledger,
            payments,
            subscriptions,
            withdrawals,
            payment_methods,
            reconciler,
        }
    }

    pub fn fan(&self) -> Uuid {
        self.directory.add(AccountRole::Fan)
    }

    pub fn creator(&self) -> Uuid {
        self.directory.add(AccountRole::Creator)
    }

    /// A verified default card for `user_id`
    pub async fn card(&self, user_id: Uuid) -> PaymentMethod {
        self.store
            .insert_payment_method(NewPaymentMethod {
                user_id,
                processor: PROCESSOR.to_string(),
                kind: PaymentMethodKind::Card,
                processor_reference: format!("pm_{}", Uuid::new_v4().simple()),
                last_four: Some("4242".into()),
                brand: Some("visa".into()),
                is_verified: true,
                make_default: true,
            })
            .await
            .unwrap()
    }

    /// A completed deposit of `amount`; returns the credited net
    pub async fn fund(&self, user_id: Uuid, amount: i64) -> i64 {
        let tx = self
            .ledger
            .create_transaction(NewTransaction {
                payer_id: user_id,
                recipient_id: None,
                kind: TransactionKind::Deposit,
                amount,
                currency: "USD".into(),
                processor: PROCESSOR.into(),
                payment_method_id: None,
                metadata: TransactionMetadata::Deposit,
            })
            .await
            .unwrap();
        match self
            .ledger
            .mark_completed(tx.id, &format!("dep_{}", tx.id.simple()))
            .await
            .unwrap()
        {
            Completion::Completed { revenue_share, .. } => revenue_share.net_amount,
            Completion::AlreadyCompleted(_) => panic!("fresh deposit reported as duplicate"),
        }
    }

    /// A pending tip row, as left behind by a charge whose outcome is unknown
    pub async fn pending_tip(&self, payer_id: Uuid, recipient_id: Uuid, amount: i64) -> Transaction {
        self.ledger
            .create_transaction(NewTransaction {
                payer_id,
                recipient_id: Some(recipient_id),
                kind: TransactionKind::Tip,
                amount,
                currency: "USD".into(),
                processor: PROCESSOR.into(),
                payment_method_id: None,
                metadata: TransactionMetadata::Tip { message: None },
            })
            .await
            .unwrap()
    }

    pub fn listing(&self, owner_id: Uuid, price: Option<i64>) -> ContentListing {
        let listing = ContentListing {
            id: Uuid::new_v4(),
            kind: ContentKind::Post,
            owner_id,
            price,
            currency: "USD".into(),
        };
        self.catalog.insert(listing.clone());
        listing
    }

    pub async fn balance(&self, user_id: Uuid) -> i64 {
        self.ledger.wallet(user_id).await.unwrap().balance
    }

    pub async fn all_transactions(&self, user_id: Uuid) -> Vec<Transaction> {
        self.ledger
            .list_transactions(user_id, None, Some(1), Some(100))
            .await
            .unwrap()
    }
}

pub fn envelope(event_id: &str, event: NormalizedEvent) -> WebhookEnvelope {
    WebhookEnvelope {
        event_id: event_id.to_string(),
        event_type: event.name().to_string(),
        event,
        occurred_at: None,
    }
}

pub fn webhook_body(event_id: &str, event: NormalizedEvent) -> Vec<u8> {
    serde_json::to_vec(&envelope(event_id, event)).unwrap()
}
