/// Business logic layer for payment-service
///
/// - Ledger: transaction lifecycle and the only path to wallet balances
/// - Subscriptions: recurring billing state machine
/// - Payments: tips, content unlocks, deposits and refunds
/// - Withdrawals: creator payouts
/// - Payment methods: processor-tokenized instruments
/// - Reconciler: processor webhooks through the inbox
pub mod ledger;
pub mod payment_methods;
pub mod payments;
pub mod reconciler;
pub mod subscriptions;
pub mod withdrawals;

pub use ledger::LedgerService;
pub use payment_methods::{AttachPaymentMethod, PaymentMethodService, UpdatePaymentMethod};
pub use payments::{Deposit, PaymentService, PurchaseContent, SendTip};
pub use reconciler::{Disposition, IngestOutcome, WebhookReconciler};
pub use subscriptions::{
    CreateSubscription, RenewalOutcome, SubscriptionService, SubscriptionStarted,
    UpdateSubscription,
};
pub use withdrawals::{RequestWithdrawal, WithdrawalService};
