pub mod memory;
pub mod postgres;

use crate::domain::obligation::{
    CompletePaymentParams, FailPaymentParams, LedgerEntry, NewPayment, ObligationStatus, Payment,
    RefundParams, RecurringObligation,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    New,
    Success,
    Error,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::New => "new",
            WebhookStatus::Success => "success",
            WebhookStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<WebhookStatus> {
        match raw {
            "new" => Some(WebhookStatus::New),
            "success" => Some(WebhookStatus::Success),
            "error" => Some(WebhookStatus::Error),
            _ => None,
        }
    }
}

// Identity (processor id, event id) never changes; status, message and
// processed_at are overwritten on reprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWebhookRecord {
    pub id: i64,
    pub processor_id: String,
    pub event_id: String,
    pub trigger: String,
    pub identifier: String,
    pub data: serde_json::Value,
    pub status: WebhookStatus,
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewQueueRecord {
    pub processor_id: String,
    pub event_id: String,
    pub trigger: String,
    pub identifier: String,
    pub data: serde_json::Value,
}

#[async_trait::async_trait]
pub trait WebhookQueueStore: Send + Sync {
    async fn find_unprocessed(
        &self,
        processor_id: &str,
        identifier: &str,
    ) -> Result<Vec<QueuedWebhookRecord>>;

    // insert-if-absent on (processor_id, event_id); None means a redelivery
    async fn insert(&self, record: NewQueueRecord) -> Result<Option<i64>>;

    async fn count_unprocessed(&self, processor_id: &str) -> Result<i64>;

    async fn get(&self, id: i64) -> Result<Option<QueuedWebhookRecord>>;

    async fn mark_processed(
        &self,
        id: i64,
        status: WebhookStatus,
        message: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<()>;

    // most recent success of the given trigger whose identifier contains
    // identifier_part
    async fn find_latest_success(
        &self,
        processor_id: &str,
        trigger: &str,
        identifier_part: &str,
    ) -> Result<Option<QueuedWebhookRecord>>;

    async fn reset_for_reprocess(&self, id: i64) -> Result<()>;

    // oldest first
    async fn next_unprocessed(&self, processor_id: &str, limit: i64) -> Result<Vec<QueuedWebhookRecord>>;

    async fn list(&self, status: Option<WebhookStatus>, limit: i64) -> Result<Vec<QueuedWebhookRecord>>;
}

#[async_trait::async_trait]
pub trait ObligationStore: Send + Sync {
    async fn find_payment_by_trxn_id(&self, reference: &str) -> Result<Option<Payment>>;

    async fn find_payment_by_order_reference(&self, reference: &str) -> Result<Option<Payment>>;

    async fn get_payment(&self, id: i64) -> Result<Option<Payment>>;

    async fn create_payment(&self, payment: NewPayment) -> Result<i64>;

    // existing identifiers are never dropped
    async fn append_trxn_id(&self, payment_id: i64, reference: &str) -> Result<()>;

    async fn set_order_reference(&self, payment_id: i64, reference: &str) -> Result<()>;

    async fn complete_payment(&self, payment_id: i64, params: CompletePaymentParams) -> Result<()>;

    async fn fail_payment(&self, payment_id: i64, params: FailPaymentParams) -> Result<()>;

    async fn record_refund(&self, params: RefundParams) -> Result<()>;

    async fn find_completed_ledger_entry(&self, trxn_id: &str) -> Result<Option<LedgerEntry>>;

    async fn ledger_entries_for_payment(&self, payment_id: i64) -> Result<Vec<LedgerEntry>>;

    async fn find_recurring_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<RecurringObligation>>;

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringObligation>>;

    async fn set_recurring_subscription_id(&self, id: i64, subscription_id: &str) -> Result<()>;

    async fn cancel_recurring(&self, id: i64, cancel_date: Option<DateTime<Utc>>) -> Result<()>;

    async fn complete_recurring(&self, id: i64) -> Result<()>;

    async fn update_recurring_status(&self, id: i64, status: ObligationStatus) -> Result<()>;

    // never touches payments already stamped out
    async fn update_recurring_amount(&self, id: i64, amount: f64, currency: &str) -> Result<()>;

    async fn customer_belongs_to_processor(
        &self,
        customer_id: &str,
        processor_id: &str,
    ) -> Result<bool>;
}

// acquired = false means the wait timed out; callers decide whether to
// proceed anyway (see strict_locking)
#[derive(Debug, Clone)]
pub struct AcquiredLock {
    pub name: String,
    pub token: String,
    pub acquired: bool,
}

#[async_trait::async_trait]
pub trait NamedLock: Send + Sync {
    async fn acquire(&self, name: &str) -> Result<AcquiredLock>;

    async fn release(&self, lock: &AcquiredLock) -> Result<()>;
}
