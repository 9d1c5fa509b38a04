use crate::domain::obligation::{
    CompletePaymentParams, FailPaymentParams, LedgerEntry, NewPayment, ObligationStatus, Payment,
    RecurringObligation, RefundParams,
};
use crate::store::{
    AcquiredLock, NamedLock, NewQueueRecord, ObligationStore, QueuedWebhookRecord,
    WebhookQueueStore, WebhookStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

// Mirrors the semantics of the sqlx implementation.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    next_id: i64,
    records: Vec<QueuedWebhookRecord>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<QueuedWebhookRecord> {
        self.inner.lock().unwrap().records.clone()
    }
}

#[async_trait::async_trait]
impl WebhookQueueStore for MemoryQueueStore {
    async fn find_unprocessed(
        &self,
        processor_id: &str,
        identifier: &str,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| {
                r.processor_id == processor_id
                    && r.identifier == identifier
                    && r.processed_at.is_none()
            })
            .cloned()
            .collect())
    }

    async fn insert(&self, record: NewQueueRecord) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .records
            .iter()
            .any(|r| r.processor_id == record.processor_id && r.event_id == record.event_id)
        {
            return Ok(None);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(QueuedWebhookRecord {
            id,
            processor_id: record.processor_id,
            event_id: record.event_id,
            trigger: record.trigger,
            identifier: record.identifier,
            data: record.data,
            status: WebhookStatus::New,
            message: None,
            received_at: Utc::now(),
            processed_at: None,
        });
        Ok(Some(id))
    }

    async fn count_unprocessed(&self, processor_id: &str) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.processor_id == processor_id && r.processed_at.is_none())
            .count() as i64)
    }

    async fn get(&self, id: i64) -> Result<Option<QueuedWebhookRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.iter().find(|r| r.id == id).cloned())
    }

    async fn mark_processed(
        &self,
        id: i64,
        status: WebhookStatus,
        message: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.iter_mut().find(|r| r.id == id) {
            record.status = status;
            record.message = Some(message.to_string());
            record.processed_at = Some(processed_at);
        }
        Ok(())
    }

    async fn find_latest_success(
        &self,
        processor_id: &str,
        trigger: &str,
        identifier_part: &str,
    ) -> Result<Option<QueuedWebhookRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .records
            .iter()
            .filter(|r| {
                r.processor_id == processor_id
                    && r.trigger == trigger
                    && r.status == WebhookStatus::Success
                    && r.identifier.contains(identifier_part)
            })
            .max_by_key(|r| r.received_at)
            .cloned())
    }

    async fn reset_for_reprocess(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.iter_mut().find(|r| r.id == id) {
            record.status = WebhookStatus::New;
            record.message = None;
            record.processed_at = None;
        }
        Ok(())
    }

    async fn next_unprocessed(
        &self,
        processor_id: &str,
        limit: i64,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut batch: Vec<QueuedWebhookRecord> = inner
            .records
            .iter()
            .filter(|r| r.processor_id == processor_id && r.processed_at.is_none())
            .cloned()
            .collect();
        batch.sort_by_key(|r| r.received_at);
        batch.truncate(limit as usize);
        Ok(batch)
    }

    async fn list(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<QueuedWebhookRecord> = inner
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        records.truncate(limit as usize);
        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryObligationStore {
    inner: Mutex<ObligationInner>,
}

#[derive(Default)]
struct ObligationInner {
    next_payment_id: i64,
    next_ledger_id: i64,
    next_recurring_id: i64,
    payments: Vec<Payment>,
    ledger: Vec<LedgerEntry>,
    recurring: Vec<RecurringObligation>,
    customers: HashSet<(String, String)>,
}

impl MemoryObligationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_payment(&self, payment: NewPayment) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_payment_id += 1;
        let id = inner.next_payment_id;
        inner.payments.push(Payment {
            id,
            recurring_id: payment.recurring_id,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            fee_amount: 0.0,
            trxn_ids: payment.trxn_ids,
            order_reference: payment.order_reference,
            receive_date: payment.receive_date,
            cancel_date: None,
            cancel_reason: None,
        });
        id
    }

    pub fn seed_recurring(&self, recurring: RecurringObligation) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_recurring_id = inner.next_recurring_id.max(recurring.id) + 1;
        let id = if recurring.id > 0 {
            recurring.id
        } else {
            inner.next_recurring_id
        };
        let mut recurring = recurring;
        recurring.id = id;
        inner.recurring.push(recurring);
        id
    }

    pub fn seed_customer(&self, customer_id: &str, processor_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .customers
            .insert((customer_id.to_string(), processor_id.to_string()));
    }

    pub fn payments(&self) -> Vec<Payment> {
        self.inner.lock().unwrap().payments.clone()
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.inner.lock().unwrap().ledger.clone()
    }

    pub fn recurring_obligations(&self) -> Vec<RecurringObligation> {
        self.inner.lock().unwrap().recurring.clone()
    }
}

fn append_reference(trxn_ids: &str, reference: &str) -> String {
    if trxn_ids.is_empty() {
        return reference.to_string();
    }
    if trxn_ids.split(',').any(|id| id == reference) {
        return trxn_ids.to_string();
    }
    format!("{trxn_ids},{reference}")
}

#[async_trait::async_trait]
impl ObligationStore for MemoryObligationStore {
    async fn find_payment_by_trxn_id(&self, reference: &str) -> Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.has_trxn_id(reference))
            .cloned())
    }

    async fn find_payment_by_order_reference(&self, reference: &str) -> Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments
            .iter()
            .find(|p| p.order_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn get_payment(&self, id: i64) -> Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<i64> {
        Ok(self.seed_payment(payment))
    }

    async fn append_trxn_id(&self, payment_id: i64, reference: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.trxn_ids = append_reference(&payment.trxn_ids, reference);
        }
        Ok(())
    }

    async fn set_order_reference(&self, payment_id: i64, reference: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.order_reference = Some(reference.to_string());
        }
        Ok(())
    }

    async fn complete_payment(&self, payment_id: i64, params: CompletePaymentParams) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.status = ObligationStatus::Completed;
            payment.fee_amount = params.fee_amount;
            if params.trxn_date.is_some() {
                payment.receive_date = params.trxn_date;
            }
            if params.order_reference.is_some() {
                payment.order_reference = params.order_reference.clone();
            }
            payment.trxn_ids = append_reference(&payment.trxn_ids, &params.trxn_id);
        }
        inner.next_ledger_id += 1;
        let id = inner.next_ledger_id;
        inner.ledger.push(LedgerEntry {
            id,
            payment_id,
            trxn_id: params.trxn_id,
            amount: params.amount,
            fee_amount: params.fee_amount,
            trxn_date: params.trxn_date,
            result_code: None,
            status: ObligationStatus::Completed,
        });
        Ok(())
    }

    async fn fail_payment(&self, payment_id: i64, params: FailPaymentParams) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.status = ObligationStatus::Failed;
            payment.cancel_date = params.cancel_date;
            payment.cancel_reason = params.cancel_reason;
            if params.order_reference.is_some() {
                payment.order_reference = params.order_reference;
            }
        }
        Ok(())
    }

    async fn record_refund(&self, params: RefundParams) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_ledger_id += 1;
        let id = inner.next_ledger_id;
        inner.ledger.push(LedgerEntry {
            id,
            payment_id: params.payment_id,
            trxn_id: params.trxn_id,
            amount: params.amount,
            fee_amount: 0.0,
            trxn_date: params.trxn_date,
            result_code: params.result_code,
            status: ObligationStatus::Completed,
        });
        if let Some(cancelled_id) = params.cancelled_ledger_id {
            if let Some(entry) = inner.ledger.iter_mut().find(|e| e.id == cancelled_id) {
                entry.status = ObligationStatus::Refunded;
            }
        }
        if let Some(payment) = inner
            .payments
            .iter_mut()
            .find(|p| p.id == params.payment_id)
        {
            payment.status = ObligationStatus::Refunded;
        }
        Ok(())
    }

    async fn find_completed_ledger_entry(&self, trxn_id: &str) -> Result<Option<LedgerEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ledger
            .iter()
            .find(|e| e.trxn_id == trxn_id && e.status == ObligationStatus::Completed)
            .cloned())
    }

    async fn ledger_entries_for_payment(&self, payment_id: i64) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn find_recurring_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<RecurringObligation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .recurring
            .iter()
            .find(|r| r.subscription_id == subscription_id)
            .cloned())
    }

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringObligation>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.recurring.iter().find(|r| r.id == id).cloned())
    }

    async fn set_recurring_subscription_id(&self, id: i64, subscription_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(recurring) = inner.recurring.iter_mut().find(|r| r.id == id) {
            recurring.subscription_id = subscription_id.to_string();
        }
        Ok(())
    }

    async fn cancel_recurring(&self, id: i64, cancel_date: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(recurring) = inner.recurring.iter_mut().find(|r| r.id == id) {
            recurring.status = ObligationStatus::Cancelled;
            recurring.cancel_date = cancel_date;
        }
        Ok(())
    }

    async fn complete_recurring(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(recurring) = inner.recurring.iter_mut().find(|r| r.id == id) {
            recurring.status = ObligationStatus::Completed;
        }
        Ok(())
    }

    async fn update_recurring_status(&self, id: i64, status: ObligationStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(recurring) = inner.recurring.iter_mut().find(|r| r.id == id) {
            recurring.status = status;
        }
        Ok(())
    }

    async fn update_recurring_amount(&self, id: i64, amount: f64, currency: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(recurring) = inner.recurring.iter_mut().find(|r| r.id == id) {
            recurring.amount = amount;
            recurring.currency = currency.to_string();
        }
        Ok(())
    }

    async fn customer_belongs_to_processor(
        &self,
        customer_id: &str,
        processor_id: &str,
    ) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .customers
            .contains(&(customer_id.to_string(), processor_id.to_string())))
    }
}

// Acquisition does not wait; a held name comes back unacquired.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashSet<String>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl NamedLock for MemoryLock {
    async fn acquire(&self, name: &str) -> Result<AcquiredLock> {
        let mut held = self.held.lock().unwrap();
        let acquired = held.insert(name.to_string());
        Ok(AcquiredLock {
            name: name.to_string(),
            token: String::new(),
            acquired,
        })
    }

    async fn release(&self, lock: &AcquiredLock) -> Result<()> {
        if lock.acquired {
            self.held.lock().unwrap().remove(&lock.name);
        }
        Ok(())
    }
}
