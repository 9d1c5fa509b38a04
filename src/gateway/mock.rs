use crate::domain::event::{Charge, Invoice, Subscription};
use crate::gateway::{BalanceTransaction, GatewayClient, Refund};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Mutex;

// Anything not seeded behaves like a gateway 404, a recoverable handler
// failure.
#[derive(Default)]
pub struct MockGatewayClient {
    inner: Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    charges: HashMap<String, Charge>,
    invoices: HashMap<String, Invoice>,
    subscriptions: HashMap<String, Subscription>,
    balance_transactions: HashMap<String, BalanceTransaction>,
    refunds: HashMap<String, Vec<Refund>>,
    cancelled_at_period_end: Vec<String>,
}

impl MockGatewayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_charge(&self, charge: Charge) {
        self.inner
            .lock()
            .unwrap()
            .charges
            .insert(charge.id.clone(), charge);
    }

    pub fn put_invoice(&self, invoice: Invoice) {
        self.inner
            .lock()
            .unwrap()
            .invoices
            .insert(invoice.id.clone(), invoice);
    }

    pub fn put_subscription(&self, subscription: Subscription) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn put_balance_transaction(&self, txn: BalanceTransaction) {
        self.inner
            .lock()
            .unwrap()
            .balance_transactions
            .insert(txn.id.clone(), txn);
    }

    pub fn put_refunds(&self, charge_id: &str, refunds: Vec<Refund>) {
        self.inner
            .lock()
            .unwrap()
            .refunds
            .insert(charge_id.to_string(), refunds);
    }

    pub fn cancelled_subscriptions(&self) -> Vec<String> {
        self.inner.lock().unwrap().cancelled_at_period_end.clone()
    }
}

#[async_trait::async_trait]
impl GatewayClient for MockGatewayClient {
    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge> {
        self.inner
            .lock()
            .unwrap()
            .charges
            .get(charge_id)
            .cloned()
            .ok_or_else(|| anyhow!("mock gateway: no such charge {charge_id}"))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.inner
            .lock()
            .unwrap()
            .invoices
            .get(invoice_id)
            .cloned()
            .ok_or_else(|| anyhow!("mock gateway: no such invoice {invoice_id}"))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| anyhow!("mock gateway: no such subscription {subscription_id}"))
    }

    async fn retrieve_balance_transaction(
        &self,
        balance_transaction_id: &str,
    ) -> Result<BalanceTransaction> {
        self.inner
            .lock()
            .unwrap()
            .balance_transactions
            .get(balance_transaction_id)
            .cloned()
            .ok_or_else(|| {
                anyhow!("mock gateway: no such balance transaction {balance_transaction_id}")
            })
    }

    async fn list_refunds(&self, charge_id: &str, limit: u32) -> Result<Vec<Refund>> {
        let mut refunds = self
            .inner
            .lock()
            .unwrap()
            .refunds
            .get(charge_id)
            .cloned()
            .unwrap_or_default();
        refunds.truncate(limit as usize);
        Ok(refunds)
    }

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .cancelled_at_period_end
            .push(subscription_id.to_string());
        Ok(())
    }
}
