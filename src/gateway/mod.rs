use crate::domain::event::{Charge, Invoice, Subscription};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod http;
pub mod mock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub fee: i64,
    #[serde(default)]
    pub exchange_rate: Option<f64>,
    #[serde(default)]
    pub available_on: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[async_trait::async_trait]
pub trait GatewayClient: Send + Sync {
    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<Invoice>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Subscription>;

    async fn retrieve_balance_transaction(&self, balance_transaction_id: &str)
        -> Result<BalanceTransaction>;

    // newest first
    async fn list_refunds(&self, charge_id: &str, limit: u32) -> Result<Vec<Refund>>;

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> Result<()>;
}
