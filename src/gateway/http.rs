use crate::domain::event::{Charge, Invoice, Subscription};
use crate::gateway::{BalanceTransaction, GatewayClient, Refund};
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

pub struct HttpGatewayClient {
    pub base_url: String,
    pub secret_key: String,
    pub timeout_ms: u64,
    pub client: reqwest::Client,
}

impl HttpGatewayClient {
    pub fn new(base_url: String, secret_key: String) -> Self {
        Self {
            base_url,
            secret_key,
            timeout_ms: 10_000,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("gateway GET {path} failed: {status}: {body}"));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[derive(serde::Deserialize)]
struct RefundList {
    #[serde(default)]
    data: Vec<Refund>,
}

#[async_trait::async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn retrieve_charge(&self, charge_id: &str) -> Result<Charge> {
        self.get_json(&format!("/v1/charges/{charge_id}?expand[]=invoice"))
            .await
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        self.get_json(&format!("/v1/invoices/{invoice_id}")).await
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Subscription> {
        self.get_json(&format!("/v1/subscriptions/{subscription_id}"))
            .await
    }

    async fn retrieve_balance_transaction(
        &self,
        balance_transaction_id: &str,
    ) -> Result<BalanceTransaction> {
        self.get_json(&format!("/v1/balance_transactions/{balance_transaction_id}"))
            .await
    }

    async fn list_refunds(&self, charge_id: &str, limit: u32) -> Result<Vec<Refund>> {
        let list: RefundList = self
            .get_json(&format!("/v1/refunds?charge={charge_id}&limit={limit}"))
            .await?;
        Ok(list.data)
    }

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> Result<()> {
        let url = format!("{}/v1/subscriptions/{subscription_id}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[("cancel_at_period_end", "true")])
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow!(
                "gateway cancel_at_period_end for {subscription_id} failed: {status}"
            ));
        }
        Ok(())
    }
}
