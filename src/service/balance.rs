use crate::accessor;
use crate::domain::event::EventObject;
use crate::gateway::GatewayClient;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct BalanceDetails {
    pub fee_amount: f64,
    pub available_on: Option<DateTime<Utc>>,
    pub exchange_rate: Option<f64>,
    pub payout_amount: f64,
    pub payout_currency: Option<String>,
}

#[derive(Clone)]
pub struct BalanceDetailsResolver {
    pub gateway: Arc<dyn GatewayClient>,
}

impl BalanceDetailsResolver {
    pub fn new(gateway: Arc<dyn GatewayClient>) -> Self {
        Self { gateway }
    }

    // A missing balance transaction id legitimately yields a zero fee; a
    // failed retrieval is a recoverable error.
    pub async fn resolve(&self, charge_id: &str, object: &EventObject) -> Result<BalanceDetails> {
        let (balance_transaction_id, charge_currency) = match object {
            EventObject::Charge(charge) => (
                charge.balance_transaction.clone(),
                accessor::format_currency(&charge.currency),
            ),
            _ if !charge_id.is_empty() => {
                let charge = self
                    .gateway
                    .retrieve_charge(charge_id)
                    .await
                    .with_context(|| format!("retrieving charge {charge_id}"))?;
                (
                    charge.balance_transaction.clone(),
                    accessor::format_currency(&charge.currency),
                )
            }
            _ => (None, String::new()),
        };

        let balance_transaction_id = match balance_transaction_id {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(BalanceDetails::default()),
        };

        let txn = self
            .gateway
            .retrieve_balance_transaction(&balance_transaction_id)
            .await
            .with_context(|| format!("retrieving balance transaction {balance_transaction_id}"))?;

        let fee_amount = match txn.exchange_rate {
            Some(rate)
                if rate != 0.0
                    && !charge_currency.is_empty()
                    && accessor::format_currency(&txn.currency) != charge_currency =>
            {
                // settled in a different currency, convert back
                (txn.fee as f64 / rate / 100.0 * 100.0).round() / 100.0
            }
            _ => accessor::minor_to_major(txn.fee),
        };

        Ok(BalanceDetails {
            fee_amount,
            available_on: accessor::epoch_to_datetime(txn.available_on),
            exchange_rate: txn.exchange_rate,
            payout_amount: accessor::minor_to_major(txn.amount),
            payout_currency: Some(accessor::format_currency(&txn.currency)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGatewayClient;
    use crate::gateway::BalanceTransaction;

    fn charge_object(balance_transaction: Option<&str>) -> EventObject {
        serde_json::from_value(serde_json::json!({
            "object": "charge",
            "id": "ch_1",
            "amount": 40000,
            "currency": "usd",
            "captured": true,
            "balance_transaction": balance_transaction,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn missing_balance_transaction_id_yields_zero_fee() {
        let gateway = Arc::new(MockGatewayClient::new());
        let resolver = BalanceDetailsResolver::new(gateway);
        let details = resolver.resolve("ch_1", &charge_object(None)).await.unwrap();
        assert_eq!(details.fee_amount, 0.0);
    }

    #[tokio::test]
    async fn fee_is_converted_from_minor_units() {
        let gateway = Arc::new(MockGatewayClient::new());
        gateway.put_balance_transaction(BalanceTransaction {
            id: "txn_1".into(),
            amount: 38810,
            currency: "usd".into(),
            fee: 1190,
            exchange_rate: None,
            available_on: 1_700_000_000,
        });
        let resolver = BalanceDetailsResolver::new(gateway);
        let details = resolver
            .resolve("ch_1", &charge_object(Some("txn_1")))
            .await
            .unwrap();
        assert_eq!(details.fee_amount, 11.90);
        assert_eq!(details.payout_amount, 388.10);
        assert_eq!(details.payout_currency.as_deref(), Some("USD"));
    }

    #[tokio::test]
    async fn unretrievable_balance_transaction_is_an_error() {
        let gateway = Arc::new(MockGatewayClient::new());
        let resolver = BalanceDetailsResolver::new(gateway);
        let result = resolver.resolve("ch_1", &charge_object(Some("txn_gone"))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cross_currency_fee_uses_exchange_rate() {
        let gateway = Arc::new(MockGatewayClient::new());
        gateway.put_balance_transaction(BalanceTransaction {
            id: "txn_fx".into(),
            amount: 31000,
            currency: "gbp".into(),
            fee: 100,
            exchange_rate: Some(0.8),
            available_on: 0,
        });
        let resolver = BalanceDetailsResolver::new(gateway);
        let details = resolver
            .resolve("ch_1", &charge_object(Some("txn_fx")))
            .await
            .unwrap();
        // 100 minor units settled at 0.8 back to the charge currency.
        assert_eq!(details.fee_amount, 1.25);
    }
}
