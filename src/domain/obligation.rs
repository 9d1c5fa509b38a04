use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObligationStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    Cancelled,
    InProgress,
    Overdue,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "PENDING",
            ObligationStatus::Completed => "COMPLETED",
            ObligationStatus::Failed => "FAILED",
            ObligationStatus::Refunded => "REFUNDED",
            ObligationStatus::Cancelled => "CANCELLED",
            ObligationStatus::InProgress => "IN_PROGRESS",
            ObligationStatus::Overdue => "OVERDUE",
        }
    }

    pub fn parse(raw: &str) -> Option<ObligationStatus> {
        let status = match raw {
            "PENDING" => ObligationStatus::Pending,
            "COMPLETED" => ObligationStatus::Completed,
            "FAILED" => ObligationStatus::Failed,
            "REFUNDED" => ObligationStatus::Refunded,
            "CANCELLED" => ObligationStatus::Cancelled,
            "IN_PROGRESS" => ObligationStatus::InProgress,
            "OVERDUE" => ObligationStatus::Overdue,
            _ => return None,
        };
        Some(status)
    }
}

pub fn invoice_status_to_payment_status(invoice_status: &str) -> Option<ObligationStatus> {
    match invoice_status {
        "draft" | "open" => Some(ObligationStatus::Pending),
        "paid" => Some(ObligationStatus::Completed),
        "void" => Some(ObligationStatus::Cancelled),
        "uncollectible" => Some(ObligationStatus::Failed),
        _ => None,
    }
}

pub fn subscription_status_to_recurring_status(subscription_status: &str) -> Option<ObligationStatus> {
    match subscription_status {
        "incomplete" | "incomplete_expired" | "unpaid" => Some(ObligationStatus::Failed),
        "trialing" | "active" => Some(ObligationStatus::InProgress),
        "past_due" => Some(ObligationStatus::Overdue),
        "canceled" => Some(ObligationStatus::Cancelled),
        _ => None,
    }
}

// trxn_ids is a comma-separated list that only ever grows, so the payment can
// be matched from any identifier the gateway sends later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub recurring_id: Option<i64>,
    pub status: ObligationStatus,
    pub amount: f64,
    pub currency: String,
    pub fee_amount: f64,
    pub trxn_ids: String,
    pub order_reference: Option<String>,
    pub receive_date: Option<DateTime<Utc>>,
    pub cancel_date: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl Payment {
    pub fn has_trxn_id(&self, reference: &str) -> bool {
        self.trxn_ids.split(',').any(|id| id == reference)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringObligation {
    pub id: i64,
    pub subscription_id: String,
    pub status: ObligationStatus,
    pub amount: f64,
    pub currency: String,
    pub frequency_unit: String,
    pub frequency_interval: i32,
    pub end_date: Option<DateTime<Utc>>,
    pub cancel_date: Option<DateTime<Utc>>,
}

// One recorded money movement. Completed payments get a positive entry keyed
// by charge id, refunds a negative entry keyed by refund id; idempotence
// checks match on trxn_id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub payment_id: i64,
    pub trxn_id: String,
    pub amount: f64,
    pub fee_amount: f64,
    pub trxn_date: Option<DateTime<Utc>>,
    pub result_code: Option<String>,
    pub status: ObligationStatus,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub recurring_id: Option<i64>,
    pub status: ObligationStatus,
    pub amount: f64,
    pub currency: String,
    pub trxn_ids: String,
    pub order_reference: Option<String>,
    pub receive_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletePaymentParams {
    pub trxn_id: String,
    pub order_reference: Option<String>,
    pub trxn_date: Option<DateTime<Utc>>,
    pub amount: f64,
    pub fee_amount: f64,
    pub available_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FailPaymentParams {
    pub order_reference: Option<String>,
    pub cancel_date: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_id: i64,
    pub trxn_id: String,
    pub amount: f64,
    pub trxn_date: Option<DateTime<Utc>>,
    pub result_code: Option<String>,
    pub order_reference: Option<String>,
    pub cancelled_ledger_id: Option<i64>,
}

// ok = false is a recoverable failure, surfaced as non-2xx so the gateway
// redelivers
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub ok: bool,
    pub message: String,
}

impl HandlerResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trxn_id_list_matches_whole_ids_only() {
        let payment = Payment {
            id: 1,
            recurring_id: None,
            status: ObligationStatus::Pending,
            amount: 10.0,
            currency: "USD".into(),
            fee_amount: 0.0,
            trxn_ids: "sub_1,in_10,ch_100".into(),
            order_reference: None,
            receive_date: None,
            cancel_date: None,
            cancel_reason: None,
        };
        assert!(payment.has_trxn_id("in_10"));
        assert!(payment.has_trxn_id("ch_100"));
        assert!(!payment.has_trxn_id("in_1"));
    }

    #[test]
    fn status_maps_follow_gateway_lifecycle() {
        assert_eq!(
            invoice_status_to_payment_status("open"),
            Some(ObligationStatus::Pending)
        );
        assert_eq!(
            invoice_status_to_payment_status("paid"),
            Some(ObligationStatus::Completed)
        );
        assert_eq!(
            subscription_status_to_recurring_status("past_due"),
            Some(ObligationStatus::Overdue)
        );
        assert_eq!(
            subscription_status_to_recurring_status("canceled"),
            Some(ObligationStatus::Cancelled)
        );
        assert_eq!(subscription_status_to_recurring_status("paused"), None);
    }
}
