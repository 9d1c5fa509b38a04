use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ChargeSucceeded,
    ChargeCaptured,
    ChargeRefunded,
    ChargeFailed,
    CheckoutSessionCompleted,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    InvoiceFinalized,
    SubscriptionUpdated,
    SubscriptionDeleted,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<EventType> {
        let event_type = match raw {
            "charge.succeeded" => EventType::ChargeSucceeded,
            "charge.captured" => EventType::ChargeCaptured,
            "charge.refunded" => EventType::ChargeRefunded,
            "charge.failed" => EventType::ChargeFailed,
            "checkout.session.completed" => EventType::CheckoutSessionCompleted,
            "invoice.paid" => EventType::InvoicePaid,
            "invoice.payment_succeeded" => EventType::InvoicePaymentSucceeded,
            "invoice.payment_failed" => EventType::InvoicePaymentFailed,
            "invoice.finalized" => EventType::InvoiceFinalized,
            "customer.subscription.updated" => EventType::SubscriptionUpdated,
            "customer.subscription.deleted" => EventType::SubscriptionDeleted,
            _ => return None,
        };
        Some(event_type)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChargeSucceeded => "charge.succeeded",
            EventType::ChargeCaptured => "charge.captured",
            EventType::ChargeRefunded => "charge.refunded",
            EventType::ChargeFailed => "charge.failed",
            EventType::CheckoutSessionCompleted => "checkout.session.completed",
            EventType::InvoicePaid => "invoice.paid",
            EventType::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            EventType::InvoicePaymentFailed => "invoice.payment_failed",
            EventType::InvoiceFinalized => "invoice.finalized",
            EventType::SubscriptionUpdated => "customer.subscription.updated",
            EventType::SubscriptionDeleted => "customer.subscription.deleted",
        }
    }
}

// The gateway delivers these references either collapsed (bare id) or
// expanded (full nested object).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl Expandable<Invoice> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(invoice) => &invoice.id,
        }
    }

    pub fn expanded(&self) -> Option<&Invoice> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(invoice) => Some(invoice),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub invoice: Option<Expandable<Invoice>>,
    #[serde(default)]
    pub captured: bool,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub balance_transaction: Option<String>,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub charge: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub amount_remaining: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recurring {
    #[serde(default)]
    pub interval: String,
    #[serde(default = "default_interval_count")]
    pub interval_count: i32,
}

fn default_interval_count() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub unit_amount: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    pub price: Price,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub items: SubscriptionItemList,
    #[serde(default)]
    pub start_date: i64,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub billing_cycle_anchor: i64,
    #[serde(default)]
    pub current_period_end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

// An unknown object tag fails deserialization and is surfaced to the caller
// rather than guessed at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "object")]
pub enum EventObject {
    #[serde(rename = "charge")]
    Charge(Charge),
    #[serde(rename = "invoice")]
    Invoice(Invoice),
    #[serde(rename = "subscription")]
    Subscription(Subscription),
    #[serde(rename = "checkout.session")]
    CheckoutSession(CheckoutSession),
    #[serde(rename = "subscription_item")]
    SubscriptionItem(SubscriptionItem),
    #[serde(rename = "price")]
    Price(Price),
}

impl EventObject {
    pub fn type_tag(&self) -> &'static str {
        match self {
            EventObject::Charge(_) => "charge",
            EventObject::Invoice(_) => "invoice",
            EventObject::Subscription(_) => "subscription",
            EventObject::CheckoutSession(_) => "checkout.session",
            EventObject::SubscriptionItem(_) => "subscription_item",
            EventObject::Price(_) => "price",
        }
    }
}

// trigger keeps the raw wire string because events of types we do not handle
// must still be acknowledged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: EventObject,
    #[serde(default)]
    pub previous_attributes: Option<serde_json::Value>,
}

impl GatewayEvent {
    pub fn event_type(&self) -> Option<EventType> {
        EventType::parse(&self.trigger)
    }

    pub fn object(&self) -> &EventObject {
        &self.data.object
    }
}

// Groups events that describe the same underlying transaction regardless of
// which sub-identifier the gateway populated on each of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationKey {
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub invoice_id: Option<String>,
    pub subscription_id: Option<String>,
}

impl CorrelationKey {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.payment_intent_id.as_deref().unwrap_or(""),
            self.charge_id.as_deref().unwrap_or(""),
            self.invoice_id.as_deref().unwrap_or(""),
            self.subscription_id.as_deref().unwrap_or("")
        )
    }
}
