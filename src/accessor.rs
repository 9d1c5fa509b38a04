use crate::domain::event::{Charge, CheckoutSession, EventObject, Invoice, Price, Subscription};
use chrono::{DateTime, TimeZone, Utc};

// Amounts are already converted from minor units, currencies uppercased and
// dates decoded from epoch seconds.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Float(f64),
    Int(i64),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

pub fn minor_to_major(amount_minor: i64) -> f64 {
    amount_minor as f64 / 100.0
}

pub fn format_currency(currency: &str) -> String {
    currency.to_uppercase()
}

pub fn epoch_to_datetime(epoch_seconds: i64) -> Option<DateTime<Utc>> {
    if epoch_seconds == 0 {
        return None;
    }
    Utc.timestamp_opt(epoch_seconds, 0).single()
}

pub fn format_date(epoch_seconds: i64) -> Option<String> {
    epoch_to_datetime(epoch_seconds).map(|date| date.format("%Y%m%d%H%M%S").to_string())
}

fn str_value(value: &str) -> Option<FieldValue> {
    if value.is_empty() {
        None
    } else {
        Some(FieldValue::Str(value.to_string()))
    }
}

fn opt_str_value(value: &Option<String>) -> Option<FieldValue> {
    value.as_deref().and_then(str_value)
}

// Missing fields and unknown (field, object type) pairs both come back as
// None; callers treat absence as "try the next fallback identifier".
pub fn get_object_param(name: &str, object: &EventObject) -> Option<FieldValue> {
    let value = match object {
        EventObject::Charge(charge) => charge_param(name, charge),
        EventObject::Invoice(invoice) => invoice_param(name, invoice),
        EventObject::Subscription(subscription) => subscription_param(name, subscription),
        EventObject::CheckoutSession(session) => checkout_session_param(name, session),
        EventObject::SubscriptionItem(item) => match name {
            "quantity" => Some(FieldValue::Int(item.quantity)),
            "unit_amount" => Some(FieldValue::Float(minor_to_major(item.price.unit_amount))),
            _ => None,
        },
        EventObject::Price(price) => price_param(name, price),
    };

    if value.is_none() {
        tracing::debug!(
            field = name,
            object = object.type_tag(),
            "no extraction rule or value for field"
        );
    }
    value
}

fn charge_param(name: &str, charge: &Charge) -> Option<FieldValue> {
    match name {
        "charge_id" => str_value(&charge.id),
        "failure_code" => opt_str_value(&charge.failure_code),
        "failure_message" => opt_str_value(&charge.failure_message),
        "amount" => Some(FieldValue::Float(minor_to_major(charge.amount))),
        "amount_refunded" => Some(FieldValue::Float(minor_to_major(charge.amount_refunded))),
        "refunded" => Some(FieldValue::Bool(charge.refunded)),
        "captured" => Some(FieldValue::Bool(charge.captured)),
        "customer_id" => opt_str_value(&charge.customer),
        "balance_transaction" => opt_str_value(&charge.balance_transaction),
        "receive_date" => epoch_to_datetime(charge.created).map(FieldValue::Date),
        "currency" => str_value(&format_currency(&charge.currency)),
        "payment_intent_id" => opt_str_value(&charge.payment_intent),
        "invoice_id" => charge.invoice.as_ref().and_then(|invoice| str_value(invoice.id())),
        "subscription_id" => charge
            .invoice
            .as_ref()
            .and_then(|invoice| invoice.expanded())
            .and_then(|invoice| opt_str_value(&invoice.subscription)),
        _ => None,
    }
}

fn invoice_param(name: &str, invoice: &Invoice) -> Option<FieldValue> {
    match name {
        "invoice_id" => str_value(&invoice.id),
        "charge_id" => opt_str_value(&invoice.charge),
        "subscription_id" => opt_str_value(&invoice.subscription),
        "customer_id" => opt_str_value(&invoice.customer),
        "amount" => Some(FieldValue::Float(minor_to_major(invoice.amount_due))),
        "amount_paid" => Some(FieldValue::Float(minor_to_major(invoice.amount_paid))),
        "amount_remaining" => Some(FieldValue::Float(minor_to_major(invoice.amount_remaining))),
        "currency" => str_value(&format_currency(&invoice.currency)),
        "description" => opt_str_value(&invoice.description),
        "receive_date" => epoch_to_datetime(invoice.created).map(FieldValue::Date),
        "status" => opt_str_value(&invoice.status),
        _ => None,
    }
}

fn subscription_param(name: &str, subscription: &Subscription) -> Option<FieldValue> {
    match name {
        "subscription_id" => str_value(&subscription.id),
        "customer_id" => opt_str_value(&subscription.customer),
        "currency" => str_value(&format_currency(&subscription.currency)),
        "status" => opt_str_value(&subscription.status),
        "plan_start" => epoch_to_datetime(subscription.start_date).map(FieldValue::Date),
        "cancel_date" => subscription
            .canceled_at
            .and_then(epoch_to_datetime)
            .map(FieldValue::Date),
        "cycle_day" => epoch_to_datetime(subscription.billing_cycle_anchor)
            .map(|date| FieldValue::Str(date.format("%d").to_string())),
        "amount" | "frequency_unit" | "frequency_interval" => {
            // aggregate of the active line items
            let mut amount_minor = 0i64;
            let mut interval = String::new();
            let mut interval_count = 0i32;
            for item in &subscription.items.data {
                if item.price.active && item.quantity > 0 {
                    amount_minor += item.price.unit_amount * item.quantity;
                    if let Some(recurring) = &item.price.recurring {
                        interval = recurring.interval.clone();
                        interval_count = recurring.interval_count;
                    }
                }
            }
            match name {
                "amount" => Some(FieldValue::Float(minor_to_major(amount_minor))),
                "frequency_unit" => str_value(&interval),
                _ => Some(FieldValue::Int(interval_count as i64)),
            }
        }
        _ => None,
    }
}

fn checkout_session_param(name: &str, session: &CheckoutSession) -> Option<FieldValue> {
    match name {
        "checkout_session_id" => str_value(&session.id),
        "client_reference_id" => opt_str_value(&session.client_reference_id),
        "customer_id" => opt_str_value(&session.customer),
        "invoice_id" => opt_str_value(&session.invoice),
        "payment_intent_id" => opt_str_value(&session.payment_intent),
        "subscription_id" => opt_str_value(&session.subscription),
        _ => None,
    }
}

fn price_param(name: &str, price: &Price) -> Option<FieldValue> {
    match name {
        "unit_amount" => Some(FieldValue::Float(minor_to_major(price.unit_amount))),
        "currency" => str_value(&format_currency(&price.currency)),
        "recurring_interval" => price
            .recurring
            .as_ref()
            .and_then(|recurring| str_value(&recurring.interval)),
        "recurring_interval_count" => price
            .recurring
            .as_ref()
            .map(|recurring| FieldValue::Int(recurring.interval_count as i64)),
        _ => None,
    }
}

pub fn get_string(name: &str, object: &EventObject) -> Option<String> {
    get_object_param(name, object).and_then(|value| value.as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventObject;

    fn charge_object() -> EventObject {
        serde_json::from_value(serde_json::json!({
            "object": "charge",
            "id": "ch_1",
            "amount": 40000,
            "amount_refunded": 0,
            "currency": "usd",
            "customer": "cus_1",
            "payment_intent": "pi_1",
            "captured": true,
            "created": 1_700_000_000,
            "balance_transaction": "txn_1"
        }))
        .unwrap()
    }

    #[test]
    fn amount_converts_minor_units() {
        assert_eq!(
            get_object_param("amount", &charge_object()),
            Some(FieldValue::Float(400.0))
        );
    }

    #[test]
    fn currency_is_uppercased() {
        assert_eq!(get_string("currency", &charge_object()).as_deref(), Some("USD"));
    }

    #[test]
    fn missing_optional_field_is_none() {
        assert_eq!(get_string("invoice_id", &charge_object()), None);
        assert_eq!(get_string("failure_message", &charge_object()), None);
    }

    #[test]
    fn unknown_field_is_none_not_error() {
        assert_eq!(get_object_param("no_such_field", &charge_object()), None);
    }

    #[test]
    fn date_decodes_epoch_seconds() {
        let Some(FieldValue::Date(date)) = get_object_param("receive_date", &charge_object())
        else {
            panic!("receive_date did not decode to a date");
        };
        assert_eq!(date.timestamp(), 1_700_000_000);
        assert_eq!(format_date(1_700_000_000).unwrap().len(), 14);
    }

    #[test]
    fn subscription_plan_aggregates_active_items() {
        let object: EventObject = serde_json::from_value(serde_json::json!({
            "object": "subscription",
            "id": "sub_1",
            "currency": "usd",
            "items": { "data": [
                {
                    "id": "si_1",
                    "quantity": 2,
                    "price": {
                        "id": "price_1",
                        "active": true,
                        "unit_amount": 1500,
                        "currency": "usd",
                        "recurring": { "interval": "month", "interval_count": 1 }
                    }
                },
                {
                    "id": "si_2",
                    "quantity": 1,
                    "price": {
                        "id": "price_2",
                        "active": false,
                        "unit_amount": 9900,
                        "currency": "usd"
                    }
                }
            ]}
        }))
        .unwrap();
        assert_eq!(
            get_object_param("amount", &object),
            Some(FieldValue::Float(30.0))
        );
        assert_eq!(get_string("frequency_unit", &object).as_deref(), Some("month"));
    }
}
