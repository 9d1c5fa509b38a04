use chrono::TimeZone;
use payments_reconciler::config::GateConfig;
use payments_reconciler::domain::event::{Charge, Subscription};
use payments_reconciler::domain::obligation::{NewPayment, ObligationStatus, RecurringObligation};
use payments_reconciler::gateway::mock::MockGatewayClient;
use payments_reconciler::gateway::BalanceTransaction;
use payments_reconciler::service::events::ReconciliationHandlers;
use payments_reconciler::service::gate::IngestionGate;
use payments_reconciler::service::sweeper::QueueSweeper;
use payments_reconciler::store::memory::{MemoryLock, MemoryObligationStore, MemoryQueueStore};
use std::sync::Arc;

fn gate() -> (
    Arc<IngestionGate>,
    Arc<MemoryObligationStore>,
    Arc<MemoryQueueStore>,
    Arc<MockGatewayClient>,
) {
    let config = GateConfig::default();
    let store = Arc::new(MemoryObligationStore::new());
    let queue = Arc::new(MemoryQueueStore::new());
    let gateway = Arc::new(MockGatewayClient::new());
    store.seed_customer("cus_1", "proc_1");

    let handlers = Arc::new(ReconciliationHandlers::new(
        "proc_1".into(),
        store.clone(),
        queue.clone(),
        Arc::new(MemoryLock::new()),
        gateway.clone(),
        &config,
    ));
    let gate = Arc::new(IngestionGate {
        config,
        processor_id: "proc_1".into(),
        queue: queue.clone(),
        store: store.clone(),
        gateway: gateway.clone(),
        handlers,
    });
    (gate, store, queue, gateway)
}

fn recurring(subscription_id: &str, end_date: Option<chrono::DateTime<chrono::Utc>>) -> RecurringObligation {
    RecurringObligation {
        id: 0,
        subscription_id: subscription_id.into(),
        status: ObligationStatus::InProgress,
        amount: 30.0,
        currency: "USD".into(),
        frequency_unit: "month".into(),
        frequency_interval: 1,
        end_date,
        cancel_date: None,
    }
}

fn seeded_charge(charge_id: &str, balance_transaction: Option<&str>) -> Charge {
    serde_json::from_value(serde_json::json!({
        "id": charge_id,
        "amount": 3000,
        "currency": "usd",
        "captured": true,
        "balance_transaction": balance_transaction,
        "created": 1_700_000_000
    }))
    .unwrap()
}

fn invoice_event(trigger: &str, event_id: &str, invoice_id: &str, subscription: &str, charge: Option<&str>) -> String {
    serde_json::json!({
        "id": event_id,
        "type": trigger,
        "data": { "object": {
            "object": "invoice",
            "id": invoice_id,
            "subscription": subscription,
            "charge": charge,
            "customer": "cus_1",
            "amount_due": 3000,
            "currency": "usd",
            "created": 1_700_000_000
        }}
    })
    .to_string()
}

#[tokio::test]
async fn invoice_payment_creates_and_completes_an_installment() {
    let (gate, store, _queue, gateway) = gate();
    let recurring_id = store.seed_recurring(recurring("sub_1", None));
    gateway.put_charge(seeded_charge("ch_5", Some("txn_5")));
    gateway.put_balance_transaction(BalanceTransaction {
        id: "txn_5".into(),
        amount: 2881,
        currency: "usd".into(),
        fee: 119,
        exchange_rate: None,
        available_on: 1_700_000_000,
    });

    let outcome = gate
        .ingest(&invoice_event("invoice.payment_succeeded", "evt_1", "in_5", "sub_1", Some("ch_5")))
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    let payments = store.payments();
    assert_eq!(payments.len(), 1);
    let payment = &payments[0];
    assert_eq!(payment.recurring_id, Some(recurring_id));
    assert_eq!(payment.status, ObligationStatus::Completed);
    assert_eq!(payment.amount, 30.0);
    assert_eq!(payment.fee_amount, 1.19);
    assert_eq!(payment.order_reference.as_deref(), Some("in_5"));
    assert!(payment.has_trxn_id("ch_5"));

    // redelivery under a new event id must not double-record
    let outcome = gate
        .ingest(&invoice_event("invoice.payment_succeeded", "evt_2", "in_5", "sub_1", Some("ch_5")))
        .await
        .unwrap();
    assert!(outcome.ok);
    assert!(outcome.message.contains("already recorded"));
    assert_eq!(store.payments().len(), 1);
    assert_eq!(store.ledger().len(), 1);
}

#[tokio::test]
async fn finalized_invoice_attaches_to_a_pre_created_payment() {
    let (gate, store, _queue, gateway) = gate();
    let recurring_id = store.seed_recurring(recurring("sub_1", None));
    store.seed_payment(NewPayment {
        recurring_id: Some(recurring_id),
        status: ObligationStatus::Pending,
        amount: 30.0,
        currency: "USD".into(),
        trxn_ids: "sub_1".into(),
        order_reference: None,
        receive_date: None,
    });

    gate.ingest(&invoice_event("invoice.finalized", "evt_f", "in_7", "sub_1", None))
        .await
        .unwrap();
    let sweeper = QueueSweeper::new(gate.clone(), 1000);
    while sweeper.tick().await.unwrap() > 0 {}

    let payment = &store.payments()[0];
    assert!(payment.has_trxn_id("sub_1"));
    assert!(payment.has_trxn_id("in_7"));
    assert_eq!(payment.status, ObligationStatus::Pending);

    gateway.put_charge(seeded_charge("ch_7", None));
    let outcome = gate
        .ingest(&invoice_event("invoice.payment_succeeded", "evt_p", "in_7", "sub_1", Some("ch_7")))
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    let payments = store.payments();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, ObligationStatus::Completed);
    assert!(payments[0].has_trxn_id("ch_7"));
}

#[tokio::test]
async fn failed_invoice_payment_records_the_charge_failure_reason() {
    let (gate, store, _queue, gateway) = gate();
    store.seed_payment(NewPayment {
        recurring_id: None,
        status: ObligationStatus::Pending,
        amount: 30.0,
        currency: "USD".into(),
        trxn_ids: "in_9".into(),
        order_reference: None,
        receive_date: None,
    });
    let mut charge = seeded_charge("ch_9", None);
    charge.failure_message = Some("card_declined".into());
    gateway.put_charge(charge);

    let outcome = gate
        .ingest(&invoice_event("invoice.payment_failed", "evt_1", "in_9", "sub_none", Some("ch_9")))
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    let payment = &store.payments()[0];
    assert_eq!(payment.status, ObligationStatus::Failed);
    assert_eq!(payment.cancel_reason.as_deref(), Some("card_declined"));
    assert_eq!(payment.order_reference.as_deref(), Some("in_9"));
}

#[tokio::test]
async fn deleted_subscription_cancels_the_recurring_obligation() {
    let (gate, store, _queue, _) = gate();
    store.seed_recurring(recurring("sub_2", None));

    let payload = serde_json::json!({
        "id": "evt_1",
        "type": "customer.subscription.deleted",
        "data": { "object": {
            "object": "subscription",
            "id": "sub_2",
            "customer": "cus_1",
            "currency": "usd",
            "canceled_at": 1_700_200_000
        }}
    })
    .to_string();
    let outcome = gate.ingest(&payload).await.unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    let obligation = &store.recurring_obligations()[0];
    assert_eq!(obligation.status, ObligationStatus::Cancelled);
    assert_eq!(
        obligation.cancel_date.map(|d| d.timestamp()),
        Some(1_700_200_000)
    );

    // a subscription nothing tracks is acknowledged and changes nothing
    let unknown = payload.replace("evt_1", "evt_2").replace("sub_2", "sub_zzz");
    let outcome = gate.ingest(&unknown).await.unwrap();
    assert!(outcome.ok);
    assert!(outcome.message.contains("ignored"));
}

#[tokio::test]
async fn fixed_term_obligation_completes_at_its_end_date() {
    let (gate, store, _queue, gateway) = gate();
    let end_date = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    store.seed_recurring(recurring("sub_3", Some(end_date)));

    let subscription: Subscription = serde_json::from_value(serde_json::json!({
        "id": "sub_3",
        "customer": "cus_1",
        "status": "active",
        "currency": "usd",
        "current_period_end": end_date.timestamp() + 60
    }))
    .unwrap();
    gateway.put_subscription(subscription);

    let outcome = gate
        .ingest(&invoice_event("invoice.paid", "evt_1", "in_11", "sub_3", None))
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);
    assert!(outcome.message.contains("cancel at period end"));

    assert_eq!(gateway.cancelled_subscriptions(), vec!["sub_3".to_string()]);
    assert_eq!(
        store.recurring_obligations()[0].status,
        ObligationStatus::Completed
    );
    assert_eq!(store.payments()[0].status, ObligationStatus::Completed);
}

#[tokio::test]
async fn checkout_session_binds_subscription_to_the_recurring_obligation() {
    let (gate, store, _queue, _) = gate();
    let recurring_id = store.seed_recurring(recurring("placeholder", None));
    store.seed_payment(NewPayment {
        recurring_id: Some(recurring_id),
        status: ObligationStatus::Pending,
        amount: 30.0,
        currency: "USD".into(),
        trxn_ids: String::new(),
        order_reference: Some("ref_9".into()),
        receive_date: None,
    });

    let payload = serde_json::json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": { "object": {
            "object": "checkout.session",
            "id": "cs_9",
            "client_reference_id": "ref_9",
            "customer": "cus_1",
            "invoice": "in_20",
            "subscription": "sub_20"
        }}
    })
    .to_string();
    let outcome = gate.ingest(&payload).await.unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    assert_eq!(store.recurring_obligations()[0].subscription_id, "sub_20");
    assert!(store.payments()[0].has_trxn_id("in_20"));
}
