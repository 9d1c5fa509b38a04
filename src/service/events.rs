use crate::accessor::{epoch_to_datetime, format_currency, minor_to_major};
use crate::config::GateConfig;
use crate::domain::event::{EventObject, EventType, GatewayEvent, Invoice, Subscription};
use crate::domain::obligation::{
    invoice_status_to_payment_status, subscription_status_to_recurring_status,
    CompletePaymentParams, FailPaymentParams, HandlerResult, NewPayment, ObligationStatus, Payment,
    RecurringObligation, RefundParams,
};
use crate::gateway::GatewayClient;
use crate::service::balance::BalanceDetailsResolver;
use crate::store::{AcquiredLock, NamedLock, ObligationStore, WebhookQueueStore};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;

// An Err from the store, the lock backend or the gateway is a recoverable
// failure the caller turns into a redeliverable outcome.
pub struct ReconciliationHandlers {
    pub processor_id: String,
    pub store: Arc<dyn ObligationStore>,
    pub queue: Arc<dyn WebhookQueueStore>,
    pub lock: Arc<dyn NamedLock>,
    pub gateway: Arc<dyn GatewayClient>,
    pub balance: BalanceDetailsResolver,
    pub strict_locking: bool,
}

impl ReconciliationHandlers {
    pub fn new(
        processor_id: String,
        store: Arc<dyn ObligationStore>,
        queue: Arc<dyn WebhookQueueStore>,
        lock: Arc<dyn NamedLock>,
        gateway: Arc<dyn GatewayClient>,
        config: &GateConfig,
    ) -> Self {
        Self {
            processor_id,
            store,
            queue,
            lock,
            balance: BalanceDetailsResolver::new(gateway.clone()),
            gateway,
            strict_locking: config.strict_locking,
        }
    }

    pub async fn handle(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let Some(event_type) = event.event_type() else {
            return Ok(HandlerResult::ok(format!(
                "{}: unhandled event type, acknowledged",
                event.trigger
            )));
        };
        match event_type {
            EventType::ChargeSucceeded | EventType::ChargeCaptured => {
                self.charge_succeeded(event).await
            }
            EventType::ChargeRefunded => self.charge_refunded(event).await,
            EventType::ChargeFailed => self.charge_failed(event).await,
            EventType::CheckoutSessionCompleted => self.checkout_session_completed(event).await,
            EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
                self.invoice_paid(event).await
            }
            EventType::InvoiceFinalized => self.invoice_finalized(event).await,
            EventType::InvoicePaymentFailed => self.invoice_payment_failed(event).await,
            EventType::SubscriptionDeleted => self.subscription_deleted(event).await,
            EventType::SubscriptionUpdated => self.subscription_updated(event).await,
        }
    }

    // Per reference, transaction ids are tried before the order reference;
    // the first hit wins.
    async fn match_payment(&self, references: &[Option<&str>]) -> Result<Option<Payment>> {
        for reference in references.iter().flatten() {
            if reference.is_empty() {
                continue;
            }
            if let Some(payment) = self.store.find_payment_by_trxn_id(reference).await? {
                return Ok(Some(payment));
            }
            if let Some(payment) = self.store.find_payment_by_order_reference(reference).await? {
                return Ok(Some(payment));
            }
        }
        Ok(None)
    }

    // A lock that could not be acquired is logged and, by default, worked
    // around; strict_locking turns it into a hard failure.
    async fn acquire_or_proceed(&self, name: &str) -> Result<AcquiredLock> {
        let lock = self.lock.acquire(name).await?;
        if !lock.acquired {
            tracing::error!(lock = name, "failed to acquire named lock, proceeding without it");
            if self.strict_locking {
                bail!("failed to acquire lock {name}");
            }
        }
        Ok(lock)
    }

    async fn release(&self, lock: &AcquiredLock) {
        if let Err(err) = self.lock.release(lock).await {
            tracing::warn!(lock = %lock.name, error = %err, "failed to release named lock");
        }
    }

    async fn charge_succeeded(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Charge(charge) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        if charge.customer.is_none() {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - no customer attached to charge {}",
                charge.id
            )));
        }
        if charge.id.is_empty() {
            return Ok(HandlerResult::err(format!("{op}: missing charge id")));
        }
        let invoice_id = charge.invoice.as_ref().map(|invoice| invoice.id().to_string());

        let Some(payment) = self
            .match_payment(&[
                Some(charge.id.as_str()),
                charge.payment_intent.as_deref(),
                invoice_id.as_deref(),
            ])
            .await?
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - no payment matches charge {}",
                charge.id
            )));
        };
        if payment.recurring_id.is_some() {
            // Installments of a recurring obligation are recorded from the
            // invoice events, which carry the authoritative amounts.
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - payment {} belongs to a recurring obligation",
                payment.id
            )));
        }
        if !charge.captured {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - charge {} not captured",
                charge.id
            )));
        }

        match payment.status {
            ObligationStatus::Pending | ObligationStatus::Failed => {
                let details = self.balance.resolve(&charge.id, event.object()).await?;
                self.store
                    .complete_payment(
                        payment.id,
                        CompletePaymentParams {
                            trxn_id: charge.id.clone(),
                            order_reference: Some(
                                invoice_id.clone().unwrap_or_else(|| charge.id.clone()),
                            ),
                            trxn_date: epoch_to_datetime(charge.created),
                            amount: minor_to_major(charge.amount),
                            fee_amount: details.fee_amount,
                            available_on: details.available_on,
                        },
                    )
                    .await?;
                Ok(HandlerResult::ok(format!(
                    "{op}: payment {} completed for charge {}",
                    payment.id, charge.id
                )))
            }
            ObligationStatus::Completed => Ok(HandlerResult::ok(format!(
                "{op}: payment {} already completed",
                payment.id
            ))),
            _ => Ok(HandlerResult::ok(format!(
                "{op}: ignoring - payment {} in status {}",
                payment.id,
                payment.status.as_str()
            ))),
        }
    }

    async fn charge_refunded(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Charge(charge) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        if !charge.captured {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - refund on uncaptured charge {}",
                charge.id
            )));
        }

        // The event itself carries only the aggregate; the refund object
        // holds the id and date the ledger entry is keyed by.
        let refunds = self.gateway.list_refunds(&charge.id, 1).await?;
        let Some(refund) = refunds.first() else {
            return Ok(HandlerResult::err(format!(
                "{op}: no refund found on charge {}",
                charge.id
            )));
        };
        let invoice_id = charge.invoice.as_ref().map(|invoice| invoice.id().to_string());

        let Some(payment) = self
            .match_payment(&[Some(charge.id.as_str()), invoice_id.as_deref()])
            .await?
        else {
            return Ok(HandlerResult::err(format!(
                "{op}: no payment matches refunded charge {}",
                charge.id
            )));
        };

        let entries = self.store.ledger_entries_for_payment(payment.id).await?;
        if entries.iter().any(|entry| entry.trxn_id == refund.id) {
            return Ok(HandlerResult::ok(format!(
                "{op}: refund {} already recorded",
                refund.id
            )));
        }
        let cancelled_ledger_id = entries
            .iter()
            .find(|entry| {
                entry.trxn_id == charge.id && entry.status == ObligationStatus::Completed
            })
            .map(|entry| entry.id);

        let lock = self
            .acquire_or_proceed(&format!("payment.{}", payment.id))
            .await?;
        let outcome = self
            .record_refund_locked(event, payment.id, cancelled_ledger_id, invoice_id)
            .await;
        self.release(&lock).await;
        outcome
    }

    async fn record_refund_locked(
        &self,
        event: &GatewayEvent,
        payment_id: i64,
        cancelled_ledger_id: Option<i64>,
        invoice_id: Option<String>,
    ) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Charge(charge) = event.object() else {
            bail!("{op}: refund recording requires a charge object");
        };
        let refunds = self.gateway.list_refunds(&charge.id, 1).await?;
        let refund = refunds
            .first()
            .ok_or_else(|| anyhow!("{op}: refund disappeared from charge {}", charge.id))?;

        // Recheck now that the lock is held; a concurrent delivery may have
        // recorded it between the first check and here.
        let entries = self.store.ledger_entries_for_payment(payment_id).await?;
        if entries.iter().any(|entry| entry.trxn_id == refund.id) {
            return Ok(HandlerResult::ok(format!(
                "{op}: refund {} already recorded",
                refund.id
            )));
        }

        let amount = -minor_to_major(charge.amount_refunded.abs());
        self.store
            .record_refund(RefundParams {
                payment_id,
                trxn_id: refund.id.clone(),
                amount,
                trxn_date: epoch_to_datetime(refund.created),
                result_code: refund.reason.clone(),
                order_reference: invoice_id,
                cancelled_ledger_id,
            })
            .await?;
        Ok(HandlerResult::ok(format!(
            "{op}: refund {} of {amount:.2} recorded against payment {payment_id}",
            refund.id
        )))
    }

    async fn charge_failed(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Charge(charge) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        if charge.customer.is_none() {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - no customer attached to charge {}",
                charge.id
            )));
        }
        let invoice_id = charge.invoice.as_ref().map(|invoice| invoice.id().to_string());

        let Some(payment) = self
            .match_payment(&[
                Some(charge.id.as_str()),
                charge.payment_intent.as_deref(),
                invoice_id.as_deref(),
            ])
            .await?
        else {
            return Ok(HandlerResult::err(format!(
                "{op}: no payment matches failed charge {}",
                charge.id
            )));
        };
        if payment.status == ObligationStatus::Failed {
            return Ok(HandlerResult::ok(format!(
                "{op}: payment {} already failed",
                payment.id
            )));
        }

        self.store
            .fail_payment(
                payment.id,
                FailPaymentParams {
                    order_reference: Some(invoice_id.unwrap_or_else(|| charge.id.clone())),
                    cancel_date: epoch_to_datetime(charge.created),
                    cancel_reason: charge.failure_message.clone(),
                },
            )
            .await?;
        Ok(HandlerResult::ok(format!(
            "{op}: payment {} marked failed",
            payment.id
        )))
    }

    async fn checkout_session_completed(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::CheckoutSession(session) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        let Some(reference) = session
            .client_reference_id
            .as_deref()
            .filter(|r| !r.is_empty())
        else {
            return Ok(HandlerResult::err(format!(
                "{op}: session {} has no client_reference_id",
                session.id
            )));
        };
        let Some(payment) = self.store.find_payment_by_order_reference(reference).await? else {
            return Ok(HandlerResult::err(format!(
                "{op}: no payment matches checkout reference {reference}"
            )));
        };
        let Some(trxn_id) = session
            .invoice
            .clone()
            .or_else(|| session.payment_intent.clone())
        else {
            return Ok(HandlerResult::err(format!(
                "{op}: session {} has neither invoice nor payment intent",
                session.id
            )));
        };

        self.store.append_trxn_id(payment.id, &trxn_id).await?;
        if let (Some(subscription_id), Some(recurring_id)) =
            (&session.subscription, payment.recurring_id)
        {
            self.store
                .set_recurring_subscription_id(recurring_id, subscription_id)
                .await?;
        }

        let mut message = format!(
            "{op}: payment {} linked to checkout session {}",
            payment.id, session.id
        );
        // charge.succeeded may have arrived before the session linked the
        // payment to its identifiers; replay it now that matching can work.
        if let Some(payment_intent_id) = session.payment_intent.as_deref() {
            if let Some(record) = self
                .queue
                .find_latest_success(&self.processor_id, "charge.succeeded", payment_intent_id)
                .await?
            {
                self.queue.reset_for_reprocess(record.id).await?;
                message.push_str(&format!(
                    ", queued {} for reprocessing",
                    record.event_id
                ));
            }
        }
        Ok(HandlerResult::ok(message))
    }

    async fn invoice_paid(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Invoice(invoice) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        if invoice.id.is_empty() {
            return Ok(HandlerResult::err(format!("{op}: missing invoice id")));
        }
        let Some(subscription_id) = invoice.subscription.as_deref().filter(|s| !s.is_empty())
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - invoice {} not tied to a subscription",
                invoice.id
            )));
        };
        let Some(recurring) = self
            .store
            .find_recurring_by_subscription_id(subscription_id)
            .await?
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - no recurring obligation for subscription {subscription_id}"
            )));
        };
        let charge_id = invoice.charge.clone().unwrap_or_default();

        // Two locks in sequence, never nested: the invoice lock guards
        // find-or-create of the installment, the payment lock guards the
        // ledger write.
        let lock = self
            .acquire_or_proceed(&format!("payment.invoice.{}", invoice.id))
            .await?;
        let found = self
            .find_or_create_installment(event, invoice, &recurring, &charge_id, ObligationStatus::Pending)
            .await;
        self.release(&lock).await;
        let payment = found?;

        let lock = self
            .acquire_or_proceed(&format!("payment.{}", payment.id))
            .await?;
        let outcome = self
            .complete_installment(event, invoice, &payment, &charge_id)
            .await;
        self.release(&lock).await;
        let mut result = outcome?;

        if let Some(note) = self.maybe_finish_recurring(subscription_id, recurring.id).await? {
            result.message.push_str(", ");
            result.message.push_str(&note);
        }
        Ok(result)
    }

    async fn find_or_create_installment(
        &self,
        event: &GatewayEvent,
        invoice: &Invoice,
        recurring: &RecurringObligation,
        charge_id: &str,
        initial_status: ObligationStatus,
    ) -> Result<Payment> {
        if let Some(payment) = self
            .match_payment(&[
                Some(charge_id),
                Some(invoice.id.as_str()),
                Some(recurring.subscription_id.as_str()),
            ])
            .await?
        {
            return Ok(payment);
        }

        let details = self.balance.resolve(charge_id, event.object()).await?;
        let id = self
            .store
            .create_payment(NewPayment {
                recurring_id: Some(recurring.id),
                status: initial_status,
                amount: minor_to_major(invoice.amount_due),
                currency: format_currency(&invoice.currency),
                trxn_ids: if charge_id.is_empty() {
                    invoice.id.clone()
                } else {
                    charge_id.to_string()
                },
                order_reference: Some(invoice.id.clone()),
                receive_date: epoch_to_datetime(invoice.created).or(details.available_on),
            })
            .await?;
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| anyhow!("payment {id} missing immediately after creation"))
    }

    async fn complete_installment(
        &self,
        event: &GatewayEvent,
        invoice: &Invoice,
        payment: &Payment,
        charge_id: &str,
    ) -> Result<HandlerResult> {
        let op = &event.trigger;
        if !charge_id.is_empty()
            && self
                .store
                .find_completed_ledger_entry(charge_id)
                .await?
                .is_some()
        {
            return Ok(HandlerResult::ok(format!(
                "{op}: payment already recorded for charge {charge_id}"
            )));
        }

        match payment.status {
            ObligationStatus::Pending | ObligationStatus::Failed => {
                let details = self.balance.resolve(charge_id, event.object()).await?;
                self.store
                    .complete_payment(
                        payment.id,
                        CompletePaymentParams {
                            trxn_id: if charge_id.is_empty() {
                                invoice.id.clone()
                            } else {
                                charge_id.to_string()
                            },
                            order_reference: Some(invoice.id.clone()),
                            trxn_date: epoch_to_datetime(invoice.created),
                            amount: minor_to_major(invoice.amount_due),
                            fee_amount: details.fee_amount,
                            available_on: details.available_on,
                        },
                    )
                    .await?;
                Ok(HandlerResult::ok(format!(
                    "{op}: payment {} completed for invoice {}",
                    payment.id, invoice.id
                )))
            }
            _ => Ok(HandlerResult::ok(format!(
                "{op}: payment {} in status {}, nothing to record",
                payment.id,
                payment.status.as_str()
            ))),
        }
    }

    // Once a fixed-length subscription's current period reaches the end date,
    // ask the gateway to stop renewing and mark the obligation completed. The
    // only outbound mutation this service performs.
    async fn maybe_finish_recurring(
        &self,
        subscription_id: &str,
        recurring_id: i64,
    ) -> Result<Option<String>> {
        let Some(recurring) = self.store.get_recurring(recurring_id).await? else {
            return Ok(None);
        };
        let Some(end_date) = recurring.end_date else {
            return Ok(None);
        };
        let finished = recurring.status == ObligationStatus::Completed || {
            let subscription = self.gateway.retrieve_subscription(subscription_id).await?;
            subscription.current_period_end >= end_date.timestamp()
        };
        if !finished {
            return Ok(None);
        }
        self.gateway
            .cancel_subscription_at_period_end(subscription_id)
            .await?;
        self.store.complete_recurring(recurring_id).await?;
        Ok(Some(format!(
            "subscription {subscription_id} set to cancel at period end"
        )))
    }

    async fn invoice_finalized(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Invoice(invoice) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        let Some(subscription_id) = invoice.subscription.as_deref().filter(|s| !s.is_empty())
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - invoice {} not tied to a subscription",
                invoice.id
            )));
        };
        let Some(recurring) = self
            .store
            .find_recurring_by_subscription_id(subscription_id)
            .await?
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - no recurring obligation for subscription {subscription_id}"
            )));
        };
        let charge_id = invoice.charge.clone().unwrap_or_default();

        let Some(payment) = self
            .match_payment(&[
                Some(charge_id.as_str()),
                Some(invoice.id.as_str()),
                Some(recurring.subscription_id.as_str()),
            ])
            .await?
        else {
            // The invoice status drives the created payment's status; a
            // finalized invoice is normally still open, hence pending.
            let status = invoice
                .status
                .as_deref()
                .and_then(invoice_status_to_payment_status)
                .unwrap_or(ObligationStatus::Pending);
            let payment = self
                .find_or_create_installment(event, invoice, &recurring, &charge_id, status)
                .await?;
            return Ok(HandlerResult::ok(format!(
                "{op}: created {} payment {} for invoice {}",
                status.as_str().to_lowercase(),
                payment.id,
                invoice.id
            )));
        };

        // A payment stamped out ahead of the gateway only knows the
        // subscription id; the finalized invoice is the first chance to
        // attach an identifier later events will match on.
        if payment.trxn_ids == recurring.subscription_id {
            self.store.append_trxn_id(payment.id, &invoice.id).await?;
            return Ok(HandlerResult::ok(format!(
                "{op}: added invoice {} to payment {}",
                invoice.id, payment.id
            )));
        }
        Ok(HandlerResult::ok(format!(
            "{op}: payment {} already tracks invoice {}",
            payment.id, invoice.id
        )))
    }

    async fn invoice_payment_failed(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Invoice(invoice) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        if invoice.id.is_empty() {
            return Ok(HandlerResult::err(format!("{op}: missing invoice id")));
        }

        let Some(payment) = self
            .match_payment(&[invoice.charge.as_deref(), Some(invoice.id.as_str())])
            .await?
        else {
            return Ok(HandlerResult::err(format!(
                "{op}: no payment matches failed invoice {}",
                invoice.id
            )));
        };
        if payment.status != ObligationStatus::Pending {
            return Ok(HandlerResult::ok(format!(
                "{op}: ignoring - payment {} not pending",
                payment.id
            )));
        }

        let cancel_reason = match invoice.charge.as_deref() {
            Some(charge_id) if !charge_id.is_empty() => {
                self.gateway.retrieve_charge(charge_id).await?.failure_message
            }
            _ => None,
        };
        self.store
            .fail_payment(
                payment.id,
                FailPaymentParams {
                    order_reference: Some(invoice.id.clone()),
                    cancel_date: epoch_to_datetime(invoice.created),
                    cancel_reason,
                },
            )
            .await?;
        Ok(HandlerResult::ok(format!(
            "{op}: payment {} marked failed for invoice {}",
            payment.id, invoice.id
        )))
    }

    async fn subscription_deleted(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Subscription(subscription) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        let Some(recurring) = self
            .store
            .find_recurring_by_subscription_id(&subscription.id)
            .await?
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: no recurring obligation found for subscription {}, ignored",
                subscription.id
            )));
        };
        if recurring.status == ObligationStatus::Cancelled {
            return Ok(HandlerResult::ok(format!(
                "{op}: recurring obligation {} already cancelled",
                recurring.id
            )));
        }

        self.store
            .cancel_recurring(
                recurring.id,
                subscription.canceled_at.and_then(epoch_to_datetime),
            )
            .await?;
        Ok(HandlerResult::ok(format!(
            "{op}: recurring obligation {} cancelled",
            recurring.id
        )))
    }

    async fn subscription_updated(&self, event: &GatewayEvent) -> Result<HandlerResult> {
        let op = &event.trigger;
        let EventObject::Subscription(subscription) = event.object() else {
            return Ok(HandlerResult::err(format!(
                "{op}: invalid object type {}",
                event.object().type_tag()
            )));
        };
        let Some(recurring) = self
            .store
            .find_recurring_by_subscription_id(&subscription.id)
            .await?
        else {
            return Ok(HandlerResult::ok(format!(
                "{op}: no recurring obligation found for subscription {}, ignored",
                subscription.id
            )));
        };
        let Some(previous) = &event.data.previous_attributes else {
            return Ok(HandlerResult::ok(format!(
                "{op}: no changes on subscription {}, ignored",
                subscription.id
            )));
        };

        let mut notes: Vec<String> = Vec::new();
        if previous.get("status").is_some() {
            if let Some(mapped) = subscription
                .status
                .as_deref()
                .and_then(subscription_status_to_recurring_status)
            {
                if mapped != recurring.status {
                    self.store
                        .update_recurring_status(recurring.id, mapped)
                        .await?;
                    notes.push(format!(
                        "recurring obligation {} moved to {}",
                        recurring.id,
                        mapped.as_str()
                    ));
                }
            }
        }

        let items_changed = previous
            .get("items")
            .and_then(|items| items.get("data"))
            .and_then(|data| data.as_array())
            .map_or(false, |data| !data.is_empty());
        if items_changed {
            let buckets = subscription_amount_buckets(subscription);
            let key = format!(
                "{}_{}_{}",
                recurring.currency.to_lowercase(),
                recurring.frequency_unit,
                recurring.frequency_interval
            );
            // Only the bucket matching the obligation's own currency and
            // schedule can change its template amount.
            if let Some(&amount) = buckets.get(&key) {
                if (amount - recurring.amount).abs() >= 0.005 {
                    self.store
                        .update_recurring_amount(recurring.id, amount, &recurring.currency)
                        .await?;
                    notes.push(format!(
                        "recurring obligation {} amount updated to {amount:.2}",
                        recurring.id
                    ));
                }
            }
        }

        if notes.is_empty() {
            return Ok(HandlerResult::ok(format!(
                "{op}: no material changes on subscription {}, ignored",
                subscription.id
            )));
        }
        Ok(HandlerResult::ok(format!("{op}: {}", notes.join(", "))))
    }
}

// Sums the active line items into per-(currency, interval, interval count)
// amounts.
fn subscription_amount_buckets(subscription: &Subscription) -> HashMap<String, f64> {
    let mut buckets = HashMap::new();
    for item in &subscription.items.data {
        if !item.price.active || item.quantity <= 0 {
            continue;
        }
        let Some(recurring) = &item.price.recurring else {
            continue;
        };
        let key = format!(
            "{}_{}_{}",
            item.price.currency.to_lowercase(),
            recurring.interval,
            recurring.interval_count
        );
        *buckets.entry(key).or_insert(0.0) += minor_to_major(item.price.unit_amount * item.quantity);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGatewayClient;
    use crate::store::memory::{MemoryLock, MemoryObligationStore, MemoryQueueStore};

    fn handlers(
        store: Arc<MemoryObligationStore>,
        queue: Arc<MemoryQueueStore>,
        gateway: Arc<MockGatewayClient>,
    ) -> ReconciliationHandlers {
        ReconciliationHandlers::new(
            "proc_1".into(),
            store,
            queue,
            Arc::new(MemoryLock::new()),
            gateway,
            &GateConfig::default(),
        )
    }

    fn event(trigger: &str, object: serde_json::Value) -> GatewayEvent {
        serde_json::from_value(serde_json::json!({
            "id": format!("evt_{trigger}"),
            "type": trigger,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn charge_succeeded_completes_pending_payment() {
        let store = Arc::new(MemoryObligationStore::new());
        store.seed_payment(NewPayment {
            recurring_id: None,
            status: ObligationStatus::Pending,
            amount: 400.0,
            currency: "USD".into(),
            trxn_ids: "pi_1".into(),
            order_reference: None,
            receive_date: None,
        });
        let gateway = Arc::new(MockGatewayClient::new());
        let handlers = handlers(store.clone(), Arc::new(MemoryQueueStore::new()), gateway);

        let result = handlers
            .handle(&event(
                "charge.succeeded",
                serde_json::json!({
                    "object": "charge",
                    "id": "ch_1",
                    "amount": 40000,
                    "currency": "usd",
                    "customer": "cus_1",
                    "payment_intent": "pi_1",
                    "captured": true,
                    "created": 1_700_000_000
                }),
            ))
            .await
            .unwrap();

        assert!(result.ok, "{}", result.message);
        let payment = &store.payments()[0];
        assert_eq!(payment.status, ObligationStatus::Completed);
        assert!(payment.has_trxn_id("ch_1"));
        assert!(payment.has_trxn_id("pi_1"));
    }

    #[tokio::test]
    async fn charge_without_matching_payment_is_acknowledged() {
        let store = Arc::new(MemoryObligationStore::new());
        let handlers = handlers(
            store,
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MockGatewayClient::new()),
        );
        let result = handlers
            .handle(&event(
                "charge.succeeded",
                serde_json::json!({
                    "object": "charge",
                    "id": "ch_none",
                    "customer": "cus_1",
                    "captured": true
                }),
            ))
            .await
            .unwrap();
        assert!(result.ok);
        assert!(result.message.contains("no payment matches"));
    }

    #[tokio::test]
    async fn subscription_update_recomputes_matching_bucket_only() {
        let store = Arc::new(MemoryObligationStore::new());
        store.seed_recurring(RecurringObligation {
            id: 7,
            subscription_id: "sub_1".into(),
            status: ObligationStatus::InProgress,
            amount: 30.0,
            currency: "USD".into(),
            frequency_unit: "month".into(),
            frequency_interval: 1,
            end_date: None,
            cancel_date: None,
        });
        let handlers = handlers(
            store.clone(),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MockGatewayClient::new()),
        );

        let mut event = event(
            "customer.subscription.updated",
            serde_json::json!({
                "object": "subscription",
                "id": "sub_1",
                "currency": "usd",
                "items": { "data": [{
                    "id": "si_1",
                    "quantity": 3,
                    "price": {
                        "id": "price_1",
                        "active": true,
                        "unit_amount": 1500,
                        "currency": "usd",
                        "recurring": { "interval": "month", "interval_count": 1 }
                    }
                }]}
            }),
        );
        event.data.previous_attributes = Some(serde_json::json!({
            "items": { "data": [{ "id": "si_1" }] }
        }));

        let result = handlers.handle(&event).await.unwrap();
        assert!(result.ok, "{}", result.message);
        assert_eq!(store.recurring_obligations()[0].amount, 45.0);
    }

    #[tokio::test]
    async fn subscription_update_without_previous_attributes_is_ignored() {
        let store = Arc::new(MemoryObligationStore::new());
        store.seed_recurring(RecurringObligation {
            id: 1,
            subscription_id: "sub_1".into(),
            status: ObligationStatus::InProgress,
            amount: 30.0,
            currency: "USD".into(),
            frequency_unit: "month".into(),
            frequency_interval: 1,
            end_date: None,
            cancel_date: None,
        });
        let handlers = handlers(
            store.clone(),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MockGatewayClient::new()),
        );
        let result = handlers
            .handle(&event(
                "customer.subscription.updated",
                serde_json::json!({
                    "object": "subscription",
                    "id": "sub_1",
                    "currency": "usd"
                }),
            ))
            .await
            .unwrap();
        assert!(result.ok);
        assert!(result.message.contains("no changes"));
        assert_eq!(store.recurring_obligations()[0].amount, 30.0);
    }

    #[tokio::test]
    async fn subscription_status_change_moves_recurring_to_mapped_status() {
        let store = Arc::new(MemoryObligationStore::new());
        store.seed_recurring(RecurringObligation {
            id: 1,
            subscription_id: "sub_1".into(),
            status: ObligationStatus::InProgress,
            amount: 30.0,
            currency: "USD".into(),
            frequency_unit: "month".into(),
            frequency_interval: 1,
            end_date: None,
            cancel_date: None,
        });
        let handlers = handlers(
            store.clone(),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MockGatewayClient::new()),
        );

        let mut event = event(
            "customer.subscription.updated",
            serde_json::json!({
                "object": "subscription",
                "id": "sub_1",
                "status": "past_due",
                "currency": "usd"
            }),
        );
        event.data.previous_attributes = Some(serde_json::json!({ "status": "active" }));

        let result = handlers.handle(&event).await.unwrap();
        assert!(result.ok, "{}", result.message);
        assert!(result.message.contains("OVERDUE"));
        assert_eq!(
            store.recurring_obligations()[0].status,
            ObligationStatus::Overdue
        );

        // unmapped gateway statuses leave the obligation alone
        event.data.object = serde_json::from_value(serde_json::json!({
            "object": "subscription",
            "id": "sub_1",
            "status": "paused",
            "currency": "usd"
        }))
        .unwrap();
        let result = handlers.handle(&event).await.unwrap();
        assert!(result.ok);
        assert_eq!(
            store.recurring_obligations()[0].status,
            ObligationStatus::Overdue
        );
    }

    #[tokio::test]
    async fn finalized_invoice_status_drives_created_payment_status() {
        let store = Arc::new(MemoryObligationStore::new());
        store.seed_recurring(RecurringObligation {
            id: 1,
            subscription_id: "sub_1".into(),
            status: ObligationStatus::InProgress,
            amount: 30.0,
            currency: "USD".into(),
            frequency_unit: "month".into(),
            frequency_interval: 1,
            end_date: None,
            cancel_date: None,
        });
        let handlers = handlers(
            store.clone(),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MockGatewayClient::new()),
        );

        let result = handlers
            .handle(&event(
                "invoice.finalized",
                serde_json::json!({
                    "object": "invoice",
                    "id": "in_1",
                    "subscription": "sub_1",
                    "status": "uncollectible",
                    "amount_due": 3000,
                    "currency": "usd",
                    "created": 1_700_000_000
                }),
            ))
            .await
            .unwrap();

        assert!(result.ok, "{}", result.message);
        let payment = &store.payments()[0];
        assert_eq!(payment.status, ObligationStatus::Failed);
        assert_eq!(payment.order_reference.as_deref(), Some("in_1"));
    }
}
