use crate::accessor;
use crate::config::GateConfig;
use crate::domain::event::{CorrelationKey, EventObject, EventType, GatewayEvent};
use crate::domain::obligation::HandlerResult;
use crate::gateway::GatewayClient;
use crate::service::events::ReconciliationHandlers;
use crate::store::{NewQueueRecord, ObligationStore, QueuedWebhookRecord, WebhookQueueStore, WebhookStatus};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;

// Dashboard "send test webhook" deliveries carry this event id suffix.
pub const TEST_EVENT_SUFFIX: &str = "_00000000000000";

const MESSAGE_LIMIT: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    ProcessNow,
    QueueOnly,
    // acknowledge without recording anything
    Suppress,
}

// pending_triggers are the event types of unprocessed deliveries sharing this
// delivery's correlation identifier. A sibling of the same type makes this a
// near-duplicate; a sibling that is not delay-flagged means the transaction
// has work in flight and this delivery must wait its turn.
pub fn decide(
    config: &GateConfig,
    event_type: Option<EventType>,
    pending_triggers: &[String],
    total_unprocessed: i64,
) -> Admission {
    let Some(event_type) = event_type else {
        return Admission::Suppress;
    };
    if !config.is_enabled(event_type) {
        return Admission::Suppress;
    }
    if pending_triggers
        .iter()
        .any(|trigger| trigger == event_type.as_str())
    {
        return Admission::Suppress;
    }

    let mut process_now = !config.is_delayed(event_type);
    if pending_triggers
        .iter()
        .any(|trigger| !config.is_delayed_trigger(trigger))
    {
        process_now = false;
    }
    if total_unprocessed >= config.processing_limit {
        process_now = false;
    }
    if process_now {
        Admission::ProcessNow
    } else {
        Admission::QueueOnly
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MESSAGE_LIMIT).collect();
    truncated.push_str(" ...");
    truncated
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub ok: bool,
    pub message: String,
}

pub struct IngestionGate {
    pub config: GateConfig,
    pub processor_id: String,
    pub queue: Arc<dyn WebhookQueueStore>,
    pub store: Arc<dyn ObligationStore>,
    pub gateway: Arc<dyn GatewayClient>,
    pub handlers: Arc<ReconciliationHandlers>,
}

impl IngestionGate {
    pub async fn ingest(&self, payload: &str) -> Result<IngestOutcome> {
        let envelope: serde_json::Value =
            serde_json::from_str(payload).context("malformed webhook payload")?;
        let event_id = envelope
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| anyhow!("webhook payload has no event id"))?
            .to_string();
        let trigger = envelope
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow!("webhook payload has no event type"))?
            .to_string();

        tracing::info!(event_id = %event_id, trigger = %trigger, "webhook received");

        if event_id.ends_with(TEST_EVENT_SUFFIX) {
            return Ok(IngestOutcome {
                ok: true,
                message: "test webhook acknowledged".to_string(),
            });
        }

        let event_type = EventType::parse(&trigger);
        if event_type.map_or(true, |t| !self.config.is_enabled(t)) {
            // Acknowledged so the gateway does not redeliver; nothing is
            // recorded for types this service does not reconcile.
            return Ok(IngestOutcome {
                ok: true,
                message: format!("event type {trigger} not enabled, ignored"),
            });
        }

        let event: GatewayEvent =
            serde_json::from_value(envelope.clone()).context("undecodable event object")?;

        if let Some(customer_id) = accessor::get_string("customer_id", event.object()) {
            if !self
                .store
                .customer_belongs_to_processor(&customer_id, &self.processor_id)
                .await?
            {
                if self.config.debug_events {
                    tracing::debug!(customer_id = %customer_id, "customer not linked to this processor");
                }
                return Ok(IngestOutcome {
                    ok: true,
                    message: format!("customer {customer_id} not linked to this processor, ignored"),
                });
            }
        }

        let identifier = self.correlation_identifier(&event).await?;
        let pending_triggers: Vec<String> = self
            .queue
            .find_unprocessed(&self.processor_id, &identifier)
            .await?
            .into_iter()
            .map(|record| record.trigger)
            .collect();
        let total_unprocessed = self.queue.count_unprocessed(&self.processor_id).await?;
        let admission = decide(&self.config, event_type, &pending_triggers, total_unprocessed);

        if admission == Admission::Suppress {
            // A delivery of the same type for the same transaction is already
            // waiting; recording this one would only make it race itself.
            return Ok(IngestOutcome {
                ok: true,
                message: format!(
                    "a {trigger} delivery for the same transaction is awaiting processing, ignored"
                ),
            });
        }

        let Some(record_id) = self
            .queue
            .insert(NewQueueRecord {
                processor_id: self.processor_id.clone(),
                event_id: event_id.clone(),
                trigger: trigger.clone(),
                identifier,
                data: envelope,
            })
            .await?
        else {
            return Ok(IngestOutcome {
                ok: true,
                message: format!("event {event_id} already received, ignored"),
            });
        };

        match admission {
            Admission::ProcessNow => {
                let record = self
                    .queue
                    .get(record_id)
                    .await?
                    .ok_or_else(|| anyhow!("queue record {record_id} missing after insert"))?;
                self.process_record(&record).await
            }
            Admission::QueueOnly | Admission::Suppress => Ok(IngestOutcome {
                ok: true,
                message: format!("event {event_id} queued for deferred processing"),
            }),
        }
    }

    // Shared between inline processing and the sweeper.
    pub async fn process_record(&self, record: &QueuedWebhookRecord) -> Result<IngestOutcome> {
        let event: GatewayEvent = serde_json::from_value(record.data.clone())
            .with_context(|| format!("undecodable queued event {}", record.event_id))?;

        let result = match self.handlers.handle(&event).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(event_id = %record.event_id, error = %err, "handler failed");
                HandlerResult::err(err.to_string())
            }
        };

        let status = if result.ok {
            WebhookStatus::Success
        } else {
            WebhookStatus::Error
        };
        self.queue
            .mark_processed(record.id, status, &truncate_message(&result.message), Utc::now())
            .await?;

        if result.ok {
            tracing::info!(event_id = %record.event_id, message = %result.message, "webhook processed");
        } else {
            tracing::warn!(event_id = %record.event_id, message = %result.message, "webhook processing failed");
        }
        Ok(IngestOutcome {
            ok: result.ok,
            message: result.message,
        })
    }

    // Charge events usually collapse their invoice to a bare id, so the
    // subscription is fetched to make later invoice events group with them.
    async fn correlation_identifier(&self, event: &GatewayEvent) -> Result<String> {
        let object = event.object();
        let mut key = CorrelationKey {
            payment_intent_id: accessor::get_string("payment_intent_id", object),
            charge_id: accessor::get_string("charge_id", object),
            invoice_id: accessor::get_string("invoice_id", object),
            subscription_id: accessor::get_string("subscription_id", object),
        };
        if key.subscription_id.is_none() {
            if let (EventObject::Charge(_), Some(invoice_id)) = (object, key.invoice_id.as_deref())
            {
                let invoice = self
                    .gateway
                    .retrieve_invoice(invoice_id)
                    .await
                    .with_context(|| format!("retrieving invoice {invoice_id}"))?;
                key.subscription_id = invoice.subscription;
            }
        }
        Ok(key.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn delayed_types_are_always_deferred() {
        let config = GateConfig::default();
        assert_eq!(
            decide(&config, Some(EventType::InvoiceFinalized), &[], 0),
            Admission::QueueOnly
        );
    }

    #[test]
    fn pending_sibling_defers_processing() {
        let config = GateConfig::default();
        assert_eq!(
            decide(&config, Some(EventType::ChargeSucceeded), &[], 0),
            Admission::ProcessNow
        );
        assert_eq!(
            decide(
                &config,
                Some(EventType::InvoicePaymentSucceeded),
                &triggers(&["invoice.paid"]),
                1
            ),
            Admission::QueueOnly
        );
    }

    #[test]
    fn pending_delayed_sibling_does_not_defer() {
        let config = GateConfig::default();
        assert_eq!(
            decide(
                &config,
                Some(EventType::InvoicePaymentSucceeded),
                &triggers(&["invoice.finalized"]),
                1
            ),
            Admission::ProcessNow
        );
    }

    #[test]
    fn same_trigger_sibling_is_suppressed() {
        let config = GateConfig::default();
        assert_eq!(
            decide(
                &config,
                Some(EventType::ChargeSucceeded),
                &triggers(&["charge.succeeded"]),
                1
            ),
            Admission::Suppress
        );
    }

    #[test]
    fn backlog_ceiling_defers_processing() {
        let config = GateConfig::default();
        assert_eq!(
            decide(
                &config,
                Some(EventType::ChargeSucceeded),
                &[],
                config.processing_limit
            ),
            Admission::QueueOnly
        );
    }

    #[test]
    fn disabled_and_unknown_types_are_suppressed() {
        let mut config = GateConfig::default();
        config.enabled_events.retain(|t| *t != EventType::ChargeFailed);
        assert_eq!(
            decide(&config, Some(EventType::ChargeFailed), &[], 0),
            Admission::Suppress
        );
        assert_eq!(decide(&config, None, &[], 0), Admission::Suppress);
    }

    #[test]
    fn long_messages_are_truncated() {
        let long = "x".repeat(300);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), MESSAGE_LIMIT + 4);
        assert!(truncated.ends_with(" ..."));
        assert_eq!(truncate_message("short"), "short");
    }
}
