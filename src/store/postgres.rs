use crate::domain::obligation::{
    CompletePaymentParams, FailPaymentParams, LedgerEntry, NewPayment, ObligationStatus, Payment,
    RecurringObligation, RefundParams,
};
use crate::store::{
    NewQueueRecord, ObligationStore, QueuedWebhookRecord, WebhookQueueStore, WebhookStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgWebhookQueueStore {
    pub pool: PgPool,
}

fn queue_record_from_row(row: &sqlx::postgres::PgRow) -> QueuedWebhookRecord {
    let status: String = row.get("status");
    QueuedWebhookRecord {
        id: row.get("id"),
        processor_id: row.get("processor_id"),
        event_id: row.get("event_id"),
        trigger: row.get("trigger"),
        identifier: row.get("identifier"),
        data: row.get("data"),
        status: WebhookStatus::parse(&status).unwrap_or(WebhookStatus::Error),
        message: row.get("message"),
        received_at: row.get("received_at"),
        processed_at: row.get("processed_at"),
    }
}

const QUEUE_COLUMNS: &str =
    "id, processor_id, event_id, trigger, identifier, data, status, message, received_at, processed_at";

#[async_trait::async_trait]
impl WebhookQueueStore for PgWebhookQueueStore {
    async fn find_unprocessed(
        &self,
        processor_id: &str,
        identifier: &str,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM webhook_queue
            WHERE processor_id = $1 AND identifier = $2 AND processed_at IS NULL
            ORDER BY received_at ASC
            "#,
        ))
        .bind(processor_id)
        .bind(identifier)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(queue_record_from_row).collect())
    }

    async fn insert(&self, record: NewQueueRecord) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_queue (processor_id, event_id, trigger, identifier, data, status)
            VALUES ($1, $2, $3, $4, $5, 'new')
            ON CONFLICT (processor_id, event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.processor_id)
        .bind(&record.event_id)
        .bind(&record.trigger)
        .bind(&record.identifier)
        .bind(&record.data)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("id")))
    }

    async fn count_unprocessed(&self, processor_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unprocessed FROM webhook_queue WHERE processor_id = $1 AND processed_at IS NULL",
        )
        .bind(processor_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("unprocessed"))
    }

    async fn get(&self, id: i64) -> Result<Option<QueuedWebhookRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM webhook_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(queue_record_from_row))
    }

    async fn mark_processed(
        &self,
        id: i64,
        status: WebhookStatus,
        message: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_queue SET status = $2, message = $3, processed_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_latest_success(
        &self,
        processor_id: &str,
        trigger: &str,
        identifier_part: &str,
    ) -> Result<Option<QueuedWebhookRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM webhook_queue
            WHERE processor_id = $1 AND trigger = $2 AND status = 'success'
              AND identifier LIKE '%' || $3 || '%'
            ORDER BY received_at DESC
            LIMIT 1
            "#,
        ))
        .bind(processor_id)
        .bind(trigger)
        .bind(identifier_part)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(queue_record_from_row))
    }

    async fn reset_for_reprocess(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_queue SET status = 'new', processed_at = NULL, message = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_unprocessed(
        &self,
        processor_id: &str,
        limit: i64,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM webhook_queue
            WHERE processor_id = $1 AND processed_at IS NULL
            ORDER BY received_at ASC
            LIMIT $2
            "#,
        ))
        .bind(processor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(queue_record_from_row).collect())
    }

    async fn list(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> Result<Vec<QueuedWebhookRecord>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {QUEUE_COLUMNS} FROM webhook_queue
                    WHERE status = $1 ORDER BY received_at DESC LIMIT $2
                    "#,
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {QUEUE_COLUMNS} FROM webhook_queue ORDER BY received_at DESC LIMIT $1",
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(queue_record_from_row).collect())
    }
}

#[derive(Clone)]
pub struct PgObligationStore {
    pub pool: PgPool,
}

const PAYMENT_COLUMNS: &str = "id, recurring_id, status, amount, currency, fee_amount, trxn_ids, order_reference, receive_date, cancel_date, cancel_reason";

fn payment_from_row(row: &sqlx::postgres::PgRow) -> Payment {
    let status: String = row.get("status");
    Payment {
        id: row.get("id"),
        recurring_id: row.get("recurring_id"),
        status: ObligationStatus::parse(&status).unwrap_or(ObligationStatus::Pending),
        amount: row.get("amount"),
        currency: row.get("currency"),
        fee_amount: row.get("fee_amount"),
        trxn_ids: row.get("trxn_ids"),
        order_reference: row.get("order_reference"),
        receive_date: row.get("receive_date"),
        cancel_date: row.get("cancel_date"),
        cancel_reason: row.get("cancel_reason"),
    }
}

fn recurring_from_row(row: &sqlx::postgres::PgRow) -> RecurringObligation {
    let status: String = row.get("status");
    RecurringObligation {
        id: row.get("id"),
        subscription_id: row.get("subscription_id"),
        status: ObligationStatus::parse(&status).unwrap_or(ObligationStatus::InProgress),
        amount: row.get("amount"),
        currency: row.get("currency"),
        frequency_unit: row.get("frequency_unit"),
        frequency_interval: row.get("frequency_interval"),
        end_date: row.get("end_date"),
        cancel_date: row.get("cancel_date"),
    }
}

fn ledger_from_row(row: &sqlx::postgres::PgRow) -> LedgerEntry {
    let status: String = row.get("status");
    LedgerEntry {
        id: row.get("id"),
        payment_id: row.get("payment_id"),
        trxn_id: row.get("trxn_id"),
        amount: row.get("amount"),
        fee_amount: row.get("fee_amount"),
        trxn_date: row.get("trxn_date"),
        result_code: row.get("result_code"),
        status: ObligationStatus::parse(&status).unwrap_or(ObligationStatus::Completed),
    }
}

#[async_trait::async_trait]
impl ObligationStore for PgObligationStore {
    async fn find_payment_by_trxn_id(&self, reference: &str) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE $1 = ANY(string_to_array(trxn_ids, ','))
            LIMIT 1
            "#,
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(payment_from_row))
    }

    async fn find_payment_by_order_reference(&self, reference: &str) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_reference = $1 LIMIT 1",
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(payment_from_row))
    }

    async fn get_payment(&self, id: i64) -> Result<Option<Payment>> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(payment_from_row))
    }

    async fn create_payment(&self, payment: NewPayment) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO payments (recurring_id, status, amount, currency, trxn_ids, order_reference, receive_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(payment.recurring_id)
        .bind(payment.status.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.trxn_ids)
        .bind(&payment.order_reference)
        .bind(payment.receive_date)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn append_trxn_id(&self, payment_id: i64, reference: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payments SET trxn_ids = CASE
                WHEN trxn_ids = '' THEN $2
                WHEN $2 = ANY(string_to_array(trxn_ids, ',')) THEN trxn_ids
                ELSE trxn_ids || ',' || $2
            END
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_order_reference(&self, payment_id: i64, reference: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET order_reference = $2 WHERE id = $1")
            .bind(payment_id)
            .bind(reference)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_payment(&self, payment_id: i64, params: CompletePaymentParams) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE payments SET
                status = 'COMPLETED',
                fee_amount = $2,
                receive_date = COALESCE($3, receive_date),
                order_reference = COALESCE($4, order_reference),
                trxn_ids = CASE
                    WHEN trxn_ids = '' THEN $5
                    WHEN $5 = ANY(string_to_array(trxn_ids, ',')) THEN trxn_ids
                    ELSE trxn_ids || ',' || $5
                END
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(params.fee_amount)
        .bind(params.trxn_date)
        .bind(&params.order_reference)
        .bind(&params.trxn_id)
        .execute(tx.as_mut())
        .await?;

        sqlx::query(
            r#"
            INSERT INTO payment_ledger (payment_id, trxn_id, amount, fee_amount, trxn_date, status)
            VALUES ($1, $2, $3, $4, $5, 'COMPLETED')
            "#,
        )
        .bind(payment_id)
        .bind(&params.trxn_id)
        .bind(params.amount)
        .bind(params.fee_amount)
        .bind(params.trxn_date)
        .execute(tx.as_mut())
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_payment(&self, payment_id: i64, params: FailPaymentParams) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE payments SET
                status = 'FAILED',
                cancel_date = $2,
                cancel_reason = $3,
                order_reference = COALESCE($4, order_reference)
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(params.cancel_date)
        .bind(&params.cancel_reason)
        .bind(&params.order_reference)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_refund(&self, params: RefundParams) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payment_ledger (payment_id, trxn_id, amount, fee_amount, trxn_date, result_code, status)
            VALUES ($1, $2, $3, 0, $4, $5, 'COMPLETED')
            "#,
        )
        .bind(params.payment_id)
        .bind(&params.trxn_id)
        .bind(params.amount)
        .bind(params.trxn_date)
        .bind(&params.result_code)
        .execute(tx.as_mut())
        .await?;

        if let Some(cancelled_id) = params.cancelled_ledger_id {
            sqlx::query("UPDATE payment_ledger SET status = 'REFUNDED' WHERE id = $1")
                .bind(cancelled_id)
                .execute(tx.as_mut())
                .await?;
        }

        sqlx::query("UPDATE payments SET status = 'REFUNDED' WHERE id = $1")
            .bind(params.payment_id)
            .execute(tx.as_mut())
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_completed_ledger_entry(&self, trxn_id: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, payment_id, trxn_id, amount, fee_amount, trxn_date, result_code, status
            FROM payment_ledger
            WHERE trxn_id = $1 AND status = 'COMPLETED'
            LIMIT 1
            "#,
        )
        .bind(trxn_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(ledger_from_row))
    }

    async fn ledger_entries_for_payment(&self, payment_id: i64) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, payment_id, trxn_id, amount, fee_amount, trxn_date, result_code, status
            FROM payment_ledger
            WHERE payment_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ledger_from_row).collect())
    }

    async fn find_recurring_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<RecurringObligation>> {
        let row = sqlx::query(
            r#"
            SELECT id, subscription_id, status, amount, currency, frequency_unit, frequency_interval, end_date, cancel_date
            FROM recurring_obligations
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(recurring_from_row))
    }

    async fn get_recurring(&self, id: i64) -> Result<Option<RecurringObligation>> {
        let row = sqlx::query(
            r#"
            SELECT id, subscription_id, status, amount, currency, frequency_unit, frequency_interval, end_date, cancel_date
            FROM recurring_obligations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(recurring_from_row))
    }

    async fn set_recurring_subscription_id(&self, id: i64, subscription_id: &str) -> Result<()> {
        sqlx::query("UPDATE recurring_obligations SET subscription_id = $2 WHERE id = $1")
            .bind(id)
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel_recurring(&self, id: i64, cancel_date: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query(
            "UPDATE recurring_obligations SET status = 'CANCELLED', cancel_date = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(cancel_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_recurring(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE recurring_obligations SET status = 'COMPLETED' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_recurring_status(&self, id: i64, status: ObligationStatus) -> Result<()> {
        sqlx::query("UPDATE recurring_obligations SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_recurring_amount(&self, id: i64, amount: f64, currency: &str) -> Result<()> {
        sqlx::query("UPDATE recurring_obligations SET amount = $2, currency = $3 WHERE id = $1")
            .bind(id)
            .bind(amount)
            .bind(currency)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn customer_belongs_to_processor(
        &self,
        customer_id: &str,
        processor_id: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM gateway_customers WHERE customer_id = $1 AND processor_id = $2",
        )
        .bind(customer_id)
        .bind(processor_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("n");
        Ok(count > 0)
    }
}
