use crate::service::gate::IngestionGate;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct QueueSweeper {
    pub gate: Arc<IngestionGate>,
    pub interval_ms: u64,
    pub batch_size: i64,
}

impl QueueSweeper {
    pub fn new(gate: Arc<IngestionGate>, interval_ms: u64) -> Self {
        Self {
            gate,
            interval_ms,
            batch_size: 100,
        }
    }

    pub async fn run(self) {
        loop {
            if let Err(err) = self.tick().await {
                tracing::error!("queue sweeper error: {}", err);
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.interval_ms)).await;
        }
    }

    // Only the first record per correlation identifier runs each tick, so
    // deliveries for one transaction never interleave.
    pub async fn tick(&self) -> Result<usize> {
        let batch = self
            .gate
            .queue
            .next_unprocessed(&self.gate.processor_id, self.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut seen_identifiers: HashSet<String> = HashSet::new();
        let mut processed = 0usize;
        for record in batch {
            if !record.identifier.is_empty() && !seen_identifiers.insert(record.identifier.clone())
            {
                continue;
            }
            match self.gate.process_record(&record).await {
                Ok(outcome) if !outcome.ok => {
                    tracing::warn!(
                        event_id = %record.event_id,
                        message = %outcome.message,
                        "queued webhook failed"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(event_id = %record.event_id, error = %err, "queued webhook errored");
                }
            }
            processed += 1;
        }
        Ok(processed)
    }
}
