use crate::db::{insert_batch, Batch};
use crate::forward::Record;
use crate::metrics::{BATCH_SIZE, INGEST_LATENCY_SECONDS};
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info};

/// Drain forwarded records into Postgres.
///
/// Flushes when `max_batch` records are buffered, every `max_wait_ms`, and
/// once more when every [`Forwarder`](crate::forward::Forwarder) is dropped.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<Record>,
    pool: PgPool,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<Record> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(r) => {
                        buffer.push(r);

                        if buffer.len() >= max_batch {
                            flush_batch(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(&pool, &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&pool, &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

/// Write and clear the buffer. A failed batch is logged and dropped; the
/// in-memory device state it came from is unaffected.
async fn flush_batch(pool: &PgPool, buffer: &mut Vec<Record>) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} records", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let batch = Batch::from_records(buffer);

    match insert_batch(pool, &batch).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            INGEST_LATENCY_SECONDS.observe(elapsed);
            debug!("Batch inserted successfully in {:.3}s", elapsed);
        }
        Err(e) => {
            error!("Failed to insert batch: {}", e);
            error!("{} records dropped due to database failure", batch_len);
        }
    }

    buffer.clear();
    BATCH_SIZE.set(0.0);
}
