use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{error, info, warn};

use crate::context::AppCtx;
use crate::workers;

use super::{Job, ALL_QUEUES};

/// A transient failure gets this many tries before the dead-letter set.
pub const MAX_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(300);
const IDLE_POLL_SLEEP: Duration = Duration::from_millis(500);

/// Exponential backoff with jitter. `attempt` is the number of tries
/// already made, so the first retry waits ~10s.
pub fn backoff_delay(attempt: u32, jitter_ms: u64) -> Duration {
    let exp = BACKOFF_BASE
        .checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(BACKOFF_CAP)
        .min(BACKOFF_CAP);
    exp + Duration::from_millis(jitter_ms)
}

/// Run `worker_instances` pollers over every named queue. Never returns.
pub async fn run_worker_pool(ctx: AppCtx) {
    let instances = ctx.config.worker_instances.max(1);
    info!(instances, "Starting worker pool.");
    let loops = (0..instances).map(|index| worker_loop(ctx.clone(), index));
    join_all(loops).await;
}

async fn worker_loop(ctx: AppCtx, index: usize) {
    loop {
        let mut worked = false;
        for queue in ALL_QUEUES {
            let job = match ctx.queues.pop(queue).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    warn!(worker = index, queue, ?err, "Failed to poll queue.");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            worked = true;
            handle_job(&ctx, job).await;
        }
        if !worked {
            let jitter = rand::thread_rng().gen_range(0..250);
            tokio::time::sleep(IDLE_POLL_SLEEP + Duration::from_millis(jitter)).await;
        }
    }
}

async fn handle_job(ctx: &AppCtx, job: Job) {
    let outcome = workers::process(ctx, &job).await;
    match outcome {
        Ok(()) => {
            if let Err(err) = ctx.queues.complete(&job).await {
                warn!(job_id = %job.job_id, ?err, "Failed to clear completed job.");
            }
        }
        Err(err) if err.is_retryable() => {
            let tries = job.attempt + 1;
            if tries >= MAX_ATTEMPTS {
                error!(
                    job_id = %job.job_id,
                    queue = %job.queue,
                    tries,
                    %err,
                    "Job exhausted its retries; moving to the dead-letter set."
                );
                if let Err(bury_err) = ctx.queues.bury(&job, &err.to_string()).await {
                    warn!(job_id = %job.job_id, ?bury_err, "Failed to bury job.");
                }
            } else {
                let jitter = rand::thread_rng().gen_range(0..1000);
                let delay = backoff_delay(tries, jitter);
                info!(
                    job_id = %job.job_id,
                    queue = %job.queue,
                    tries,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "Transient failure; scheduling retry."
                );
                if let Err(retry_err) = ctx.queues.retry_later(&job, delay).await {
                    warn!(job_id = %job.job_id, ?retry_err, "Failed to schedule retry.");
                }
            }
        }
        Err(err) => {
            // Non-transient failures are logged and dropped; replaying
            // them would fail the same way.
            error!(
                job_id = %job.job_id,
                queue = %job.queue,
                kind = ?err.kind(),
                %err,
                "Dropping job after non-retryable failure."
            );
            if let Err(drop_err) = ctx.queues.complete(&job).await {
                warn!(job_id = %job.job_id, ?drop_err, "Failed to clear dropped job.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1, 0), Duration::from_secs(10));
        assert_eq!(backoff_delay(2, 0), Duration::from_secs(20));
        assert_eq!(backoff_delay(4, 0), Duration::from_secs(80));
        assert_eq!(backoff_delay(10, 0), Duration::from_secs(300));
        assert_eq!(backoff_delay(31, 0), Duration::from_secs(300));
    }

    #[test]
    fn jitter_is_additive() {
        assert_eq!(
            backoff_delay(1, 999),
            Duration::from_secs(10) + Duration::from_millis(999)
        );
    }
}
