pub mod worker;

use std::time::Duration;

use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::Kv;

pub const CHECK_SOURCE: &str = "check-source";
pub const CANONICALIZE: &str = "canonicalize";
pub const CHAPTER_INGEST: &str = "chapter-ingest";
pub const NOTIFICATION_FANOUT: &str = "notification-fanout";
pub const NOTIFICATION_DELIVERY: &str = "notification-delivery";
pub const NOTIFICATION_DELIVERY_PREMIUM: &str = "notification-delivery-premium";
pub const SYNC_SOURCE: &str = "sync-source";
pub const COVER_REFRESH: &str = "cover-refresh";

/// Every queue the worker pool drains, in polling order. Premium delivery
/// comes before free delivery on purpose.
pub const ALL_QUEUES: &[&str] = &[
    NOTIFICATION_DELIVERY_PREMIUM,
    CHECK_SOURCE,
    CANONICALIZE,
    CHAPTER_INGEST,
    NOTIFICATION_FANOUT,
    NOTIFICATION_DELIVERY,
    SYNC_SOURCE,
    COVER_REFRESH,
];

/// Lower runs sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPriority {
    Critical,
    Hot,
    Warm,
    Cold,
    Standard,
    Low,
}

impl JobPriority {
    pub const fn as_i32(self) -> i32 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::Hot => 1,
            JobPriority::Warm => 2,
            JobPriority::Cold => 3,
            JobPriority::Standard => 5,
            JobPriority::Low => 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Number of times this job has been handed to a processor.
    pub attempt: u32,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub job_id: String,
    pub priority: i32,
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn new(job_id: impl Into<String>, priority: JobPriority) -> JobOptions {
        JobOptions {
            job_id: job_id.into(),
            priority: priority.as_i32(),
            delay: None,
        }
    }

    pub fn with_priority_value(job_id: impl Into<String>, priority: i32) -> JobOptions {
        JobOptions {
            job_id: job_id.into(),
            priority,
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> JobOptions {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    /// Milliseconds the oldest waiting job has been parked, if any.
    pub oldest_waiting_age_ms: Option<i64>,
}

/// A queue is unhealthy once its backlog crosses this line; the search
/// dispatcher defers instead of piling on.
pub const HEALTHY_MAX_WAITING: u64 = 10_000;
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Priority-major, FIFO-minor ordering packed into one zset score. The
/// multiplier leaves room for millisecond timestamps until year ~2286.
const PRIORITY_STRIDE: f64 = 1e14;

fn waiting_score(priority: i32, enqueued_ms: i64) -> f64 {
    priority as f64 * PRIORITY_STRIDE + enqueued_ms as f64
}

fn enqueued_ms_from_score(score: f64) -> i64 {
    (score % PRIORITY_STRIDE) as i64
}

// Registers the job id and parks the job in exactly one of waiting or
// delayed. A job id already registered (waiting or active) is a no-op, so
// enqueue is naturally deduplicated.
const ADD_SCRIPT: &str = r#"
if redis.call("hexists", KEYS[1], ARGV[1]) == 1 then
    return 0
end
redis.call("hset", KEYS[1], ARGV[1], ARGV[2])
if ARGV[5] == "0" then
    redis.call("zadd", KEYS[2], ARGV[3], ARGV[1])
else
    redis.call("zadd", KEYS[3], ARGV[4], ARGV[1])
end
return 1
"#;

#[derive(Clone)]
pub struct Queues {
    kv: Kv,
}

impl Queues {
    pub fn new(kv: Kv) -> Queues {
        Queues { kv }
    }

    fn jobs_key(&self, queue: &str) -> String {
        self.kv.key(&format!("queue:{}:jobs", queue))
    }

    fn waiting_key(&self, queue: &str) -> String {
        self.kv.key(&format!("queue:{}:waiting", queue))
    }

    fn delayed_key(&self, queue: &str) -> String {
        self.kv.key(&format!("queue:{}:delayed", queue))
    }

    fn dead_key(&self, queue: &str) -> String {
        self.kv.key(&format!("queue:{}:dead", queue))
    }

    /// Enqueue one job. Returns false when a job with the same id is
    /// already waiting or active.
    pub async fn add(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let job = Job {
            job_id: opts.job_id.clone(),
            queue: queue.to_string(),
            payload,
            priority: opts.priority,
            attempt: 0,
            enqueued_at: now,
        };
        let delay_ms = opts.delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        let mut conn = self.kv.conn();
        let added: i32 = Script::new(ADD_SCRIPT)
            .key(self.jobs_key(queue))
            .key(self.waiting_key(queue))
            .key(self.delayed_key(queue))
            .arg(&job.job_id)
            .arg(serde_json::to_string(&job).expect("job serializes"))
            .arg(waiting_score(opts.priority, now))
            .arg((now + delay_ms) as f64)
            .arg(if delay_ms > 0 { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    /// Enqueue many jobs; duplicates are skipped individually. Returns how
    /// many were actually added.
    pub async fn add_bulk(
        &self,
        queue: &str,
        jobs: Vec<(serde_json::Value, JobOptions)>,
    ) -> Result<usize> {
        let mut added = 0;
        for (payload, opts) in jobs {
            if self.add(queue, payload, opts).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Move due delayed jobs to waiting, then pop the best waiting job.
    /// The popped job stays registered in the jobs hash (active) until
    /// `complete`, `retry_later` or `bury`.
    pub async fn pop(&self, queue: &str) -> Result<Option<Job>> {
        self.promote_due(queue).await?;
        let mut conn = self.kv.conn();
        loop {
            let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
                .arg(self.waiting_key(queue))
                .arg(1)
                .query_async(&mut conn)
                .await?;
            let (job_id, _score) = match popped.into_iter().next() {
                Some(entry) => entry,
                None => return Ok(None),
            };
            let raw: Option<String> = conn.hget(self.jobs_key(queue), &job_id).await?;
            match raw.and_then(|r| serde_json::from_str::<Job>(&r).ok()) {
                Some(job) => return Ok(Some(job)),
                // Registration vanished (completed elsewhere or corrupt);
                // skip and keep draining.
                None => continue,
            }
        }
    }

    async fn promote_due(&self, queue: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.kv.conn();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key(queue))
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(&mut conn)
            .await?;
        for job_id in due {
            let raw: Option<String> = conn.hget(self.jobs_key(queue), &job_id).await?;
            let priority = raw
                .as_deref()
                .and_then(|r| serde_json::from_str::<Job>(r).ok())
                .map(|j| j.priority)
                .unwrap_or(JobPriority::Standard.as_i32());
            let _: () = conn
                .zadd(self.waiting_key(queue), &job_id, waiting_score(priority, now))
                .await?;
            let _: () = conn.zrem(self.delayed_key(queue), &job_id).await?;
        }
        Ok(())
    }

    /// Successful completion frees the job id for future enqueues.
    pub async fn complete(&self, job: &Job) -> Result<()> {
        let mut conn = self.kv.conn();
        let _: () = conn.hdel(self.jobs_key(&job.queue), &job.job_id).await?;
        Ok(())
    }

    /// Park the job for another attempt after `delay`.
    pub async fn retry_later(&self, job: &Job, delay: Duration) -> Result<()> {
        let mut retried = job.clone();
        retried.attempt += 1;
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.kv.conn();
        let _: () = conn
            .hset(
                self.jobs_key(&job.queue),
                &job.job_id,
                serde_json::to_string(&retried).expect("job serializes"),
            )
            .await?;
        let _: () = conn
            .zadd(self.delayed_key(&job.queue), &job.job_id, ready_at as f64)
            .await?;
        Ok(())
    }

    /// Move an exhausted job to the dead-letter set, kept 24 h for
    /// inspection.
    pub async fn bury(&self, job: &Job, reason: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let record = serde_json::json!({
            "job": job,
            "reason": reason,
            "buried_at": now,
        });
        let mut conn = self.kv.conn();
        let _: () = conn.hdel(self.jobs_key(&job.queue), &job.job_id).await?;
        let _: () = conn
            .zadd(self.dead_key(&job.queue), record.to_string(), now as f64)
            .await?;
        let cutoff = now - 24 * 60 * 60 * 1000;
        let _: () = redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.dead_key(&job.queue))
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let mut conn = self.kv.conn();
        let waiting: u64 = conn.zcard(self.waiting_key(queue)).await?;
        let delayed: u64 = conn.zcard(self.delayed_key(queue)).await?;
        let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(self.waiting_key(queue))
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        let oldest_waiting_age_ms = head.first().map(|(_, score)| {
            (Utc::now().timestamp_millis() - enqueued_ms_from_score(*score)).max(0)
        });
        Ok(QueueCounts {
            waiting,
            delayed,
            oldest_waiting_age_ms,
        })
    }

    /// Healthy means: backlog under the line AND the store answers a ping
    /// within five seconds.
    pub async fn is_healthy(&self, queue: &str) -> Result<bool> {
        let mut conn = self.kv.conn();
        let ping = tokio::time::timeout(HEALTH_PING_TIMEOUT, async {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await;
        match ping {
            Ok(Ok(_)) => {}
            _ => return Ok(false),
        }
        let counts = self.counts(queue).await?;
        Ok(counts.waiting < HEALTHY_MAX_WAITING)
    }

    /// Total waiting across every named queue, for the safety monitor.
    pub async fn total_waiting(&self) -> Result<u64> {
        let mut total = 0;
        for queue in ALL_QUEUES {
            total += self.counts(queue).await?.waiting;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_values_match_the_tiering() {
        assert_eq!(JobPriority::Critical.as_i32(), 0);
        assert_eq!(JobPriority::Hot.as_i32(), 1);
        assert_eq!(JobPriority::Warm.as_i32(), 2);
        assert_eq!(JobPriority::Cold.as_i32(), 3);
        assert_eq!(JobPriority::Standard.as_i32(), 5);
        assert_eq!(JobPriority::Low.as_i32(), 10);
    }

    #[test]
    fn score_orders_by_priority_then_fifo() {
        let now = 1_750_000_000_000;
        let critical_late = waiting_score(0, now + 60_000);
        let hot_early = waiting_score(1, now);
        assert!(critical_late < hot_early);

        let hot_late = waiting_score(1, now + 1);
        assert!(hot_early < hot_late);
    }

    #[test]
    fn score_round_trips_enqueue_time() {
        let now = 1_750_000_000_123;
        for priority in [0, 1, 3, 5, 10] {
            assert_eq!(enqueued_ms_from_score(waiting_score(priority, now)), now);
        }
    }
}
