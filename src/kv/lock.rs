use std::future::Future;
use std::time::Duration;

use redis::Script;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::Kv;

// Delete only when the stored token is still ours, so a lock that expired
// and was reacquired by someone else is never released from here.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Run `body` under the named distributed lock. Fails fast with `Conflict`
/// when another holder owns the lock; never waits for it.
pub async fn with_lock<T, F, Fut>(kv: &Kv, name: &str, ttl: Duration, body: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let key = kv.key(&format!("lock:{}", name));
    let token = Uuid::new_v4().to_string();
    let mut conn = kv.conn();

    let acquired: Option<String> = redis::cmd("SET")
        .arg(&key)
        .arg(&token)
        .arg("NX")
        .arg("PX")
        .arg(ttl.as_millis() as u64)
        .query_async(&mut conn)
        .await?;
    if acquired.is_none() {
        return Err(Error::Conflict(format!("lock {:?} is held", name)));
    }

    let outcome = body().await;

    let released: Result<i32, redis::RedisError> = Script::new(RELEASE_SCRIPT)
        .key(&key)
        .arg(&token)
        .invoke_async(&mut conn)
        .await;
    match released {
        Ok(0) => warn!(lock = %name, "Lock expired before release; a second holder may have run."),
        Ok(_) => {}
        Err(err) => warn!(lock = %name, ?err, "Failed to release lock; it will expire on its own."),
    }

    outcome
}
