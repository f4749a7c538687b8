use redis::AsyncCommands;

use crate::error::Result;
use crate::kv::Kv;

/// Sliding window over which repeat interest counts.
pub const HEAT_WINDOW_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeatSample {
    pub count: i64,
    pub unique_users: i64,
}

/// A query is worth an external dispatch once it repeats or a second
/// person wants it.
pub fn is_hot(sample: HeatSample) -> bool {
    sample.count >= 2 || sample.unique_users >= 2
}

/// Record one observation of the query and return the updated sample.
pub async fn bump(kv: &Kv, query_hash: &str, user_id: Option<&str>) -> Result<HeatSample> {
    let count_key = kv.key(&format!("search:heat:{}:count", query_hash));
    let users_key = kv.key(&format!("search:heat:{}:users", query_hash));
    let mut conn = kv.conn();

    let count: i64 = conn.incr(&count_key, 1).await?;
    let _: () = conn.expire(&count_key, HEAT_WINDOW_SECS).await?;

    let unique_users = match user_id {
        Some(user) => {
            let _: () = conn.sadd(&users_key, user).await?;
            let _: () = conn.expire(&users_key, HEAT_WINDOW_SECS).await?;
            conn.scard(&users_key).await?
        }
        None => conn.scard(&users_key).await.unwrap_or(0),
    };

    Ok(HeatSample {
        count,
        unique_users,
    })
}

/// Read the current sample without adding an observation (the deferred
/// retry path validates heat without inflating it).
pub async fn sample(kv: &Kv, query_hash: &str) -> Result<HeatSample> {
    let count_key = kv.key(&format!("search:heat:{}:count", query_hash));
    let users_key = kv.key(&format!("search:heat:{}:users", query_hash));
    let mut conn = kv.conn();
    let count: Option<i64> = conn.get(&count_key).await?;
    let unique_users: i64 = conn.scard(&users_key).await.unwrap_or(0);
    Ok(HeatSample {
        count: count.unwrap_or(0),
        unique_users,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_user_single_query_is_cold() {
        assert!(!is_hot(HeatSample {
            count: 1,
            unique_users: 1
        }));
    }

    #[test]
    fn repeats_or_second_user_make_it_hot() {
        assert!(is_hot(HeatSample {
            count: 2,
            unique_users: 1
        }));
        assert!(is_hot(HeatSample {
            count: 1,
            unique_users: 2
        }));
    }

    #[test]
    fn empty_sample_is_cold() {
        assert!(!is_hot(HeatSample::default()));
    }
}
