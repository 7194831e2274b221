#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::error::StoreError;
#[cfg(feature = "redis")]
use crate::storage::KeyValueStore;

/// Durable store backed by Redis.
///
/// Every key is namespaced under `prefix`, so several agents may share one
/// server as long as their prefixes differ. A server refusing writes with
/// `OOM` is reported as [`StoreError::QuotaExceeded`].
#[cfg(feature = "redis")]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(feature = "redis")]
const SCAN_COUNT: usize = 100;

/// Escape glob metacharacters so the prefix matches literally in `MATCH`.
#[cfg(feature = "redis")]
fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(feature = "redis")]
fn classify(err: redis::RedisError) -> StoreError {
    if err.code() == Some("OOM") {
        StoreError::QuotaExceeded
    } else if err.is_io_error() || err.is_connection_refusal() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(self.namespaced(key)).await.map_err(classify)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(self.namespaced(key), value)
            .await
            .map_err(classify)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.namespaced(key)).await.map_err(classify)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let namespace = format!("{}:", self.prefix);
        let pattern = format!("{}*", escape_glob(&namespace));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            keys.extend(
                page.into_iter()
                    .filter_map(|k| k.strip_prefix(&namespace).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
