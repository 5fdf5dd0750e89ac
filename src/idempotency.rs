use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;

/// Stored under a key between `reserve` and `put`.
const IN_FLIGHT: &str = "";

/// Result of claiming an `Idempotency-Key`.
#[derive(Debug, PartialEq)]
pub enum Reservation<T> {
    /// The caller owns the key and must `put` or `release` it.
    Acquired,
    /// Another request holds the key and has not finished.
    InFlight,
    /// A finished request already stored this response.
    Done(T),
}

/// Replays earlier responses for a repeated `Idempotency-Key`.
///
/// Uses redis when configured so replicas share keys; otherwise keeps a
/// process-local map.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, String>>>,
    ttl_secs: u64,
}

impl IdempotencyCache {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
        }
    }

    fn scoped(user_id: &str, key: &str) -> String {
        format!("listro:idem:{user_id}:{key}")
    }

    /// Atomically claims the key (redis `SET NX`, or the local map under its
    /// lock) or reports what already holds it.
    pub async fn reserve<T: DeserializeOwned>(&self, user_id: &str, key: &str) -> Reservation<T> {
        let key = Self::scoped(user_id, key);
        match &self.redis {
            Some(client) => {
                let mut conn = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(target = "listro.idempotency", error = %err, "redis unavailable; key not reserved");
                        return Reservation::Acquired;
                    }
                };
                let set: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(&key)
                    .arg(IN_FLIGHT)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.ttl_secs)
                    .query_async(&mut conn)
                    .await;
                match set {
                    Ok(Some(_)) => Reservation::Acquired,
                    Ok(None) => {
                        let held: Result<Option<String>, _> = conn.get(&key).await;
                        classify(held.ok().flatten())
                    }
                    Err(err) => {
                        warn!(target = "listro.idempotency", error = %err, "redis reserve failed");
                        Reservation::Acquired
                    }
                }
            }
            None => {
                let mut local = self.local.lock().await;
                match local.get(&key) {
                    Some(held) => classify(Some(held.clone())),
                    None => {
                        local.insert(key, IN_FLIGHT.to_string());
                        Reservation::Acquired
                    }
                }
            }
        }
    }

    /// Drops a reservation whose request failed, so a retry can run.
    pub async fn release(&self, user_id: &str, key: &str) {
        let key = Self::scoped(user_id, key);
        match &self.redis {
            Some(client) => {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                    let removed: Result<(), _> = conn.del(&key).await;
                    if let Err(err) = removed {
                        warn!(target = "listro.idempotency", error = %err, "redis release failed");
                    }
                }
            }
            None => {
                self.local.lock().await.remove(&key);
            }
        }
    }

    pub async fn put<T: Serialize>(&self, user_id: &str, key: &str, value: &T) {
        let key = Self::scoped(user_id, key);
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        match &self.redis {
            Some(client) => {
                let stored = match client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        let written: Result<(), _> = conn.set_ex(&key, json, self.ttl_secs).await;
                        written.map_err(|err| err.to_string())
                    }
                    Err(err) => Err(err.to_string()),
                };
                if let Err(err) = stored {
                    warn!(target = "listro.idempotency", error = %err, "redis write failed");
                }
            }
            None => {
                self.local.lock().await.insert(key, json);
            }
        }
    }
}

fn classify<T: DeserializeOwned>(held: Option<String>) -> Reservation<T> {
    match held.as_deref() {
        // expired between SET NX and GET
        None => Reservation::Acquired,
        Some(IN_FLIGHT) => Reservation::InFlight,
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => Reservation::Done(value),
            Err(err) => {
                warn!(target = "listro.idempotency", error = %err, "unreadable cached response; overwriting");
                Reservation::Acquired
            }
        },
    }
}
