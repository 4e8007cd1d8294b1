use std::sync::Arc;

use anyhow::{Context, Result};
use redis::{aio::MultiplexedConnection, Client};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::job::JobRecord;

/// Record TTL in seconds. Mirrored records only need to outlive the
/// in-process retention window.
const RECORD_TTL: u64 = 86_400;

/// Redis mirror of job records and cancellation markers.
///
/// The in-process queue remains authoritative; this store lets other
/// processes read job status and request cancellation without direct
/// access to the queue.
pub struct RedisJobStore {
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisJobStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .context(format!("Failed to connect to Redis at {redis_url}"))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            conn_pool: Arc::new(Mutex::new(conn)),
        })
    }

    fn record_key(id: Uuid) -> String {
        format!("sitescan:job:{id}")
    }

    fn cancel_key(id: Uuid) -> String {
        format!("sitescan:cancel:{id}")
    }

    /// Write the latest snapshot of a job record.
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize job record")?;

        let mut conn = self.conn_pool.lock().await;
        redis::cmd("SET")
            .arg(Self::record_key(record.id))
            .arg(&json)
            .arg("EX")
            .arg(RECORD_TTL)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to mirror job record")?;

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let mut conn = self.conn_pool.lock().await;
        let json: Option<String> = redis::cmd("GET")
            .arg(Self::record_key(id))
            .query_async(&mut *conn)
            .await
            .context("Failed to read job record")?;

        match json {
            Some(json) => {
                let record =
                    serde_json::from_str(&json).context("Failed to deserialize job record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove a record and any pending cancel marker.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("DEL")
            .arg(Self::record_key(id))
            .arg(Self::cancel_key(id))
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to delete job record")?;

        Ok(())
    }

    /// Set the cancellation marker for a job. The owning queue observes it
    /// on its next dispatcher tick.
    pub async fn request_cancel(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;
        redis::cmd("SET")
            .arg(Self::cancel_key(id))
            .arg(1)
            .arg("EX")
            .arg(RECORD_TTL)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to set cancel marker")?;

        debug!(job_id = %id, "cancel marker set");
        Ok(())
    }

    /// Scan all mirrored records. Used by the out-of-process status and
    /// metrics commands; in-process state never goes through here.
    pub async fn scan_records(&self) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn_pool.lock().await;
        let mut records = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("sitescan:job:*")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .context("Failed to scan job records")?;

            for key in keys {
                let json: Option<String> = redis::cmd("GET")
                    .arg(&key)
                    .query_async(&mut *conn)
                    .await
                    .context("Failed to read job record")?;
                if let Some(json) = json {
                    match serde_json::from_str(&json) {
                        Ok(record) => records.push(record),
                        Err(e) => debug!("skipping unreadable record {key}: {e}"),
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(records)
    }

    pub async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn_pool.lock().await;
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::cancel_key(id))
            .query_async(&mut *conn)
            .await
            .context("Failed to check cancel marker")?;

        Ok(exists)
    }
}
