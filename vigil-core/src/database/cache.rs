use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info};
use vigil_model::TaskId;

use crate::database::ports::FastStore;
use crate::error::{CoreError, Result};

/// Interval between non-blocking pops while waiting on an empty queue.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct RedisFastStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisFastStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisFastStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisFastStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::mirror("create client", e))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::mirror("connect", e))?;

        info!("Successfully connected to Redis");

        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl FastStore for RedisFastStore {
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        debug!("Mirror RPUSH: {} (+{})", key, values.len());
        self.conn()
            .rpush::<_, _, ()>(key, values)
            .await
            .map_err(|e| CoreError::mirror("RPUSH", e))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        self.conn()
            .lrange(key, start, stop)
            .await
            .map_err(|e| CoreError::mirror("LRANGE", e))
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        self.conn()
            .lrem(key, 0, value)
            .await
            .map_err(|e| CoreError::mirror("LREM", e))
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.conn()
            .llen(key)
            .await
            .map_err(|e| CoreError::mirror("LLEN", e))
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        debug!("Mirror DEL: {:?}", keys);
        self.conn()
            .del::<_, ()>(keys)
            .await
            .map_err(|e| CoreError::mirror("DEL", e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.conn()
            .exists(key)
            .await
            .map_err(|e| CoreError::mirror("EXISTS", e))
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.conn()
            .hset_multiple::<_, _, _, ()>(key, fields)
            .await
            .map_err(|e| CoreError::mirror("HSET", e))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| CoreError::mirror("HGETALL", e))
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<String>> {
        // Polls with LPOP instead of BLPOP so a long wait never parks the
        // multiplexed connection other callers share.
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn();
        loop {
            let item: Option<String> = redis::cmd("LPOP")
                .arg(queue)
                .query_async(&mut conn)
                .await
                .map_err(|e| CoreError::mirror("LPOP", e))?;
            if item.is_some() {
                return Ok(item);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut self.conn())
            .await
            .map_err(|e| CoreError::mirror("SET NX EX", e))?;
        Ok(reply.is_some())
    }

    async fn replace_list(&self, key: &str, values: &[String]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !values.is_empty() {
            pipe.rpush(key, values).ignore();
        }
        pipe.query_async::<()>(&mut self.conn())
            .await
            .map_err(|e| CoreError::mirror("DEL+RPUSH", e))
    }
}

/// Key shapes used in the mirror store.
#[derive(Debug, Clone, Copy)]
pub struct FastKeys;

impl FastKeys {
    pub const TASK_LIST: &'static str = "tasks:list";
    pub const TARGET_SYNC_QUEUE: &'static str = "task:sync:targets:queue";
    pub const TARGET_SYNC_FAILED: &'static str = "task:sync:targets:failed";
    pub const TARGET_DELETE_QUEUE: &'static str = "target:delete:queue";
    pub const TARGET_DELETE_FAILED: &'static str = "target:delete:failed";
    pub const TASK_DELETE_QUEUE: &'static str = "task:delete:queue";
    pub const TASK_DELETE_FAILED: &'static str = "task:delete:failed";
    pub const FINDING_REPLAY_QUEUE: &'static str = "task:findings:queue";
    pub const FINDING_REPLAY_FAILED: &'static str = "task:findings:failed";

    pub fn targets(id: &TaskId) -> String {
        format!("task:{id}:targets")
    }

    pub fn results(id: &TaskId) -> String {
        format!("task:{id}:result")
    }

    pub fn log(id: &TaskId) -> String {
        format!("task:{id}:log")
    }

    pub fn info(id: &TaskId) -> String {
        format!("task:{id}:info")
    }

    pub fn start_lock(id: &TaskId) -> String {
        format!("task:lock:{id}")
    }

    /// Every per-task key; cleared when a task is deleted.
    pub fn task_keys(id: &TaskId) -> Vec<String> {
        vec![
            Self::info(id),
            Self::targets(id),
            Self::results(id),
            Self::log(id),
        ]
    }
}
