//! In-process implementations of both store ports.
//!
//! Used by tests and for running the engine without external services. Each
//! store carries fault switches so failure paths can be exercised.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use vigil_model::{
    Finding, NewFinding, NewTask, NewTaskLog, Target, Task, TaskId, TaskLog,
    TaskStatus,
};

use crate::database::ports::{DurableStore, FastStore, StatusGuard};
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct DurableState {
    tasks: HashMap<TaskId, Task>,
    targets: Vec<Target>,
    findings: Vec<Finding>,
    logs: Vec<TaskLog>,
    next_row_id: i64,
}

impl DurableState {
    fn next_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn live_task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks
            .get(task_id)
            .filter(|task| task.status != TaskStatus::Deleted)
    }
}

/// Durable store kept in a mutex-guarded map. Status transitions are atomic
/// with respect to each other, matching a row-level conditional update.
#[derive(Clone, Default)]
pub struct MemoryDurableStore {
    state: Arc<Mutex<DurableState>>,
    failing_transactions: Arc<AtomicU32>,
    failing_queries: Arc<AtomicU32>,
}

impl fmt::Debug for MemoryDurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryDurableStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("tasks", &state.tasks.len())
                    .field("targets", &state.targets.len())
                    .field("findings", &state.findings.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` transaction begins fail.
    pub fn fail_transactions(&self, count: u32) {
        self.failing_transactions.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` statements fail.
    pub fn fail_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    /// Every audit row written so far.
    pub async fn logs(&self) -> Vec<TaskLog> {
        self.state.lock().await.logs.clone()
    }

    /// Targets including those of soft-deleted tasks.
    pub async fn raw_target_count(&self, task_id: &TaskId) -> usize {
        self.state
            .lock()
            .await
            .targets
            .iter()
            .filter(|t| &t.task_id == task_id)
            .count()
    }

    /// Row lookup that ignores the soft-delete filter.
    pub async fn raw_task(&self, task_id: &TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(task_id).cloned()
    }

    /// Backdate `updated_at`, used to age soft deletes in tests.
    pub async fn set_updated_at(&self, task_id: &TaskId, at: DateTime<Utc>) {
        if let Some(task) = self.state.lock().await.tasks.get_mut(task_id) {
            task.updated_at = at;
        }
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }

    fn begin(&self, op: &'static str) -> Result<()> {
        if Self::take_fault(&self.failing_transactions) {
            return Err(CoreError::transaction(op, "injected begin failure"));
        }
        Ok(())
    }

    fn statement(&self, op: &'static str) -> Result<()> {
        if Self::take_fault(&self.failing_queries) {
            return Err(CoreError::query(op, "injected statement failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn create_task_with_targets(&self, task: &NewTask) -> Result<Task> {
        self.begin("create task")?;
        self.statement("insert task")?;
        let mut state = self.state.lock().await;
        if state.tasks.contains_key(&task.id) {
            return Err(CoreError::query("insert task", "duplicate task id"));
        }
        let now = Utc::now();
        let row = Task {
            id: task.id.clone(),
            name: task.name.clone(),
            status: TaskStatus::Pending,
            config: task.config.clone(),
            creator: task.creator.clone(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        state.tasks.insert(task.id.clone(), row.clone());
        for target in &task.targets {
            let id = state.next_id();
            state.targets.push(Target {
                id,
                task_id: task.id.clone(),
                target: target.clone(),
                created_at: now,
                updated_at: now,
            });
        }
        Ok(row)
    }

    async fn insert_targets(
        &self,
        task_id: &TaskId,
        targets: &[String],
    ) -> Result<u64> {
        self.statement("insert targets")?;
        let mut state = self.state.lock().await;
        if state.live_task(task_id).is_none() {
            return Err(CoreError::NotFound(format!("task {task_id}")));
        }
        let now = Utc::now();
        for target in targets {
            let id = state.next_id();
            state.targets.push(Target {
                id,
                task_id: task_id.clone(),
                target: target.clone(),
                created_at: now,
                updated_at: now,
            });
        }
        Ok(targets.len() as u64)
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.statement("get task")?;
        Ok(self.state.lock().await.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.statement("list tasks")?;
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| task.status != TaskStatus::Deleted)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    async fn list_stale_deleted(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        self.statement("list stale deletes")?;
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Deleted && task.updated_at <= cutoff
            })
            .map(|task| task.id.clone())
            .collect())
    }

    async fn list_targets(&self, task_id: &TaskId) -> Result<Vec<Target>> {
        self.statement("list targets")?;
        let state = self.state.lock().await;
        Ok(state
            .targets
            .iter()
            .filter(|t| &t.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        task_id: &TaskId,
        guard: StatusGuard,
        next: TaskStatus,
        message: Option<&str>,
    ) -> Result<u64> {
        self.statement("transition status")?;
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(0);
        };
        if !guard.admits(task.status) {
            return Ok(0);
        }
        let now = Utc::now();
        task.status = next;
        task.updated_at = now;
        if next == TaskStatus::Running {
            task.started_at = Some(now);
            task.finished_at = None;
            task.error_message = None;
        } else if matches!(
            next,
            TaskStatus::Finished | TaskStatus::Stopped | TaskStatus::Error
        ) {
            task.finished_at = Some(now);
        }
        if let Some(message) = message {
            task.error_message = Some(message.to_string());
        }
        Ok(1)
    }

    async fn delete_targets(
        &self,
        task_id: &TaskId,
        targets: Option<&[String]>,
    ) -> Result<u64> {
        self.begin("delete targets")?;
        self.statement("delete targets")?;
        let mut state = self.state.lock().await;
        let before = state.targets.len();
        state.targets.retain(|row| {
            if &row.task_id != task_id {
                return true;
            }
            match targets {
                Some(names) => !names.contains(&row.target),
                None => false,
            }
        });
        Ok((before - state.targets.len()) as u64)
    }

    async fn purge_task(&self, task_id: &TaskId) -> Result<bool> {
        self.begin("purge task")?;
        self.statement("purge task")?;
        let mut state = self.state.lock().await;
        match state.tasks.get(task_id) {
            Some(task) if task.status == TaskStatus::Deleted => {}
            _ => return Ok(false),
        }
        state.tasks.remove(task_id);
        state.targets.retain(|row| &row.task_id != task_id);
        state.findings.retain(|row| &row.task_id != task_id);
        for log in state.logs.iter_mut() {
            if log.task_id.as_ref() == Some(task_id) {
                log.task_id = None;
            }
        }
        Ok(true)
    }

    async fn insert_finding(&self, finding: &NewFinding) -> Result<Finding> {
        self.statement("insert finding")?;
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(&finding.task_id) {
            return Err(CoreError::query("insert finding", "unknown task"));
        }
        let row = Finding {
            id: state.next_id(),
            task_id: finding.task_id.clone(),
            target: finding.target.clone(),
            template_id: finding.template_id.clone(),
            severity: finding.severity.clone(),
            title: finding.title.clone(),
            details: finding.details.clone(),
            raw_ref: finding.raw_ref.clone(),
            created_at: Utc::now(),
        };
        state.findings.push(row.clone());
        Ok(row)
    }

    async fn list_findings(
        &self,
        task_id: &TaskId,
        page: u32,
        page_size: u32,
    ) -> Result<(u64, Vec<Finding>)> {
        self.statement("list findings")?;
        let state = self.state.lock().await;
        let all: Vec<&Finding> = state
            .findings
            .iter()
            .filter(|f| &f.task_id == task_id)
            .collect();
        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        let items = all
            .iter()
            .skip(offset)
            .take(page_size as usize)
            .map(|f| (*f).clone())
            .collect();
        Ok((all.len() as u64, items))
    }

    async fn append_log(&self, entry: &NewTaskLog) -> Result<()> {
        self.statement("append log")?;
        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.logs.push(TaskLog {
            id,
            task_id: entry.task_id.clone(),
            action: entry.action.clone(),
            actor: entry.actor.clone(),
            message: entry.message.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FastState {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, (String, tokio::time::Instant)>,
}

/// Mirror store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryFastStore {
    state: Arc<Mutex<FastState>>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    failing_keys: Arc<std::sync::Mutex<Vec<String>>>,
}

impl fmt::Debug for MemoryFastStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFastStore")
            .field("fail_writes", &self.fail_writes.load(Ordering::Relaxed))
            .field("fail_reads", &self.fail_reads.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every mutating command fails.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// While set, every read command (including pops) fails.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail every write to `key` until [`Self::clear_key_failures`].
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.push(key.into());
        }
    }

    pub fn clear_key_failures(&self) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.clear();
        }
    }

    fn check_write(&self, op: &str, key: &str) -> Result<()> {
        let key_fails = self
            .failing_keys
            .lock()
            .map(|keys| keys.iter().any(|failing| failing == key))
            .unwrap_or(false);
        if key_fails || self.fail_writes.load(Ordering::SeqCst) {
            return Err(CoreError::mirror(op, "injected write failure"));
        }
        Ok(())
    }

    fn check_read(&self, op: &str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CoreError::mirror(op, "injected read failure"));
        }
        Ok(())
    }

    /// Snapshot of a list regardless of fault switches.
    pub async fn list(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a hash regardless of fault switches.
    pub async fn hash(&self, key: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

/// Resolve redis-style inclusive indices against a list length.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn rpush(&self, key: &str, values: &[String]) -> Result<()> {
        self.check_write("RPUSH", key)?;
        let mut state = self.state.lock().await;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        self.check_read("LRANGE")?;
        let state = self.state.lock().await;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<u64> {
        self.check_write("LREM", key)?;
        let mut state = self.state.lock().await;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            state.lists.remove(key);
        }
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        self.check_read("LLEN")?;
        let state = self.state.lock().await;
        Ok(state.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn del(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.check_write("DEL", key)?;
        }
        let mut state = self.state.lock().await;
        for key in keys {
            state.lists.remove(key);
            state.hashes.remove(key);
            state.strings.remove(key);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_read("EXISTS")?;
        let state = self.state.lock().await;
        let live_string = state
            .strings
            .get(key)
            .is_some_and(|(_, expires)| *expires > tokio::time::Instant::now());
        Ok(state.lists.contains_key(key)
            || state.hashes.contains_key(key)
            || live_string)
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<()> {
        self.check_write("HSET", key)?;
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_read("HGETALL")?;
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.check_read("LPOP")?;
            {
                let mut state = self.state.lock().await;
                if let Some(list) = state.lists.get_mut(queue) {
                    let item = list.pop_front();
                    if list.is_empty() {
                        state.lists.remove(queue);
                    }
                    if item.is_some() {
                        return Ok(item);
                    }
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10).min(deadline - now))
                .await;
        }
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_write("SET NX EX", key)?;
        let mut state = self.state.lock().await;
        let now = tokio::time::Instant::now();
        if let Some((_, expires)) = state.strings.get(key)
            && *expires > now
        {
            return Ok(false);
        }
        state
            .strings
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }
}
