use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const CLEAR_TIME_SAMPLES: usize = 16;
const DEFAULT_CLEAR_TIME: Duration = Duration::from_secs(60);

type OrderKey = (Reverse<u8>, u64);

/// A call waiting for an agent. Ordering is priority descending, then
/// arrival (monotonic sequence) ascending.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: String,
    pub call_id: String,
    pub tenant_id: String,
    pub department: String,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub max_wait: Duration,
    #[serde(skip)]
    enqueued_instant: Instant,
    #[serde(skip)]
    seq: u64,
}

impl QueueEntry {
    pub fn wait_time(&self) -> Duration {
        self.enqueued_instant.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.wait_time() > self.max_wait
    }

    fn key(&self) -> OrderKey {
        (Reverse(self.priority), self.seq)
    }
}

struct DepartmentQueue {
    entries: BTreeMap<OrderKey, QueueEntry>,
    clear_times: VecDeque<Duration>,
}

impl DepartmentQueue {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            clear_times: VecDeque::new(),
        }
    }

    fn avg_clear_time(&self) -> Duration {
        if self.clear_times.is_empty() {
            return DEFAULT_CLEAR_TIME;
        }
        let total: Duration = self.clear_times.iter().sum();
        total / self.clear_times.len() as u32
    }
}

struct QueueInner {
    departments: HashMap<String, DepartmentQueue>,
    /// call_id -> (department key, order key); enforces at most one
    /// active entry per call.
    active_calls: HashMap<String, (String, OrderKey)>,
}

/// Per-department waiting lines, one short lock around all mutations.
/// Nothing is called out to while the lock is held; routing happens
/// outside.
pub struct CallQueue {
    seq: AtomicU64,
    inner: Mutex<QueueInner>,
}

fn dept_key(tenant_id: &str, department: &str) -> String {
    format!("{}/{}", tenant_id, department)
}

impl CallQueue {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            inner: Mutex::new(QueueInner {
                departments: HashMap::new(),
                active_calls: HashMap::new(),
            }),
        }
    }

    /// Add a call to a department's line. Fails with `Capacity` once
    /// `max_queue_size` is reached so the caller can take the fallback
    /// path instead of silently dropping.
    pub fn enqueue(
        &self,
        call_id: &str,
        tenant_id: &str,
        department: &str,
        priority: u8,
        max_wait: Duration,
        max_queue_size: usize,
    ) -> Result<QueueEntry> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let key = dept_key(tenant_id, department);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *inner;
        if inner.active_calls.contains_key(call_id) {
            return Err(EngineError::Validation(format!(
                "call {} already has an active queue entry",
                call_id
            )));
        }
        let queue = inner
            .departments
            .entry(key.clone())
            .or_insert_with(DepartmentQueue::new);
        if queue.entries.len() >= max_queue_size {
            return Err(EngineError::Capacity(format!(
                "queue {} is full ({} waiting)",
                key,
                queue.entries.len()
            )));
        }
        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            tenant_id: tenant_id.to_string(),
            department: department.to_string(),
            priority,
            enqueued_at: Utc::now(),
            max_wait,
            enqueued_instant: Instant::now(),
            seq,
        };
        queue.entries.insert(entry.key(), entry.clone());
        inner
            .active_calls
            .insert(call_id.to_string(), (key.clone(), entry.key()));
        debug!(call_id, department = %key, priority, depth = queue.entries.len(), "call enqueued");
        Ok(entry)
    }

    /// Pop the next entry in priority/FIFO order.
    pub fn dequeue(&self, tenant_id: &str, department: &str) -> Option<QueueEntry> {
        let key = dept_key(tenant_id, department);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *inner;
        let queue = inner.departments.get_mut(&key)?;
        let first_key = *queue.entries.keys().next()?;
        let entry = queue.entries.remove(&first_key)?;
        inner.active_calls.remove(&entry.call_id);
        Some(entry)
    }

    /// 1-based position, computed lazily from the ordering rather than
    /// stored and renumbered on every change.
    pub fn position(&self, tenant_id: &str, department: &str, entry_id: &str) -> Option<usize> {
        let key = dept_key(tenant_id, department);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let queue = inner.departments.get(&key)?;
        queue
            .entries
            .values()
            .position(|e| e.id == entry_id)
            .map(|idx| idx + 1)
    }

    /// Average recent clear-time for the department multiplied by the
    /// entry's position.
    pub fn estimate_wait(
        &self,
        tenant_id: &str,
        department: &str,
        entry_id: &str,
    ) -> Option<Duration> {
        let key = dept_key(tenant_id, department);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let queue = inner.departments.get(&key)?;
        let position = queue.entries.values().position(|e| e.id == entry_id)? + 1;
        Some(queue.avg_clear_time() * position as u32)
    }

    /// Cancellation path: dequeue-and-discard wherever the call sits.
    pub fn remove_call(&self, call_id: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (dept, order_key) = inner.active_calls.remove(call_id)?;
        inner
            .departments
            .get_mut(&dept)
            .and_then(|q| q.entries.remove(&order_key))
    }

    /// Collect entries whose wait exceeded their max. Surfaced to the
    /// coordinator for fallback, never dropped here.
    pub fn drain_expired(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();
        let mut removed_calls = Vec::new();
        for queue in inner.departments.values_mut() {
            let keys: Vec<OrderKey> = queue
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                if let Some(entry) = queue.entries.remove(&key) {
                    removed_calls.push(entry.call_id.clone());
                    expired.push(entry);
                }
            }
        }
        for call_id in removed_calls {
            inner.active_calls.remove(&call_id);
        }
        expired
    }

    /// Record how long the most recent head-of-line took to clear.
    pub fn record_clear_time(&self, tenant_id: &str, department: &str, sample: Duration) {
        let key = dept_key(tenant_id, department);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let queue = inner
            .departments
            .entry(key)
            .or_insert_with(DepartmentQueue::new);
        queue.clear_times.push_back(sample);
        while queue.clear_times.len() > CLEAR_TIME_SAMPLES {
            queue.clear_times.pop_front();
        }
    }

    pub fn depth(&self, tenant_id: &str, department: &str) -> usize {
        let key = dept_key(tenant_id, department);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .departments
            .get(&key)
            .map(|q| q.entries.len())
            .unwrap_or(0)
    }
}

impl Default for CallQueue {
    fn default() -> Self {
        Self::new()
    }
}
