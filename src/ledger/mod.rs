use crate::error::{EngineError, Result};
use crate::event::CallDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Closed call lifecycle enumeration. Terminal states are retained
/// for audit and never mutated further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    OnHold,
    Transferred,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
                | CallStatus::Cancelled
        )
    }

    /// Transition table. Any non-terminal state may move to a
    /// carrier-reported failure state; `Completed` is only reachable
    /// from an established call.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() && next != CallStatus::Completed {
            return true;
        }
        matches!(
            (self, next),
            (CallStatus::Initiated, CallStatus::Ringing)
                | (CallStatus::Ringing, CallStatus::InProgress)
                | (CallStatus::InProgress, CallStatus::OnHold)
                | (CallStatus::OnHold, CallStatus::InProgress)
                | (CallStatus::InProgress, CallStatus::Transferred)
                | (CallStatus::Transferred, CallStatus::InProgress)
                | (CallStatus::InProgress, CallStatus::Completed)
                | (CallStatus::OnHold, CallStatus::Completed)
                | (CallStatus::Transferred, CallStatus::Completed)
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::OnHold => "on_hold",
            CallStatus::Transferred => "transferred",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Busy => "busy",
            CallStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Immutable audit record of one transition or coordinator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    pub actor: String,
    pub old_status: CallStatus,
    pub new_status: CallStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// The authoritative record for one phone conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    pub status: CallStatus,
    pub agent_id: Option<String>,
    pub department: Option<String>,
    pub routing_attempts: u32,
    pub spam_score: f64,
    pub spam_reasons: Vec<String>,
    pub is_vip: bool,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ai_started_at: Option<DateTime<Utc>>,
    pub ai_ended_at: Option<DateTime<Utc>>,
    pub resolution_status: Option<String>,
    pub satisfaction_score: Option<u8>,
}

impl Call {
    /// Seconds from creation to answer.
    pub fn wait_time_secs(&self) -> Option<i64> {
        self.started_at.map(|s| (s - self.created_at).num_seconds())
    }

    /// Seconds from answer to end.
    pub fn talk_time_secs(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }

    pub fn ai_time_secs(&self) -> Option<i64> {
        match (self.ai_started_at, self.ai_ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.talk_time_secs()
    }
}

/// A call plus its event trail, guarded as one unit so transitions on
/// a single call are serialized.
#[derive(Debug)]
pub struct CallEntry {
    pub call: Call,
    pub events: Vec<CallEvent>,
}

impl CallEntry {
    /// Apply a transition validated against the current status.
    pub fn transition(
        &mut self,
        actor: &str,
        next: CallStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let current = self.call.status;
        if !current.can_transition_to(next) {
            return Err(EngineError::Consistency {
                expected: format!("a state that permits {}", next),
                actual: current.to_string(),
            });
        }
        let now = Utc::now();
        if next == CallStatus::InProgress && self.call.started_at.is_none() {
            self.call.started_at = Some(now);
        }
        if next.is_terminal() {
            self.call.ended_at = Some(now);
        }
        self.events.push(CallEvent {
            actor: actor.to_string(),
            old_status: current,
            new_status: next,
            at: now,
            reason,
        });
        self.call.status = next;
        debug!(call_id = %self.call.id, from = %current, to = %next, "call transition");
        Ok(())
    }

    /// Compare-and-set variant: rejects when the caller's expectation
    /// is stale, so no transition is ever applied against a prior
    /// status the caller did not observe.
    pub fn transition_if(
        &mut self,
        expected: CallStatus,
        actor: &str,
        next: CallStatus,
        reason: Option<String>,
    ) -> Result<()> {
        if self.call.status != expected {
            return Err(EngineError::Consistency {
                expected: expected.to_string(),
                actual: self.call.status.to_string(),
            });
        }
        self.transition(actor, next, reason)
    }

    /// Append an audit event without changing status.
    pub fn annotate(&mut self, actor: &str, reason: impl Into<String>) {
        let status = self.call.status;
        self.events.push(CallEvent {
            actor: actor.to_string(),
            old_status: status,
            new_status: status,
            at: Utc::now(),
            reason: Some(reason.into()),
        });
    }

    /// Metadata may still be attached after a terminal state.
    pub fn set_resolution(&mut self, resolution: impl Into<String>) {
        self.call.resolution_status = Some(resolution.into());
    }

    pub fn set_satisfaction(&mut self, score: u8) {
        self.call.satisfaction_score = Some(score);
    }
}

pub type CallEntryRef = Arc<Mutex<CallEntry>>;

/// In-memory ledger: a map of per-call handles. The outer lock only
/// guards the map; per-call work happens under the entry's own lock.
/// Terminal calls are retained, never removed.
pub struct CallLedger {
    calls: Mutex<HashMap<String, CallEntryRef>>,
    by_correlation: Mutex<HashMap<String, String>>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            by_correlation: Mutex::new(HashMap::new()),
        }
    }

    /// Create the entry for a carrier correlation id, or return the
    /// existing one (carrier retries deliver duplicates).
    pub async fn create(
        &self,
        tenant_id: &str,
        correlation_id: &str,
        direction: CallDirection,
        from_number: &str,
        to_number: &str,
    ) -> CallEntryRef {
        // Hold the correlation index across check-and-insert so two
        // concurrent creates for one correlation id resolve to a
        // single entry.
        let mut by_correlation = self.by_correlation.lock().await;
        if let Some(id) = by_correlation.get(correlation_id) {
            if let Some(existing) = self.calls.lock().await.get(id).cloned() {
                return existing;
            }
        }
        let call = Call {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            correlation_id: correlation_id.to_string(),
            direction,
            from_number: from_number.to_string(),
            to_number: to_number.to_string(),
            status: CallStatus::Initiated,
            agent_id: None,
            department: None,
            routing_attempts: 0,
            spam_score: 0.0,
            spam_reasons: vec![],
            is_vip: false,
            priority: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            ai_started_at: None,
            ai_ended_at: None,
            resolution_status: None,
            satisfaction_score: None,
        };
        let id = call.id.clone();
        let entry: CallEntryRef = Arc::new(Mutex::new(CallEntry {
            call,
            events: vec![],
        }));
        self.calls.lock().await.insert(id.clone(), entry.clone());
        by_correlation.insert(correlation_id.to_string(), id);
        entry
    }

    pub async fn get(&self, call_id: &str) -> Option<CallEntryRef> {
        self.calls.lock().await.get(call_id).cloned()
    }

    pub async fn find_by_correlation(&self, correlation_id: &str) -> Option<CallEntryRef> {
        let call_id = self.by_correlation.lock().await.get(correlation_id).cloned()?;
        self.get(&call_id).await
    }

    pub async fn snapshot(&self, call_id: &str) -> Option<Call> {
        let entry = self.get(call_id).await?;
        let guard = entry.lock().await;
        Some(guard.call.clone())
    }

    pub async fn events(&self, call_id: &str) -> Option<Vec<CallEvent>> {
        let entry = self.get(call_id).await?;
        let guard = entry.lock().await;
        Some(guard.events.clone())
    }
}

impl Default for CallLedger {
    fn default() -> Self {
        Self::new()
    }
}
