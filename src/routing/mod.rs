use crate::config::{AgentSeed, Config, DepartmentConfig, TenantConfig};
use crate::queue::{CallQueue, QueueEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    NotAvailable,
}

/// A human call handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    pub department: String,
    pub name: Option<String>,
    pub status: AgentStatus,
    pub max_concurrent_calls: u32,
    pub current_calls: u32,
    pub weight: u32,
    pub skills: Vec<String>,
    pub languages: Vec<String>,
    pub is_active: bool,
    /// Optional supervisor, resolved by lookup rather than held as an
    /// object reference.
    pub manager_id: Option<String>,
}

impl Agent {
    pub fn from_seed(tenant_id: &str, seed: &AgentSeed) -> Self {
        Self {
            id: seed.id.clone(),
            tenant_id: tenant_id.to_string(),
            department: seed.department.clone(),
            name: seed.name.clone(),
            status: AgentStatus::Available,
            max_concurrent_calls: seed.max_concurrent_calls,
            current_calls: 0,
            weight: seed.weight,
            skills: seed.skills.clone(),
            languages: seed.languages.clone(),
            is_active: true,
            manager_id: seed.manager_id.clone(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        self.is_active
            && self.status == AgentStatus::Available
            && self.current_calls < self.max_concurrent_calls
    }

    pub fn has_any_skill(&self, required: &[String]) -> bool {
        required.iter().any(|s| self.skills.contains(s))
    }
}

/// Single owner of every agent's concurrency counter. Assignment and
/// release go through this lock only, so `current_calls` can never be
/// read-then-written unsynchronized.
pub struct AgentRegistry {
    inner: Mutex<HashMap<String, Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, agent: Agent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(agent.id.clone(), agent);
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(agent_id).cloned()
    }

    pub fn set_status(&self, agent_id: &str, status: AgentStatus) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                true
            }
            None => false,
        }
    }

    /// Reserve one call slot. Eligibility is re-checked under the lock,
    /// so two near-simultaneous attempts on a one-slot agent resolve to
    /// exactly one winner.
    pub fn try_assign(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(agent_id) {
            Some(agent) if agent.is_eligible() => {
                agent.current_calls += 1;
                true
            }
            _ => false,
        }
    }

    /// Release one call slot, saturating at zero.
    pub fn release(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = inner.get_mut(agent_id) {
            agent.current_calls = agent.current_calls.saturating_sub(1);
        }
    }

    /// Snapshot of eligible agents in a department, in stable id order
    /// so strategy rotation is deterministic.
    pub fn eligible_agents(&self, tenant_id: &str, department: &str) -> Vec<Agent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut agents: Vec<Agent> = inner
            .values()
            .filter(|a| a.tenant_id == tenant_id && a.department == department && a.is_eligible())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    RoundRobin,
    LeastBusy,
    SkillsBased,
}

/// Round-robin rotation counters, one per tenant/department group.
#[derive(Debug)]
pub struct RoutingState {
    round_robin_counters: Mutex<HashMap<String, AtomicUsize>>,
}

impl RoutingState {
    pub fn new() -> Self {
        Self {
            round_robin_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_round_robin_index(&self, group_key: &str, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let mut counters = self
            .round_robin_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .entry(group_key.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        counter.fetch_add(1, Ordering::SeqCst) % count
    }
}

impl Default for RoutingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one routing pass. Queue-full and after-hours resolve to
/// voicemail by policy, never to a hard failure or a silent drop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteDecision {
    Agent { agent_id: String, department: String },
    Queued { entry: QueueEntry },
    Voicemail { reason: String },
}

/// Routing input derived from the call record at decision time.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub call_id: String,
    pub tenant_id: String,
    pub from_number: String,
    pub is_vip: bool,
    pub priority: u8,
    pub preferred_agent: Option<String>,
    pub requested_department: Option<String>,
    pub speech_text: Option<String>,
}

pub struct Router {
    config: Arc<Config>,
    registry: Arc<AgentRegistry>,
    queue: Arc<CallQueue>,
    state: RoutingState,
}

impl Router {
    pub fn new(config: Arc<Config>, registry: Arc<AgentRegistry>, queue: Arc<CallQueue>) -> Self {
        Self {
            config,
            registry,
            queue,
            state: RoutingState::new(),
        }
    }

    /// Select the next handler for a call. A successful `Agent`
    /// decision has already reserved the agent's slot; the caller must
    /// pair it with the call-record update or release the reservation.
    pub fn route(&self, req: &RouteRequest, now: DateTime<Utc>) -> RouteDecision {
        let Some(tenant) = self.config.tenant(&req.tenant_id) else {
            warn!(tenant_id = %req.tenant_id, "routing without tenant configuration");
            return RouteDecision::Voicemail {
                reason: "no tenant configuration".to_string(),
            };
        };

        // VIP callers and preferred agents bypass strategy selection
        // when the target is currently eligible.
        if let Some(preferred) = &req.preferred_agent {
            if let Some(agent) = self.registry.get(preferred) {
                if agent.tenant_id == req.tenant_id && self.registry.try_assign(preferred) {
                    info!(call_id = %req.call_id, agent_id = %preferred, "preferred agent assigned");
                    return RouteDecision::Agent {
                        agent_id: preferred.clone(),
                        department: agent.department,
                    };
                }
            }
        }

        let department = self.select_department(tenant, req);

        if !tenant.is_open(now) {
            return RouteDecision::Voicemail {
                reason: "after hours".to_string(),
            };
        }

        let Some(dept) = tenant.department(&department) else {
            return RouteDecision::Voicemail {
                reason: format!("unknown department {}", department),
            };
        };

        if let Some(agent_id) = self.pick_agent(req, dept) {
            return RouteDecision::Agent {
                agent_id,
                department,
            };
        }

        // No eligible agent: queue, overflowing or falling back to
        // voicemail by policy when full.
        self.enqueue_with_overflow(tenant, dept, req)
    }

    fn select_department(&self, tenant: &TenantConfig, req: &RouteRequest) -> String {
        if let Some(requested) = &req.requested_department {
            if tenant.department(requested).is_some() {
                return requested.clone();
            }
        }
        if let Some(text) = &req.speech_text {
            let lowered = text.to_lowercase();
            for dept in &tenant.departments {
                if dept
                    .keywords
                    .iter()
                    .any(|k| lowered.contains(&k.to_lowercase()))
                {
                    return dept.name.clone();
                }
            }
        }
        tenant.default_department.clone()
    }

    /// Apply the department's configured strategy over the eligible
    /// snapshot, re-checking each candidate under the registry lock.
    fn pick_agent(&self, req: &RouteRequest, dept: &DepartmentConfig) -> Option<String> {
        let eligible = self.registry.eligible_agents(&req.tenant_id, &dept.name);
        if eligible.is_empty() {
            return None;
        }
        let group_key = format!("{}/{}", req.tenant_id, dept.name);

        let candidates: Vec<&Agent> = match dept.strategy {
            RoutingStrategy::RoundRobin => {
                let start = self.state.next_round_robin_index(&group_key, eligible.len());
                rotation(&eligible, start)
            }
            RoutingStrategy::LeastBusy => {
                let start = self.state.next_round_robin_index(&group_key, eligible.len());
                let mut rotated = rotation(&eligible, start);
                rotated.sort_by_key(|a| a.current_calls);
                rotated
            }
            RoutingStrategy::SkillsBased => {
                let skilled: Vec<&Agent> = eligible
                    .iter()
                    .filter(|a| a.has_any_skill(&dept.required_skills))
                    .collect();
                // nobody carries the skill: fall back to the whole pool
                let pool = if skilled.is_empty() || dept.required_skills.is_empty() {
                    eligible.iter().collect()
                } else {
                    skilled
                };
                let start = self.state.next_round_robin_index(&group_key, pool.len());
                let mut rotated = rotation_ref(&pool, start);
                rotated.sort_by_key(|a| a.current_calls);
                rotated
            }
        };

        for candidate in candidates {
            if self.registry.try_assign(&candidate.id) {
                debug!(call_id = %req.call_id, agent_id = %candidate.id, strategy = ?dept.strategy, "agent selected");
                return Some(candidate.id.clone());
            }
        }
        None
    }

    fn enqueue_with_overflow(
        &self,
        tenant: &TenantConfig,
        dept: &DepartmentConfig,
        req: &RouteRequest,
    ) -> RouteDecision {
        let max_wait = Duration::from_secs(dept.max_wait_secs);
        match self.queue.enqueue(
            &req.call_id,
            &req.tenant_id,
            &dept.name,
            req.priority,
            max_wait,
            dept.max_queue_size,
        ) {
            Ok(entry) => RouteDecision::Queued { entry },
            Err(e) => {
                debug!(call_id = %req.call_id, department = %dept.name, error = %e, "queue unavailable");
                if let Some(overflow) = dept
                    .overflow_department
                    .as_ref()
                    .and_then(|name| tenant.department(name))
                {
                    if let Some(agent_id) = self.pick_agent(req, overflow) {
                        return RouteDecision::Agent {
                            agent_id,
                            department: overflow.name.clone(),
                        };
                    }
                    if let Ok(entry) = self.queue.enqueue(
                        &req.call_id,
                        &req.tenant_id,
                        &overflow.name,
                        req.priority,
                        Duration::from_secs(overflow.max_wait_secs),
                        overflow.max_queue_size,
                    ) {
                        return RouteDecision::Queued { entry };
                    }
                }
                RouteDecision::Voicemail {
                    reason: "no agent and no queue capacity".to_string(),
                }
            }
        }
    }
}

fn rotation<'a>(agents: &'a [Agent], start: usize) -> Vec<&'a Agent> {
    let mut out: Vec<&Agent> = Vec::with_capacity(agents.len());
    for i in 0..agents.len() {
        out.push(&agents[(start + i) % agents.len()]);
    }
    out
}

fn rotation_ref<'a>(agents: &[&'a Agent], start: usize) -> Vec<&'a Agent> {
    let mut out: Vec<&Agent> = Vec::with_capacity(agents.len());
    for i in 0..agents.len() {
        out.push(agents[(start + i) % agents.len()]);
    }
    out
}
