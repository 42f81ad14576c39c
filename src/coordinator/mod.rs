use crate::ai::{InferenceAction, InferenceClient, InferenceRequest};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::event::{CarrierCommand, CommandSender, DialTarget};
use crate::ledger::{CallLedger, CallStatus};
use crate::queue::{CallQueue, QueueEntry};
use crate::routing::{AgentRegistry, RouteDecision, RouteRequest, Router};
use crate::spam::SpamRuleEngine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{info, warn};

const ACTOR: &str = "coordinator";

/// Escalated calls outrank fresh arrivals in the queue.
const ESCALATION_PRIORITY_BOOST: u8 = 5;

/// Handling-path state machine layered over the call lifecycle:
/// `AiHandling -> {AiResolved, TransferRequested}`,
/// `TransferRequested -> {AgentAssigned, Queued, Voicemail}`,
/// plus queue dispatch (`Queued -> AgentAssigned`) and queue expiry
/// (`Queued -> Voicemail`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlingPath {
    AiHandling,
    AiResolved,
    TransferRequested,
    AgentAssigned,
    Queued,
    Voicemail,
}

#[derive(Debug, Default)]
struct PathState {
    path: Option<HandlingPath>,
    ai_transfer_attempts: u32,
    /// Generation counter for the accept watchdog; bumping it
    /// invalidates an in-flight grace timer.
    accept_generation: u64,
    pending_agent: Option<String>,
}

/// Orchestrates handoffs between the AI path and human agents,
/// reacting to AI requests, agent availability and queue timeouts.
/// Every action it takes appends a ledger event.
pub struct Coordinator {
    config: Arc<Config>,
    ledger: Arc<CallLedger>,
    queue: Arc<CallQueue>,
    registry: Arc<AgentRegistry>,
    router: Arc<Router>,
    spam: Arc<SpamRuleEngine>,
    inference: Arc<dyn InferenceClient>,
    commands: CommandSender,
    paths: Mutex<HashMap<String, PathState>>,
    /// Self-handle for the accept watchdog tasks.
    me: Weak<Self>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<CallLedger>,
        queue: Arc<CallQueue>,
        registry: Arc<AgentRegistry>,
        router: Arc<Router>,
        spam: Arc<SpamRuleEngine>,
        inference: Arc<dyn InferenceClient>,
        commands: CommandSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            ledger,
            queue,
            registry,
            router,
            spam,
            inference,
            commands,
            paths: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn path(&self, call_id: &str) -> Option<HandlingPath> {
        let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.get(call_id).and_then(|s| s.path)
    }

    pub fn ai_transfer_attempts(&self, call_id: &str) -> u32 {
        let paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        paths.get(call_id).map(|s| s.ai_transfer_attempts).unwrap_or(0)
    }

    fn set_path(&self, call_id: &str, next: HandlingPath) {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        let state = paths.entry(call_id.to_string()).or_default();
        state.path = Some(next);
    }

    fn send(&self, command: CarrierCommand) {
        if self.commands.send(command).is_err() {
            warn!("carrier command channel closed");
        }
    }

    /// Put a freshly gated call on the AI handling path.
    pub async fn start_ai_handling(&self, call_id: &str) {
        self.set_path(call_id, HandlingPath::AiHandling);
        if let Some(entry) = self.ledger.get(call_id).await {
            let mut guard = entry.lock().await;
            guard.call.ai_started_at = Some(Utc::now());
            guard.annotate(ACTOR, "ai handling started");
        }
    }

    /// React to a caller utterance while the AI path owns the call.
    /// A collaborator fault or low confidence degrades to a transfer
    /// request rather than stranding the caller.
    pub async fn handle_speech(&self, call_id: &str, text: &str) -> Result<()> {
        if self.path(call_id) != Some(HandlingPath::AiHandling) {
            return Ok(());
        }
        let Some(snapshot) = self.ledger.snapshot(call_id).await else {
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        };
        let tenant = self.config.tenant(&snapshot.tenant_id);
        let threshold = tenant.map(|t| t.ai_confidence_threshold).unwrap_or(0.5);
        let max_attempts = tenant.map(|t| t.max_transfer_attempts).unwrap_or(3);

        // transfer budget exhausted: the AI no longer gets a say
        if self.ai_transfer_attempts(call_id) >= max_attempts {
            info!(call_id, "max transfer attempts reached, forcing human transfer");
            return self.request_transfer(call_id, Some(text.to_string())).await;
        }

        let request = InferenceRequest {
            call_id: call_id.to_string(),
            utterance: text.to_string(),
            context: snapshot.spam_reasons.clone(),
        };
        match self.inference.infer(&request).await {
            Ok(reply) => match reply.action {
                InferenceAction::Resolve => self.ai_resolved(call_id).await,
                InferenceAction::Transfer => {
                    self.request_transfer(call_id, Some(text.to_string())).await
                }
                InferenceAction::Continue if reply.confidence < threshold => {
                    info!(
                        call_id,
                        confidence = reply.confidence,
                        "ai confidence below threshold"
                    );
                    self.request_transfer(call_id, Some(text.to_string())).await
                }
                InferenceAction::Continue => {
                    self.send(CarrierCommand::PlayAudio {
                        correlation_id: snapshot.correlation_id.clone(),
                        prompt: reply.reply_text,
                    });
                    Ok(())
                }
            },
            Err(e) => {
                // inference is down: a human takes over, the call is
                // never dropped
                warn!(call_id, error = %e, "inference failed, escalating to human");
                self.request_transfer(call_id, Some(text.to_string())).await
            }
        }
    }

    async fn ai_resolved(&self, call_id: &str) -> Result<()> {
        self.set_path(call_id, HandlingPath::AiResolved);
        if let Some(entry) = self.ledger.get(call_id).await {
            let mut guard = entry.lock().await;
            guard.call.ai_ended_at = Some(Utc::now());
            guard.set_resolution("ai_resolved");
            guard.annotate(ACTOR, "resolved by ai");
            let correlation_id = guard.call.correlation_id.clone();
            drop(guard);
            self.send(CarrierCommand::Hangup {
                correlation_id,
                reason: Some("resolved".to_string()),
            });
        }
        Ok(())
    }

    /// Move the call off the AI path toward a human handler.
    pub async fn request_transfer(&self, call_id: &str, speech: Option<String>) -> Result<()> {
        if self.ledger.snapshot(call_id).await.is_none() {
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        }
        {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            let state = paths.entry(call_id.to_string()).or_default();
            state.ai_transfer_attempts += 1;
            state.path = Some(HandlingPath::TransferRequested);
        }
        if let Some(entry) = self.ledger.get(call_id).await {
            let mut guard = entry.lock().await;
            if guard.call.ai_started_at.is_some() && guard.call.ai_ended_at.is_none() {
                guard.call.ai_ended_at = Some(Utc::now());
            }
            guard.call.priority = guard.call.priority.saturating_add(ESCALATION_PRIORITY_BOOST);
            guard.annotate(ACTOR, "transfer requested");
        }
        self.route_call(call_id, speech, true).await
    }

    /// Run the routing engine for a call and act on the decision. Used
    /// for the initial human route and for AI transfers; `via_transfer`
    /// marks a mid-call handoff, which moves the lifecycle through
    /// `Transferred` and arms the accept watchdog.
    pub async fn route_call(
        &self,
        call_id: &str,
        speech: Option<String>,
        via_transfer: bool,
    ) -> Result<()> {
        let Some(entry) = self.ledger.get(call_id).await else {
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        };
        let request = {
            let guard = entry.lock().await;
            RouteRequest {
                call_id: call_id.to_string(),
                tenant_id: guard.call.tenant_id.clone(),
                from_number: guard.call.from_number.clone(),
                is_vip: guard.call.is_vip,
                priority: guard.call.priority,
                preferred_agent: None,
                requested_department: guard.call.department.clone(),
                speech_text: speech,
            }
        };

        // routing happens outside any queue or ledger lock
        let decision = self.router.route(&request, Utc::now());
        match decision {
            RouteDecision::Agent {
                agent_id,
                department,
            } => {
                self.bind_agent(call_id, &agent_id, &department, via_transfer)
                    .await
            }
            RouteDecision::Queued { entry } => self.mark_queued(call_id, entry).await,
            RouteDecision::Voicemail { reason } => self.voicemail(call_id, &reason).await,
        }
    }

    /// Pair the agent reservation with the call-record update. The
    /// routing engine already incremented the agent's counter; if the
    /// record can no longer accept the assignment the reservation is
    /// released, so the two writes always land together or not at all.
    async fn bind_agent(
        &self,
        call_id: &str,
        agent_id: &str,
        department: &str,
        via_transfer: bool,
    ) -> Result<()> {
        let Some(entry) = self.ledger.get(call_id).await else {
            self.registry.release(agent_id);
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        };
        let mut guard = entry.lock().await;
        if guard.call.status.is_terminal() {
            // cancelled while routing: roll the reservation back
            drop(guard);
            self.registry.release(agent_id);
            return Ok(());
        }
        if via_transfer && guard.call.status == CallStatus::InProgress {
            if let Err(e) = guard.transition(
                ACTOR,
                CallStatus::Transferred,
                Some(format!("transfer to agent {}", agent_id)),
            ) {
                drop(guard);
                self.registry.release(agent_id);
                return Err(e);
            }
        } else {
            guard.annotate(ACTOR, format!("agent {} assigned", agent_id));
        }
        guard.call.agent_id = Some(agent_id.to_string());
        guard.call.department = Some(department.to_string());
        guard.call.routing_attempts += 1;
        let correlation_id = guard.call.correlation_id.clone();
        drop(guard);

        self.set_path(call_id, HandlingPath::AgentAssigned);
        if via_transfer {
            self.arm_accept_watchdog(call_id, agent_id);
        }
        self.send(CarrierCommand::Dial {
            correlation_id,
            target: DialTarget::AgentEndpoint(agent_id.to_string()),
        });
        Ok(())
    }

    async fn mark_queued(&self, call_id: &str, queue_entry: QueueEntry) -> Result<()> {
        let Some(entry) = self.ledger.get(call_id).await else {
            // cancelled while routing: no dangling queue entry
            self.queue.remove_call(call_id);
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        };
        let mut guard = entry.lock().await;
        if guard.call.status.is_terminal() {
            drop(guard);
            self.queue.remove_call(call_id);
            return Ok(());
        }
        guard.call.department = Some(queue_entry.department.clone());
        guard.annotate(
            ACTOR,
            format!(
                "queued in {} (priority {})",
                queue_entry.department, queue_entry.priority
            ),
        );
        let correlation_id = guard.call.correlation_id.clone();
        drop(guard);

        self.set_path(call_id, HandlingPath::Queued);
        self.send(CarrierCommand::Hold { correlation_id });
        Ok(())
    }

    /// Last-resort path: never a silent drop. The caller hears the
    /// voicemail prompt and the call is marked accordingly.
    pub async fn voicemail(&self, call_id: &str, reason: &str) -> Result<()> {
        let Some(entry) = self.ledger.get(call_id).await else {
            return Err(EngineError::NotFound(format!("call {}", call_id)));
        };
        let mut guard = entry.lock().await;
        guard.set_resolution("voicemail");
        guard.annotate(ACTOR, format!("voicemail fallback: {}", reason));
        let correlation_id = guard.call.correlation_id.clone();
        drop(guard);

        self.set_path(call_id, HandlingPath::Voicemail);
        self.send(CarrierCommand::PlayAudio {
            correlation_id: correlation_id.clone(),
            prompt: "voicemail_greeting".to_string(),
        });
        self.send(CarrierCommand::StartRecording { correlation_id });
        Ok(())
    }

    /// Arm a grace timer for the agent to accept. If it fires before
    /// the agent answers, the call is re-routed to the next-best
    /// target instead of sitting in transferred limbo.
    fn arm_accept_watchdog(&self, call_id: &str, agent_id: &str) {
        let generation = {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            let state = paths.entry(call_id.to_string()).or_default();
            state.accept_generation += 1;
            state.pending_agent = Some(agent_id.to_string());
            state.accept_generation
        };
        let Some(coordinator) = self.me.upgrade() else {
            return;
        };
        let call_id = call_id.to_string();
        let agent_id = agent_id.to_string();
        let grace = Duration::from_secs(self.config.accept_grace_secs);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            coordinator
                .handle_accept_timeout(&call_id, &agent_id, generation)
                .await;
        });
    }

    pub async fn handle_accept_timeout(
        &self,
        call_id: &str,
        agent_id: &str,
        generation: u64,
    ) {
        let stale = {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            match paths.get_mut(call_id) {
                Some(state)
                    if state.accept_generation == generation
                        && state.pending_agent.as_deref() == Some(agent_id) =>
                {
                    state.pending_agent = None;
                    false
                }
                _ => true,
            }
        };
        if stale {
            return;
        }
        warn!(call_id, agent_id, "agent did not accept within grace period, re-routing");
        self.registry.release(agent_id);
        if let Some(entry) = self.ledger.get(call_id).await {
            let mut guard = entry.lock().await;
            if guard.call.status.is_terminal() {
                return;
            }
            guard.call.agent_id = None;
            guard.annotate(ACTOR, format!("agent {} missed accept window", agent_id));
            if guard.call.status == CallStatus::Transferred {
                let _ =
                    guard.transition(ACTOR, CallStatus::InProgress, Some("transfer retry".into()));
            }
            drop(guard);
            if let Err(e) = self.route_call(call_id, None, true).await {
                warn!(call_id, error = %e, "re-route after missed accept failed");
            }
        }
    }

    /// The transferred-to agent answered inside the grace window.
    pub async fn agent_answered(&self, call_id: &str) {
        {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = paths.get_mut(call_id) {
                state.pending_agent = None;
                state.accept_generation += 1;
            }
        }
        if let Some(entry) = self.ledger.get(call_id).await {
            let mut guard = entry.lock().await;
            if guard.call.status == CallStatus::Transferred {
                let _ = guard.transition(ACTOR, CallStatus::InProgress, Some("agent answered".into()));
            }
        }
    }

    /// Queue expiries surfaced by the sweeper. Each one takes the
    /// voicemail fallback.
    pub async fn handle_expired(&self, expired: Vec<QueueEntry>) {
        for entry in expired {
            info!(call_id = %entry.call_id, department = %entry.department, "queue entry expired");
            if let Some(call) = self.ledger.get(&entry.call_id).await {
                let mut guard = call.lock().await;
                guard.annotate(ACTOR, format!("queue wait exceeded in {}", entry.department));
            }
            if let Err(e) = self.voicemail(&entry.call_id, "queue timeout").await {
                warn!(call_id = %entry.call_id, error = %e, "voicemail fallback failed");
            }
        }
    }

    /// An agent slot freed up: dispatch the next waiting call for the
    /// department, if any.
    pub async fn dispatch_queue(&self, tenant_id: &str, department: &str) {
        let Some(queue_entry) = self.queue.dequeue(tenant_id, department) else {
            return;
        };
        self.queue
            .record_clear_time(tenant_id, department, queue_entry.wait_time());
        let call_id = queue_entry.call_id.clone();
        if let Err(e) = self.route_call(&call_id, None, false).await {
            warn!(call_id, error = %e, "dispatch from queue failed");
        }
    }

    /// Terminal cleanup on `call.ended`: release the agent slot,
    /// discard any queue entry, close out the path state and feed the
    /// behavior tracker.
    pub async fn finalize(&self, call_id: &str) {
        let removed = self.queue.remove_call(call_id);
        let snapshot = self.ledger.snapshot(call_id).await;
        {
            let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
            paths.remove(call_id);
        }
        let Some(call) = snapshot else {
            return;
        };
        if removed.is_some() {
            info!(call_id, "queued call ended before dispatch");
        }
        if let Some(agent_id) = &call.agent_id {
            self.registry.release(agent_id);
            if let Some(dept) = &call.department {
                self.dispatch_queue(&call.tenant_id, dept).await;
            }
        }
        let duration = call.talk_time_secs().unwrap_or(0).max(0) as u64;
        self.spam
            .record_call_end(&call.tenant_id, &call.from_number, duration, Utc::now());
    }
}
