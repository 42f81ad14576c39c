use crate::ai::{HttpInferenceClient, InferenceClient, UnconfiguredInferenceClient};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result as EngineResult};
use crate::event::{
    CarrierCommand, CarrierEvent, CommandReceiver, CommandSender, EndReason,
};
use crate::ledger::{CallLedger, CallStatus};
use crate::queue::CallQueue;
use crate::routing::{Agent, AgentRegistry, Router as CallRouter};
use crate::spam::{BehaviorTracker, CallContext, SpamAction, SpamRuleEngine};
use anyhow::Result;
use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const ACTOR_CARRIER: &str = "carrier";
const ACTOR_GATE: &str = "spam_gate";

/// Elevated queue/routing priority for VIP callers.
pub const VIP_PRIORITY: u8 = 10;

/// Trailing window for caller behavior history.
const BEHAVIOR_WINDOW_SECS: u64 = 3600;

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub ledger: Arc<CallLedger>,
    pub queue: Arc<CallQueue>,
    pub registry: Arc<AgentRegistry>,
    pub spam: Arc<SpamRuleEngine>,
    pub call_router: Arc<CallRouter>,
    pub coordinator: Arc<Coordinator>,
    commands: CommandSender,
    commands_rx: Mutex<Option<CommandReceiver>>,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    pub inference: Option<Arc<dyn InferenceClient>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            inference: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn inference(mut self, inference: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();
        let ledger = Arc::new(CallLedger::new());
        let queue = Arc::new(CallQueue::new());
        let registry = Arc::new(AgentRegistry::new());
        let behavior = Arc::new(BehaviorTracker::new(BEHAVIOR_WINDOW_SECS));
        let spam = Arc::new(SpamRuleEngine::new(
            Duration::from_secs(config.rule_cache_ttl_secs),
            behavior,
        ));

        // seed agents and rules from tenant configuration; a malformed
        // seed rule is a startup error, not something to evaluate around
        for tenant in &config.tenants {
            for seed in &tenant.agents {
                registry.upsert(Agent::from_seed(&tenant.id, seed));
            }
            for def in &tenant.spam_rules {
                spam.add_rule(&tenant.id, def.clone())
                    .map_err(|e| anyhow::anyhow!("tenant {}: {}", tenant.id, e))?;
            }
        }

        let inference: Arc<dyn InferenceClient> = match self.inference {
            Some(client) => client,
            None => match HttpInferenceClient::new(&config.ai) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    warn!(error = %e, "ai collaborator unavailable, calls will route to humans");
                    Arc::new(UnconfiguredInferenceClient)
                }
            },
        };

        let call_router = Arc::new(CallRouter::new(
            config.clone(),
            registry.clone(),
            queue.clone(),
        ));
        let (commands, commands_rx) = tokio::sync::mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            config.clone(),
            ledger.clone(),
            queue.clone(),
            registry.clone(),
            call_router.clone(),
            spam.clone(),
            inference,
            commands.clone(),
        );

        Ok(Arc::new(AppStateInner {
            config,
            token,
            ledger,
            queue,
            registry,
            spam,
            call_router,
            coordinator,
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
        }))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppStateInner {
    fn send(&self, command: CarrierCommand) {
        if self.commands.send(command).is_err() {
            warn!("carrier command channel closed");
        }
    }

    /// Hand the outbound command stream to a gateway adapter. `run`
    /// drains it into the log when nobody has claimed it.
    pub fn take_command_receiver(&self) -> Option<CommandReceiver> {
        self.commands_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Entry point for every carrier event.
    pub async fn dispatch_carrier_event(&self, event: CarrierEvent) -> EngineResult<()> {
        match event {
            CarrierEvent::Initiated {
                correlation_id,
                tenant_id,
                direction,
                from_number,
                to_number,
                requested_department,
            } => {
                self.handle_initiated(
                    &correlation_id,
                    &tenant_id,
                    direction,
                    &from_number,
                    &to_number,
                    requested_department,
                )
                .await
            }
            CarrierEvent::Ringing { correlation_id } => {
                let entry = self.entry_for(&correlation_id).await?;
                let mut guard = entry.lock().await;
                guard.transition(ACTOR_CARRIER, CallStatus::Ringing, None)
            }
            CarrierEvent::Answered {
                correlation_id,
                agent_id,
            } => {
                let entry = self.entry_for(&correlation_id).await?;
                let call_id = {
                    let mut guard = entry.lock().await;
                    if guard.call.status != CallStatus::InProgress {
                        guard.transition(ACTOR_CARRIER, CallStatus::InProgress, None)?;
                    }
                    guard.call.id.clone()
                };
                if agent_id.is_some() {
                    self.coordinator.agent_answered(&call_id).await;
                }
                Ok(())
            }
            CarrierEvent::Ended {
                correlation_id,
                reason,
            } => self.handle_ended(&correlation_id, reason).await,
            CarrierEvent::Dtmf {
                correlation_id,
                digits,
            } => {
                let entry = self.entry_for(&correlation_id).await?;
                let mut guard = entry.lock().await;
                guard.annotate(ACTOR_CARRIER, format!("dtmf: {}", digits));
                Ok(())
            }
            CarrierEvent::Speech {
                correlation_id,
                text,
            } => {
                let entry = self.entry_for(&correlation_id).await?;
                let call_id = entry.lock().await.call.id.clone();
                self.coordinator.handle_speech(&call_id, &text).await
            }
        }
    }

    async fn entry_for(&self, correlation_id: &str) -> EngineResult<crate::ledger::CallEntryRef> {
        self.ledger
            .find_by_correlation(correlation_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("correlation {}", correlation_id)))
    }

    /// Intake path: spam gate first; allowed calls get a ledger entry
    /// and either the AI path or an immediate human route.
    async fn handle_initiated(
        &self,
        correlation_id: &str,
        tenant_id: &str,
        direction: crate::event::CallDirection,
        from_number: &str,
        to_number: &str,
        requested_department: Option<String>,
    ) -> EngineResult<()> {
        let Some(tenant) = self.config.tenant(tenant_id) else {
            return Err(EngineError::Validation(format!(
                "unknown tenant {}",
                tenant_id
            )));
        };

        let verdict = self.spam.evaluate(
            tenant_id,
            from_number,
            &CallContext { transcript: None },
            Utc::now(),
        );

        if verdict.action == SpamAction::Block {
            info!(
                tenant_id,
                from_number,
                score = verdict.score,
                "call blocked at the gate"
            );
            self.send(CarrierCommand::PlayAudio {
                correlation_id: correlation_id.to_string(),
                prompt: "spam_blocked".to_string(),
            });
            self.send(CarrierCommand::Hangup {
                correlation_id: correlation_id.to_string(),
                reason: Some("blocked".to_string()),
            });
            return Ok(());
        }

        let entry = self
            .ledger
            .create(tenant_id, correlation_id, direction, from_number, to_number)
            .await;
        let call_id = {
            let mut guard = entry.lock().await;
            guard.call.spam_score = verdict.score;
            guard.call.spam_reasons = verdict.reasons.clone();
            guard.call.is_vip = tenant.is_vip(from_number);
            if guard.call.is_vip {
                guard.call.priority = VIP_PRIORITY;
            }
            if let Some(dept) = requested_department {
                if tenant.department(&dept).is_some() {
                    guard.call.department = Some(dept);
                }
            }
            if !verdict.triggered_rule_ids.is_empty() {
                guard.annotate(
                    ACTOR_GATE,
                    format!(
                        "spam score {:.2}, action {:?}",
                        verdict.score, verdict.action
                    ),
                );
            }
            guard.call.id.clone()
        };

        if verdict.action == SpamAction::Challenge {
            self.send(CarrierCommand::PlayAudio {
                correlation_id: correlation_id.to_string(),
                prompt: "spam_challenge".to_string(),
            });
        }

        if tenant.ai_enabled {
            self.coordinator.start_ai_handling(&call_id).await;
        } else {
            self.coordinator.route_call(&call_id, None, false).await?;
        }
        Ok(())
    }

    async fn handle_ended(&self, correlation_id: &str, reason: EndReason) -> EngineResult<()> {
        let entry = self.entry_for(correlation_id).await?;
        let call_id = {
            let mut guard = entry.lock().await;
            if !guard.call.status.is_terminal() {
                let mut target = match reason {
                    EndReason::Completed => CallStatus::Completed,
                    EndReason::Failed => CallStatus::Failed,
                    EndReason::NoAnswer => CallStatus::NoAnswer,
                    EndReason::Busy => CallStatus::Busy,
                    EndReason::Cancelled => CallStatus::Cancelled,
                };
                // a call that never got established cannot complete;
                // the caller simply went away
                if target == CallStatus::Completed
                    && !guard.call.status.can_transition_to(CallStatus::Completed)
                {
                    target = CallStatus::Cancelled;
                }
                guard.transition(
                    ACTOR_CARRIER,
                    target,
                    Some(format!("carrier reported {:?}", reason)),
                )?;
            }
            guard.call.id.clone()
        };
        self.coordinator.finalize(&call_id).await;
        Ok(())
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();

    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };

    // queue expiry sweeper: expired entries are surfaced to the
    // coordinator, never dropped in place
    let sweeper_state = state.clone();
    let sweeper_token = token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            sweeper_state.config.queue_sweep_interval_secs,
        ));
        loop {
            select! {
                _ = interval.tick() => {
                    let expired = sweeper_state.queue.drain_expired();
                    if !expired.is_empty() {
                        sweeper_state.coordinator.handle_expired(expired).await;
                    }
                }
                _ = sweeper_token.cancelled() => break,
            }
        }
    });

    // default command drain: log outbound commands until a gateway
    // adapter claims the receiver
    if let Some(mut rx) = state.take_command_receiver() {
        let drain_token = token.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    command = rx.recv() => match command {
                        Some(command) => info!(?command, "carrier command"),
                        None => break,
                    },
                    _ = drain_token.cancelled() => break,
                }
            }
        });
    }

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    Ok(())
}

fn create_router(state: AppState) -> Router {
    use tower_http::cors::{AllowOrigin, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    crate::handler::router().with_state(state).layer(cors)
}
