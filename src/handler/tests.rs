use crate::ai::{InferenceAction, InferenceReply, MockInferenceClient};
use crate::app::{AppState, AppStateBuilder};
use crate::config::Config;
use crate::error::EngineError;
use crate::event::{CallDirection, CarrierEvent, EndReason};
use crate::ledger::CallStatus;
use std::sync::Arc;

fn test_config(ai_enabled: bool) -> Config {
    let toml_str = format!(
        r#"
http_addr = "127.0.0.1:0"
accept_grace_secs = 1

[[tenants]]
id = "acme"
default_department = "support"
ai_enabled = {}
vip_numbers = ["+15559999"]

[[tenants.spam_rules]]
type = "number"
pattern = "+15666"
weight = 100
action = "block"
confidence = 1.0

[[tenants.spam_rules]]
type = "keyword"
pattern = "free insurance"
weight = 50
action = "flag"

[[tenants.departments]]
name = "support"
strategy = "least_busy"
max_queue_size = 2
max_wait_secs = 120

[[tenants.agents]]
id = "agent-1"
department = "support"
max_concurrent_calls = 1
"#,
        ai_enabled
    );
    toml::from_str(&toml_str).unwrap()
}

fn state_with(ai_enabled: bool, inference: MockInferenceClient) -> AppState {
    AppStateBuilder::new()
        .config(test_config(ai_enabled))
        .inference(Arc::new(inference))
        .build()
        .unwrap()
}

fn initiated(correlation_id: &str, from: &str) -> CarrierEvent {
    CarrierEvent::Initiated {
        correlation_id: correlation_id.to_string(),
        tenant_id: "acme".to_string(),
        direction: CallDirection::Inbound,
        from_number: from.to_string(),
        to_number: "+15550199".to_string(),
        requested_department: None,
    }
}

#[tokio::test]
async fn test_blocked_caller_creates_no_ledger_entry() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15666000"))
        .await
        .unwrap();
    assert!(state.ledger.find_by_correlation("corr-1").await.is_none());
}

#[tokio::test]
async fn test_inbound_call_routes_to_agent_and_completes() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15550100"))
        .await
        .unwrap();

    let entry = state.ledger.find_by_correlation("corr-1").await.unwrap();
    let call_id = entry.lock().await.call.id.clone();
    let call = state.ledger.snapshot(&call_id).await.unwrap();
    assert_eq!(call.agent_id.as_deref(), Some("agent-1"));
    assert_eq!(call.department.as_deref(), Some("support"));
    assert_eq!(state.registry.get("agent-1").unwrap().current_calls, 1);

    state
        .dispatch_carrier_event(CarrierEvent::Ringing {
            correlation_id: "corr-1".to_string(),
        })
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Answered {
            correlation_id: "corr-1".to_string(),
            agent_id: None,
        })
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Ended {
            correlation_id: "corr-1".to_string(),
            reason: EndReason::Completed,
        })
        .await
        .unwrap();

    let call = state.ledger.snapshot(&call_id).await.unwrap();
    assert_eq!(call.status, CallStatus::Completed);
    assert!(call.ended_at.is_some());
    // slot released on completion
    assert_eq!(state.registry.get("agent-1").unwrap().current_calls, 0);
}

#[tokio::test]
async fn test_second_call_queues_when_agent_busy() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15550100"))
        .await
        .unwrap();
    state
        .dispatch_carrier_event(initiated("corr-2", "+15550101"))
        .await
        .unwrap();

    assert_eq!(state.queue.depth("acme", "support"), 1);
    let entry = state.ledger.find_by_correlation("corr-2").await.unwrap();
    let guard = entry.lock().await;
    assert!(guard.call.agent_id.is_none());
    assert!(guard
        .events
        .iter()
        .any(|e| e.reason.as_deref().map_or(false, |r| r.contains("queued"))));
}

#[tokio::test]
async fn test_vip_caller_gets_priority() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15559999"))
        .await
        .unwrap();
    let entry = state.ledger.find_by_correlation("corr-1").await.unwrap();
    let guard = entry.lock().await;
    assert!(guard.call.is_vip);
    assert!(guard.call.priority > 0);
}

#[tokio::test]
async fn test_ai_path_handles_speech_then_transfers() {
    let mut inference = MockInferenceClient::new();
    let mut first = true;
    inference.expect_infer().returning(move |_| {
        if first {
            first = false;
            Ok(InferenceReply {
                intent: Some("greeting".to_string()),
                reply_text: "how can I help".to_string(),
                confidence: 0.9,
                action: InferenceAction::Continue,
            })
        } else {
            Ok(InferenceReply {
                intent: None,
                reply_text: String::new(),
                confidence: 0.9,
                action: InferenceAction::Transfer,
            })
        }
    });
    let state = state_with(true, inference);
    state
        .dispatch_carrier_event(initiated("corr-1", "+15550100"))
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Ringing {
            correlation_id: "corr-1".to_string(),
        })
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Answered {
            correlation_id: "corr-1".to_string(),
            agent_id: None,
        })
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Speech {
            correlation_id: "corr-1".to_string(),
            text: "hello".to_string(),
        })
        .await
        .unwrap();
    state
        .dispatch_carrier_event(CarrierEvent::Speech {
            correlation_id: "corr-1".to_string(),
            text: "give me a person".to_string(),
        })
        .await
        .unwrap();

    let entry = state.ledger.find_by_correlation("corr-1").await.unwrap();
    let guard = entry.lock().await;
    assert_eq!(guard.call.status, CallStatus::Transferred);
    assert_eq!(guard.call.agent_id.as_deref(), Some("agent-1"));
}

#[tokio::test]
async fn test_answered_without_ringing_is_consistency_error() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15550100"))
        .await
        .unwrap();
    let err = state
        .dispatch_carrier_event(CarrierEvent::Answered {
            correlation_id: "corr-1".to_string(),
            agent_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Consistency { .. }));
}

#[tokio::test]
async fn test_unknown_tenant_rejected() {
    let state = state_with(false, MockInferenceClient::new());
    let err = state
        .dispatch_carrier_event(CarrierEvent::Initiated {
            correlation_id: "corr-1".to_string(),
            tenant_id: "ghost".to_string(),
            direction: CallDirection::Inbound,
            from_number: "+15550100".to_string(),
            to_number: "+15550199".to_string(),
            requested_department: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_correlation_is_not_found() {
    let state = state_with(false, MockInferenceClient::new());
    let err = state
        .dispatch_carrier_event(CarrierEvent::Ringing {
            correlation_id: "ghost".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn test_cancellation_clears_queue_entry() {
    let state = state_with(false, MockInferenceClient::new());
    state
        .dispatch_carrier_event(initiated("corr-1", "+15550100"))
        .await
        .unwrap();
    state
        .dispatch_carrier_event(initiated("corr-2", "+15550101"))
        .await
        .unwrap();
    assert_eq!(state.queue.depth("acme", "support"), 1);

    state
        .dispatch_carrier_event(CarrierEvent::Ended {
            correlation_id: "corr-2".to_string(),
            reason: EndReason::Cancelled,
        })
        .await
        .unwrap();
    // no dangling queue entry after cancellation
    assert_eq!(state.queue.depth("acme", "support"), 0);
    let entry = state.ledger.find_by_correlation("corr-2").await.unwrap();
    assert_eq!(entry.lock().await.call.status, CallStatus::Cancelled);
}
