use serde::{Deserialize, Serialize};

/// Call-lifecycle events delivered by the carrier gateway. Every event
/// carries the carrier correlation id used to look up or create the
/// ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum CarrierEvent {
    #[serde(rename = "call.initiated")]
    Initiated {
        correlation_id: String,
        tenant_id: String,
        direction: CallDirection,
        from_number: String,
        to_number: String,
        #[serde(default)]
        requested_department: Option<String>,
    },

    #[serde(rename = "call.ringing")]
    Ringing { correlation_id: String },

    #[serde(rename = "call.answered")]
    Answered {
        correlation_id: String,
        /// Set when the answering party is an agent endpoint rather
        /// than the caller leg.
        #[serde(default)]
        agent_id: Option<String>,
    },

    #[serde(rename = "call.ended")]
    Ended {
        correlation_id: String,
        reason: EndReason,
    },

    #[serde(rename = "call.dtmf")]
    Dtmf {
        correlation_id: String,
        digits: String,
    },

    #[serde(rename = "call.speech")]
    Speech {
        correlation_id: String,
        text: String,
    },
}

impl CarrierEvent {
    pub fn correlation_id(&self) -> &str {
        match self {
            CarrierEvent::Initiated { correlation_id, .. } => correlation_id,
            CarrierEvent::Ringing { correlation_id } => correlation_id,
            CarrierEvent::Answered { correlation_id, .. } => correlation_id,
            CarrierEvent::Ended { correlation_id, .. } => correlation_id,
            CarrierEvent::Dtmf { correlation_id, .. } => correlation_id,
            CarrierEvent::Speech { correlation_id, .. } => correlation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Carrier-reported reason for `call.ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Cancelled,
}

/// Intent-level commands issued to the carrier gateway. The core never
/// touches audio or media directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum CarrierCommand {
    Dial {
        correlation_id: String,
        target: DialTarget,
    },
    PlayAudio {
        correlation_id: String,
        /// Prompt id or literal text, resolved by the gateway.
        prompt: String,
    },
    Hold {
        correlation_id: String,
    },
    Hangup {
        correlation_id: String,
        reason: Option<String>,
    },
    StartRecording {
        correlation_id: String,
    },
    StopRecording {
        correlation_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DialTarget {
    Number(String),
    AgentEndpoint(String),
}

pub type CommandSender = tokio::sync::mpsc::UnboundedSender<CarrierCommand>;
pub type CommandReceiver = tokio::sync::mpsc::UnboundedReceiver<CarrierCommand>;
