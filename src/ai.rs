use crate::config::AiConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// One turn of caller speech handed to the inference collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub call_id: String,
    pub utterance: String,
    pub context: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceAction {
    Continue,
    Resolve,
    Transfer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceReply {
    pub intent: Option<String>,
    pub reply_text: String,
    pub confidence: f64,
    pub action: InferenceAction,
}

/// Boundary to the conversational AI service. The coordinator treats
/// `Transfer` and low confidence identically to a human-initiated
/// transfer request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceReply>;
}

/// HTTP implementation. Inference is idempotent, so transport faults
/// are retried with bounded, jittered backoff.
#[derive(Debug)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpInferenceClient {
    pub fn new(config: &AiConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var("CALLGATE_AI_ENDPOINT").ok())
            .ok_or_else(|| EngineError::Validation("ai endpoint is not configured".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::ExternalService(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceReply> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let jitter_ms = rand::rng().random_range(0..250u64);
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt - 1) + jitter_ms);
                tokio::time::sleep(backoff).await;
            }
            match self.client.post(&self.endpoint).json(request).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => {
                        return response
                            .json::<InferenceReply>()
                            .await
                            .map_err(|e| EngineError::ExternalService(e.to_string()));
                    }
                    Err(e) => {
                        warn!(call_id = %request.call_id, attempt, error = %e, "inference request rejected");
                        last_error = Some(e.to_string());
                    }
                },
                Err(e) => {
                    warn!(call_id = %request.call_id, attempt, error = %e, "inference request failed");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(EngineError::ExternalService(
            last_error.unwrap_or_else(|| "inference unavailable".to_string()),
        ))
    }
}

/// Stand-in when no endpoint is configured. Every request fails as an
/// external-service fault, which the coordinator degrades to a human
/// transfer, so calls are still handled.
pub struct UnconfiguredInferenceClient;

#[async_trait]
impl InferenceClient for UnconfiguredInferenceClient {
    async fn infer(&self, _request: &InferenceRequest) -> Result<InferenceReply> {
        Err(EngineError::ExternalService(
            "ai endpoint is not configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_deserializes_camel_case() {
        let json = r#"{"intent":"billing","replyText":"Sure, let me check.","confidence":0.92,"action":"continue"}"#;
        let reply: InferenceReply = serde_json::from_str(json).unwrap();
        assert_eq!(reply.intent.as_deref(), Some("billing"));
        assert_eq!(reply.action, InferenceAction::Continue);
        assert!(reply.confidence > 0.9);
    }

    #[test]
    fn test_missing_endpoint_is_validation_error() {
        std::env::remove_var("CALLGATE_AI_ENDPOINT");
        let err = HttpInferenceClient::new(&AiConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
