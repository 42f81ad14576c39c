use super::behavior::BehaviorTracker;
use super::rules::{SpamAction, SpamRule, SpamRuleDef, SpamRuleView};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RULE_BLEND: f64 = 0.7;
const BEHAVIOR_BLEND: f64 = 0.3;
const CHALLENGE_THRESHOLD: f64 = 0.7;
const BLOCK_THRESHOLD: f64 = 0.9;

/// Call context available at evaluation time. Transcript text is a
/// partial view of whatever the gateway has captured so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallContext {
    pub transcript: Option<String>,
}

/// Composite gate verdict for one caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamVerdict {
    pub score: f64,
    pub action: SpamAction,
    pub reasons: Vec<String>,
    pub triggered_rule_ids: Vec<String>,
    pub confidence: f64,
}

impl SpamVerdict {
    /// Safe default when the engine itself fails: never block traffic
    /// on an internal fault.
    pub fn allow_default() -> Self {
        Self {
            score: 0.0,
            action: SpamAction::Allow,
            reasons: vec![],
            triggered_rule_ids: vec![],
            confidence: 0.0,
        }
    }
}

/// Feedback record linking a number to the score and rules that fired,
/// with an optional human confirmation used to recalibrate confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamReport {
    pub id: String,
    pub tenant_id: String,
    pub phone_number: String,
    pub score: f64,
    pub triggered_rule_ids: Vec<String>,
    pub action_taken: SpamAction,
    pub confirmed_spam: Option<bool>,
    pub reported_at: DateTime<Utc>,
}

struct CachedRules {
    rules: Arc<Vec<Arc<SpamRule>>>,
    fetched_at: Instant,
}

/// Tenant-scoped rule store with a short-TTL evaluation cache. The
/// cache bounds staleness under call volume; rule writes invalidate
/// the owning tenant's entry immediately.
pub struct SpamRuleEngine {
    ttl: Duration,
    rules: RwLock<HashMap<String, Vec<Arc<SpamRule>>>>,
    cache: RwLock<HashMap<String, CachedRules>>,
    behavior: Arc<BehaviorTracker>,
    reports: Mutex<HashMap<String, SpamReport>>,
}

impl SpamRuleEngine {
    pub fn new(ttl: Duration, behavior: Arc<BehaviorTracker>) -> Self {
        Self {
            ttl,
            rules: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            behavior,
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn behavior(&self) -> &BehaviorTracker {
        &self.behavior
    }

    /// Validate and register a rule. Malformed definitions are
    /// rejected here and never reach evaluation.
    pub fn add_rule(&self, tenant_id: &str, def: SpamRuleDef) -> Result<String> {
        let rule = Arc::new(SpamRule::from_def(tenant_id, def)?);
        let id = rule.id.clone();
        {
            let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
            rules.entry(tenant_id.to_string()).or_default().push(rule);
        }
        self.invalidate(tenant_id);
        Ok(id)
    }

    /// Soft delete: the rule stays for audit, stops matching.
    pub fn deactivate_rule(&self, tenant_id: &str, rule_id: &str) -> Result<()> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let rule = rules
            .get(tenant_id)
            .and_then(|list| list.iter().find(|r| r.id == rule_id))
            .ok_or_else(|| EngineError::NotFound(format!("rule {}", rule_id)))?;
        rule.deactivate();
        drop(rules);
        self.invalidate(tenant_id);
        Ok(())
    }

    pub fn rules_view(&self, tenant_id: &str) -> Vec<SpamRuleView> {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        rules
            .get(tenant_id)
            .map(|list| list.iter().map(|r| r.view()).collect())
            .unwrap_or_default()
    }

    fn invalidate(&self, tenant_id: &str) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.remove(tenant_id);
    }

    fn active_rules(&self, tenant_id: &str) -> Arc<Vec<Arc<SpamRule>>> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cache.get(tenant_id) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return cached.rules.clone();
                }
            }
        }
        let snapshot: Arc<Vec<Arc<SpamRule>>> = {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            Arc::new(rules.get(tenant_id).cloned().unwrap_or_default())
        };
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            tenant_id.to_string(),
            CachedRules {
                rules: snapshot.clone(),
                fetched_at: Instant::now(),
            },
        );
        snapshot
    }

    /// Gate a caller. A failure inside the engine degrades to the safe
    /// default rather than blocking all traffic.
    pub fn evaluate(
        &self,
        tenant_id: &str,
        number: &str,
        ctx: &CallContext,
        now: DateTime<Utc>,
    ) -> SpamVerdict {
        match self.evaluate_inner(tenant_id, number, ctx, now) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(tenant_id, number, error = %e, "spam evaluation failed, allowing call");
                SpamVerdict::allow_default()
            }
        }
    }

    fn evaluate_inner(
        &self,
        tenant_id: &str,
        number: &str,
        ctx: &CallContext,
        now: DateTime<Utc>,
    ) -> Result<SpamVerdict> {
        let rules = self.active_rules(tenant_id);
        let behavior_score = self.behavior.score(tenant_id, number, now);
        let now_ms = crate::get_timestamp();

        let mut rule_score = 0.0_f64;
        let mut confidence_sum = 0.0_f64;
        let mut action = SpamAction::Allow;
        let mut reasons = Vec::new();
        let mut triggered = Vec::new();

        for rule in rules.iter() {
            if !rule.is_active() || !rule.applies_to(number, now) {
                continue;
            }
            // A single misbehaving rule must not block the gate.
            let matched = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                match rule.kind {
                    super::rules::SpamRuleKind::Behavior => {
                        behavior_score >= rule.behavior_threshold
                    }
                    _ => rule.matches(number, ctx.transcript.as_deref()),
                }
            })) {
                Ok(matched) => matched,
                Err(_) => {
                    warn!(rule_id = %rule.id, "rule evaluation panicked, skipping rule");
                    false
                }
            };
            if !matched {
                continue;
            }
            let confidence = rule.confidence();
            rule_score += rule.weight as f64 / 100.0 * confidence;
            confidence_sum += confidence;
            if rule.action > action {
                action = rule.action;
            }
            reasons.push(format!(
                "rule {} matched ({:?}: {})",
                rule.id, rule.kind, rule.pattern
            ));
            triggered.push(rule.id.clone());
            rule.record_match(now_ms);
        }

        let normalized = rule_score.min(1.0);
        let score = (RULE_BLEND * normalized + BEHAVIOR_BLEND * behavior_score).clamp(0.0, 1.0);

        if score >= BLOCK_THRESHOLD && action < SpamAction::Block {
            action = SpamAction::Block;
            reasons.push(format!("composite score {:.2} escalated action to block", score));
        } else if score >= CHALLENGE_THRESHOLD && action < SpamAction::Challenge {
            action = SpamAction::Challenge;
            reasons.push(format!(
                "composite score {:.2} escalated action to challenge",
                score
            ));
        }

        let confidence = if triggered.is_empty() {
            0.0
        } else {
            confidence_sum / triggered.len() as f64
        };

        debug!(
            tenant_id,
            number,
            score,
            ?action,
            triggered = triggered.len(),
            "spam gate evaluated"
        );

        Ok(SpamVerdict {
            score,
            action,
            reasons,
            triggered_rule_ids: triggered,
            confidence,
        })
    }

    /// Apply human feedback to the rules that fired. Idempotent per
    /// report id: replays are a no-op.
    pub fn report_outcome(&self, report: SpamReport) -> Result<()> {
        let mut reports = self.reports.lock().unwrap_or_else(|e| e.into_inner());
        if reports.contains_key(&report.id) {
            return Ok(());
        }
        if let Some(confirmed) = report.confirmed_spam {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = rules.get(&report.tenant_id) {
                for rule_id in &report.triggered_rule_ids {
                    if let Some(rule) = list.iter().find(|r| &r.id == rule_id) {
                        rule.apply_feedback(confirmed);
                    }
                }
            }
        }
        reports.insert(report.id.clone(), report);
        Ok(())
    }

    pub fn record_call_end(
        &self,
        tenant_id: &str,
        number: &str,
        duration_secs: u64,
        at: DateTime<Utc>,
    ) {
        self.behavior.record_call(tenant_id, number, duration_secs, at);
    }
}
