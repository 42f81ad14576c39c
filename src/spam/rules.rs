use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

static NON_DIAL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9+]").unwrap());

/// Strip separators so number comparisons work across formatting.
pub fn normalize_number(number: &str) -> String {
    NON_DIAL_CHARS.replace_all(number, "").to_string()
}

/// Recommended handling for a caller, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamAction {
    Allow,
    Flag,
    Challenge,
    Block,
}

impl Default for SpamAction {
    fn default() -> Self {
        SpamAction::Flag
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpamRuleKind {
    /// Substring match against available call context text.
    Keyword,
    /// Regex match against available call context text.
    Pattern,
    /// Substring or regex match against the caller number.
    Number,
    /// Derived from recent call history for the caller number.
    Behavior,
}

/// Daily applicability window in tenant-local hours. A window whose
/// end precedes its start wraps midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl TimeWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now + ChronoDuration::minutes(self.utc_offset_minutes as i64);
        let hour = local.hour() as u8;
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Serializable rule definition, as configured by a tenant or posted
/// through the admin surface. Validated into a [`SpamRule`] before it
/// can reach evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamRuleDef {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: SpamRuleKind,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub case_sensitive: bool,
    /// 1..=100, contributes `weight/100 * confidence` per match.
    pub weight: u32,
    #[serde(default)]
    pub action: SpamAction,
    #[serde(default)]
    pub apply_to_numbers: Vec<String>,
    #[serde(default)]
    pub exclude_numbers: Vec<String>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    /// Behavior rules trigger once the behavior sub-score reaches this.
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

/// A validated, evaluation-ready rule. Match bookkeeping uses atomics
/// so concurrent evaluations never lose updates; confidence moves only
/// through feedback.
#[derive(Debug)]
pub struct SpamRule {
    pub id: String,
    pub tenant_id: String,
    pub kind: SpamRuleKind,
    pub pattern: String,
    pub is_regex: bool,
    pub case_sensitive: bool,
    pub weight: u32,
    pub action: SpamAction,
    pub apply_to_numbers: Vec<String>,
    pub exclude_numbers: Vec<String>,
    pub time_window: Option<TimeWindow>,
    pub behavior_threshold: f64,
    compiled: Option<Regex>,
    confidence: RwLock<f64>,
    active: AtomicBool,
    match_count: AtomicU64,
    false_positive_count: AtomicU64,
    last_matched_ms: AtomicU64,
}

pub const CONFIDENCE_MIN: f64 = 0.1;
pub const CONFIDENCE_MAX: f64 = 1.0;
pub const CONFIRM_DELTA: f64 = 0.01;
pub const DENY_DELTA: f64 = -0.05;

impl SpamRule {
    /// Validate and compile a definition. Malformed rules are rejected
    /// here and never reach evaluation.
    pub fn from_def(tenant_id: &str, def: SpamRuleDef) -> Result<Self> {
        if def.weight < 1 || def.weight > 100 {
            return Err(EngineError::invalid_rule(format!(
                "weight must be within 1..=100, got {}",
                def.weight
            )));
        }
        if !(CONFIDENCE_MIN..=CONFIDENCE_MAX).contains(&def.confidence) {
            return Err(EngineError::invalid_rule(format!(
                "confidence must be within [{}, {}], got {}",
                CONFIDENCE_MIN, CONFIDENCE_MAX, def.confidence
            )));
        }
        let needs_pattern = !matches!(def.kind, SpamRuleKind::Behavior);
        if needs_pattern && def.pattern.trim().is_empty() {
            return Err(EngineError::invalid_rule("pattern must not be empty"));
        }
        if let Some(window) = &def.time_window {
            if window.start_hour > 23 || window.end_hour > 23 {
                return Err(EngineError::invalid_rule(
                    "time window hours must be within 0..=23",
                ));
            }
        }

        let wants_regex = def.is_regex || matches!(def.kind, SpamRuleKind::Pattern);
        let compiled = if needs_pattern && wants_regex {
            let regex = RegexBuilder::new(&def.pattern)
                .case_insensitive(!def.case_sensitive)
                .build()
                .map_err(|e| EngineError::invalid_rule(format!("bad regex: {}", e)))?;
            Some(regex)
        } else {
            None
        };

        Ok(Self {
            id: def
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tenant_id: tenant_id.to_string(),
            kind: def.kind,
            pattern: def.pattern,
            is_regex: wants_regex,
            case_sensitive: def.case_sensitive,
            weight: def.weight,
            action: def.action,
            apply_to_numbers: def.apply_to_numbers.iter().map(|n| normalize_number(n)).collect(),
            exclude_numbers: def.exclude_numbers.iter().map(|n| normalize_number(n)).collect(),
            time_window: def.time_window,
            behavior_threshold: def.threshold.unwrap_or(0.5),
            compiled,
            confidence: RwLock::new(def.confidence),
            active: AtomicBool::new(true),
            match_count: AtomicU64::new(0),
            false_positive_count: AtomicU64::new(0),
            last_matched_ms: AtomicU64::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Soft delete. Rules with match history are never hard-deleted.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn confidence(&self) -> f64 {
        *self.confidence.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }

    pub fn false_positive_count(&self) -> u64 {
        self.false_positive_count.load(Ordering::Relaxed)
    }

    /// Applicability gate: number allow/exclude lists and time window.
    pub fn applies_to(&self, number: &str, now: DateTime<Utc>) -> bool {
        let number = normalize_number(number);
        if !self.apply_to_numbers.is_empty() && !self.apply_to_numbers.contains(&number) {
            return false;
        }
        if self.exclude_numbers.contains(&number) {
            return false;
        }
        if let Some(window) = &self.time_window {
            if !window.contains(now) {
                return false;
            }
        }
        true
    }

    /// Match against caller number or context text. Behavior rules do
    /// not match text; the engine scores them from call history.
    pub fn matches(&self, number: &str, context_text: Option<&str>) -> bool {
        match self.kind {
            SpamRuleKind::Keyword => match context_text {
                Some(text) => self.matches_text(text),
                None => false,
            },
            SpamRuleKind::Pattern => match context_text {
                Some(text) => self
                    .compiled
                    .as_ref()
                    .map(|re| re.is_match(text))
                    .unwrap_or(false),
                None => false,
            },
            SpamRuleKind::Number => self.matches_text(&normalize_number(number)),
            SpamRuleKind::Behavior => false,
        }
    }

    fn matches_text(&self, text: &str) -> bool {
        if let Some(re) = &self.compiled {
            return re.is_match(text);
        }
        if self.case_sensitive {
            text.contains(&self.pattern)
        } else {
            text.to_lowercase().contains(&self.pattern.to_lowercase())
        }
    }

    pub fn record_match(&self, now_ms: u64) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
        self.last_matched_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Nudge confidence from a feedback report, clamped to
    /// [CONFIDENCE_MIN, CONFIDENCE_MAX].
    pub fn apply_feedback(&self, confirmed_spam: bool) {
        let delta = if confirmed_spam {
            CONFIRM_DELTA
        } else {
            self.false_positive_count.fetch_add(1, Ordering::Relaxed);
            DENY_DELTA
        };
        let mut guard = self.confidence.write().unwrap_or_else(|e| e.into_inner());
        *guard = (*guard + delta).clamp(CONFIDENCE_MIN, CONFIDENCE_MAX);
    }

    pub fn view(&self) -> SpamRuleView {
        SpamRuleView {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            kind: self.kind,
            pattern: self.pattern.clone(),
            weight: self.weight,
            action: self.action,
            is_active: self.is_active(),
            confidence: self.confidence(),
            match_count: self.match_count(),
            false_positive_count: self.false_positive_count(),
            last_matched_ms: self.last_matched_ms.load(Ordering::Relaxed),
        }
    }
}

/// Read-only snapshot for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamRuleView {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: SpamRuleKind,
    pub pattern: String,
    pub weight: u32,
    pub action: SpamAction,
    pub is_active: bool,
    pub confidence: f64,
    pub match_count: u64,
    pub false_positive_count: u64,
    pub last_matched_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn keyword_def(pattern: &str, weight: u32) -> SpamRuleDef {
        SpamRuleDef {
            id: None,
            kind: SpamRuleKind::Keyword,
            pattern: pattern.to_string(),
            is_regex: false,
            case_sensitive: false,
            weight,
            action: SpamAction::Flag,
            apply_to_numbers: vec![],
            exclude_numbers: vec![],
            time_window: None,
            threshold: None,
            confidence: 0.8,
        }
    }

    #[test]
    fn test_keyword_match_case_insensitive() {
        let rule = SpamRule::from_def("acme", keyword_def("free insurance", 50)).unwrap();
        assert!(rule.matches("+15550100", Some("ask about FREE Insurance now")));
        assert!(!rule.matches("+15550100", Some("regular support question")));
        assert!(!rule.matches("+15550100", None));
    }

    #[test]
    fn test_bad_regex_rejected_at_creation() {
        let mut def = keyword_def("([invalid", 50);
        def.kind = SpamRuleKind::Pattern;
        let err = SpamRule::from_def("acme", def).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        assert!(SpamRule::from_def("acme", keyword_def("x", 0)).is_err());
        assert!(SpamRule::from_def("acme", keyword_def("x", 101)).is_err());
        assert!(SpamRule::from_def("acme", keyword_def("x", 100)).is_ok());
    }

    #[test]
    fn test_number_rule_normalizes_formatting() {
        let mut def = keyword_def("+1555010", 40);
        def.kind = SpamRuleKind::Number;
        let rule = SpamRule::from_def("acme", def).unwrap();
        assert!(rule.matches("+1 (555) 010-0123", None));
        assert!(!rule.matches("+1 (666) 010-0123", None));
    }

    #[test]
    fn test_exclude_list_wins() {
        let mut def = keyword_def("free", 40);
        def.exclude_numbers = vec!["+15550100".to_string()];
        let rule = SpamRule::from_def("acme", def).unwrap();
        let now = Utc::now();
        assert!(!rule.applies_to("+1 555 0100", now));
        assert!(rule.applies_to("+15550199", now));
    }

    #[test]
    fn test_time_window_gates_applicability() {
        let mut def = keyword_def("free", 40);
        def.time_window = Some(TimeWindow {
            start_hour: 9,
            end_hour: 17,
            utc_offset_minutes: 0,
        });
        let rule = SpamRule::from_def("acme", def).unwrap();
        let inside = Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2025, 6, 4, 20, 0, 0).unwrap();
        assert!(rule.applies_to("+15550100", inside));
        assert!(!rule.applies_to("+15550100", outside));
    }

    #[test]
    fn test_feedback_clamps_confidence() {
        let rule = SpamRule::from_def("acme", keyword_def("free", 50)).unwrap();
        for _ in 0..100 {
            rule.apply_feedback(true);
        }
        assert!((rule.confidence() - CONFIDENCE_MAX).abs() < 1e-9);
        for _ in 0..100 {
            rule.apply_feedback(false);
        }
        assert!((rule.confidence() - CONFIDENCE_MIN).abs() < 1e-9);
        assert_eq!(rule.false_positive_count(), 100);
    }

    #[test]
    fn test_action_severity_order() {
        assert!(SpamAction::Allow < SpamAction::Flag);
        assert!(SpamAction::Flag < SpamAction::Challenge);
        assert!(SpamAction::Challenge < SpamAction::Block);
    }
}
