use crate::routing::RoutingStrategy;
use crate::spam::SpamRuleDef;
use anyhow::{anyhow, Error};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};

const USER_AGENT: &str = "callgate";

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "callgate.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// TTL of the per-tenant active-rule cache, in seconds.
    #[serde(default = "default_rule_cache_ttl")]
    pub rule_cache_ttl_secs: u64,
    /// Grace period an agent has to accept a transferred call.
    #[serde(default = "default_accept_grace")]
    pub accept_grace_secs: u64,
    /// Interval of the queue expiry sweeper.
    #[serde(default = "default_sweep_interval")]
    pub queue_sweep_interval_secs: u64,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AiConfig {
    pub endpoint: Option<String>,
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantConfig {
    pub id: String,
    pub name: Option<String>,
    pub default_department: String,
    #[serde(default = "default_max_transfer_attempts")]
    pub max_transfer_attempts: u32,
    /// Calls start on the AI handling path when true.
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    /// AI replies below this confidence are treated as transfer requests.
    #[serde(default = "default_ai_confidence")]
    pub ai_confidence_threshold: f64,
    #[serde(default)]
    pub vip_numbers: Vec<String>,
    #[serde(default)]
    pub business_hours: Option<BusinessHours>,
    #[serde(default)]
    pub departments: Vec<DepartmentConfig>,
    #[serde(default)]
    pub agents: Vec<AgentSeed>,
    #[serde(default)]
    pub spam_rules: Vec<SpamRuleDef>,
}

impl TenantConfig {
    pub fn department(&self, name: &str) -> Option<&DepartmentConfig> {
        self.departments.iter().find(|d| d.name == name)
    }

    pub fn is_vip(&self, number: &str) -> bool {
        self.vip_numbers.iter().any(|n| n == number)
    }

    /// Open when no business hours are configured.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match &self.business_hours {
            Some(hours) => hours.is_open(now),
            None => true,
        }
    }
}

/// Weekly opening window in tenant-local time, derived from a fixed
/// UTC offset. An overnight window (close before open) wraps midnight.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BusinessHours {
    #[serde(default)]
    pub utc_offset_minutes: i32,
    pub open_hour: u8,
    pub close_hour: u8,
    /// ISO weekday numbers, Monday = 1 .. Sunday = 7.
    #[serde(default = "default_weekdays")]
    pub days: Vec<u8>,
}

impl BusinessHours {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now + ChronoDuration::minutes(self.utc_offset_minutes as i64);
        let weekday = local.weekday().number_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }
        let hour = local.hour() as u8;
        if self.open_hour <= self.close_hour {
            hour >= self.open_hour && hour < self.close_hour
        } else {
            hour >= self.open_hour || hour < self.close_hour
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DepartmentConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
    /// Intent keywords that select this department from caller speech.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Skills required of agents under skills-based routing.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Department that absorbs overflow when this queue is full.
    #[serde(default)]
    pub overflow_department: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub department: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub manager_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            rule_cache_ttl_secs: default_rule_cache_ttl(),
            accept_grace_secs: default_accept_grace(),
            queue_sweep_interval_secs: default_sweep_interval(),
            ai: AiConfig::default(),
            tenants: vec![],
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_ai_timeout(),
            max_retries: default_ai_retries(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn user_agent() -> &'static str {
        USER_AGENT
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == tenant_id)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for tenant in &self.tenants {
            if tenant.department(&tenant.default_department).is_none() {
                return Err(anyhow!(
                    "tenant {}: default department '{}' is not defined",
                    tenant.id,
                    tenant.default_department
                ));
            }
            for dept in &tenant.departments {
                if let Some(overflow) = &dept.overflow_department {
                    if tenant.department(overflow).is_none() {
                        return Err(anyhow!(
                            "tenant {}: department '{}' overflows to unknown department '{}'",
                            tenant.id,
                            dept.name,
                            overflow
                        ));
                    }
                }
            }
            for agent in &tenant.agents {
                if tenant.department(&agent.department).is_none() {
                    return Err(anyhow!(
                        "tenant {}: agent '{}' references unknown department '{}'",
                        tenant.id,
                        agent.id,
                        agent.department
                    ));
                }
            }
        }
        Ok(())
    }
}

fn default_rule_cache_ttl() -> u64 {
    30
}
fn default_accept_grace() -> u64 {
    20
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_ai_timeout() -> u64 {
    10
}
fn default_ai_retries() -> u32 {
    2
}
fn default_max_transfer_attempts() -> u32 {
    3
}
fn default_ai_confidence() -> f64 {
    0.5
}
fn default_max_queue_size() -> usize {
    50
}
fn default_max_wait() -> u64 {
    300
}
fn default_max_concurrent() -> u32 {
    1
}
fn default_weight() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_weekdays() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_tenant_config() {
        let toml_str = r#"
http_addr = "0.0.0.0:8080"

[[tenants]]
id = "acme"
default_department = "support"
max_transfer_attempts = 2
vip_numbers = ["+15550100"]

[[tenants.departments]]
name = "support"
strategy = "least_busy"
max_queue_size = 10
keywords = ["help", "support"]

[[tenants.departments]]
name = "sales"
strategy = "skills_based"
required_skills = ["sales"]
overflow_department = "support"

[[tenants.agents]]
id = "agent-1"
department = "support"
max_concurrent_calls = 2
skills = ["billing"]
"#;

        let config: Config = toml::from_str(toml_str).expect("Failed to parse");
        config.validate().expect("Failed to validate");
        let tenant = config.tenant("acme").expect("tenant missing");
        assert_eq!(tenant.max_transfer_attempts, 2);
        assert!(tenant.is_vip("+15550100"));
        assert!(!tenant.is_vip("+15550199"));
        let dept = tenant.department("support").unwrap();
        assert_eq!(dept.strategy, RoutingStrategy::LeastBusy);
        assert_eq!(dept.max_queue_size, 10);
    }

    #[test]
    fn test_validate_rejects_unknown_default_department() {
        let toml_str = r#"
http_addr = "0.0.0.0:8080"

[[tenants]]
id = "acme"
default_department = "missing"
"#;
        let config: Config = toml::from_str(toml_str).expect("Should parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_business_hours_window() {
        let hours = BusinessHours {
            utc_offset_minutes: 0,
            open_hour: 9,
            close_hour: 17,
            days: vec![1, 2, 3, 4, 5],
        };
        // Wednesday 10:00 UTC
        let open = Utc.with_ymd_and_hms(2025, 6, 4, 10, 0, 0).unwrap();
        assert!(hours.is_open(open));
        // Wednesday 20:00 UTC
        let closed = Utc.with_ymd_and_hms(2025, 6, 4, 20, 0, 0).unwrap();
        assert!(!hours.is_open(closed));
        // Sunday
        let sunday = Utc.with_ymd_and_hms(2025, 6, 8, 10, 0, 0).unwrap();
        assert!(!hours.is_open(sunday));
    }

    #[test]
    fn test_business_hours_overnight_wraps() {
        let hours = BusinessHours {
            utc_offset_minutes: 0,
            open_hour: 22,
            close_hour: 6,
            days: vec![1, 2, 3, 4, 5, 6, 7],
        };
        let late = Utc.with_ymd_and_hms(2025, 6, 4, 23, 0, 0).unwrap();
        assert!(hours.is_open(late));
        let early = Utc.with_ymd_and_hms(2025, 6, 4, 3, 0, 0).unwrap();
        assert!(hours.is_open(early));
        let midday = Utc.with_ymd_and_hms(2025, 6, 4, 12, 0, 0).unwrap();
        assert!(!hours.is_open(midday));
    }
}
