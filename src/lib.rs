pub mod ai;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod handler;
pub mod ledger;
pub mod queue;
pub mod routing;
pub mod spam;

pub type TenantId = String;
pub type CallId = String;
pub type AgentId = String;
pub type RuleId = String;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}
