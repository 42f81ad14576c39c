pub mod behavior;
pub mod engine;
pub mod rules;

pub use behavior::{BehaviorSignals, BehaviorTracker};
pub use engine::{CallContext, SpamReport, SpamRuleEngine, SpamVerdict};
pub use rules::{SpamAction, SpamRule, SpamRuleDef, SpamRuleKind, SpamRuleView, TimeWindow};
