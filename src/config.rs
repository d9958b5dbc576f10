//! Tract configuration: token budget, cache sizing, compression autonomy.

use serde::{Deserialize, Serialize};

/// What happens when a commit would push the reachable history past the
/// configured token budget.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    /// Log a warning and proceed.
    #[default]
    Warn,
    /// Refuse the commit and roll back.
    Reject,
    /// Invoke the registered budget callback, then proceed.
    Callback,
}

/// How much initiative the compression engine takes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Compression happens only on explicit request, returning a proposal.
    #[default]
    Manual,
    /// Compression runs on request but returns a proposal for approval.
    Collaborative,
    /// Compression commits its summaries directly.
    Autonomous,
}

/// Numbers reported to a budget callback when the `Callback` policy fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetBreach {
    /// Reachable-history total after the attempted commit.
    pub total: u64,
    pub budget: u64,
    /// Tokens of the commit being attempted.
    pub attempted: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TractConfig {
    /// Reachable-history token ceiling; `None` disables budget checks.
    pub token_budget: Option<u64>,
    pub budget_policy: BudgetPolicy,
    /// Number of compile snapshots retained by the LRU cache.
    pub cache_capacity: u32,
    pub autonomy: AutonomyMode,
    /// Commits per summarization batch when no token target is given.
    pub compression_group_size: usize,
    /// Retry ceiling for validator-guarded LLM calls.
    pub max_retries: u32,
    /// Model name used to select the token encoder.
    pub token_model: String,
}

impl Default for TractConfig {
    fn default() -> Self {
        Self {
            token_budget: None,
            budget_policy: BudgetPolicy::default(),
            cache_capacity: 64,
            autonomy: AutonomyMode::default(),
            compression_group_size: 20,
            max_retries: 3,
            token_model: "gpt-4o".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TractConfig::default();
        assert!(config.token_budget.is_none());
        assert_eq!(config.budget_policy, BudgetPolicy::Warn);
        assert_eq!(config.autonomy, AutonomyMode::Manual);
        assert!(config.cache_capacity > 0);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut config = TractConfig::default();
        config.token_budget = Some(100_000);
        config.budget_policy = BudgetPolicy::Reject;
        let text = serde_json::to_string(&config).unwrap();
        let back: TractConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.token_budget, Some(100_000));
        assert_eq!(back.budget_policy, BudgetPolicy::Reject);
    }
}
