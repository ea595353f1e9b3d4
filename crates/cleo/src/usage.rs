//! Centralized usage tracking: token counts, costs, per-agent and per-model
//! stats, with budget enforcement.
//!
//! File-backed JSON store, process-safe under the usage lock. The budget
//! check runs inside the same critical section as the record append, so
//! concurrent workers cannot overspend past the hard limit unnoticed.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::lockfile::LockGuard;
use crate::now_ts;
use crate::workdir::Workdir;

/// Approximate per-million-token prices, keyed by model.
const MODEL_COSTS: &[(&str, f64, f64)] = &[
    ("minimax-m2.1", 1.0, 4.0),
    ("deepseek-v3.2", 0.5, 2.0),
    ("qwen3-235b-thinking", 1.5, 6.0),
    ("kimi-k2.5", 1.0, 4.0),
];
const DEFAULT_COSTS: (f64, f64) = (1.0, 4.0);

/// Estimate cost in USD for a single call.
pub fn estimate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let (input, output) = MODEL_COSTS
        .iter()
        .find(|(m, _, _)| *m == model)
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_COSTS);
    (prompt_tokens as f64 / 1_000_000.0) * input + (completion_tokens as f64 / 1_000_000.0) * output
}

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    /// Spending crossed the configured hard limit. Terminal for the
    /// current task; the worker fails the task and the orchestrator
    /// surfaces the error.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("usage store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("usage store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub agent_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub retries: u32,
    pub failover: bool,
    pub ts: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageAggregate {
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub total_prompt_tokens: u64,
    #[serde(default)]
    pub total_completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_retries: u64,
    #[serde(default)]
    pub total_failovers: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsageStore {
    #[serde(default)]
    calls: Vec<UsageRecord>,
    #[serde(default)]
    aggregate: UsageAggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_cost_usd: f64,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default = "default_warn_at")]
    pub warn_at_percent: u32,
    #[serde(default)]
    pub updated_at: f64,
}

fn default_warn_at() -> u32 {
    80
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            enabled: false,
            max_cost_usd: 0.0,
            max_tokens: 0,
            warn_at_percent: default_warn_at(),
            updated_at: 0.0,
        }
    }
}

/// Inputs to one usage record.
#[derive(Debug, Clone, Default)]
pub struct CallUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: f64,
    pub success: bool,
    pub retries: u32,
    pub failover: bool,
}

#[derive(Debug, Clone)]
pub struct UsageTracker {
    path: PathBuf,
    lock_path: PathBuf,
    budget_path: PathBuf,
    alerts_path: PathBuf,
}

impl UsageTracker {
    pub fn new(workdir: &Workdir) -> Self {
        Self {
            path: workdir.usage_file(),
            lock_path: workdir.usage_lock(),
            budget_path: workdir.budget_file(),
            alerts_path: workdir.alerts_file(),
        }
    }

    /// Record a single LLM call and enforce the budget.
    pub fn record(
        &self,
        agent_id: &str,
        model: &str,
        usage: CallUsage,
    ) -> Result<UsageRecord, UsageError> {
        let cost = estimate_cost(model, usage.prompt_tokens, usage.completion_tokens);
        let record = UsageRecord {
            agent_id: agent_id.to_string(),
            model: model.to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.prompt_tokens + usage.completion_tokens,
            cost_usd: cost,
            latency_ms: usage.latency_ms,
            success: usage.success,
            retries: usage.retries,
            failover: usage.failover,
            ts: now_ts(),
        };

        let _guard = LockGuard::acquire(&self.lock_path);
        let mut store = self.read();
        store.calls.push(record.clone());

        let agg = &mut store.aggregate;
        agg.total_calls += 1;
        agg.total_prompt_tokens += usage.prompt_tokens;
        agg.total_completion_tokens += usage.completion_tokens;
        agg.total_tokens += record.total_tokens;
        agg.total_cost_usd += cost;
        agg.total_retries += usage.retries as u64;
        if usage.failover {
            agg.total_failovers += 1;
        }
        if usage.success {
            agg.success_count += 1;
        } else {
            agg.failure_count += 1;
        }

        let aggregate = store.aggregate.clone();
        self.write(&store)?;

        // Budget check inside the lock prevents concurrent overspend.
        self.check_budget(&aggregate)?;
        Ok(record)
    }

    /// Aggregate plus per-agent and per-model breakdowns.
    pub fn summary(&self) -> Value {
        let store = self.read();
        let mut by_agent: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();
        let mut by_model: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();

        for call in &store.calls {
            let a = by_agent.entry(call.agent_id.clone()).or_default();
            a.0 += 1;
            a.1 += call.total_tokens;
            a.2 += call.cost_usd;
            let m = by_model.entry(call.model.clone()).or_default();
            m.0 += 1;
            m.1 += call.total_tokens;
            m.2 += call.cost_usd;
        }

        let fmt = |map: BTreeMap<String, (u64, u64, f64)>| -> Value {
            map.into_iter()
                .map(|(k, (calls, tokens, cost))| {
                    (k, json!({"calls": calls, "tokens": tokens, "cost": cost}))
                })
                .collect::<serde_json::Map<_, _>>()
                .into()
        };

        json!({
            "aggregate": store.aggregate,
            "by_agent": fmt(by_agent),
            "by_model": fmt(by_model),
        })
    }

    /// Summary of calls since a timestamp.
    pub fn session_summary(&self, since_ts: f64) -> Value {
        let store = self.read();
        let calls: Vec<&UsageRecord> = store.calls.iter().filter(|c| c.ts >= since_ts).collect();
        let total_tokens: u64 = calls.iter().map(|c| c.total_tokens).sum();
        let total_cost: f64 = calls.iter().map(|c| c.cost_usd).sum();
        let successes = calls.iter().filter(|c| c.success).count();
        let latencies: Vec<f64> = calls
            .iter()
            .filter(|c| c.success && c.latency_ms > 0.0)
            .map(|c| c.latency_ms)
            .collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        json!({
            "calls": calls.len(),
            "tokens": total_tokens,
            "cost_usd": total_cost,
            "successes": successes,
            "failures": calls.len() - successes,
            "avg_latency": avg_latency,
        })
    }

    pub fn recent_calls(&self, limit: usize) -> Vec<UsageRecord> {
        let store = self.read();
        let skip = store.calls.len().saturating_sub(limit);
        store.calls.into_iter().skip(skip).collect()
    }

    pub fn aggregate(&self) -> UsageAggregate {
        self.read().aggregate
    }

    /// Reset all usage data.
    pub fn clear(&self) -> Result<(), UsageError> {
        let _guard = LockGuard::acquire(&self.lock_path);
        self.write(&UsageStore::default())
    }

    // ── Budget ──────────────────────────────────────────────────────────

    fn check_budget(&self, agg: &UsageAggregate) -> Result<(), UsageError> {
        let budget = self.get_budget();
        if !budget.enabled {
            return Ok(());
        }

        if budget.max_cost_usd > 0.0 {
            let warn_at = budget.warn_at_percent as f64 / 100.0;
            let total = agg.total_cost_usd;
            if total >= budget.max_cost_usd * warn_at && total < budget.max_cost_usd {
                let pct = total / budget.max_cost_usd * 100.0;
                tracing::warn!(
                    cost = total,
                    limit = budget.max_cost_usd,
                    percent = pct as u32,
                    "budget alert"
                );
                self.write_alert(&json!({
                    "type": "budget_warning",
                    "message": format!(
                        "Budget {pct:.0}% used (${total:.4} / ${:.2})", budget.max_cost_usd
                    ),
                    "cost": total,
                    "limit": budget.max_cost_usd,
                    "percent": pct,
                    "ts": now_ts(),
                }));
            }
            if total >= budget.max_cost_usd {
                self.write_alert(&json!({
                    "type": "budget_exceeded",
                    "message": format!("Budget exceeded: ${total:.4} >= ${:.2}", budget.max_cost_usd),
                    "cost": total,
                    "limit": budget.max_cost_usd,
                    "ts": now_ts(),
                }));
                return Err(UsageError::BudgetExceeded(format!(
                    "${total:.4} >= ${:.2}; raise the limit via config/budget.json or the API",
                    budget.max_cost_usd
                )));
            }
        }

        if budget.max_tokens > 0 && agg.total_tokens >= budget.max_tokens {
            return Err(UsageError::BudgetExceeded(format!(
                "token limit exceeded: {} >= {}",
                agg.total_tokens, budget.max_tokens
            )));
        }
        Ok(())
    }

    pub fn set_budget(&self, budget: &Budget) -> Result<(), UsageError> {
        let mut budget = budget.clone();
        budget.updated_at = now_ts();
        if let Some(parent) = self.budget_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.budget_path, serde_json::to_string_pretty(&budget)?)?;
        Ok(())
    }

    pub fn get_budget(&self) -> Budget {
        std::fs::read_to_string(&self.budget_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Budget config plus current spending, for the gateway.
    pub fn budget_status(&self) -> Value {
        let budget = self.get_budget();
        let agg = self.aggregate();
        let percent_used = if budget.max_cost_usd > 0.0 {
            (agg.total_cost_usd / budget.max_cost_usd * 1000.0).round() / 10.0
        } else {
            0.0
        };
        json!({
            "enabled": budget.enabled,
            "max_cost_usd": budget.max_cost_usd,
            "max_tokens": budget.max_tokens,
            "warn_at_percent": budget.warn_at_percent,
            "current_cost_usd": agg.total_cost_usd,
            "current_tokens": agg.total_tokens,
            "percent_used": percent_used,
        })
    }

    fn write_alert(&self, alert: &Value) {
        if let Some(parent) = self.alerts_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.alerts_path)
            .and_then(|mut f| writeln!(f, "{alert}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append alert");
        }
    }

    pub fn get_alerts(&self, limit: usize) -> Vec<Value> {
        let raw = std::fs::read_to_string(&self.alerts_path).unwrap_or_default();
        let alerts: Vec<Value> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = alerts.len().saturating_sub(limit);
        alerts.into_iter().skip(skip).collect()
    }

    // ── Internal ────────────────────────────────────────────────────────

    fn read(&self) -> UsageStore {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write(&self, store: &UsageStore) -> Result<(), UsageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(store)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker() -> (tempfile::TempDir, UsageTracker) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(&Workdir::new(dir.path()));
        (dir, tracker)
    }

    fn ok_call(prompt: u64, completion: u64) -> CallUsage {
        CallUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            latency_ms: 900.0,
            success: true,
            retries: 0,
            failover: false,
        }
    }

    #[test]
    fn test_record_and_aggregate() {
        let (_dir, tracker) = test_tracker();
        let rec = tracker
            .record("jerry", "deepseek-v3.2", ok_call(1000, 500))
            .unwrap();
        assert_eq!(rec.total_tokens, 1500);
        assert!(rec.cost_usd > 0.0);

        tracker
            .record(
                "leo",
                "qwen3-235b-thinking",
                CallUsage {
                    success: false,
                    retries: 2,
                    ..ok_call(2000, 0)
                },
            )
            .unwrap();

        let agg = tracker.aggregate();
        assert_eq!(agg.total_calls, 2);
        assert_eq!(agg.total_tokens, 3500);
        assert_eq!(agg.success_count, 1);
        assert_eq!(agg.failure_count, 1);
        assert_eq!(agg.total_retries, 2);
    }

    #[test]
    fn test_cost_table_and_fallback() {
        let known = estimate_cost("qwen3-235b-thinking", 1_000_000, 1_000_000);
        assert!((known - 7.5).abs() < 1e-9);
        let unknown = estimate_cost("some-new-model", 1_000_000, 1_000_000);
        assert!((unknown - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_budget_monotonicity() {
        let (_dir, tracker) = test_tracker();
        let mut expected = 0.0;
        for _ in 0..5 {
            let rec = tracker.record("jerry", "kimi-k2.5", ok_call(10_000, 5_000)).unwrap();
            expected += rec.cost_usd;
        }
        let agg = tracker.aggregate();
        assert!((agg.total_cost_usd - expected).abs() < 1e-12);
    }

    #[test]
    fn test_budget_hard_limit() {
        let (_dir, tracker) = test_tracker();
        tracker
            .set_budget(&Budget {
                enabled: true,
                max_cost_usd: 0.0001,
                ..Default::default()
            })
            .unwrap();

        let err = tracker
            .record("executor", "qwen3-235b-thinking", ok_call(100_000, 50_000))
            .unwrap_err();
        assert!(matches!(err, UsageError::BudgetExceeded(_)));

        // The call is still recorded and an alert is on disk.
        let agg = tracker.aggregate();
        assert!(agg.total_cost_usd > 0.0001);
        let alerts = tracker.get_alerts(10);
        assert!(alerts.iter().any(|a| a["type"] == "budget_exceeded"));
    }

    #[test]
    fn test_budget_warning_threshold() {
        let (_dir, tracker) = test_tracker();
        tracker
            .set_budget(&Budget {
                enabled: true,
                max_cost_usd: 1.0,
                warn_at_percent: 1,
                ..Default::default()
            })
            .unwrap();

        // ~$0.45 on qwen pricing: past 1% warn, below the hard limit.
        tracker
            .record("jerry", "qwen3-235b-thinking", ok_call(100_000, 50_000))
            .unwrap();
        let alerts = tracker.get_alerts(10);
        assert!(alerts.iter().any(|a| a["type"] == "budget_warning"));
    }

    #[test]
    fn test_token_limit() {
        let (_dir, tracker) = test_tracker();
        tracker
            .set_budget(&Budget {
                enabled: true,
                max_tokens: 1000,
                ..Default::default()
            })
            .unwrap();
        let err = tracker.record("jerry", "kimi-k2.5", ok_call(900, 200)).unwrap_err();
        assert!(matches!(err, UsageError::BudgetExceeded(_)));
    }

    #[test]
    fn test_disabled_budget_never_raises() {
        let (_dir, tracker) = test_tracker();
        tracker
            .set_budget(&Budget {
                enabled: false,
                max_cost_usd: 0.0000001,
                ..Default::default()
            })
            .unwrap();
        tracker
            .record("jerry", "kimi-k2.5", ok_call(1_000_000, 1_000_000))
            .unwrap();
    }

    #[test]
    fn test_session_summary_since() {
        let (_dir, tracker) = test_tracker();
        tracker.record("jerry", "kimi-k2.5", ok_call(100, 100)).unwrap();
        let cutoff = now_ts() + 1.0;
        let summary = tracker.session_summary(cutoff);
        assert_eq!(summary["calls"], 0);
        let summary = tracker.session_summary(0.0);
        assert_eq!(summary["calls"], 1);
        assert_eq!(summary["tokens"], 200);
    }

    #[test]
    fn test_summary_breakdowns() {
        let (_dir, tracker) = test_tracker();
        tracker.record("jerry", "kimi-k2.5", ok_call(100, 100)).unwrap();
        tracker.record("jerry", "deepseek-v3.2", ok_call(100, 100)).unwrap();
        tracker.record("leo", "kimi-k2.5", ok_call(100, 100)).unwrap();
        let summary = tracker.summary();
        assert_eq!(summary["by_agent"]["jerry"]["calls"], 2);
        assert_eq!(summary["by_agent"]["leo"]["calls"], 1);
        assert_eq!(summary["by_model"]["kimi-k2.5"]["calls"], 2);
    }

    #[test]
    fn test_clear() {
        let (_dir, tracker) = test_tracker();
        tracker.record("jerry", "kimi-k2.5", ok_call(100, 100)).unwrap();
        tracker.clear().unwrap();
        assert_eq!(tracker.aggregate().total_calls, 0);
    }
}
