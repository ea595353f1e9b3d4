//! TextGrad feedback pipeline.
//!
//! Four-step loop that converts accumulated critiques into auto-injected
//! skill patches per agent:
//!
//!   1. Accumulate — workers append every CritiqueSpec to
//!      `memory/critique_log.jsonl` (in-band, under the log lock).
//!   2. Aggregate — group by agent, count recurring issues (keyed by the
//!      first 60 lowercase chars), keep those seen ≥ 3 times.
//!   3. Inject — rewrite `skills/agent_overrides/<id>_textgrad.md`; the
//!      worker prompt assembly hot-loads it on every task.
//!   4. Decay — an issue seen < 2 times in the last 40 entries is dropped;
//!      when every issue decays the override file is removed.

use std::collections::BTreeMap;
use std::io::Write as _;

use serde_json::Value;

use crate::lockfile::LockGuard;
use crate::now_ts;
use crate::protocols::{CritiqueSpec, GradientSignal};
use crate::skills;
use crate::workdir::Workdir;

/// New entries required before a run aggregates.
pub const AGGREGATE_THRESHOLD: usize = 20;
/// Occurrences required for an issue to become a patch.
pub const RECURRENCE_MIN: usize = 3;
/// Recent-entry window for the decay check.
pub const DECAY_WINDOW: usize = 40;
/// Below this count within the window, an issue has decayed.
pub const DECAY_THRESHOLD: usize = 2;

/// Append a critique to the shared log. Called in-band by reviewer workers.
///
/// `agent_id` is the GRADED agent (the critiqued task's holder), which is
/// what the aggregation step groups by; the reviewer is already inside the
/// spec.
pub fn append_critique(workdir: &Workdir, spec: &CritiqueSpec, agent_id: &str) {
    let path = workdir.critique_log();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut entry: Value = match serde_json::from_str(&spec.to_json()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "critique spec did not serialize");
            return;
        }
    };
    entry["agent_id"] = Value::String(agent_id.to_string());

    let _guard = LockGuard::acquire(&workdir.critique_log_lock());
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{entry}"));
    if let Err(e) = result {
        tracing::warn!(error = %e, "critique log append failed");
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub entries_processed: usize,
    pub agents_patched: usize,
    pub issues_found: usize,
    pub decayed: usize,
}

/// Periodic background pipeline. Non-blocking for workers: it only reads
/// the log and rewrites override files.
#[derive(Debug)]
pub struct TextGradPipeline {
    workdir: Workdir,
    last_line_count: usize,
    last_run: f64,
}

impl TextGradPipeline {
    pub fn new(workdir: Workdir) -> Self {
        Self {
            workdir,
            last_line_count: 0,
            last_run: 0.0,
        }
    }

    /// Enough time passed and enough new entries accumulated?
    pub fn should_run(&self, interval_secs: f64) -> bool {
        if now_ts() - self.last_run < interval_secs {
            return false;
        }
        count_lines(&self.workdir.critique_log()) >= self.last_line_count + AGGREGATE_THRESHOLD
    }

    /// Execute the full pipeline.
    pub fn run(&mut self) -> PipelineStats {
        self.last_run = now_ts();
        let mut stats = PipelineStats::default();

        let entries = load_critique_log(&self.workdir);
        stats.entries_processed = entries.len();
        self.last_line_count = entries.len();
        if entries.len() < AGGREGATE_THRESHOLD {
            return stats;
        }

        let mut by_agent: BTreeMap<String, Vec<&Value>> = BTreeMap::new();
        for entry in &entries {
            // The log stores reviewer critiques; the graded agent is the
            // holder of the critiqued task, recorded as agent_id.
            if let Some(agent_id) = entry.get("agent_id").and_then(|v| v.as_str()) {
                if !agent_id.is_empty() {
                    by_agent.entry(agent_id.to_string()).or_default().push(entry);
                }
            }
        }

        for (agent_id, agent_entries) in &by_agent {
            let result = self.process_agent(agent_id, agent_entries);
            if result.patched {
                stats.agents_patched += 1;
            }
            stats.issues_found += result.issues;
            stats.decayed += result.decayed;
        }
        stats
    }

    fn process_agent(&self, agent_id: &str, entries: &[&Value]) -> AgentResult {
        let mut result = AgentResult::default();

        // Aggregate: recurring issues across the whole history.
        let mut counter: BTreeMap<String, usize> = BTreeMap::new();
        for entry in entries {
            for key in issue_keys(entry) {
                *counter.entry(key).or_default() += 1;
            }
        }
        let recurring: BTreeMap<String, usize> = counter
            .into_iter()
            .filter(|(_, count)| *count >= RECURRENCE_MIN)
            .collect();
        result.issues = recurring.len();
        if recurring.is_empty() {
            return result;
        }

        // Decay: does the issue still appear in the recent window?
        let window_start = entries.len().saturating_sub(DECAY_WINDOW);
        let mut recent: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &entries[window_start..] {
            for key in issue_keys(entry) {
                *recent.entry(key).or_default() += 1;
            }
        }

        let mut active: BTreeMap<String, usize> = BTreeMap::new();
        let mut decayed: Vec<String> = Vec::new();
        for (issue, total) in recurring {
            if recent.get(&issue).copied().unwrap_or(0) >= DECAY_THRESHOLD {
                active.insert(issue, total);
            } else {
                decayed.push(issue);
                result.decayed += 1;
            }
        }

        if active.is_empty() {
            // All issues decayed; drop the patch.
            let path = skills::override_path(&self.workdir, agent_id);
            if path.exists() {
                let _ = std::fs::remove_file(&path);
                tracing::info!(agent_id, "removed decayed textgrad patch");
            }
            return result;
        }

        self.write_patch(agent_id, &active);
        self.write_gradient_signal(agent_id, &active, &decayed, entries);
        result.patched = true;
        result
    }

    fn write_patch(&self, agent_id: &str, active: &BTreeMap<String, usize>) {
        let dir = self.workdir.overrides_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "overrides dir create failed");
            return;
        }

        // Highest-count issues first.
        let mut ranked: Vec<(&String, &usize)> = active.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let total: usize = active.values().sum();
        let mut lines = vec![
            "# TextGrad Auto-Improvements".to_string(),
            String::new(),
            format!("_Auto-generated from {total} critique observations._"),
            String::new(),
            "## Known Issues to Avoid".to_string(),
            String::new(),
        ];
        for (issue, count) in &ranked {
            lines.push(format!("- **[{count}x]** {issue}"));
        }
        lines.extend([
            String::new(),
            "## Improvement Guidelines".to_string(),
            String::new(),
            "Based on recurring feedback, pay special attention to:".to_string(),
        ]);
        for (i, (issue, _)) in ranked.iter().take(5).enumerate() {
            lines.push(format!("{}. Address: {issue}", i + 1));
        }

        let path = skills::override_path(&self.workdir, agent_id);
        if let Err(e) = std::fs::write(&path, lines.join("\n")) {
            tracing::warn!(agent_id, error = %e, "patch write failed");
        } else {
            tracing::info!(agent_id, active = active.len(), "wrote textgrad patch");
        }
    }

    fn write_gradient_signal(
        &self,
        agent_id: &str,
        active: &BTreeMap<String, usize>,
        decayed: &[String],
        entries: &[&Value],
    ) {
        let signal = GradientSignal {
            agent_id: agent_id.to_string(),
            recurring_issues: active.keys().cloned().collect(),
            improvement_patches: active.keys().map(|i| format!("Avoid: {i}")).collect(),
            source_critique_ids: entries
                .iter()
                .rev()
                .take(10)
                .filter_map(|e| e.get("task_id").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect(),
            generated_at: now_ts(),
            decayed_issues: decayed.to_vec(),
        };
        let path = self.workdir.gradient_signal_file(agent_id);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(&signal) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&path, raw) {
                    tracing::debug!(error = %e, "gradient signal write failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "gradient signal serialize failed"),
        }
    }
}

#[derive(Debug, Default)]
struct AgentResult {
    patched: bool,
    issues: usize,
    decayed: usize,
}

/// Normalized issue keys in one critique entry: first 60 lowercase chars.
fn issue_keys(entry: &Value) -> Vec<String> {
    entry
        .get("items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("issue").and_then(|v| v.as_str()))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase().chars().take(60).collect())
                .collect()
        })
        .unwrap_or_default()
}

fn count_lines(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .map(|raw| raw.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

fn load_critique_log(workdir: &Workdir) -> Vec<Value> {
    std::fs::read_to_string(workdir.critique_log())
        .map(|raw| {
            raw.lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str(l).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{CritiqueItem, CritiqueSpec};

    fn critique(agent_id: &str, issue: &str) -> CritiqueSpec {
        // agent_id rides in the log entry so the pipeline can group by the
        // graded agent.
        let mut spec = CritiqueSpec {
            reviewer_id: "alic".to_string(),
            task_id: format!("task-for-{agent_id}"),
            items: vec![CritiqueItem {
                dimension: "accuracy".to_string(),
                issue: issue.to_string(),
                suggestion: "fix it".to_string(),
            }],
            ..Default::default()
        };
        spec.timestamp = now_ts();
        spec
    }

    fn append_with_agent(workdir: &Workdir, agent_id: &str, issue: &str) {
        append_critique(workdir, &critique(agent_id, issue), agent_id);
    }

    #[test]
    fn test_recurring_issue_produces_patch() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        for _ in 0..12 {
            append_with_agent(&workdir, "jerry", "missed edge cases in output");
        }
        for i in 0..10 {
            append_with_agent(&workdir, "jerry", &format!("one-off issue {i}"));
        }

        let mut pipeline = TextGradPipeline::new(workdir.clone());
        let stats = pipeline.run();
        assert_eq!(stats.entries_processed, 22);
        assert_eq!(stats.agents_patched, 1);
        assert!(stats.issues_found >= 1);

        let patch = skills::load_override(&workdir, "jerry");
        assert!(patch.contains("missed edge cases in output"));
        assert!(patch.contains("[12x]"));

        let signal_raw =
            std::fs::read_to_string(workdir.gradient_signal_file("jerry")).unwrap();
        let signal: GradientSignal = serde_json::from_str(&signal_raw).unwrap();
        assert_eq!(signal.agent_id, "jerry");
        assert!(!signal.recurring_issues.is_empty());
    }

    #[test]
    fn test_below_threshold_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        for _ in 0..5 {
            append_with_agent(&workdir, "jerry", "same issue repeated");
        }
        let mut pipeline = TextGradPipeline::new(workdir.clone());
        let stats = pipeline.run();
        assert_eq!(stats.agents_patched, 0);
        assert!(skills::load_override(&workdir, "jerry").is_empty());
    }

    #[test]
    fn test_decayed_issue_removes_patch() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        // An old recurring issue, then a long quiet tail pushing it out of
        // the decay window.
        for _ in 0..5 {
            append_with_agent(&workdir, "jerry", "stale problem");
        }
        for i in 0..DECAY_WINDOW {
            append_with_agent(&workdir, "jerry", &format!("noise {i}"));
        }

        let mut pipeline = TextGradPipeline::new(workdir.clone());
        // Seed a patch file as if a previous run had found the issue active.
        std::fs::create_dir_all(workdir.overrides_dir()).unwrap();
        std::fs::write(skills::override_path(&workdir, "jerry"), "old patch").unwrap();

        let stats = pipeline.run();
        assert_eq!(stats.decayed, 1);
        assert!(!skills::override_path(&workdir, "jerry").exists());
    }

    #[test]
    fn test_should_run_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        let pipeline = TextGradPipeline::new(workdir.clone());
        assert!(!pipeline.should_run(0.0));

        for _ in 0..AGGREGATE_THRESHOLD {
            append_with_agent(&workdir, "jerry", "issue");
        }
        assert!(pipeline.should_run(0.0));
    }

    #[test]
    fn test_append_critique_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        append_critique(&workdir, &critique("jerry", "an issue"), "jerry");
        append_critique(&workdir, &critique("jerry", "another"), "jerry");
        let entries = load_critique_log(&workdir);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["reviewer_id"], "alic");
        assert_eq!(entries[0]["agent_id"], "jerry");
    }
}
