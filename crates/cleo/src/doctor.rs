//! Health checks backing `GET /v1/doctor` and the CLI doctor command.

use serde::Serialize;
use serde_json::Value;

use crate::config::CleoConfig;
use crate::heartbeat;
use crate::lockfile::LockGuard;
use crate::workdir::Workdir;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        ok,
        detail: detail.into(),
    }
}

/// Run every health check. Read-only apart from a scratch lock probe.
pub fn run_checks(workdir: &Workdir) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // Config present and parseable.
    let config_path = workdir.agents_config();
    let config = match CleoConfig::load(workdir) {
        Ok(c) => {
            let detail = if config_path.exists() {
                format!("{} agents configured", c.agents.len())
            } else {
                "config/agents.yaml missing; running on defaults".to_string()
            };
            results.push(check("config", config_path.exists(), detail));
            Some(c)
        }
        Err(e) => {
            results.push(check("config", false, format!("parse failed: {e}")));
            None
        }
    };

    // Workspace writable.
    let workspace = workdir.workspace();
    let writable = std::fs::create_dir_all(&workspace)
        .and_then(|_| {
            let probe = workspace.join(".doctor_probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    results.push(check(
        "workspace",
        writable,
        workspace.display().to_string(),
    ));

    // File lock usable.
    let lock_probe = workdir.join(".doctor_probe.lock");
    let guard = LockGuard::acquire(&lock_probe);
    results.push(check(
        "file_lock",
        guard.is_locked(),
        if guard.is_locked() {
            "advisory locking works".to_string()
        } else {
            "lock unavailable; concurrent runs are UNSAFE".to_string()
        },
    ));
    drop(guard);
    let _ = std::fs::remove_file(&lock_probe);

    // Board and usage documents parse.
    for (name, path) in [
        ("task_board", workdir.board_file()),
        ("usage_stats", workdir.usage_file()),
    ] {
        let ok = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Value>(&raw).is_ok(),
            Err(_) => true, // absent is fine; created on first write
        };
        results.push(check(
            name,
            ok,
            if ok { "ok" } else { "corrupt JSON; will be reset on next write" },
        ));
    }

    // Provider env keys per agent.
    if let Some(config) = &config {
        for agent in &config.agents {
            let env = &agent.llm.api_key_env;
            if env.is_empty() {
                continue;
            }
            let set = std::env::var(env).map(|v| !v.is_empty()).unwrap_or(false);
            results.push(check(
                &format!("api_key:{}", agent.id),
                set,
                if set {
                    format!("{env} (set)")
                } else {
                    format!("{env} (not set)")
                },
            ));
        }
    }

    // Heartbeat freshness.
    let beats = heartbeat::all_heartbeats(workdir);
    let online = beats.iter().filter(|(_, _, on)| *on).count();
    results.push(check(
        "heartbeats",
        true,
        format!("{online}/{} agents online", beats.len()),
    ));

    results
}

/// Aggregate report for the gateway.
pub fn report(workdir: &Workdir) -> Value {
    let checks = run_checks(workdir);
    let ok = checks.iter().all(|c| c.ok);
    serde_json::json!({
        "ok": ok,
        "checks": checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checks_on_empty_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        let checks = run_checks(&workdir);
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"workspace"));
        assert!(names.contains(&"file_lock"));
        assert!(names.contains(&"task_board"));
        // Workspace and lock must pass in a scratch dir.
        assert!(checks.iter().find(|c| c.name == "workspace").unwrap().ok);
        assert!(checks.iter().find(|c| c.name == "file_lock").unwrap().ok);
    }

    #[test]
    fn test_corrupt_board_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        std::fs::write(workdir.board_file(), "{ nope").unwrap();
        let checks = run_checks(&workdir);
        assert!(!checks.iter().find(|c| c.name == "task_board").unwrap().ok);
        let r = report(&workdir);
        assert_eq!(r["ok"], false);
    }
}
