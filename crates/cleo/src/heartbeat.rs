//! Per-agent liveness files.
//!
//! Every worker loop iteration writes `{status, progress, ts}` to
//! `.heartbeats/<agent_id>.json`. An agent is online iff its file was
//! modified within the last 30 seconds.

use serde::{Deserialize, Serialize};

use crate::now_ts;
use crate::workdir::Workdir;

pub const ONLINE_WINDOW_SECS: f64 = 30.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub ts: f64,
}

pub fn write_heartbeat(workdir: &Workdir, agent_id: &str, status: &str, progress: &str) {
    let hb = Heartbeat {
        status: status.to_string(),
        progress: progress.to_string(),
        ts: now_ts(),
    };
    let path = workdir.heartbeat_file(agent_id);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match serde_json::to_string(&hb) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(&path, raw) {
                tracing::warn!(agent_id, error = %e, "heartbeat write failed");
            }
        }
        Err(e) => tracing::warn!(agent_id, error = %e, "heartbeat serialize failed"),
    }
}

pub fn read_heartbeat(workdir: &Workdir, agent_id: &str) -> Option<Heartbeat> {
    let raw = std::fs::read_to_string(workdir.heartbeat_file(agent_id)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Online iff the heartbeat file's mtime is within the online window.
pub fn is_online(workdir: &Workdir, agent_id: &str) -> bool {
    let Ok(meta) = std::fs::metadata(workdir.heartbeat_file(agent_id)) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age.as_secs_f64() <= ONLINE_WINDOW_SECS,
        Err(_) => true, // mtime in the future counts as fresh
    }
}

/// Heartbeats for every agent with a file on disk.
pub fn all_heartbeats(workdir: &Workdir) -> Vec<(String, Heartbeat, bool)> {
    let mut out = Vec::new();
    let Ok(iter) = std::fs::read_dir(workdir.heartbeat_dir()) else {
        return out;
    };
    for entry in iter.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(agent_id) = name.strip_suffix(".json") else {
            continue;
        };
        if let Some(hb) = read_heartbeat(workdir, agent_id) {
            let online = is_online(workdir, agent_id);
            out.push((agent_id.to_string(), hb, online));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_online() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        write_heartbeat(&workdir, "jerry", "working", "step 2/5");

        let hb = read_heartbeat(&workdir, "jerry").unwrap();
        assert_eq!(hb.status, "working");
        assert_eq!(hb.progress, "step 2/5");
        assert!(is_online(&workdir, "jerry"));
        assert!(!is_online(&workdir, "ghost"));
    }

    #[test]
    fn test_all_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = Workdir::new(dir.path());
        write_heartbeat(&workdir, "leo", "idle", "");
        write_heartbeat(&workdir, "jerry", "working", "");
        let all = all_heartbeats(&workdir);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "jerry");
        assert!(all[0].2);
    }
}
