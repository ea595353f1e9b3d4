//! Per-agent append-only inboxes.
//!
//! One JSON-Lines file per agent under `.mailboxes/`. Messages are never
//! mutated retroactively; each file is FIFO-trimmed to the most recent 50
//! entries on write. Consumers keep their own offset file and read-then-
//! advance, so per-producer per-file ordering is preserved.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::lockfile::LockGuard;
use crate::now_ts;
use crate::workdir::Workdir;

/// Messages retained per mailbox file.
pub const MAILBOX_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailMessage {
    pub from: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: String,
    #[serde(default)]
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(workdir: &Workdir) -> Self {
        Self {
            dir: workdir.mailbox_dir(),
        }
    }

    fn file_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}.jsonl"))
    }

    fn offset_file(&self, agent_id: &str, consumer: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}.{consumer}.offset"))
    }

    fn lock_file(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{agent_id}.lock"))
    }

    /// Append a message to `to`'s inbox, trimming to the FIFO cap.
    pub fn send(&self, to: &str, from: &str, msg_type: &str, content: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let _guard = LockGuard::acquire(&self.lock_file(to));

        let mut lines = self.read_lines(to);
        let msg = MailMessage {
            from: from.to_string(),
            msg_type: msg_type.to_string(),
            content: content.to_string(),
            ts: now_ts(),
        };
        lines.push(serde_json::to_string(&msg).expect("mail message serializes"));
        if lines.len() > MAILBOX_CAP {
            let excess = lines.len() - MAILBOX_CAP;
            lines.drain(..excess);
        }
        std::fs::write(self.file_for(to), lines.join("\n") + "\n")
    }

    /// Read every message currently in an inbox.
    pub fn read_all(&self, agent_id: &str) -> Vec<MailMessage> {
        self.read_lines(agent_id)
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Read messages past this consumer's cursor and advance it.
    pub fn read_new(&self, agent_id: &str, consumer: &str) -> Vec<MailMessage> {
        let _guard = LockGuard::acquire(&self.lock_file(agent_id));
        let all = self.read_all(agent_id);
        let offset_path = self.offset_file(agent_id, consumer);
        let offset: usize = std::fs::read_to_string(&offset_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        // The offset is clamped to the current length: after a FIFO trim the
        // oldest unread messages are gone and the cursor restarts at the
        // surviving tail.
        let already = offset.min(all.len());
        let fresh: Vec<MailMessage> = all.into_iter().skip(already).collect();
        let new_offset = already + fresh.len();
        let _ = std::fs::create_dir_all(&self.dir);
        let _ = std::fs::write(&offset_path, new_offset.to_string());
        fresh
    }

    fn read_lines(&self, agent_id: &str) -> Vec<String> {
        match std::fs::read_to_string(self.file_for(agent_id)) {
            Ok(raw) => raw
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
