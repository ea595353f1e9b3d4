//! Skill files consumed by worker prompt assembly.
//!
//! Layout under `skills/`: `_team.md` (shared team skills), `<name>.md`
//! (named team skills), `agents/<id>/<name>.md` (agent-private skills),
//! and `agent_overrides/<id>_textgrad.md` (hot-loaded feedback patches).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::workdir::Workdir;

/// Valid skill file names; blocks path traversal through the gateway CRUD.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

pub fn team_skill_path(workdir: &Workdir) -> std::path::PathBuf {
    workdir.skills_dir().join("_team.md")
}

pub fn skill_path(workdir: &Workdir, name: &str) -> Option<std::path::PathBuf> {
    is_valid_name(name).then(|| workdir.skills_dir().join(format!("{name}.md")))
}

pub fn agent_skill_path(workdir: &Workdir, agent_id: &str, name: &str) -> Option<std::path::PathBuf> {
    (is_valid_name(agent_id) && is_valid_name(name))
        .then(|| workdir.skills_dir().join(format!("agents/{agent_id}/{name}.md")))
}

pub fn override_path(workdir: &Workdir, agent_id: &str) -> std::path::PathBuf {
    workdir.overrides_dir().join(format!("{agent_id}_textgrad.md"))
}

/// Shared team skills, or empty.
pub fn load_team_skills(workdir: &Workdir) -> String {
    std::fs::read_to_string(team_skill_path(workdir)).unwrap_or_default()
}

/// Concatenated private skills for one agent.
pub fn load_agent_skills(workdir: &Workdir, agent_id: &str) -> String {
    let dir = workdir.skills_dir().join("agents").join(agent_id);
    let Ok(iter) = std::fs::read_dir(&dir) else {
        return String::new();
    };
    let mut files: Vec<std::path::PathBuf> = iter
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    files.sort();
    files
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Hot-loaded TextGrad patch for one agent, or empty.
pub fn load_override(workdir: &Workdir, agent_id: &str) -> String {
    std::fs::read_to_string(override_path(workdir, agent_id)).unwrap_or_default()
}

/// Names of all team-level skill files (without extension).
pub fn list_skills(workdir: &Workdir) -> Vec<String> {
    let Ok(iter) = std::fs::read_dir(workdir.skills_dir()) else {
        return Vec::new();
    };
    let mut names: Vec<String> = iter
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".md").map(|n| n.to_string())
        })
        .collect();
    names.sort();
    names
}
