//! Agent registry: discovery and capability matching.
//!
//! Sources in precedence order: static `remotes` from config, dynamic
//! discovery from configured registries, and on-demand entries for
//! explicit URLs seen at call time. Health tracking marks an agent
//! unhealthy after three consecutive failures; the Agent Card cache
//! holds fetched cards for an hour. All of this state is per-process;
//! authoritative state lives in config and on the remote side.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use cleo::config::{A2aAuth, A2aClientConfig};

use crate::security::{resolve_trust_level, TRUST_COMMUNITY, TRUST_UNTRUSTED, TRUST_VERIFIED};

/// Consecutive failures before an agent is skipped.
pub const UNHEALTHY_AFTER: u32 = 3;
/// Agent Card cache TTL.
pub const CARD_CACHE_TTL: Duration = Duration::from_secs(3600);

/// A registered external agent with resolved metadata.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub url: String,
    pub name: String,
    pub description: String,
    pub skills: Vec<String>,
    pub trust_level: String,
    pub last_seen: f64,
    pub failure_count: u32,
    pub auth: A2aAuth,
}

impl AgentEntry {
    pub fn is_healthy(&self) -> bool {
        self.failure_count < UNHEALTHY_AFTER
    }
}

pub struct AgentRegistry {
    config: A2aClientConfig,
    entries: Mutex<BTreeMap<String, AgentEntry>>,
    card_cache: Mutex<BTreeMap<String, (Instant, Value)>>,
    http: reqwest::Client,
}

impl AgentRegistry {
    pub fn new(config: A2aClientConfig) -> Self {
        let mut entries = BTreeMap::new();
        for remote in &config.remotes {
            let url = remote.url.trim_end_matches('/').to_string();
            if url.is_empty() {
                continue;
            }
            let trust = if remote.trust_level.is_empty() {
                TRUST_VERIFIED.to_string()
            } else {
                remote.trust_level.clone()
            };
            let entry = AgentEntry {
                name: if remote.name.is_empty() {
                    host_name(&url)
                } else {
                    remote.name.clone()
                },
                description: remote.description.clone(),
                skills: remote.skills.clone(),
                trust_level: trust,
                last_seen: 0.0,
                failure_count: 0,
                auth: remote.auth.clone(),
                url: url.clone(),
            };
            tracing::debug!(name = %entry.name, trust = %entry.trust_level, "static agent");
            entries.insert(url, entry);
        }
        tracing::info!(
            static_agents = entries.len(),
            registries = config.registries.len(),
            "agent registry initialized"
        );
        Self {
            config,
            entries: Mutex::new(entries),
            card_cache: Mutex::new(BTreeMap::new()),
            http: reqwest::Client::new(),
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    pub fn get(&self, url: &str) -> Option<AgentEntry> {
        let normalized = url.trim_end_matches('/');
        self.entries
            .lock()
            .expect("registry lock")
            .get(normalized)
            .cloned()
    }

    pub fn list_all(&self) -> Vec<AgentEntry> {
        self.entries
            .lock()
            .expect("registry lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn list_healthy(&self) -> Vec<AgentEntry> {
        self.list_all().into_iter().filter(|e| e.is_healthy()).collect()
    }

    pub fn record_success(&self, url: &str) {
        let mut entries = self.entries.lock().expect("registry lock");
        if let Some(entry) = entries.get_mut(url.trim_end_matches('/')) {
            entry.last_seen = cleo::now_ts();
            entry.failure_count = 0;
        }
    }

    pub fn record_failure(&self, url: &str) {
        let mut entries = self.entries.lock().expect("registry lock");
        if let Some(entry) = entries.get_mut(url.trim_end_matches('/')) {
            entry.failure_count += 1;
        }
    }

    // ── Capability matching ─────────────────────────────────────────────

    /// Healthy agents matching the requested skills, best first.
    /// Score = skill-overlap × 10 + trust bonus (verified 3 / community 2
    /// / untrusted 1).
    pub fn find_by_skills(&self, required_skills: &[String]) -> Vec<AgentEntry> {
        if required_skills.is_empty() {
            return self.list_healthy();
        }
        let req: Vec<String> = required_skills.iter().map(|s| s.to_lowercase()).collect();

        let mut matches: Vec<(i64, AgentEntry)> = self
            .list_healthy()
            .into_iter()
            .filter_map(|entry| {
                let have: Vec<String> = entry.skills.iter().map(|s| s.to_lowercase()).collect();
                let overlap = req.iter().filter(|s| have.contains(s)).count() as i64;
                if overlap == 0 {
                    return None;
                }
                let trust_bonus = match entry.trust_level.as_str() {
                    TRUST_VERIFIED => 3,
                    TRUST_COMMUNITY => 2,
                    _ => 1,
                };
                Some((overlap * 10 + trust_bonus, entry))
            })
            .collect();
        matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.url.cmp(&b.1.url)));
        matches.into_iter().map(|(_, e)| e).collect()
    }

    /// Resolve a target: `"auto"` picks the best skill match; an explicit
    /// URL returns the known entry or registers a fresh one at its
    /// resolved trust level.
    pub fn resolve(&self, agent_url: &str, required_skills: &[String]) -> Option<AgentEntry> {
        if agent_url.eq_ignore_ascii_case("auto") {
            let matches = self.find_by_skills(required_skills);
            match matches.into_iter().next() {
                Some(best) => {
                    tracing::info!(name = %best.name, url = %best.url, "auto-resolved agent");
                    return Some(best);
                }
                None => {
                    tracing::warn!(?required_skills, "no agent matches the required skills");
                    return None;
                }
            }
        }

        let normalized = agent_url.trim_end_matches('/').to_string();
        if let Some(entry) = self.get(&normalized) {
            return Some(entry);
        }

        let trust = resolve_trust_level(&normalized, &self.config.remotes, &self.config.registries);
        let entry = AgentEntry {
            name: host_name(&normalized),
            description: String::new(),
            skills: Vec::new(),
            trust_level: trust.clone(),
            last_seen: 0.0,
            failure_count: 0,
            auth: A2aAuth::default(),
            url: normalized.clone(),
        };
        tracing::info!(url = %normalized, trust = %trust, "registered new agent");
        self.entries
            .lock()
            .expect("registry lock")
            .insert(normalized, entry.clone());
        Some(entry)
    }

    // ── Agent Card discovery ────────────────────────────────────────────

    /// Fetch `/.well-known/agent.json`, with the hour-long cache. Updates
    /// the entry's metadata and health on the way through.
    pub async fn fetch_agent_card(&self, base_url: &str) -> Option<Value> {
        let normalized = base_url.trim_end_matches('/').to_string();

        if let Some((at, card)) = self
            .card_cache
            .lock()
            .expect("card cache lock")
            .get(&normalized)
            .cloned()
        {
            if at.elapsed() < CARD_CACHE_TTL {
                return Some(card);
            }
        }

        let card_url = format!("{normalized}/.well-known/agent.json");
        let result = self
            .http
            .get(&card_url)
            .header("Accept", "application/json")
            .header("User-Agent", "Cleo-A2A-Client/0.2")
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        let card: Value = match result {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(card) => card,
                Err(e) => {
                    tracing::warn!(url = %card_url, error = %e, "agent card was not JSON");
                    self.record_failure(&normalized);
                    return None;
                }
            },
            Ok(resp) => {
                tracing::warn!(url = %card_url, status = %resp.status(), "agent card fetch failed");
                self.record_failure(&normalized);
                return None;
            }
            Err(e) => {
                tracing::warn!(url = %card_url, error = %e, "agent card fetch failed");
                self.record_failure(&normalized);
                return None;
            }
        };

        self.card_cache
            .lock()
            .expect("card cache lock")
            .insert(normalized.clone(), (Instant::now(), card.clone()));

        // Refresh the entry from the card.
        {
            let mut entries = self.entries.lock().expect("registry lock");
            if let Some(entry) = entries.get_mut(&normalized) {
                if let Some(name) = card.get("name").and_then(|v| v.as_str()) {
                    entry.name = name.to_string();
                }
                if let Some(desc) = card.get("description").and_then(|v| v.as_str()) {
                    entry.description = desc.to_string();
                }
                entry.skills = card_skill_tags(&card);
                entry.last_seen = cleo::now_ts();
                entry.failure_count = 0;
            }
        }
        tracing::info!(url = %normalized, "fetched agent card");
        Some(card)
    }

    /// Pull agent lists from every configured registry. Returns how many
    /// new agents appeared.
    pub async fn discover_from_registries(&self) -> usize {
        let mut discovered = 0;
        for registry in self.config.registries.clone() {
            if registry.url.is_empty() {
                continue;
            }
            let trust = if registry.trust_level.is_empty() {
                TRUST_COMMUNITY.to_string()
            } else {
                registry.trust_level.clone()
            };

            let result = self
                .http
                .get(&registry.url)
                .header("Accept", "application/json")
                .header("User-Agent", "Cleo-A2A-Client/0.2")
                .timeout(Duration::from_secs(15))
                .send()
                .await;
            let data: Value = match result {
                Ok(resp) if resp.status().is_success() => match resp.json().await {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(url = %registry.url, error = %e, "registry payload was not JSON");
                        continue;
                    }
                },
                Ok(resp) => {
                    tracing::warn!(url = %registry.url, status = %resp.status(), "registry fetch failed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(url = %registry.url, error = %e, "registry fetch failed");
                    continue;
                }
            };

            let agents: Vec<Value> = if let Some(list) = data.as_array() {
                list.clone()
            } else {
                data.get("agents")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default()
            };

            let mut entries = self.entries.lock().expect("registry lock");
            for info in agents {
                let Some(url) = info.get("url").and_then(|v| v.as_str()) else {
                    continue;
                };
                let url = url.trim_end_matches('/').to_string();
                if url.is_empty() || entries.contains_key(&url) {
                    continue;
                }
                let entry = AgentEntry {
                    name: info
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    description: info
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    skills: card_skill_tags(&info),
                    trust_level: trust.clone(),
                    last_seen: 0.0,
                    failure_count: 0,
                    auth: A2aAuth::default(),
                    url: url.clone(),
                };
                entries.insert(url, entry);
                discovered += 1;
            }
            tracing::info!(url = %registry.url, discovered, "registry discovery pass");
        }
        discovered
    }

    // ── Auth ────────────────────────────────────────────────────────────

    /// HTTP auth headers for an agent, resolving tokens from env.
    pub fn auth_headers(&self, agent_url: &str) -> Vec<(String, String)> {
        let Some(entry) = self.get(agent_url) else {
            return Vec::new();
        };
        if entry.auth.scheme.eq_ignore_ascii_case("bearer") && !entry.auth.token_env.is_empty() {
            if let Ok(token) = std::env::var(&entry.auth.token_env) {
                if !token.is_empty() {
                    return vec![("Authorization".to_string(), format!("Bearer {token}"))];
                }
            }
        }
        Vec::new()
    }
}

/// Skill tags from an Agent Card-shaped value: `skills[].tags[]`, with
/// bare-string skills accepted from loose registries.
fn card_skill_tags(card: &Value) -> Vec<String> {
    let Some(skills) = card.get("skills").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    skills
        .iter()
        .flat_map(|skill| match skill {
            Value::String(s) => vec![s.clone()],
            Value::Object(_) => skill
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str())
                        .map(|t| t.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        })
        .collect()
}

fn host_name(url: &str) -> String {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("");
    if host.is_empty() {
        "unknown".to_string()
    } else {
        host.to_string()
    }
}
