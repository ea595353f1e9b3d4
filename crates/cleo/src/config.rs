//! Configuration surface.
//!
//! `config/agents.yaml` is the sole authoritative configuration. Sections
//! for collaborator subsystems (chain, channels, compaction, resilience,
//! memory backends) are parsed and carried but consumed elsewhere; this
//! crate wires the agent roster, tool scoping, and the A2A section.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::workdir::Workdir;

pub const DEFAULT_GATEWAY_PORT: u16 = 19789;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleoConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub tools: ToolsDefaults,
    #[serde(default)]
    pub channels: serde_yaml::Mapping,
    #[serde(default)]
    pub a2a: A2aConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "mock" / "chroma" / "hybrid"; only "mock" is wired in-core.
    #[serde(default = "default_mock")]
    pub backend: String,
}

fn default_mock() -> String {
    "mock".to_string()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_mock(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// LLM call behavior, consumed by the provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default = "default_cb_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_cb_cooldown")]
    pub circuit_breaker_cooldown: f64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_cb_threshold() -> u32 {
    5
}
fn default_cb_cooldown() -> f64 {
    60.0
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: true,
            circuit_breaker_threshold: default_cb_threshold(),
            circuit_breaker_cooldown: default_cb_cooldown(),
        }
    }
}

/// Context window management, consumed by the provider adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_context_tokens: u64,
    #[serde(default)]
    pub summary_target_tokens: u64,
    #[serde(default)]
    pub keep_recent_turns: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsDefaults {
    #[serde(default = "default_full")]
    pub default_profile: String,
}

fn default_full() -> String {
    "full".to_string()
}

impl Default for ToolsDefaults {
    fn default() -> Self {
        Self {
            default_profile: default_full(),
        }
    }
}

/// Per-agent tool scoping: profile base set, minus deny, plus allow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_full")]
    pub profile: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            profile: default_full(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentLlmConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub autonomy_level: String,
    #[serde(default)]
    pub llm: AgentLlmConfig,
    #[serde(default)]
    pub tools: Option<ToolsConfig>,
    #[serde(default = "default_reputation")]
    pub reputation: i64,
}

fn default_reputation() -> i64 {
    100
}

impl AgentConfig {
    /// Effective tool scoping: the agent's own block, else the global
    /// default profile.
    pub fn tools_config(&self, defaults: &ToolsDefaults) -> ToolsConfig {
        match &self.tools {
            Some(t) => t.clone(),
            None => ToolsConfig {
                profile: defaults.default_profile.clone(),
                ..Default::default()
            },
        }
    }
}

// ── A2A section ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aConfig {
    #[serde(default)]
    pub server: A2aServerConfig,
    #[serde(default)]
    pub client: A2aClientConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aServerConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aClientConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub remotes: Vec<A2aRemote>,
    #[serde(default)]
    pub registries: Vec<A2aRegistryEntry>,
    #[serde(default)]
    pub security: A2aSecurityConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aRemote {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub trust_level: String,
    #[serde(default)]
    pub auth: A2aAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aAuth {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub token_env: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct A2aRegistryEntry {
    pub url: String,
    #[serde(default)]
    pub trust_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aSecurityConfig {
    #[serde(default = "default_true")]
    pub redact_patterns: bool,
    #[serde(default = "default_true")]
    pub untrusted_require_confirmation: bool,
    #[serde(default = "default_max_timeout")]
    pub max_timeout: f64,
    #[serde(default)]
    pub custom_redact_patterns: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_max_timeout() -> f64 {
    600.0
}

impl Default for A2aSecurityConfig {
    fn default() -> Self {
        Self {
            redact_patterns: true,
            untrusted_require_confirmation: true,
            max_timeout: default_max_timeout(),
            custom_redact_patterns: Vec::new(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────

impl CleoConfig {
    /// Load from `config/agents.yaml`; a missing file yields the defaults
    /// (empty roster), a malformed file is an error.
    pub fn load(workdir: &Workdir) -> anyhow::Result<Self> {
        Self::load_path(&workdir.agents_config())
    }

    pub fn load_path(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == agent_id)
    }
}

/// Gateway port from `CLEO_GATEWAY_PORT`, defaulting to 19789.
pub fn gateway_port() -> u16 {
    std::env::var("CLEO_GATEWAY_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_GATEWAY_PORT)
}

/// Auth token from `CLEO_GATEWAY_TOKEN`, generated when absent.
pub fn gateway_token() -> String {
    match std::env::var("CLEO_GATEWAY_TOKEN") {
        Ok(t) if !t.is_empty() => t,
        _ => {
            use rand::Rng as _;
            let mut rng = rand::thread_rng();
            let token: String = (0..32)
                .map(|_| {
                    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
                    CHARSET[rng.gen_range(0..CHARSET.len())] as char
                })
                .collect();
            tracing::info!("generated gateway token (set CLEO_GATEWAY_TOKEN to pin it)");
            token
        }
    }
}

/// Load `.env` into the process environment, once, at startup.
pub fn load_dotenv(workdir: &Workdir) {
    let path = workdir.join(".env");
    if path.exists() {
        if let Err(e) = dotenvy::from_path(&path) {
            tracing::warn!(error = %e, "failed to load .env");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
llm:
  provider: openai

memory:
  backend: mock

resilience:
  max_retries: 5
  base_delay: 0.5

tools:
  default_profile: coding

a2a:
  server:
    enabled: true
  client:
    enabled: true
    remotes:
      - url: https://chart-agent.example.com
        name: chart-agent
        skills: [chart-generation, data-viz]
        trust_level: verified
        auth:
          scheme: bearer
          token_env: CHART_AGENT_TOKEN
    registries:
      - url: https://registry.example.com/agents
        trust_level: community

agents:
  - id: leo
    role: Planner and coordinator
    model: qwen3-235b-thinking
    skills: [planning]
  - id: jerry
    role: Implementation agent
    model: deepseek-v3.2
    tools:
      profile: coding
      allow: ["group:messaging"]
      deny: [exec]
  - id: alic
    role: Peer reviewer
    model: kimi-k2.5
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: CleoConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.resilience.max_retries, 5);
        assert_eq!(config.tools.default_profile, "coding");
        assert_eq!(config.agents.len(), 3);
        assert!(config.a2a.server.enabled);
        assert_eq!(config.a2a.client.remotes[0].skills.len(), 2);
        assert_eq!(config.a2a.client.remotes[0].auth.scheme, "bearer");

        let jerry = config.agent("jerry").unwrap();
        let tools = jerry.tools_config(&config.tools);
        assert_eq!(tools.profile, "coding");
        assert_eq!(tools.deny, vec!["exec"]);

        // leo has no tools block: falls back to the global default profile.
        let leo = config.agent("leo").unwrap();
        assert_eq!(leo.tools_config(&config.tools).profile, "coding");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CleoConfig::load(&Workdir::new(dir.path())).unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.memory.backend, "mock");
        assert!(!config.a2a.client.enabled);
    }

    #[test]
    fn test_resilience_defaults() {
        let r = ResilienceConfig::default();
        assert_eq!(r.max_retries, 3);
        assert!(r.jitter);
    }
}
