//! The five-level precedence merger producing an immutable [`ResolvedConfig`] (§4.1).
//!
//! No TOML/YAML/env-file parsing dependency is introduced here — callers build [`Defaults`],
//! [`AgentDefinition`], [`ChainConfig`], and [`StageConfig`] values directly, the same way the
//! rest of this crate prefers manual construction over a config-file format. The resolver's only
//! job is precedence merging and registry lookup.

use std::collections::HashMap;

use crate::cloudllm::error::ConfigError;

/// Agent type, as looked up from an [`AgentDefinition`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentType {
    Default,
    Synthesis,
    Scoring,
    Orchestrator,
}

impl Default for AgentType {
    fn default() -> Self {
        AgentType::Default
    }
}

/// A provider's connection details, looked up from the provider registry by name (§4.1).
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub model_id: String,
    pub credential_env_var: String,
    pub base_url: String,
    pub per_tool_token_cap: u32,
    pub native_tools: Vec<String>,
}

/// The immutable, per-execution agent configuration produced by the resolver (§3).
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub agent_name: String,
    pub agent_type: AgentType,
    pub llm_backend: String,
    pub provider: ProviderDescriptor,
    pub max_iterations: u32,
    pub iteration_timeout_secs: u64,
    pub tool_servers: Vec<String>,
    pub custom_instructions: String,
}

/// Process-wide defaults, the lowest-precedence tier.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    pub llm_backend: String,
    pub provider_name: String,
    pub max_iterations: Option<u32>,
    pub scoring_agent: Option<String>,
}

/// A registered agent's static definition: type, default tool servers, and custom instructions.
#[derive(Debug, Clone, Default)]
pub struct AgentDefinition {
    pub name: String,
    pub agent_type: AgentType,
    pub llm_backend: String,
    pub tool_servers: Vec<String>,
    pub custom_instructions: String,
}

/// Per-agent, per-stage overrides (highest precedence below a direct caller override).
#[derive(Debug, Clone, Default)]
pub struct StageAgentOverride {
    pub max_iterations: Option<u32>,
    pub tool_servers: Option<Vec<String>>,
}

/// One stage of a chain: a set of agents, each with an optional per-stage override.
#[derive(Debug, Clone, Default)]
pub struct StageConfig {
    pub agent_overrides: HashMap<String, StageAgentOverride>,
}

/// An ordered sequence of stages, the chain tier of the precedence chain.
#[derive(Debug, Clone, Default)]
pub struct ChainConfig {
    pub llm_backend: Option<String>,
    pub provider_name: Option<String>,
    pub max_iterations: Option<u32>,
    pub tool_servers: Option<Vec<String>>,
    pub stages: Vec<StageConfig>,
    pub agent_names: Vec<String>,
}

/// Caller-supplied overrides, the highest-precedence tier, for an investigation execution.
#[derive(Debug, Clone, Default)]
pub struct CallerOverride {
    pub llm_backend: Option<String>,
    pub provider_name: Option<String>,
    pub max_iterations: Option<u32>,
    pub tool_servers: Option<Vec<String>>,
}

/// Overrides specific to chat executions (§4.1 "Chat agent-name default").
#[derive(Debug, Clone, Default)]
pub struct ChatConfigOverride {
    pub agent: Option<String>,
    pub caller: CallerOverride,
}

/// Overrides specific to scoring executions (§4.1 "Scoring agent-name default").
#[derive(Debug, Clone, Default)]
pub struct ScoringConfigOverride {
    pub agent: Option<String>,
    pub caller: CallerOverride,
}

/// Registries plus the merge logic. Holds no mutable state beyond the two lookup maps supplied at
/// construction — there is no global config singleton (§9 "No global mutable state").
pub struct ConfigResolver {
    defaults: Defaults,
    agents: HashMap<String, AgentDefinition>,
    providers: HashMap<String, ProviderDescriptor>,
}

impl ConfigResolver {
    pub fn new(
        defaults: Defaults,
        agents: HashMap<String, AgentDefinition>,
        providers: HashMap<String, ProviderDescriptor>,
    ) -> Self {
        Self { defaults, agents, providers }
    }

    /// Investigation entry point: defaults → agent-def → chain → stage → caller-override.
    pub fn resolve_agent_config(
        &self,
        agent_name: &str,
        chain: Option<&ChainConfig>,
        stage_index: Option<usize>,
        caller: &CallerOverride,
    ) -> Result<ResolvedConfig, ConfigError> {
        let chain = chain.ok_or(ConfigError::NilChain)?;
        let agent_def = self.lookup_agent(agent_name)?;

        let stage_override = stage_index
            .and_then(|i| chain.stages.get(i))
            .and_then(|s| s.agent_overrides.get(agent_name));

        let llm_backend = first_non_empty(&[
            &self.defaults.llm_backend,
            &agent_def.llm_backend,
            chain.llm_backend.as_deref().unwrap_or(""),
            caller.llm_backend.as_deref().unwrap_or(""),
        ]);

        let provider_name = first_non_empty(&[
            &self.defaults.provider_name,
            chain.provider_name.as_deref().unwrap_or(""),
            caller.provider_name.as_deref().unwrap_or(""),
        ]);
        let provider = self.lookup_provider(&provider_name)?;

        let max_iterations = first_some(&[
            self.defaults.max_iterations,
            chain.max_iterations,
            stage_override.and_then(|o| o.max_iterations),
            caller.max_iterations,
        ])
        .unwrap_or(crate::cloudllm::types::DEFAULT_MAX_ITERATIONS);

        let empty_list: Vec<String> = Vec::new();
        let stage_tool_servers = stage_override.and_then(|o| o.tool_servers.clone()).unwrap_or_default();
        let caller_tool_servers = caller.tool_servers.clone().unwrap_or_default();
        let tool_servers = first_non_empty_list(&[
            &agent_def.tool_servers,
            chain.tool_servers.as_ref().unwrap_or(&empty_list),
            &stage_tool_servers,
            &caller_tool_servers,
        ]);

        Ok(ResolvedConfig {
            agent_name: agent_name.to_string(),
            agent_type: agent_def.agent_type,
            llm_backend,
            provider,
            max_iterations,
            iteration_timeout_secs: crate::cloudllm::types::DEFAULT_ITERATION_TIMEOUT_SECS,
            tool_servers,
            custom_instructions: agent_def.custom_instructions.clone(),
        })
    }

    /// Chat entry point: agent name defaults to `"ChatAgent"`; tool-server resolution
    /// additionally aggregates the union of every chain stage's (and stage-agent's) tool-servers
    /// when no chain-level override is set (§4.1 "Chain MCP aggregation").
    pub fn resolve_chat_agent_config(
        &self,
        chat_cfg: &ChatConfigOverride,
        chain: Option<&ChainConfig>,
    ) -> Result<ResolvedConfig, ConfigError> {
        let chain = chain.ok_or(ConfigError::NilChain)?;
        let agent_name = chat_cfg.agent.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| "ChatAgent".to_string());
        let agent_def = self.lookup_agent(&agent_name).unwrap_or_else(|_| AgentDefinition {
            name: agent_name.clone(),
            agent_type: AgentType::Default,
            llm_backend: String::new(),
            tool_servers: Vec::new(),
            custom_instructions: String::new(),
        });

        let llm_backend = first_non_empty(&[&self.defaults.llm_backend, &agent_def.llm_backend, "", chat_cfg.caller.llm_backend.as_deref().unwrap_or("")]);

        let provider_name = first_non_empty(&[
            &self.defaults.provider_name,
            chain.provider_name.as_deref().unwrap_or(""),
            chat_cfg.caller.provider_name.as_deref().unwrap_or(""),
        ]);
        let provider = self.lookup_provider(&provider_name)?;

        let max_iterations = first_some(&[self.defaults.max_iterations, chain.max_iterations, chat_cfg.caller.max_iterations])
            .unwrap_or(crate::cloudllm::types::DEFAULT_MAX_ITERATIONS);

        let tool_servers = if let Some(explicit) = chain.tool_servers.as_ref().filter(|v| !v.is_empty()) {
            explicit.clone()
        } else if let Some(explicit) = chat_cfg.caller.tool_servers.as_ref().filter(|v| !v.is_empty()) {
            explicit.clone()
        } else {
            self.aggregate_chain_tool_servers(chain)
        };

        Ok(ResolvedConfig {
            agent_name,
            agent_type: agent_def.agent_type,
            llm_backend,
            provider,
            max_iterations,
            iteration_timeout_secs: crate::cloudllm::types::DEFAULT_ITERATION_TIMEOUT_SECS,
            tool_servers,
            custom_instructions: agent_def.custom_instructions,
        })
    }

    /// Scoring entry point: agent name defaults to `"ScoringAgent"`, overridable by
    /// `defaults.scoring_agent` then `scoring_cfg.agent` (§4.1). Bypasses tool-server resolution
    /// entirely — the scoring controller never has tools (§4.5 "Scoring agent").
    pub fn resolve_scoring_config(&self, scoring_cfg: &ScoringConfigOverride) -> Result<ResolvedConfig, ConfigError> {
        let agent_name = scoring_cfg
            .agent
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.defaults.scoring_agent.clone().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "ScoringAgent".to_string());

        let agent_def = self.lookup_agent(&agent_name).unwrap_or_else(|_| AgentDefinition {
            name: agent_name.clone(),
            agent_type: AgentType::Scoring,
            llm_backend: String::new(),
            tool_servers: Vec::new(),
            custom_instructions: String::new(),
        });

        let llm_backend = first_non_empty(&[&self.defaults.llm_backend, &agent_def.llm_backend]);
        let provider_name = first_non_empty(&[&self.defaults.provider_name, scoring_cfg.caller.provider_name.as_deref().unwrap_or("")]);
        let provider = self.lookup_provider(&provider_name)?;

        let max_iterations = first_some(&[self.defaults.max_iterations, scoring_cfg.caller.max_iterations])
            .unwrap_or(crate::cloudllm::types::DEFAULT_MAX_ITERATIONS);

        Ok(ResolvedConfig {
            agent_name,
            agent_type: AgentType::Scoring,
            llm_backend,
            provider,
            max_iterations,
            iteration_timeout_secs: crate::cloudllm::types::DEFAULT_ITERATION_TIMEOUT_SECS,
            tool_servers: Vec::new(),
            custom_instructions: agent_def.custom_instructions,
        })
    }

    fn lookup_agent(&self, name: &str) -> Result<AgentDefinition, ConfigError> {
        self.agents.get(name).cloned().ok_or_else(|| ConfigError::UnknownAgent(name.to_string()))
    }

    fn lookup_provider(&self, name: &str) -> Result<ProviderDescriptor, ConfigError> {
        self.providers.get(name).cloned().ok_or_else(|| ConfigError::UnknownProvider(name.to_string()))
    }

    /// Deterministic insertion-ordered union of each referenced agent-definition's tool-server
    /// list plus each stage-agent override's list. Duplicates dropped on first-seen.
    fn aggregate_chain_tool_servers(&self, chain: &ChainConfig) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut ordered = Vec::new();

        for agent_name in &chain.agent_names {
            if let Ok(def) = self.lookup_agent(agent_name) {
                for s in &def.tool_servers {
                    if seen.insert(s.clone()) {
                        ordered.push(s.clone());
                    }
                }
            }
        }
        for stage in &chain.stages {
            let mut override_names: Vec<&String> = stage.agent_overrides.keys().collect();
            override_names.sort();
            for agent_name in override_names {
                if let Some(servers) = &stage.agent_overrides[agent_name].tool_servers {
                    for s in servers {
                        if seen.insert(s.clone()) {
                            ordered.push(s.clone());
                        }
                    }
                }
            }
        }

        ordered
    }
}

/// Later-wins, empty-is-skip: returns the last non-empty string in precedence order, or `""` if
/// every tier is empty.
fn first_non_empty(tiers: &[&str]) -> String {
    tiers.iter().rev().find(|s| !s.is_empty()).map(|s| s.to_string()).unwrap_or_default()
}

/// Later-wins, empty-is-skip for `Option<u32>` tiers.
fn first_some(tiers: &[Option<u32>]) -> Option<u32> {
    tiers.iter().rev().find_map(|v| *v)
}

/// Later-wins, empty-is-skip for list-valued tiers.
fn first_non_empty_list(tiers: &[&Vec<String>]) -> Vec<String> {
    tiers.iter().rev().find(|v| !v.is_empty()).map(|v| (*v).clone()).unwrap_or_default()
}
