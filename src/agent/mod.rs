//! Subprocess-backed agent adapters and the per-workflow agent set.

mod adapter;
mod redact;
mod stream;

pub use adapter::{AgentInvoker, AgentRequest, AgentResult, CliAgent};
pub use redact::Redactor;
pub use stream::{ParsedOutput, parse_plain_output, parse_stream_output};

use crate::config::ConfigSnapshot;
use crate::errors::{QuorumError, Result};
use crate::state::ExecutionMode;
use std::collections::HashMap;
use std::sync::Arc;

/// One agent's text output inside a round, as handed to the moderator.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub agent: String,
    pub text: String,
}

/// The resolved set of invokers for one workflow: analysis pool, refiner,
/// synthesizer, and the moderator chain, all validated against the config
/// snapshot up front so phases never hit an unknown handle mid-run.
#[derive(Clone)]
pub struct AgentSet {
    all: HashMap<String, Arc<dyn AgentInvoker>>,
    enabled: Vec<String>,
    refiner: String,
    synthesizer: String,
    moderator_chain: Vec<String>,
}

impl AgentSet {
    pub fn from_config(config: &ConfigSnapshot) -> Result<Self> {
        let redactor = Arc::new(Redactor::from_config(&config.redaction)?);
        let grace = config.timeouts.grace_period();
        let mut all: HashMap<String, Arc<dyn AgentInvoker>> = HashMap::new();
        for definition in &config.agents {
            let invoker: Arc<dyn AgentInvoker> = Arc::new(CliAgent::new(
                definition.clone(),
                Arc::clone(&redactor),
                grace,
            ));
            all.insert(definition.name.clone(), invoker);
        }
        let enabled: Vec<String> = config.enabled_agents().map(|a| a.name.clone()).collect();
        let first = enabled.first().cloned().ok_or_else(|| {
            QuorumError::InvalidArgument("no enabled agents configured".to_string())
        })?;
        let refiner = config.refiner.clone().unwrap_or_else(|| first.clone());
        let synthesizer = config.synthesizer.clone().unwrap_or_else(|| first.clone());
        for name in [&refiner, &synthesizer] {
            if !all.contains_key(name) {
                return Err(QuorumError::InvalidArgument(format!(
                    "configured agent {name} does not exist"
                )));
            }
        }
        let moderator_chain: Vec<String> = config.moderator.chain().map(str::to_string).collect();
        for name in &moderator_chain {
            if !all.contains_key(name) {
                return Err(QuorumError::InvalidArgument(format!(
                    "moderator chain references unknown agent {name}"
                )));
            }
        }
        Ok(Self {
            all,
            enabled,
            refiner,
            synthesizer,
            moderator_chain,
        })
    }

    /// Test seam: build a set from ready-made invokers. The first invoker
    /// doubles as refiner and synthesizer unless the chain says otherwise.
    pub fn from_invokers(
        invokers: Vec<Arc<dyn AgentInvoker>>,
        moderator_chain: Vec<String>,
    ) -> Result<Self> {
        let enabled: Vec<String> = invokers.iter().map(|i| i.name().to_string()).collect();
        let first = enabled.first().cloned().ok_or_else(|| {
            QuorumError::InvalidArgument("no agents provided".to_string())
        })?;
        let all: HashMap<String, Arc<dyn AgentInvoker>> = invokers
            .into_iter()
            .map(|i| (i.name().to_string(), i))
            .collect();
        Ok(Self {
            all,
            enabled,
            refiner: first.clone(),
            synthesizer: first,
            moderator_chain,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentInvoker>> {
        self.all.get(name).cloned()
    }

    /// Analysis/planning pool for the given execution mode: a single agent
    /// for `single_agent`, every enabled agent otherwise.
    pub fn pool_for(&self, mode: ExecutionMode) -> Vec<Arc<dyn AgentInvoker>> {
        let names: &[String] = match mode {
            ExecutionMode::SingleAgent => &self.enabled[..1],
            _ => &self.enabled[..],
        };
        names.iter().filter_map(|n| self.get(n)).collect()
    }

    pub fn refiner(&self) -> Arc<dyn AgentInvoker> {
        self.all[&self.refiner].clone()
    }

    pub fn synthesizer(&self) -> Arc<dyn AgentInvoker> {
        self.all[&self.synthesizer].clone()
    }

    /// Primary moderator followed by fallbacks, in consultation order.
    pub fn moderator_chain(&self) -> Vec<Arc<dyn AgentInvoker>> {
        self.moderator_chain
            .iter()
            .filter_map(|n| self.get(n))
            .collect()
    }

    /// Resolve a task's assigned agent, falling back to the first enabled
    /// agent when the plan names an unknown handle.
    pub fn resolve_or_default(&self, name: &str) -> Arc<dyn AgentInvoker> {
        self.get(name)
            .unwrap_or_else(|| self.all[&self.enabled[0]].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentDefinition, ConfigSnapshot};

    fn config_with_agents() -> ConfigSnapshot {
        let mut config = ConfigSnapshot::default();
        config.agents = vec![
            AgentDefinition::new("alpha", "cat"),
            AgentDefinition::new("beta", "cat"),
            {
                let mut d = AgentDefinition::new("gamma", "cat");
                d.enabled = false;
                d
            },
        ];
        config.moderator.primary = "beta".into();
        config
    }

    #[test]
    fn test_from_config_resolves_roles() {
        let set = AgentSet::from_config(&config_with_agents()).unwrap();
        assert_eq!(set.refiner().name(), "alpha");
        assert_eq!(set.synthesizer().name(), "alpha");
        let chain = set.moderator_chain();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].name(), "beta");
    }

    #[test]
    fn test_pool_for_single_agent_mode() {
        let set = AgentSet::from_config(&config_with_agents()).unwrap();
        assert_eq!(set.pool_for(ExecutionMode::SingleAgent).len(), 1);
        assert_eq!(set.pool_for(ExecutionMode::MultiAgent).len(), 2);
    }

    #[test]
    fn test_disabled_agent_still_resolvable_by_name() {
        let set = AgentSet::from_config(&config_with_agents()).unwrap();
        assert!(set.get("gamma").is_some());
        assert_eq!(set.resolve_or_default("nonexistent").name(), "alpha");
    }

    #[test]
    fn test_no_enabled_agents_rejected() {
        let mut config = ConfigSnapshot::default();
        let mut agent = AgentDefinition::new("a", "cat");
        agent.enabled = false;
        config.agents = vec![agent];
        config.moderator.primary = "a".into();
        assert!(AgentSet::from_config(&config).is_err());
    }
}
