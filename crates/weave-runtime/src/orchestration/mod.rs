//! Orchestration modes.
//!
//! An [`Orchestration`] is the execution topology applied to an incoming
//! event: dispatch by `route` metadata, a fixed sequence, a collaborative
//! fan-out, a loop over one agent, or a mix of stages. The [`Orchestrator`]
//! pairs a plan with the knobs the composite modes need and runs it through
//! the shared [`Dispatcher`].

pub mod looping;
pub mod mixed;
pub mod parallel;
pub mod route;
pub mod sequential;

use std::time::Duration;

use weave_core::config::{OrchestrationConfig, OrchestrationMode};
use weave_core::context::RunContext;
use weave_core::error::{Result, WeaveError};
use weave_core::types::{AgentResult, Event, State};

use crate::dispatch::Dispatcher;

pub use looping::LoopOutcome;

/// Execution plan for events that are not error events.
#[derive(Debug, Clone, PartialEq)]
pub enum Orchestration {
    Route,
    /// Empty `agents` means every registered agent in name order.
    Sequential { agents: Vec<String> },
    /// Empty `agents` means every registered agent in name order.
    Collaborative { agents: Vec<String> },
    Loop { agent: String, max_iterations: u32 },
    Mixed { stages: Vec<Stage> },
}

/// One step of a mixed plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Agent(String),
    Parallel(Vec<String>),
    Loop { agent: String, max_iterations: u32 },
}

impl Orchestration {
    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        Ok(match config.mode {
            OrchestrationMode::Route => Orchestration::Route,
            OrchestrationMode::Sequential => Orchestration::Sequential {
                agents: config.sequence.clone(),
            },
            OrchestrationMode::Collaborative => Orchestration::Collaborative {
                agents: config.collaborators.clone(),
            },
            OrchestrationMode::Loop => {
                let agent = config
                    .loop_agent
                    .clone()
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| {
                        WeaveError::Config("orchestration.loop_agent is required in loop mode".into())
                    })?;
                Orchestration::Loop {
                    agent,
                    max_iterations: config.max_iterations,
                }
            }
            OrchestrationMode::Mixed => {
                let mut stages = Vec::new();
                if !config.collaborators.is_empty() {
                    stages.push(Stage::Parallel(config.collaborators.clone()));
                }
                stages.extend(config.sequence.iter().cloned().map(Stage::Agent));
                Orchestration::Mixed { stages }
            }
        })
    }

    pub fn mode(&self) -> OrchestrationMode {
        match self {
            Orchestration::Route => OrchestrationMode::Route,
            Orchestration::Sequential { .. } => OrchestrationMode::Sequential,
            Orchestration::Collaborative { .. } => OrchestrationMode::Collaborative,
            Orchestration::Loop { .. } => OrchestrationMode::Loop,
            Orchestration::Mixed { .. } => OrchestrationMode::Mixed,
        }
    }

    /// Agents the plan names explicitly, in plan order, without duplicates.
    pub fn referenced_agents(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        match self {
            Orchestration::Route => {}
            Orchestration::Sequential { agents } | Orchestration::Collaborative { agents } => {
                names.extend(agents.iter().map(String::as_str));
            }
            Orchestration::Loop { agent, .. } => names.push(agent),
            Orchestration::Mixed { stages } => {
                for stage in stages {
                    match stage {
                        Stage::Agent(agent) | Stage::Loop { agent, .. } => names.push(agent),
                        Stage::Parallel(group) => names.extend(group.iter().map(String::as_str)),
                    }
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        names.retain(|n| seen.insert(*n));
        names
    }
}

/// Knobs shared by the composite modes.
#[derive(Debug, Clone)]
pub struct ModeSettings {
    /// Upper bound for one collaborative fan-out.
    pub timeout: Duration,
    pub max_concurrency: usize,
    /// Failure ratio above which a partially failed fan-out fails.
    pub failure_threshold: f64,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self::from(&OrchestrationConfig::default())
    }
}

impl From<&OrchestrationConfig> for ModeSettings {
    fn from(config: &OrchestrationConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_concurrency: config.max_concurrency.max(1),
            failure_threshold: config.failure_threshold,
        }
    }
}

/// Successful outcome of running a plan on one event.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// Agent the result is attributed to; the source of any successor event.
    pub agent_id: String,
    pub result: AgentResult,
}

/// Hard failure of a plan, attributed to the agent that raised it.
#[derive(Debug)]
pub struct Failure {
    pub agent_id: String,
    pub error: WeaveError,
}

impl Failure {
    pub fn new(agent_id: impl Into<String>, error: WeaveError) -> Self {
        Self {
            agent_id: agent_id.into(),
            error,
        }
    }
}

pub type Outcome = std::result::Result<Dispatched, Failure>;

/// A plan plus its settings.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    plan: Orchestration,
    settings: ModeSettings,
    excluded: Vec<String>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(Orchestration::Route)
    }
}

impl Orchestrator {
    pub fn new(plan: Orchestration) -> Self {
        Self {
            plan,
            settings: ModeSettings::default(),
            excluded: Vec::new(),
        }
    }

    pub fn from_config(config: &OrchestrationConfig) -> Result<Self> {
        Ok(Self::new(Orchestration::from_config(config)?).with_settings(ModeSettings::from(config)))
    }

    pub fn with_settings(mut self, settings: ModeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Names left out when an empty agent list expands to "all registered".
    pub fn with_excluded<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(names.into_iter().map(Into::into));
        self.excluded.sort_unstable();
        self.excluded.dedup();
        self
    }

    pub fn plan(&self) -> &Orchestration {
        &self.plan
    }

    pub fn settings(&self) -> &ModeSettings {
        &self.settings
    }

    pub fn mode(&self) -> OrchestrationMode {
        self.plan.mode()
    }

    /// Run the plan for one event.
    pub async fn dispatch(
        &self,
        dispatcher: &Dispatcher,
        ctx: &RunContext,
        event: &Event,
        state: State,
    ) -> Outcome {
        match &self.plan {
            Orchestration::Route => route::run(dispatcher, ctx, event, state).await,
            Orchestration::Sequential { agents } => {
                let agents = self.resolve(dispatcher, agents);
                sequential::run(dispatcher, ctx, event, state, &agents, "sequential").await
            }
            Orchestration::Collaborative { agents } => {
                let agents = self.resolve(dispatcher, agents);
                parallel::run(dispatcher, ctx, event, state, &agents, &self.settings).await
            }
            Orchestration::Loop {
                agent,
                max_iterations,
            } => looping::run(dispatcher, ctx, event, state, agent, *max_iterations).await,
            Orchestration::Mixed { stages } => {
                mixed::run(dispatcher, ctx, event, state, stages, self).await
            }
        }
    }

    /// Expand an empty agent list to every registered, non-excluded agent.
    pub(crate) fn resolve(&self, dispatcher: &Dispatcher, agents: &[String]) -> Vec<String> {
        if !agents.is_empty() {
            return agents.to_vec();
        }
        dispatcher
            .registry()
            .names()
            .into_iter()
            .filter(|name| self.excluded.binary_search(name).is_err())
            .collect()
    }
}

/// Join the soft errors collected across a composite run.
pub(crate) fn join_soft_errors(errors: &[String]) -> Option<String> {
    (!errors.is_empty()).then(|| errors.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_modes() {
        let mut config = OrchestrationConfig::default();
        assert_eq!(Orchestration::from_config(&config).unwrap(), Orchestration::Route);

        config.mode = OrchestrationMode::Sequential;
        config.sequence = vec!["a".into(), "b".into()];
        assert_eq!(
            Orchestration::from_config(&config).unwrap(),
            Orchestration::Sequential {
                agents: vec!["a".into(), "b".into()]
            }
        );

        config.mode = OrchestrationMode::Loop;
        assert!(Orchestration::from_config(&config).is_err());
        config.loop_agent = Some("refiner".into());
        config.max_iterations = 7;
        assert_eq!(
            Orchestration::from_config(&config).unwrap(),
            Orchestration::Loop {
                agent: "refiner".into(),
                max_iterations: 7
            }
        );
    }

    #[test]
    fn test_mixed_from_config() {
        let config = OrchestrationConfig {
            mode: OrchestrationMode::Mixed,
            collaborators: vec!["r1".into(), "r2".into()],
            sequence: vec!["writer".into()],
            ..OrchestrationConfig::default()
        };
        let plan = Orchestration::from_config(&config).unwrap();
        assert_eq!(
            plan,
            Orchestration::Mixed {
                stages: vec![
                    Stage::Parallel(vec!["r1".into(), "r2".into()]),
                    Stage::Agent("writer".into()),
                ]
            }
        );
        assert_eq!(plan.referenced_agents(), vec!["r1", "r2", "writer"]);
        assert_eq!(plan.mode(), OrchestrationMode::Mixed);
    }

    #[test]
    fn test_referenced_agents_dedup() {
        let plan = Orchestration::Mixed {
            stages: vec![
                Stage::Agent("a".into()),
                Stage::Loop {
                    agent: "a".into(),
                    max_iterations: 2,
                },
                Stage::Parallel(vec!["b".into(), "a".into()]),
            ],
        };
        assert_eq!(plan.referenced_agents(), vec!["a", "b"]);
        assert!(Orchestration::Route.referenced_agents().is_empty());
    }
}
