use crate::condition::LoopCondition;
use async_trait::async_trait;
use maestro_core::{CoreError, CoreResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::warn;

/// The shape in which the scheduler invokes the selected agents.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestrationPattern {
    Simple,
    Sequential,
    Parallel {
        timeout: Duration,
        fail_fast: bool,
    },
    Loop {
        max_iterations: u32,
        condition: Option<LoopCondition>,
    },
}

impl OrchestrationPattern {
    pub fn name(&self) -> &'static str {
        match self {
            OrchestrationPattern::Simple => "simple",
            OrchestrationPattern::Sequential => "sequential",
            OrchestrationPattern::Parallel { .. } => "parallel",
            OrchestrationPattern::Loop { .. } => "loop",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub timeout: Option<u64>,
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: Option<u32>,
    pub condition: Option<String>,
}

/// Recognized keys of the request's `context` object. Everything else is
/// passed through to agents untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub orchestration_pattern: Option<String>,
    pub agents: Option<Vec<String>>,
    pub agent_sequence: Option<Vec<String>>,
    pub parallel_config: Option<ParallelConfig>,
    pub loop_config: Option<LoopConfig>,
    /// Steps allowed to fail without halting a sequential plan.
    pub optional_agents: Option<Vec<String>>,
    /// Caller-requested ceiling on each invocation, seconds.
    pub timeout_seconds: Option<u64>,
}

impl RequestContext {
    pub fn from_value(value: Option<&serde_json::Value>) -> CoreResult<Self> {
        match value {
            None => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| CoreError::InvalidRequest(format!("bad request context: {e}"))),
        }
    }

    /// The caller overrode the plan when it named a pattern or an agent set.
    pub fn has_override(&self) -> bool {
        self.orchestration_pattern.is_some()
            || self.agents.as_ref().is_some_and(|a| !a.is_empty())
            || self.agent_sequence.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn override_agents(&self) -> Option<Vec<String>> {
        self.agent_sequence
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| self.agents.clone().filter(|a| !a.is_empty()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    pub fn optional_set(&self) -> HashSet<String> {
        self.optional_agents
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

/// Validated execution plan for one request.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub pattern: OrchestrationPattern,
    pub agents: Vec<String>,
    pub user_override: bool,
    pub optional: HashSet<String>,
}

/// What the planner proposes before registry validation.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerProposal {
    pub pattern: String,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Abstract plan producer. An LLM-backed implementation prompts with the
/// query and capability snapshot and parses the `{pattern, agents}` reply;
/// this crate ships a deterministic keyword heuristic for operation without
/// an LLM and for tests.
#[async_trait]
pub trait PlannerClient: Send + Sync {
    async fn plan(
        &self,
        query: &str,
        capabilities: &BTreeMap<String, Vec<String>>,
    ) -> CoreResult<PlannerProposal>;
}

/// Keyword-driven selection mirroring the platform's fallback behaviour:
/// search-flavoured queries go to data-search capabilities, reporting
/// queries to reporting capabilities, anything else to the first available
/// agent. Always proposes the `simple` pattern.
pub struct HeuristicPlanner;

const SEARCH_KEYWORDS: &[&str] = &["search", "find", "query", "data", "lookup"];
const REPORT_KEYWORDS: &[&str] = &["report", "analysis", "analytics", "summar"];

impl HeuristicPlanner {
    fn match_capability<'a>(
        query: &str,
        capabilities: &'a BTreeMap<String, Vec<String>>,
    ) -> Option<&'a Vec<String>> {
        let lower = query.to_lowercase();
        let wanted: &[&str] = if SEARCH_KEYWORDS.iter().any(|k| lower.contains(k)) {
            &["search", "data"]
        } else if REPORT_KEYWORDS.iter().any(|k| lower.contains(k)) {
            &["report", "analytic"]
        } else {
            return capabilities.values().next();
        };

        capabilities
            .iter()
            .find(|(name, _)| wanted.iter().any(|w| name.contains(w)))
            .map(|(_, agents)| agents)
            .or_else(|| capabilities.values().next())
    }
}

#[async_trait]
impl PlannerClient for HeuristicPlanner {
    async fn plan(
        &self,
        query: &str,
        capabilities: &BTreeMap<String, Vec<String>>,
    ) -> CoreResult<PlannerProposal> {
        let agents = Self::match_capability(query, capabilities)
            .and_then(|agents| agents.first())
            .map(|a| vec![a.clone()])
            .unwrap_or_default();
        Ok(PlannerProposal {
            pattern: "simple".to_string(),
            agents,
        })
    }
}

/// Build the concrete pattern from its name plus the request's configs.
/// Unknown names fall back to `simple` with a warning.
pub fn build_pattern(
    name: &str,
    ctx: &RequestContext,
    default_timeout: Duration,
) -> CoreResult<OrchestrationPattern> {
    match name {
        "simple" => Ok(OrchestrationPattern::Simple),
        "sequential" => Ok(OrchestrationPattern::Sequential),
        "parallel" => {
            let cfg = ctx.parallel_config.clone().unwrap_or_default();
            Ok(OrchestrationPattern::Parallel {
                timeout: cfg
                    .timeout
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
                fail_fast: cfg.fail_fast.unwrap_or(false),
            })
        }
        "loop" => {
            let cfg = ctx.loop_config.clone().unwrap_or_default();
            let condition = cfg
                .condition
                .as_deref()
                .map(LoopCondition::parse)
                .transpose()?;
            Ok(OrchestrationPattern::Loop {
                max_iterations: cfg.max_iterations.unwrap_or(10),
                condition,
            })
        }
        other => {
            warn!(pattern = %other, "unknown pattern name, using simple");
            Ok(OrchestrationPattern::Simple)
        }
    }
}
