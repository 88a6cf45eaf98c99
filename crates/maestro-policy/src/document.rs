use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of governed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Agent,
    Tool,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Agent => write!(f, "agent"),
            ResourceType::Tool => write!(f, "tool"),
        }
    }
}

/// Per-role allow/deny lists over agent ids and tool ids. `*` matches
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleRules {
    pub allow_agents: Vec<String>,
    pub deny_agents: Vec<String>,
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
}

fn matches(list: &[String], id: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == id)
}

impl RoleRules {
    pub fn allows(&self, resource: ResourceType, id: &str) -> bool {
        match resource {
            ResourceType::Agent => matches(&self.allow_agents, id),
            ResourceType::Tool => matches(&self.allow_tools, id),
        }
    }

    pub fn denies(&self, resource: ResourceType, id: &str) -> bool {
        match resource {
            ResourceType::Agent => matches(&self.deny_agents, id),
            ResourceType::Tool => matches(&self.deny_tools, id),
        }
    }
}

/// Per-resource execution restrictions. Keys in the document are
/// `"{resource_type}:{resource_id}"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRestrictions {
    /// Seconds; stamped into decisions so the scheduler can impose a
    /// deadline.
    pub max_execution_time: Option<u64>,
    /// When present, every parameter key must appear here (`*` disables the
    /// check).
    pub allowed_parameters: Option<Vec<String>>,
    pub forbidden_parameters: Vec<String>,
    pub rate_limit_per_hour: Option<u32>,
}

/// Scope-wide rate ceilings, all fixed one-hour windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub global_per_hour: Option<u32>,
    pub per_user_per_hour: Option<u32>,
}

/// Immutable policy document. Loaded at start-up and on hot-reload; the
/// engine swaps the whole document atomically, so in-flight evaluations
/// keep the version they started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    /// `allow` or `deny`; applied when no rule matches.
    pub default_policy: String,
    pub roles: HashMap<String, RoleRules>,
    pub restrictions: HashMap<String, ResourceRestrictions>,
    pub rate_limits: RateLimits,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            default_policy: "deny".to_string(),
            roles: HashMap::new(),
            restrictions: HashMap::new(),
            rate_limits: RateLimits::default(),
        }
    }
}

impl PolicyDocument {
    pub fn default_allows(&self) -> bool {
        self.default_policy.eq_ignore_ascii_case("allow")
    }

    pub fn role(&self, role: &str) -> Option<&RoleRules> {
        self.roles.get(role)
    }

    pub fn restrictions_for(
        &self,
        resource: ResourceType,
        id: &str,
    ) -> Option<&ResourceRestrictions> {
        self.restrictions.get(&format!("{resource}:{id}"))
    }

    /// Reject documents that could not mean anything at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if !self.default_policy.eq_ignore_ascii_case("allow")
            && !self.default_policy.eq_ignore_ascii_case("deny")
        {
            return Err(format!(
                "default_policy must be 'allow' or 'deny', got '{}'",
                self.default_policy
            ));
        }
        for key in self.restrictions.keys() {
            match key.split_once(':') {
                Some(("agent" | "tool", id)) if !id.is_empty() => {}
                _ => {
                    return Err(format!(
                        "restriction key '{key}' is not '<agent|tool>:<id>'"
                    ))
                }
            }
        }
        Ok(())
    }
}
