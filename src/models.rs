use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, str::FromStr};
use uuid::Uuid;

use crate::constants;

/// Model class an agent invocation runs against
///
/// The class determines the CLI model identifier, the cost rates applied to
/// token usage, and the weekly hour cap metered against the plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Opus => "opus",
            ModelClass::Sonnet => "sonnet",
            ModelClass::Haiku => "haiku",
        }
    }

    /// Full model identifier passed to the CLI via `--model`.
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelClass::Opus => constants::MODEL_ID_OPUS,
            ModelClass::Sonnet => constants::MODEL_ID_SONNET,
            ModelClass::Haiku => constants::MODEL_ID_HAIKU,
        }
    }

    /// Published input rate, USD per million tokens.
    pub fn input_rate(&self) -> Decimal {
        match self {
            ModelClass::Opus => dec!(15.00),
            ModelClass::Sonnet => dec!(3.00),
            ModelClass::Haiku => dec!(0.25),
        }
    }

    /// Published output rate, USD per million tokens.
    pub fn output_rate(&self) -> Decimal {
        match self {
            ModelClass::Opus => dec!(75.00),
            ModelClass::Sonnet => dec!(15.00),
            ModelClass::Haiku => dec!(1.25),
        }
    }

    /// Weekly hour cap for this class, `None` when unmetered.
    pub fn weekly_hour_limit(&self) -> Option<f64> {
        match self {
            ModelClass::Opus => Some(constants::WEEKLY_OPUS_HOUR_LIMIT),
            ModelClass::Sonnet => Some(constants::WEEKLY_SONNET_HOUR_LIMIT),
            ModelClass::Haiku => None,
        }
    }

    pub fn all() -> [ModelClass; 3] {
        [ModelClass::Opus, ModelClass::Sonnet, ModelClass::Haiku]
    }
}

impl FromStr for ModelClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opus" => Ok(ModelClass::Opus),
            "sonnet" => Ok(ModelClass::Sonnet),
            "haiku" => Ok(ModelClass::Haiku),
            _ => Err(format!("Unknown model class: {s}")),
        }
    }
}

/// Types of specialized agents available in the system
///
/// Each type carries a default configuration: model class, output budget,
/// invocation timeout, retry budget, and whether dispatch must pass the
/// approval gate first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    BusinessAnalyst,
    CodeReviewer,
    TestRunner,
    TechnicalArchitect,
    DevelopmentPlanner,
    SopEnforcer,
    GeneralPurpose,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::BusinessAnalyst => "business-analyst",
            AgentType::CodeReviewer => "code-reviewer",
            AgentType::TestRunner => "test-runner",
            AgentType::TechnicalArchitect => "technical-architect",
            AgentType::DevelopmentPlanner => "development-planner",
            AgentType::SopEnforcer => "sop-enforcer",
            AgentType::GeneralPurpose => "general-purpose",
        }
    }

    pub fn all() -> [AgentType; 7] {
        [
            AgentType::BusinessAnalyst,
            AgentType::CodeReviewer,
            AgentType::TestRunner,
            AgentType::TechnicalArchitect,
            AgentType::DevelopmentPlanner,
            AgentType::SopEnforcer,
            AgentType::GeneralPurpose,
        ]
    }

    /// Default configuration for this agent type.
    pub fn default_config(&self) -> AgentConfig {
        match self {
            AgentType::BusinessAnalyst => AgentConfig {
                model: ModelClass::Sonnet,
                max_output_tokens: 8192,
                timeout_seconds: Some(600),
                max_retries: 1,
                requires_approval: false,
            },
            AgentType::CodeReviewer => AgentConfig {
                model: ModelClass::Opus,
                max_output_tokens: 8192,
                timeout_seconds: Some(900),
                max_retries: 1,
                requires_approval: false,
            },
            AgentType::TestRunner => AgentConfig {
                model: ModelClass::Haiku,
                max_output_tokens: 4096,
                timeout_seconds: Some(1200),
                max_retries: 2,
                requires_approval: false,
            },
            AgentType::TechnicalArchitect => AgentConfig {
                model: ModelClass::Opus,
                max_output_tokens: 16384,
                timeout_seconds: Some(900),
                max_retries: 1,
                requires_approval: false,
            },
            AgentType::DevelopmentPlanner => AgentConfig {
                model: ModelClass::Sonnet,
                max_output_tokens: 8192,
                timeout_seconds: Some(600),
                max_retries: 1,
                requires_approval: false,
            },
            AgentType::SopEnforcer => AgentConfig {
                model: ModelClass::Sonnet,
                max_output_tokens: 4096,
                timeout_seconds: Some(600),
                max_retries: 1,
                requires_approval: true,
            },
            AgentType::GeneralPurpose => AgentConfig {
                model: ModelClass::Sonnet,
                max_output_tokens: 8192,
                timeout_seconds: Some(600),
                max_retries: 0,
                requires_approval: false,
            },
        }
    }

    /// Infer the agent type from free text when the caller does not name one.
    ///
    /// Case-insensitive substring scan over the ordered keyword table; the
    /// first hit wins and the fallback is `general-purpose`.
    pub fn infer(description: &str, prompt: &str) -> AgentType {
        let haystack = format!("{} {}", description, prompt).to_lowercase();

        const KEYWORD_TABLE: &[(&[&str], AgentType)] = &[
            (
                &["requirement", "user story", "analyze requirements"],
                AgentType::BusinessAnalyst,
            ),
            (&["review", "code quality"], AgentType::CodeReviewer),
            (&["test", "coverage"], AgentType::TestRunner),
            (&["architecture", "design"], AgentType::TechnicalArchitect),
            (&["plan", "roadmap"], AgentType::DevelopmentPlanner),
            (&["sop", "compliance"], AgentType::SopEnforcer),
        ];

        for (keywords, agent_type) in KEYWORD_TABLE {
            if keywords.iter().any(|k| haystack.contains(k)) {
                return *agent_type;
            }
        }

        AgentType::GeneralPurpose
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "business-analyst" => Ok(AgentType::BusinessAnalyst),
            "code-reviewer" => Ok(AgentType::CodeReviewer),
            "test-runner" => Ok(AgentType::TestRunner),
            "technical-architect" => Ok(AgentType::TechnicalArchitect),
            "development-planner" => Ok(AgentType::DevelopmentPlanner),
            "sop-enforcer" => Ok(AgentType::SopEnforcer),
            "general-purpose" => Ok(AgentType::GeneralPurpose),
            _ => Err(format!("Unknown agent type: {s}")),
        }
    }
}

/// Effective configuration of one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: ModelClass,
    pub max_output_tokens: u32,
    /// Per-invocation timeout passed to the CLI; `None` lets it run.
    pub timeout_seconds: Option<u64>,
    /// Caller-side retry budget. The kernel itself never retries a spawn.
    pub max_retries: u32,
    pub requires_approval: bool,
}

/// Caller overrides merged over an agent type's defaults at spawn time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOverrides {
    pub model: Option<ModelClass>,
    pub max_output_tokens: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

impl AgentConfig {
    pub fn merged(mut self, overrides: &SpawnOverrides) -> AgentConfig {
        if let Some(model) = overrides.model {
            self.model = model;
        }
        if let Some(max) = overrides.max_output_tokens {
            self.max_output_tokens = max;
        }
        if let Some(timeout) = overrides.timeout_seconds {
            self.timeout_seconds = Some(timeout);
        }
        self
    }
}

/// Current status of a task in the dispatch pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    AwaitingApproval,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A work item submitted to the dispatcher
///
/// Priority is an integer, higher first; ties break FIFO. Dependencies name
/// other task ids that must be terminal before this task dispatches. The
/// context map carries free-form data; the dispatcher understands the keys
/// `locks`, `user_id`, `session_id`, `approval_type`, `risk`, `resource` and
/// `reversible`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub prompt: String,
    pub priority: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub context: HashMap<String, String>,
    pub dependencies: Vec<String>,
    /// Explicit agent type; inferred from description + prompt when absent.
    pub agent_type: Option<AgentType>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            prompt: prompt.into(),
            priority: 0,
            deadline: None,
            context: HashMap::new(),
            dependencies: Vec::new(),
            agent_type: None,
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// User the task is attributed to for metering; `system` when anonymous.
    pub fn user_id(&self) -> String {
        self.context
            .get("user_id")
            .cloned()
            .unwrap_or_else(|| "system".to_string())
    }

    /// Resolved agent type: explicit, else inferred from the text.
    pub fn resolved_agent_type(&self) -> AgentType {
        self.agent_type
            .unwrap_or_else(|| AgentType::infer(&self.description, &self.prompt))
    }
}

/// Lifecycle state of one supervised subprocess
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    Initializing,
    Working,
    /// Valid only while the owning task's approval gate is open. The kernel
    /// resolves approvals before spawning, so the spawner never produces it;
    /// the state exists for surfaces that register instances ahead of gating.
    WaitingApproval,
    Completed,
    Failed,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Initializing => "initializing",
            AgentState::Working => "working",
            AgentState::WaitingApproval => "waiting-approval",
            AgentState::Completed => "completed",
            AgentState::Failed => "failed",
            AgentState::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Completed | AgentState::Failed | AgentState::Terminated
        )
    }

    /// States that count against the spawner's concurrency cap.
    pub fn is_live(&self) -> bool {
        matches!(self, AgentState::Initializing | AgentState::Working)
    }
}

/// Runtime record of one agent subprocess
///
/// Owned exclusively by the spawner; external access is via cloned
/// snapshots. Retained for a window after exit to serve status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub agent_type: AgentType,
    pub task_id: String,
    pub config: AgentConfig,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub state: AgentState,
    pub ended_at: Option<DateTime<Utc>>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
}

impl AgentRecord {
    pub fn new(agent_type: AgentType, task_id: String, config: AgentConfig, work_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_type,
            task_id,
            config,
            work_dir,
            started_at: Utc::now(),
            state: AgentState::Initializing,
            ended_at: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
        }
    }

    /// Execution time in seconds, once the agent has ended.
    pub fn execution_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_type_from_keyword_table_in_order() {
        assert_eq!(
            AgentType::infer("run tests", ""),
            AgentType::TestRunner
        );
        assert_eq!(
            AgentType::infer("analyze requirements for checkout", ""),
            AgentType::BusinessAnalyst
        );
        // "review" outranks "test" in the ordered table
        assert_eq!(
            AgentType::infer("review the test suite", ""),
            AgentType::CodeReviewer
        );
        assert_eq!(
            AgentType::infer("draft a roadmap", ""),
            AgentType::DevelopmentPlanner
        );
        assert_eq!(AgentType::infer("do the thing", ""), AgentType::GeneralPurpose);
    }

    #[test]
    fn inference_scans_prompt_as_well() {
        assert_eq!(
            AgentType::infer("", "check sop compliance before merging"),
            AgentType::SopEnforcer
        );
    }

    #[test]
    fn merged_config_applies_overrides() {
        let base = AgentType::TestRunner.default_config();
        let merged = base.merged(&SpawnOverrides {
            model: Some(ModelClass::Opus),
            max_output_tokens: None,
            timeout_seconds: Some(42),
        });
        assert_eq!(merged.model, ModelClass::Opus);
        assert_eq!(merged.timeout_seconds, Some(42));
        assert_eq!(
            merged.max_output_tokens,
            AgentType::TestRunner.default_config().max_output_tokens
        );
    }

    #[test]
    fn model_ids_are_the_published_strings() {
        assert_eq!(ModelClass::Opus.model_id(), "claude-3-opus-20240229");
        assert_eq!(ModelClass::Sonnet.model_id(), "claude-3-5-sonnet-20241022");
        assert_eq!(ModelClass::Haiku.model_id(), "claude-3-haiku-20240307");
    }
}
