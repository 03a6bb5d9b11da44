use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tracing::{error, warn};

use braid_core::settings::{AgentSettings, ToolSettings};
use braid_core::tools::{Tool, ToolContext, ToolDefinition};

/// Which of the master's tools a sub-agent may call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolFilter {
    InheritAll,
    InheritExcept(HashSet<String>),
    Explicit(HashSet<String>),
}

impl ToolFilter {
    /// An explicit `tools` list wins over `excludeTools`.
    pub fn for_agent(agent: &AgentSettings) -> Self {
        match &agent.tools {
            Some(tools) => Self::Explicit(tools.iter().cloned().collect()),
            None if !agent.exclude_tools.is_empty() => {
                Self::InheritExcept(agent.exclude_tools.iter().cloned().collect())
            }
            None => Self::InheritAll,
        }
    }

    fn allows(&self, name: &str) -> bool {
        match self {
            Self::InheritAll => true,
            Self::InheritExcept(excluded) => !excluded.contains(name),
            Self::Explicit(included) => included.contains(name),
        }
    }
}

/// Structured failure of one tool call, fed back to the producer.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolFailure {
    pub error_text: String,
    pub error_kind: String,
}

impl ToolFailure {
    pub fn new(error_kind: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            error_text: error_text.into(),
            error_kind: error_kind.into(),
        }
    }
}

#[derive(Debug)]
pub struct ToolOutcome {
    pub result: Result<Value, ToolFailure>,
    pub duration: Duration,
}

/// Closed registry of tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions handed to the producer, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Copy of this registry restricted to what `filter` allows.
    pub fn clone_for_subagent(&self, filter: &ToolFilter) -> Self {
        let tools = self
            .tools
            .iter()
            .filter(|(name, _)| filter.allows(name))
            .map(|(name, tool)| (name.clone(), Arc::clone(tool)))
            .collect();
        Self { tools }
    }

    /// Run one tool call under its category timeout. Failures of every kind,
    /// panics included, come back as a `ToolFailure` rather than an error.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        ctx: &ToolContext,
        settings: &ToolSettings,
    ) -> ToolOutcome {
        let start = Instant::now();
        let Some(tool) = self.get(name) else {
            warn!(tool = %name, tool_call_id = %ctx.tool_call_id, "unknown tool requested");
            return ToolOutcome {
                result: Err(ToolFailure::new("unknown_tool", format!("Unknown tool: {name}"))),
                duration: start.elapsed(),
            };
        };

        let timeout = settings.timeout_for(tool.category());
        let guarded = std::panic::AssertUnwindSafe(tool.execute(input, ctx)).catch_unwind();
        let result = tokio::time::timeout(timeout, guarded).await;

        let result = match result {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(ToolFailure::new(e.error_kind(), e.to_string())),
            Ok(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(tool = %name, panic = %msg, "tool panicked during execution");
                Err(ToolFailure::new("panic", "Internal error: tool crashed"))
            }
            Err(_) => {
                warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool timed out");
                Err(ToolFailure::new("timeout", timeout_text(timeout)))
            }
        };
        ToolOutcome {
            result,
            duration: start.elapsed(),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn timeout_text(timeout: Duration) -> String {
    if timeout.as_secs() > 0 {
        format!("Tool timed out after {}s", timeout.as_secs())
    } else {
        format!("Tool timed out after {}ms", timeout.as_millis())
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{tool_context, EchoTool, FailingTool, PanicTool, SlowTool};
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool::control()));
        registry.register(Arc::new(PanicTool));
        registry.register(Arc::new(FailingTool));
        registry
    }

    #[test]
    fn register_and_lookup() {
        let registry = registry();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("Write").is_none());
        assert_eq!(registry.count(), 4);
    }

    #[test]
    fn names_and_definitions_sorted() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["echo", "failing", "panic", "slow"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[3].name, "slow");
    }

    #[test]
    fn clone_for_subagent_filters() {
        let registry = registry();
        assert_eq!(registry.clone_for_subagent(&ToolFilter::InheritAll).count(), 4);

        let except = ToolFilter::InheritExcept(HashSet::from(["panic".to_string()]));
        let sub = registry.clone_for_subagent(&except);
        assert_eq!(sub.count(), 3);
        assert!(sub.get("panic").is_none());

        let only = ToolFilter::Explicit(HashSet::from(["echo".to_string()]));
        assert_eq!(registry.clone_for_subagent(&only).names(), vec!["echo"]);
    }

    #[test]
    fn filter_follows_agent_settings() {
        let mut agent = AgentSettings {
            name: "researcher".into(),
            ..Default::default()
        };
        assert_eq!(ToolFilter::for_agent(&agent), ToolFilter::InheritAll);

        agent.exclude_tools = vec!["panic".into()];
        assert_eq!(
            ToolFilter::for_agent(&agent),
            ToolFilter::InheritExcept(HashSet::from(["panic".to_string()]))
        );

        agent.tools = Some(vec!["echo".into(), "slow".into()]);
        let sub = registry().clone_for_subagent(&ToolFilter::for_agent(&agent));
        assert_eq!(sub.names(), vec!["echo", "slow"]);
    }

    #[tokio::test]
    async fn executes_known_tool() {
        let outcome = registry()
            .execute("echo", json!({"x": 1}), &tool_context(), &ToolSettings::default())
            .await;
        assert_eq!(outcome.result.unwrap(), json!({"echo": {"x": 1}}));
    }

    #[tokio::test]
    async fn unknown_tool_is_recoverable_failure() {
        let outcome = registry()
            .execute("nope", json!({}), &tool_context(), &ToolSettings::default())
            .await;
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.error_kind, "unknown_tool");
        assert!(failure.error_text.contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn control_category_timeout_applies() {
        let settings = ToolSettings {
            control_timeout_ms: 50,
            ..Default::default()
        };
        let outcome = registry().execute("slow", json!({}), &tool_context(), &settings).await;
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.error_kind, "timeout");
        assert_eq!(failure.error_text, "Tool timed out after 50ms");
    }

    #[tokio::test]
    async fn panic_becomes_error_result() {
        let outcome = registry()
            .execute("panic", json!({}), &tool_context(), &ToolSettings::default())
            .await;
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.error_kind, "panic");
        assert_eq!(failure.error_text, "Internal error: tool crashed");
    }

    #[tokio::test]
    async fn tool_error_keeps_its_kind() {
        let outcome = registry()
            .execute("failing", json!({}), &tool_context(), &ToolSettings::default())
            .await;
        assert_eq!(outcome.result.unwrap_err().error_kind, "execution_failed");
    }

    #[test]
    fn panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&boxed), "static str");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&boxed), "unknown panic");
    }
}
