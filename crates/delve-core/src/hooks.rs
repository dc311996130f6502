//! Run lifecycle subscriptions.
//!
//! The orchestrator awaits every registered `RunHook` inline at each state
//! transition, after each capability invocation and when the run ends. Hooks
//! run in priority order (lowest value first) and cannot alter the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use delve_tools::ToolKind;
use delve_types::EngineEvent;

use crate::event_bus::EventBus;
use crate::orchestrator::{RunContext, RunOutcome, WorkflowState};

#[derive(Debug, Clone)]
pub struct ToolCompletion {
    pub tool: ToolKind,
    pub step_id: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

#[async_trait]
pub trait RunHook: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    async fn on_state_change(&self, _run: &RunContext, _from: WorkflowState, _to: WorkflowState) {}

    async fn on_tool_complete(&self, _run: &RunContext, _completion: &ToolCompletion) {}

    /// Called once the final text has been persisted.
    async fn on_text_complete(&self, _run: &RunContext, _text: &str) {}

    async fn on_finish(&self, _run: &RunContext, _outcome: &RunOutcome) {}
}

#[derive(Clone, Default)]
pub struct RunHooks {
    hooks: Vec<Arc<dyn RunHook>>,
}

impl RunHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn RunHook>) {
        self.hooks.push(hook);
        self.hooks.sort_by_key(|h| h.priority());
        tracing::debug!(
            "run hook registered (priority {})",
            self.hooks.last().map(|h| h.priority()).unwrap_or(0)
        );
    }

    pub async fn fire_state_change(&self, run: &RunContext, from: WorkflowState, to: WorkflowState) {
        for hook in &self.hooks {
            hook.on_state_change(run, from, to).await;
        }
    }

    pub async fn fire_tool_complete(&self, run: &RunContext, completion: &ToolCompletion) {
        for hook in &self.hooks {
            hook.on_tool_complete(run, completion).await;
        }
    }

    pub async fn fire_text_complete(&self, run: &RunContext, text: &str) {
        for hook in &self.hooks {
            hook.on_text_complete(run, text).await;
        }
    }

    pub async fn fire_finish(&self, run: &RunContext, outcome: &RunOutcome) {
        for hook in &self.hooks {
            hook.on_finish(run, outcome).await;
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Republishes run lifecycle on the engine event bus.
pub struct EventBusHook {
    bus: EventBus,
}

impl EventBusHook {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl RunHook for EventBusHook {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn on_state_change(&self, run: &RunContext, from: WorkflowState, to: WorkflowState) {
        self.bus.publish(EngineEvent::new(
            "run.state",
            json!({
                "sessionId": run.session_id,
                "messageId": run.message_id,
                "streamId": run.stream_id,
                "from": from.as_str(),
                "to": to.as_str(),
            }),
        ));
    }

    async fn on_tool_complete(&self, run: &RunContext, completion: &ToolCompletion) {
        self.bus.publish(EngineEvent::new(
            "run.tool",
            json!({
                "sessionId": run.session_id,
                "messageId": run.message_id,
                "tool": completion.tool.tool_name(),
                "stepId": completion.step_id,
                "success": completion.success,
                "durationMs": completion.duration.as_millis() as u64,
                "error": completion.error,
            }),
        ));
    }

    async fn on_finish(&self, run: &RunContext, outcome: &RunOutcome) {
        self.bus.publish(EngineEvent::new(
            "run.finished",
            json!({
                "sessionId": run.session_id,
                "messageId": run.message_id,
                "streamId": run.stream_id,
                "state": outcome.state.as_str(),
                "transitions": outcome.transitions,
                "capped": outcome.capped,
                "error": outcome.error,
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_types::ModelSpec;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        priority: i32,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RunHook for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn on_state_change(&self, _run: &RunContext, _from: WorkflowState, to: WorkflowState) {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(format!("{}:{}", self.name, to.as_str()));
            }
        }
    }

    fn run_context() -> RunContext {
        RunContext {
            session_id: "s1".to_string(),
            message_id: "m1".to_string(),
            stream_id: "st1".to_string(),
            model: ModelSpec::parse("scripted/test").expect("model"),
            prompt: "hi".to_string(),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn hooks_fire_in_priority_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = RunHooks::new();
        hooks.register(Arc::new(Recorder {
            name: "late".to_string(),
            priority: 10,
            seen: seen.clone(),
        }));
        hooks.register(Arc::new(Recorder {
            name: "early".to_string(),
            priority: -10,
            seen: seen.clone(),
        }));
        hooks
            .fire_state_change(&run_context(), WorkflowState::Start, WorkflowState::Analyzing)
            .await;
        assert_eq!(
            seen.lock().expect("seen").clone(),
            vec!["early:ANALYZING", "late:ANALYZING"]
        );
    }

    #[tokio::test]
    async fn event_bus_hook_publishes_transitions() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut hooks = RunHooks::new();
        hooks.register(Arc::new(EventBusHook::new(bus)));
        hooks
            .fire_state_change(&run_context(), WorkflowState::Analyzing, WorkflowState::Searching)
            .await;
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "run.state");
        assert_eq!(event.properties["to"], "SEARCHING");
        assert_eq!(event.session_id(), Some("s1"));
    }
}
