use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use delve_types::{ModelSpec, StepType};

mod model;
pub mod scripted;
mod search;

pub use model::{extract_first_json_object, ModelAnalyzer, ModelReporter, ModelSynthesizer};
pub use search::{favicon_for, ExaSearch, SearchConfig};

/// The closed set of capabilities a run may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Analyze,
    Search,
    Synthesize,
    Report,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Analyze,
        ToolKind::Search,
        ToolKind::Synthesize,
        ToolKind::Report,
    ];

    pub fn tool_name(self) -> &'static str {
        match self {
            ToolKind::Analyze => "analyzeQueryTool",
            ToolKind::Search => "webSearchTool",
            ToolKind::Synthesize => "synthesizeTool",
            ToolKind::Report => "generateReportTool",
        }
    }

    pub fn from_tool_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tool_name() == name)
    }

    pub fn step_type(self) -> StepType {
        match self {
            ToolKind::Analyze => StepType::Analysis,
            ToolKind::Search => StepType::Search,
            ToolKind::Synthesize => StepType::Evaluation,
            ToolKind::Report => StepType::Report,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeInput {
    pub prompt: String,
    /// Recent conversation turns, oldest first, as `role: content` lines.
    #[serde(default)]
    pub context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeOutput {
    pub needs_deep_search: bool,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHitSummary {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutput {
    pub query: String,
    #[serde(default)]
    pub results: Vec<SearchHitSummary>,
}

/// One collected search result handed to Synthesize and Report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub query: String,
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeInput {
    pub prompt: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeOutput {
    pub needs_more_search: bool,
    #[serde(default)]
    pub follow_up_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInput {
    pub prompt: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutput {
    pub report: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Analyze(AnalyzeInput),
    Search(SearchInput),
    Synthesize(SynthesizeInput),
    Report(ReportInput),
}

impl ToolInput {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolInput::Analyze(_) => ToolKind::Analyze,
            ToolInput::Search(_) => ToolKind::Search,
            ToolInput::Synthesize(_) => ToolKind::Synthesize,
            ToolInput::Report(_) => ToolKind::Report,
        }
    }

    /// JSON recorded as the step input.
    pub fn to_value(&self) -> Value {
        let value = match self {
            ToolInput::Analyze(input) => serde_json::to_value(input),
            ToolInput::Search(input) => serde_json::to_value(input),
            ToolInput::Synthesize(input) => serde_json::to_value(input),
            ToolInput::Report(input) => serde_json::to_value(input),
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Analyze(AnalyzeOutput),
    Search(SearchOutput),
    Synthesize(SynthesizeOutput),
    Report(ReportOutput),
}

impl ToolOutput {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolOutput::Analyze(_) => ToolKind::Analyze,
            ToolOutput::Search(_) => ToolKind::Search,
            ToolOutput::Synthesize(_) => ToolKind::Synthesize,
            ToolOutput::Report(_) => ToolKind::Report,
        }
    }

    /// JSON recorded as the step output.
    pub fn to_value(&self) -> Value {
        let value = match self {
            ToolOutput::Analyze(output) => serde_json::to_value(output),
            ToolOutput::Search(output) => serde_json::to_value(output),
            ToolOutput::Synthesize(output) => serde_json::to_value(output),
            ToolOutput::Report(output) => serde_json::to_value(output),
        };
        value.unwrap_or(Value::Null)
    }
}

/// A source surfaced by a capability, before it is assigned to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSource {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub favicon: String,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: ToolOutput,
    pub sources: Vec<DiscoveredSource>,
    pub reasoning: String,
}

/// Per-invocation context: the run's model and its cancellation token.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub model: ModelSpec,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(model: ModelSpec) -> Self {
        Self {
            model,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> ToolKind;
    async fn invoke(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult>;
}

/// Tag-to-implementation mapping used by the orchestrator.
#[derive(Clone, Default)]
pub struct CapabilitySet {
    tools: HashMap<ToolKind, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.tools.insert(capability.kind(), capability);
        self
    }

    pub fn is_complete(&self) -> bool {
        ToolKind::ALL.iter().all(|kind| self.tools.contains_key(kind))
    }

    pub async fn dispatch(&self, input: ToolInput, ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let kind = input.kind();
        let Some(tool) = self.tools.get(&kind) else {
            anyhow::bail!("capability `{}` is not registered", kind.tool_name());
        };
        let result = tool.invoke(input, ctx).await?;
        if result.output.kind() != kind {
            anyhow::bail!(
                "capability `{}` returned output for `{}`",
                kind.tool_name(),
                result.output.kind().tool_name()
            );
        }
        Ok(result)
    }

    pub async fn analyze(
        &self,
        input: AnalyzeInput,
        ctx: &ToolContext,
    ) -> anyhow::Result<(AnalyzeOutput, ToolResult)> {
        let result = self.dispatch(ToolInput::Analyze(input), ctx).await?;
        match &result.output {
            ToolOutput::Analyze(output) => Ok((output.clone(), result)),
            _ => anyhow::bail!("analyze returned a foreign output"),
        }
    }

    pub async fn search(
        &self,
        input: SearchInput,
        ctx: &ToolContext,
    ) -> anyhow::Result<ToolResult> {
        self.dispatch(ToolInput::Search(input), ctx).await
    }

    pub async fn synthesize(
        &self,
        input: SynthesizeInput,
        ctx: &ToolContext,
    ) -> anyhow::Result<(SynthesizeOutput, ToolResult)> {
        let result = self.dispatch(ToolInput::Synthesize(input), ctx).await?;
        match &result.output {
            ToolOutput::Synthesize(output) => Ok((output.clone(), result)),
            _ => anyhow::bail!("synthesize returned a foreign output"),
        }
    }

    pub async fn report(
        &self,
        input: ReportInput,
        ctx: &ToolContext,
    ) -> anyhow::Result<(ReportOutput, ToolResult)> {
        let result = self.dispatch(ToolInput::Report(input), ctx).await?;
        match &result.output {
            ToolOutput::Report(output) => Ok((output.clone(), result)),
            _ => anyhow::bail!("report returned a foreign output"),
        }
    }
}
