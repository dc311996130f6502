//! Deterministic capabilities for tests and offline runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::search::{favicon_for, search_result};
use crate::{
    AnalyzeOutput, Capability, DiscoveredSource, ReportOutput, SynthesizeOutput, ToolContext,
    ToolInput, ToolKind, ToolOutput, ToolResult,
};

pub struct ScriptedAnalyzer {
    outcome: Result<AnalyzeOutput, String>,
}

impl ScriptedAnalyzer {
    pub fn direct() -> Self {
        Self {
            outcome: Ok(AnalyzeOutput {
                needs_deep_search: false,
                search_queries: Vec::new(),
                reasoning: "answerable without search".to_string(),
            }),
        }
    }

    pub fn deep(queries: &[&str]) -> Self {
        Self {
            outcome: Ok(AnalyzeOutput {
                needs_deep_search: true,
                search_queries: queries.iter().map(|q| q.to_string()).collect(),
                reasoning: "needs current sources".to_string(),
            }),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl Capability for ScriptedAnalyzer {
    fn kind(&self) -> ToolKind {
        ToolKind::Analyze
    }

    async fn invoke(&self, _input: ToolInput, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let output = self.outcome.clone().map_err(anyhow::Error::msg)?;
        Ok(ToolResult {
            reasoning: output.reasoning.clone(),
            output: ToolOutput::Analyze(output),
            sources: Vec::new(),
        })
    }
}

/// Search that fabricates one source per query, with optional per-query
/// delays, failures and a shared url surfaced by every query.
#[derive(Default)]
pub struct ScriptedSearch {
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    shared_url: Option<String>,
    gate: Option<Arc<Semaphore>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, query: &str, delay: Duration) -> Self {
        self.delays.insert(query.to_string(), delay);
        self
    }

    pub fn with_failure(mut self, query: &str) -> Self {
        self.failures.insert(query.to_string());
        self
    }

    pub fn with_shared_url(mut self, url: &str) -> Self {
        self.shared_url = Some(url.to_string());
        self
    }

    /// Every search waits for one permit from `gate` before returning.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queries in the order their searches finished.
    pub fn completion_order(&self) -> Vec<String> {
        self.completed
            .lock()
            .map(|order| order.clone())
            .unwrap_or_default()
    }

    fn sources_for(&self, query: &str) -> Vec<DiscoveredSource> {
        let slug = query
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect::<String>();
        let mut urls = vec![format!("https://example.com/{slug}")];
        urls.extend(self.shared_url.clone());
        urls.into_iter()
            .map(|url| DiscoveredSource {
                title: format!("Result for {query}"),
                content: format!("Findings about {query}"),
                favicon: favicon_for(&url),
                images: Vec::new(),
                url,
            })
            .collect()
    }
}

#[async_trait]
impl Capability for ScriptedSearch {
    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    async fn invoke(&self, input: ToolInput, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Search(input) = input else {
            anyhow::bail!("webSearchTool received a foreign input");
        };
        if let Some(delay) = self.delays.get(&input.query) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        if let Ok(mut completed) = self.completed.lock() {
            completed.push(input.query.clone());
        }
        if self.failures.contains(&input.query) {
            anyhow::bail!("search backend unavailable for `{}`", input.query);
        }
        Ok(search_result(&input.query, self.sources_for(&input.query)))
    }
}

enum SynthesisMode {
    Done,
    AlwaysMore,
    FollowUpOnce(Vec<String>),
    Fail(String),
}

pub struct ScriptedSynthesizer {
    mode: SynthesisMode,
    calls: AtomicUsize,
}

impl ScriptedSynthesizer {
    fn with_mode(mode: SynthesisMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn done() -> Self {
        Self::with_mode(SynthesisMode::Done)
    }

    /// Requests one more search on every call.
    pub fn always_more() -> Self {
        Self::with_mode(SynthesisMode::AlwaysMore)
    }

    /// Requests `queries` on the first call, then finishes.
    pub fn follow_up_once(queries: &[&str]) -> Self {
        Self::with_mode(SynthesisMode::FollowUpOnce(
            queries.iter().map(|q| q.to_string()).collect(),
        ))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_mode(SynthesisMode::Fail(message.into()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for ScriptedSynthesizer {
    fn kind(&self) -> ToolKind {
        ToolKind::Synthesize
    }

    async fn invoke(&self, input: ToolInput, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Synthesize(input) = input else {
            anyhow::bail!("synthesizeTool received a foreign input");
        };
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let follow_up_queries = match &self.mode {
            SynthesisMode::Done => Vec::new(),
            SynthesisMode::AlwaysMore => vec![format!("follow-up {}", call + 1)],
            SynthesisMode::FollowUpOnce(queries) if call == 0 => queries.clone(),
            SynthesisMode::FollowUpOnce(_) => Vec::new(),
            SynthesisMode::Fail(message) => anyhow::bail!(message.clone()),
        };
        let output = SynthesizeOutput {
            needs_more_search: !follow_up_queries.is_empty(),
            follow_up_queries,
            reasoning: format!("reviewed {} findings", input.findings.len()),
            summary: format!("Summary of {} findings.", input.findings.len()),
        };
        Ok(ToolResult {
            reasoning: output.reasoning.clone(),
            output: ToolOutput::Synthesize(output),
            sources: Vec::new(),
        })
    }
}

pub struct ScriptedReporter {
    outcome: Result<String, String>,
}

impl ScriptedReporter {
    pub fn new(report: impl Into<String>) -> Self {
        Self {
            outcome: Ok(report.into()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }
}

#[async_trait]
impl Capability for ScriptedReporter {
    fn kind(&self) -> ToolKind {
        ToolKind::Report
    }

    async fn invoke(&self, input: ToolInput, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let ToolInput::Report(input) = input else {
            anyhow::bail!("generateReportTool received a foreign input");
        };
        let report = self.outcome.clone().map_err(anyhow::Error::msg)?;
        Ok(ToolResult {
            reasoning: format!("Compiled report from {} findings", input.findings.len()),
            output: ToolOutput::Report(ReportOutput { report }),
            sources: Vec::new(),
        })
    }
}
