use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::Level;

use delve_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use delve_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use delve_tools::{
    AnalyzeInput, AnalyzeOutput, CapabilitySet, Finding, ReportInput, SearchInput,
    SynthesizeInput, SynthesizeOutput, ToolContext, ToolKind, ToolResult,
};
use delve_types::ModelSpec;
use delve_wire::{ProgressStatus, StreamFrame};

use crate::config::WorkflowConfig;
use crate::error::{DelveError, DelveResult};
use crate::hooks::{RunHooks, ToolCompletion};
use crate::ledger::{CommittedStep, StepLedger, StepSlot};
use crate::multiplexer::{MuxWriter, StreamMultiplexer};
use crate::progress::ProgressTracker;
use crate::storage::Store;
use crate::stream_registry::FrameSink;

const DIRECT_ANSWER_PROMPT: &str = "You are a research assistant. The question can be answered \
without searching the web. Answer it directly and concisely.";

const SUMMARY_PROMPT: &str = "You are a research assistant. A detailed report has already been \
shown to the user. Write a short closing summary of its key findings.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Start,
    Analyzing,
    DirectAnswer,
    Searching,
    Synthesizing,
    Reporting,
    Finalizing,
    Done,
    Failed,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Start => "START",
            WorkflowState::Analyzing => "ANALYZING",
            WorkflowState::DirectAnswer => "DIRECT_ANSWER",
            WorkflowState::Searching => "SEARCHING",
            WorkflowState::Synthesizing => "SYNTHESIZING",
            WorkflowState::Reporting => "REPORTING",
            WorkflowState::Finalizing => "FINALIZING",
            WorkflowState::Done => "DONE",
            WorkflowState::Failed => "FAILED",
        }
    }

    /// Entering these states invokes a capability and counts against the step cap.
    pub fn invokes_tool(self) -> bool {
        matches!(
            self,
            WorkflowState::Analyzing
                | WorkflowState::Searching
                | WorkflowState::Synthesizing
                | WorkflowState::Reporting
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }
}

/// Everything a run needs to know about the turn it serves.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    /// The assistant placeholder the run fills in.
    pub message_id: String,
    pub stream_id: String,
    pub model: ModelSpec,
    pub prompt: String,
    /// Earlier turns of the session, oldest first.
    pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub state: WorkflowState,
    pub final_text: String,
    /// Tool-invoking transitions taken.
    pub transitions: u32,
    pub capped: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct StepBudget {
    cap: u32,
    used: u32,
}

impl StepBudget {
    fn new(cap: u32) -> Self {
        Self { cap, used: 0 }
    }

    fn try_take(&mut self) -> bool {
        if self.used >= self.cap {
            return false;
        }
        self.used += 1;
        true
    }
}

#[derive(Debug)]
struct RunTrack {
    state: WorkflowState,
    budget: StepBudget,
    capped: bool,
}

/// Stops a text stream once `max` lines have been produced.
#[derive(Debug)]
struct LineBudget {
    max: usize,
    lines: usize,
}

impl LineBudget {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            lines: 0,
        }
    }

    /// Returns the part of `delta` that fits and whether the budget is spent.
    fn clip<'a>(&mut self, delta: &'a str) -> (&'a str, bool) {
        for (idx, ch) in delta.char_indices() {
            if ch == '\n' {
                self.lines += 1;
                if self.lines >= self.max {
                    return (&delta[..idx], true);
                }
            }
        }
        (delta, false)
    }
}

/// Drives one deep search run from ANALYZING to DONE or FAILED.
///
/// The orchestrator walks the state machine itself and invokes capabilities by
/// tag. Every outbound frame goes through the run's `StreamMultiplexer`, and
/// every capability invocation is committed to the `StepLedger` at the
/// position reserved when it was dispatched.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    store: Arc<dyn Store>,
    capabilities: CapabilitySet,
    providers: ProviderRegistry,
    hooks: RunHooks,
    config: WorkflowConfig,
    channel_capacity: usize,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        capabilities: CapabilitySet,
        providers: ProviderRegistry,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            capabilities,
            providers,
            hooks: RunHooks::new(),
            config,
            channel_capacity: 256,
        }
    }

    pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs to completion. Never returns early on client disconnect; the
    /// frames land in `sink` whether or not anyone is reading them.
    pub async fn run(&self, ctx: RunContext, sink: Box<dyn FrameSink>) -> RunOutcome {
        let started = Instant::now();
        let prompt = redact_text(&ctx.prompt);
        self.log(Level::INFO, "run.started", &ctx, Some("START"), None, Some(&prompt));

        let mux = StreamMultiplexer::spawn(sink, self.channel_capacity);
        let writer = mux.writer();
        let mut track = RunTrack {
            state: WorkflowState::Start,
            budget: StepBudget::new(self.config.step_cap),
            capped: false,
        };

        let result = self.execute(&ctx, writer.clone(), &mut track).await;
        let (terminal, final_text, error) = match result {
            Ok(text) => {
                writer.send(StreamFrame::Finish).await;
                (WorkflowState::Done, text, None)
            }
            Err(err) => {
                // Open text segments are closed by the multiplexer before this frame.
                writer.send(StreamFrame::error(err.to_string())).await;
                self.log(
                    Level::ERROR,
                    "run.failed",
                    &ctx,
                    Some(track.state.as_str()),
                    Some(err.code()),
                    Some(&err.to_string()),
                );
                (WorkflowState::Failed, String::new(), Some(err.to_string()))
            }
        };
        drop(writer);

        let summary = mux.close().await;
        if summary.sink_errors > 0 {
            tracing::warn!(
                stream_id = %ctx.stream_id,
                "{} stream frames could not be registered",
                summary.sink_errors
            );
        }
        match self
            .store
            .clear_active_stream_if(&ctx.session_id, &ctx.stream_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                session_id = %ctx.session_id,
                "active stream already replaced; leaving it in place"
            ),
            Err(err) => tracing::error!(
                session_id = %ctx.session_id,
                "failed to clear active stream: {}",
                err
            ),
        }
        self.enter(&ctx, &mut track, terminal).await;

        let outcome = RunOutcome {
            state: terminal,
            final_text,
            transitions: track.budget.used,
            capped: track.capped,
            error,
        };
        self.hooks.fire_finish(&ctx, &outcome).await;
        if terminal == WorkflowState::Done {
            let detail = format!(
                "transitions={} capped={} frames={} elapsed_ms={}",
                outcome.transitions,
                outcome.capped,
                summary.written,
                started.elapsed().as_millis()
            );
            self.log(Level::INFO, "run.finished", &ctx, Some("DONE"), None, Some(&detail));
        }
        outcome
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        writer: MuxWriter,
        track: &mut RunTrack,
    ) -> DelveResult<String> {
        let ledger = StepLedger::open(self.store.clone(), &ctx.message_id).await?;
        let tracker = ProgressTracker::load(self.store.clone(), &ctx.message_id).await?;
        let run = Run {
            orchestrator: self,
            ctx,
            writer,
            ledger,
            tracker,
            tool_ctx: ToolContext::new(ctx.model.clone()),
        };
        run.drive(track).await
    }

    /// Moves the run to `to`. False when `to` invokes a tool and the step
    /// cap is already spent; the state is left unchanged in that case.
    async fn enter(&self, ctx: &RunContext, track: &mut RunTrack, to: WorkflowState) -> bool {
        if to.invokes_tool() && !track.budget.try_take() {
            track.capped = true;
            self.log(
                Level::WARN,
                "run.capped",
                ctx,
                Some(to.as_str()),
                None,
                Some(&format!("step cap {} reached", track.budget.cap)),
            );
            return false;
        }
        let from = track.state;
        track.state = to;
        self.log(Level::INFO, "run.state", ctx, Some(to.as_str()), None, None);
        self.hooks.fire_state_change(ctx, from, to).await;
        true
    }

    fn log(
        &self,
        level: Level,
        event: &str,
        ctx: &RunContext,
        status: Option<&str>,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                event,
                component: "orchestrator",
                session_id: Some(&ctx.session_id),
                run_id: Some(&ctx.stream_id),
                message_id: Some(&ctx.message_id),
                stream_id: Some(&ctx.stream_id),
                status,
                error_code,
                detail,
            },
        );
    }
}

/// Per-run working set. Only `&self` methods so parallel searches can share it.
struct Run<'a> {
    orchestrator: &'a WorkflowOrchestrator,
    ctx: &'a RunContext,
    writer: MuxWriter,
    ledger: StepLedger,
    tracker: ProgressTracker,
    tool_ctx: ToolContext,
}

impl Run<'_> {
    async fn drive(&self, track: &mut RunTrack) -> DelveResult<String> {
        let orchestrator = self.orchestrator;
        if !orchestrator.enter(self.ctx, track, WorkflowState::Analyzing).await {
            return self.finish_capped(track, "", &[]).await;
        }
        let analysis = self.analyze().await?;

        if !analysis.needs_deep_search {
            orchestrator
                .enter(self.ctx, track, WorkflowState::DirectAnswer)
                .await;
            self.tracker.mark_direct_answer().await?;
            self.tracker
                .emit_progress(&self.writer, "Answering directly", ProgressStatus::Running)
                .await;
            let text = self.stream_text(self.direct_messages(), None).await?;
            return self.finalize(track, text).await;
        }

        orchestrator
            .store
            .mark_message_deep_search(&self.ctx.message_id)
            .await?;
        let mut queries = normalize_queries(analysis.search_queries);
        if queries.is_empty() {
            queries.push(self.ctx.prompt.trim().to_string());
        }
        self.tracker.initialize(queries.len() as u32).await?;
        self.tracker
            .emit_progress(&self.writer, "Planning searches", ProgressStatus::Running)
            .await;

        let mut findings = Vec::new();
        let mut summary = String::new();
        loop {
            if !orchestrator.enter(self.ctx, track, WorkflowState::Searching).await {
                return self.finish_capped(track, &summary, &findings).await;
            }
            findings.extend(self.search_round(std::mem::take(&mut queries)).await?);

            if !orchestrator
                .enter(self.ctx, track, WorkflowState::Synthesizing)
                .await
            {
                return self.finish_capped(track, &summary, &findings).await;
            }
            let Some(evaluation) = self.synthesize(&findings).await? else {
                break;
            };
            if !evaluation.summary.trim().is_empty() {
                summary = evaluation.summary;
            }
            if !evaluation.needs_more_search {
                break;
            }
            let follow_ups = normalize_queries(evaluation.follow_up_queries);
            if follow_ups.is_empty() {
                break;
            }
            self.tracker.add_total(follow_ups.len() as u32).await?;
            self.tracker
                .emit_progress(&self.writer, "Planning follow-up searches", ProgressStatus::Running)
                .await;
            queries = follow_ups;
        }

        if !orchestrator.enter(self.ctx, track, WorkflowState::Reporting).await {
            return self.finish_capped(track, &summary, &findings).await;
        }
        let report = self.report(&findings).await?;
        let budget = orchestrator.config.summary_line_budget;
        let messages = self.summary_messages(report.as_deref(), &summary, &findings, budget);
        let text = self.stream_text(messages, Some(budget)).await?;
        self.finalize(track, text).await
    }

    async fn analyze(&self) -> DelveResult<AnalyzeOutput> {
        let slot = self.ledger.reserve();
        let input = AnalyzeInput {
            prompt: self.ctx.prompt.clone(),
            context: self
                .ctx
                .history
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect(),
        };
        let input_value = serde_json::to_value(&input).unwrap_or(Value::Null);
        let started = Instant::now();
        self.tracker
            .emit_progress(&self.writer, "Analyzing query", ProgressStatus::Running)
            .await;

        match self
            .orchestrator
            .capabilities
            .analyze(input, &self.tool_ctx)
            .await
        {
            Ok((output, result)) => {
                let committed = self
                    .record(&slot, ToolKind::Analyze, input_value, result, started)
                    .await?;
                self.publish_step(&committed).await;
                Ok(output)
            }
            Err(err) => {
                self.tool_finished(ToolKind::Analyze, &slot, started, Some(err.to_string()))
                    .await;
                Err(DelveError::UpstreamModel(err.to_string()))
            }
        }
    }

    /// Dispatches every query, at most `max_parallel_searches` at a time, and
    /// waits for all of them.
    async fn search_round(&self, queries: Vec<String>) -> DelveResult<Vec<Finding>> {
        let permits = Arc::new(Semaphore::new(
            self.orchestrator.config.max_parallel_searches.max(1),
        ));
        let dispatched = queries
            .into_iter()
            .map(|query| (self.ledger.reserve(), query))
            .collect::<Vec<_>>();
        let completions = dispatched.into_iter().map(|(slot, query)| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire_owned().await.ok();
                self.search_one(slot, query).await
            }
        });

        let mut findings = Vec::new();
        for result in join_all(completions).await {
            findings.extend(result?);
        }
        Ok(findings)
    }

    async fn search_one(&self, slot: StepSlot, query: String) -> DelveResult<Vec<Finding>> {
        let input = SearchInput {
            query: query.clone(),
        };
        let input_value = serde_json::to_value(&input).unwrap_or(Value::Null);
        let started = Instant::now();
        let committed = match self
            .orchestrator
            .capabilities
            .search(input, &self.tool_ctx)
            .await
        {
            Ok(result) => {
                self.record(&slot, ToolKind::Search, input_value, result, started)
                    .await?
            }
            Err(err) => {
                self.record_failure(
                    &slot,
                    ToolKind::Search,
                    &format!("Searching for: {query}"),
                    input_value,
                    &err,
                    started,
                )
                .await?
            }
        };

        // Failed searches advance progress like successful ones.
        self.tracker.increment().await?;
        self.tracker
            .emit_progress(
                &self.writer,
                &format!("Searched: {query}"),
                ProgressStatus::Running,
            )
            .await;
        self.publish_step(&committed).await;

        Ok(committed
            .sources
            .into_iter()
            .map(|source| Finding {
                query: query.clone(),
                title: source.name,
                url: source.url,
                content: source.content,
            })
            .collect())
    }

    /// `None` when the evaluation failed; the run then goes on to report.
    async fn synthesize(&self, findings: &[Finding]) -> DelveResult<Option<SynthesizeOutput>> {
        self.tracker
            .emit_progress(&self.writer, "Synthesizing findings", ProgressStatus::Running)
            .await;
        let slot = self.ledger.reserve();
        let input = SynthesizeInput {
            prompt: self.ctx.prompt.clone(),
            findings: findings.to_vec(),
        };
        let input_value = serde_json::to_value(&input).unwrap_or(Value::Null);
        let started = Instant::now();
        match self
            .orchestrator
            .capabilities
            .synthesize(input, &self.tool_ctx)
            .await
        {
            Ok((output, result)) => {
                let committed = self
                    .record(&slot, ToolKind::Synthesize, input_value, result, started)
                    .await?;
                self.publish_step(&committed).await;
                Ok(Some(output))
            }
            Err(err) => {
                let committed = self
                    .record_failure(
                        &slot,
                        ToolKind::Synthesize,
                        "Evaluating findings",
                        input_value,
                        &err,
                        started,
                    )
                    .await?;
                self.publish_step(&committed).await;
                Ok(None)
            }
        }
    }

    async fn report(&self, findings: &[Finding]) -> DelveResult<Option<String>> {
        self.tracker
            .emit_progress(&self.writer, "Generating report", ProgressStatus::Running)
            .await;
        let slot = self.ledger.reserve();
        let input = ReportInput {
            prompt: self.ctx.prompt.clone(),
            findings: findings.to_vec(),
        };
        let input_value = serde_json::to_value(&input).unwrap_or(Value::Null);
        let started = Instant::now();
        match self
            .orchestrator
            .capabilities
            .report(input, &self.tool_ctx)
            .await
        {
            Ok((output, result)) => {
                let committed = self
                    .record(&slot, ToolKind::Report, input_value, result, started)
                    .await?;
                self.publish_step(&committed).await;
                self.writer.send(StreamFrame::report(output.report.clone())).await;
                Ok(Some(output.report))
            }
            Err(err) => {
                let committed = self
                    .record_failure(
                        &slot,
                        ToolKind::Report,
                        "Compiling report",
                        input_value,
                        &err,
                        started,
                    )
                    .await?;
                self.publish_step(&committed).await;
                Ok(None)
            }
        }
    }

    async fn record(
        &self,
        slot: &StepSlot,
        kind: ToolKind,
        input: Value,
        result: ToolResult,
        started: Instant,
    ) -> DelveResult<CommittedStep> {
        let committed = self
            .ledger
            .commit(
                slot,
                kind.step_type(),
                &result.reasoning,
                input,
                result.output.to_value(),
                result.sources,
            )
            .await?;
        self.tool_finished(kind, slot, started, None).await;
        Ok(committed)
    }

    async fn record_failure(
        &self,
        slot: &StepSlot,
        kind: ToolKind,
        reasoning: &str,
        input: Value,
        err: &anyhow::Error,
        started: Instant,
    ) -> DelveResult<CommittedStep> {
        let committed = self
            .ledger
            .commit(
                slot,
                kind.step_type(),
                reasoning,
                input,
                json!({ "error": err.to_string() }),
                Vec::new(),
            )
            .await?;
        self.tool_finished(kind, slot, started, Some(err.to_string()))
            .await;
        Ok(committed)
    }

    async fn tool_finished(
        &self,
        kind: ToolKind,
        slot: &StepSlot,
        started: Instant,
        error: Option<String>,
    ) {
        let (level, event) = match error {
            Some(_) => (Level::WARN, "tool.failed"),
            None => (Level::INFO, "tool.completed"),
        };
        let detail = match &error {
            Some(message) => format!("{} step={}: {}", kind.tool_name(), slot.step_id, message),
            None => format!("{} step={}", kind.tool_name(), slot.step_id),
        };
        self.orchestrator.log(
            level,
            event,
            self.ctx,
            Some(kind.tool_name()),
            error.as_ref().map(|_| "tool_execution"),
            Some(&detail),
        );
        let completion = ToolCompletion {
            tool: kind,
            step_id: slot.step_id.clone(),
            success: error.is_none(),
            duration: started.elapsed(),
            error,
        };
        self.orchestrator
            .hooks
            .fire_tool_complete(self.ctx, &completion)
            .await;
    }

    /// Emits the step frame and one source frame per url not seen earlier in
    /// the message. Replayed commits emit nothing.
    async fn publish_step(&self, committed: &CommittedStep) {
        if !committed.inserted {
            return;
        }
        self.writer
            .send(StreamFrame::step(&committed.step, &committed.sources))
            .await;
        for source in &committed.new_sources {
            self.writer.send(StreamFrame::source(source)).await;
        }
    }

    /// Streams model text into the message's text segment.
    async fn stream_text(
        &self,
        messages: Vec<ChatMessage>,
        line_budget: Option<usize>,
    ) -> DelveResult<String> {
        let mut stream = self
            .orchestrator
            .providers
            .stream_for(&self.ctx.model, messages, self.tool_ctx.cancel.clone())
            .await
            .map_err(|err| DelveError::UpstreamModel(err.to_string()))?;

        let segment = self.ctx.message_id.as_str();
        self.writer.text_start(segment).await;
        let mut budget = line_budget.map(LineBudget::new);
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|err| DelveError::UpstreamModel(err.to_string()))? {
                StreamChunk::TextDelta(delta) => {
                    let (piece, spent) = match budget.as_mut() {
                        Some(budget) => budget.clip(&delta),
                        None => (delta.as_str(), false),
                    };
                    if !piece.is_empty() {
                        text.push_str(piece);
                        self.writer.text_delta(segment, piece).await;
                    }
                    if spent {
                        break;
                    }
                }
                StreamChunk::ReasoningDelta(_) => {}
                StreamChunk::Done { .. } => break,
            }
        }
        self.writer.text_end(segment).await;
        Ok(text)
    }

    /// Emits already-known text as the message's text segment.
    async fn emit_text(&self, text: &str) {
        let segment = self.ctx.message_id.as_str();
        self.writer.text_start(segment).await;
        self.writer.text_delta(segment, text).await;
        self.writer.text_end(segment).await;
    }

    fn direct_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.ctx.history.len() + 2);
        messages.push(ChatMessage::system(DIRECT_ANSWER_PROMPT));
        messages.extend(self.ctx.history.iter().cloned());
        messages.push(ChatMessage::user(self.ctx.prompt.clone()));
        messages
    }

    fn summary_messages(
        &self,
        report: Option<&str>,
        summary: &str,
        findings: &[Finding],
        line_budget: usize,
    ) -> Vec<ChatMessage> {
        let material = match report.filter(|r| !r.trim().is_empty()) {
            Some(report) => format!("Report:\n{report}"),
            None if !summary.trim().is_empty() => format!("Findings summary:\n{summary}"),
            None => format!("Findings:\n{}", findings_digest(findings, usize::MAX)),
        };
        vec![
            ChatMessage::system(format!(
                "{SUMMARY_PROMPT} Use at most {} lines.",
                line_budget.max(1)
            )),
            ChatMessage::user(format!("Question: {}\n\n{}", self.ctx.prompt, material)),
        ]
    }

    async fn finish_capped(
        &self,
        track: &mut RunTrack,
        summary: &str,
        findings: &[Finding],
    ) -> DelveResult<String> {
        let text = if !summary.trim().is_empty() {
            summary.trim().to_string()
        } else if !findings.is_empty() {
            let budget = self.orchestrator.config.summary_line_budget.max(1);
            format!(
                "Research stopped after {} steps. Sources reviewed:\n{}",
                track.budget.used,
                findings_digest(findings, budget.saturating_sub(1).max(1))
            )
        } else {
            String::new()
        };
        if !text.is_empty() {
            self.emit_text(&text).await;
        }
        self.finalize(track, text).await
    }

    async fn finalize(&self, track: &mut RunTrack, text: String) -> DelveResult<String> {
        self.orchestrator
            .enter(self.ctx, track, WorkflowState::Finalizing)
            .await;
        if !text.trim().is_empty() {
            self.orchestrator
                .store
                .update_message_content(&self.ctx.message_id, &text)
                .await?;
        }
        if !self.tracker.state().await.is_complete {
            self.tracker.mark_complete().await?;
        }
        self.tracker
            .emit_progress(&self.writer, "Complete", ProgressStatus::Done)
            .await;
        self.orchestrator
            .hooks
            .fire_text_complete(self.ctx, &text)
            .await;
        Ok(text)
    }
}

/// Trims, drops empties and removes repeats, keeping first-seen order.
fn normalize_queries(queries: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
        .collect()
}

fn findings_digest(findings: &[Finding], limit: usize) -> String {
    let mut seen = std::collections::HashSet::new();
    findings
        .iter()
        .filter(|f| seen.insert(f.url.as_str()))
        .take(limit)
        .map(|f| format!("- {} ({})", f.title, f.url))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;
    use crate::stream_registry::{MemoryStreamRegistry, StreamRegistry};
    use delve_providers::scripted::ScriptedProvider;
    use delve_providers::Provider;
    use delve_tools::scripted::{
        ScriptedAnalyzer, ScriptedReporter, ScriptedSearch, ScriptedSynthesizer,
    };
    use delve_types::{Message, StepType};
    use std::time::Duration;

    struct Harness {
        store: Arc<dyn Store>,
        registry: MemoryStreamRegistry,
        ctx: RunContext,
    }

    async fn harness(prompt: &str) -> Harness {
        let store: Arc<dyn Store> = Arc::new(FileStore::ephemeral());
        store
            .get_or_create_session("s1", "u1", Some(prompt))
            .await
            .expect("session");
        store
            .append_message(Message::user("s1", prompt))
            .await
            .expect("user");
        let placeholder = Message::assistant_placeholder("s1");
        let message_id = placeholder.id.clone();
        store.append_message(placeholder).await.expect("placeholder");
        assert!(store
            .claim_active_stream("s1", "stream-1")
            .await
            .expect("claim"));
        Harness {
            store,
            registry: MemoryStreamRegistry::new(Duration::from_secs(60)),
            ctx: RunContext {
                session_id: "s1".to_string(),
                message_id,
                stream_id: "stream-1".to_string(),
                model: ModelSpec::parse("scripted/scripted-1").expect("model"),
                prompt: prompt.to_string(),
                history: Vec::new(),
            },
        }
    }

    fn providers(provider: ScriptedProvider) -> ProviderRegistry {
        let provider: Arc<dyn Provider> = Arc::new(provider);
        ProviderRegistry::with_providers(vec![provider], Some("scripted".to_string()))
    }

    fn capabilities(
        analyzer: ScriptedAnalyzer,
        search: ScriptedSearch,
        synthesizer: ScriptedSynthesizer,
        reporter: ScriptedReporter,
    ) -> CapabilitySet {
        CapabilitySet::new()
            .with(Arc::new(analyzer))
            .with(Arc::new(search))
            .with(Arc::new(synthesizer))
            .with(Arc::new(reporter))
    }

    async fn run(
        h: &Harness,
        capabilities: CapabilitySet,
        provider: ScriptedProvider,
    ) -> (RunOutcome, Vec<StreamFrame>) {
        let orchestrator = WorkflowOrchestrator::new(
            h.store.clone(),
            capabilities,
            providers(provider),
            WorkflowConfig::default(),
        );
        let sink = h.registry.create_stream("stream-1").await.expect("create");
        let outcome = orchestrator.run(h.ctx.clone(), sink).await;
        let frames = h
            .registry
            .resume_stream("stream-1", 0)
            .await
            .expect("resume")
            .expect("stream")
            .map(|f| f.frame().expect("frame"))
            .collect::<Vec<_>>()
            .await;
        (outcome, frames)
    }

    #[tokio::test]
    async fn direct_answer_records_one_analysis_step() {
        let h = harness("what's 2+2").await;
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::direct(),
                ScriptedSearch::new(),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("unused"),
            ),
            ScriptedProvider::new("scripted").with_reply("2 + 2 = 4"),
        )
        .await;

        assert_eq!(outcome.state, WorkflowState::Done);
        assert_eq!(outcome.final_text, "2 + 2 = 4");
        let steps = h.store.list_steps(&h.ctx.message_id).await.expect("steps");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].step_type, StepType::Analysis);
        assert!(h
            .store
            .list_sources(&h.ctx.message_id)
            .await
            .expect("sources")
            .is_empty());
        let progress = h
            .store
            .load_progress(&h.ctx.message_id)
            .await
            .expect("load")
            .expect("progress");
        assert_eq!(
            (progress.total, progress.completed, progress.is_complete),
            (1, 1, true)
        );
        assert_eq!(frames.last(), Some(&StreamFrame::Finish));
        let session = h.store.get_session("s1").await.expect("get").expect("session");
        assert_eq!(session.active_stream_id, None);
    }

    #[tokio::test]
    async fn deep_search_completes_every_search_before_synthesis() {
        let h = harness("compare tokio and async-std").await;
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["q1", "q2", "q3"]),
                ScriptedSearch::new(),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("# Runtime comparison"),
            ),
            ScriptedProvider::new("scripted").with_reply("Tokio leads adoption."),
        )
        .await;

        assert_eq!(outcome.state, WorkflowState::Done);
        assert_eq!(outcome.transitions, 4);
        let steps = h.store.list_steps(&h.ctx.message_id).await.expect("steps");
        let types = steps.iter().map(|s| s.step_type).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                StepType::Analysis,
                StepType::Search,
                StepType::Search,
                StepType::Search,
                StepType::Evaluation,
                StepType::Report,
            ]
        );
        assert_eq!(steps[5].report_text(), Some("# Runtime comparison"));

        let synthesizing_at = frames
            .iter()
            .position(|f| {
                matches!(f, StreamFrame::DataProgress { data } if data.label == "Synthesizing findings")
            })
            .expect("synthesis progress");
        match &frames[synthesizing_at] {
            StreamFrame::DataProgress { data } => assert_eq!((data.completed, data.total), (3, 3)),
            other => panic!("unexpected frame {other:?}"),
        }

        let message = h
            .store
            .list_messages("s1")
            .await
            .expect("messages")
            .into_iter()
            .find(|m| m.id == h.ctx.message_id)
            .expect("message");
        assert_eq!(message.content, "Tokio leads adoption.");
        assert!(message.is_deep_search_initiated);
        assert_eq!(message.progress, 100);
        assert!(frames
            .iter()
            .any(|f| matches!(f, StreamFrame::DataReport { data } if data.report_text == "# Runtime comparison")));
    }

    #[tokio::test]
    async fn ledger_keeps_dispatch_order_when_later_search_finishes_first() {
        let h = harness("two parallel searches").await;
        let search = ScriptedSearch::new().with_delay("first", Duration::from_millis(50));
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["first", "second"]),
                search,
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("report"),
            ),
            ScriptedProvider::new("scripted"),
        )
        .await;
        assert_eq!(outcome.state, WorkflowState::Done);

        let searches = h
            .store
            .list_steps(&h.ctx.message_id)
            .await
            .expect("steps")
            .into_iter()
            .filter(|s| s.step_type == StepType::Search)
            .map(|s| s.input["query"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(searches, vec!["first", "second"]);

        let progress_labels = frames
            .iter()
            .filter_map(|f| match f {
                StreamFrame::DataProgress { data } if data.label.starts_with("Searched") => {
                    Some(data.label.clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(progress_labels, vec!["Searched: second", "Searched: first"]);
    }

    #[tokio::test]
    async fn endless_synthesis_stops_at_step_cap() {
        let h = harness("never satisfied").await;
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["seed"]),
                ScriptedSearch::new(),
                ScriptedSynthesizer::always_more(),
                ScriptedReporter::new("unused"),
            ),
            ScriptedProvider::new("scripted"),
        )
        .await;

        assert_eq!(outcome.state, WorkflowState::Done);
        assert!(outcome.capped);
        assert_eq!(outcome.transitions, 10);
        assert!(!outcome.final_text.is_empty());
        let steps = h.store.list_steps(&h.ctx.message_id).await.expect("steps");
        assert!(steps.iter().all(|s| s.step_type != StepType::Report));
        let progress = h
            .store
            .load_progress(&h.ctx.message_id)
            .await
            .expect("load")
            .expect("progress");
        assert!(progress.is_complete && progress.is_consistent());
        assert_eq!(frames.last(), Some(&StreamFrame::Finish));
    }

    #[tokio::test]
    async fn failed_search_is_recorded_and_still_advances_progress() {
        let h = harness("one flaky backend").await;
        let (outcome, _) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["ok", "broken"]),
                ScriptedSearch::new().with_failure("broken"),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("report"),
            ),
            ScriptedProvider::new("scripted"),
        )
        .await;

        assert_eq!(outcome.state, WorkflowState::Done);
        let steps = h.store.list_steps(&h.ctx.message_id).await.expect("steps");
        let failed = steps
            .iter()
            .find(|s| s.input["query"] == "broken")
            .expect("failed step");
        assert!(failed.is_error());
        let sources = h
            .store
            .list_sources(&h.ctx.message_id)
            .await
            .expect("sources");
        assert!(sources.iter().all(|s| s.step_id != failed.id));
        assert_eq!(sources.len(), 1);
    }

    #[tokio::test]
    async fn shared_urls_are_streamed_once() {
        let h = harness("overlapping results").await;
        let (_, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["a", "b"]),
                ScriptedSearch::new().with_shared_url("https://shared.example"),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("report"),
            ),
            ScriptedProvider::new("scripted"),
        )
        .await;
        let shared = frames
            .iter()
            .filter(|f| {
                matches!(f, StreamFrame::DataSource { data, .. } if data.url == "https://shared.example")
            })
            .count();
        assert_eq!(shared, 1);
    }

    #[tokio::test]
    async fn failed_report_falls_back_to_summary_text() {
        let h = harness("report backend down").await;
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::deep(&["q"]),
                ScriptedSearch::new(),
                ScriptedSynthesizer::done(),
                ScriptedReporter::failing("report model overloaded"),
            ),
            ScriptedProvider::new("scripted").with_reply("Short summary."),
        )
        .await;
        assert_eq!(outcome.state, WorkflowState::Done);
        assert_eq!(outcome.final_text, "Short summary.");
        assert!(!frames.iter().any(|f| matches!(f, StreamFrame::DataReport { .. })));
        let steps = h.store.list_steps(&h.ctx.message_id).await.expect("steps");
        assert!(steps
            .last()
            .is_some_and(|s| s.step_type == StepType::Report && s.is_error()));
    }

    #[tokio::test]
    async fn model_failure_ends_run_with_error_frame() {
        let h = harness("what's 2+2").await;
        let (outcome, frames) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::direct(),
                ScriptedSearch::new(),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("unused"),
            ),
            ScriptedProvider::new("scripted").with_failure("quota exceeded"),
        )
        .await;

        assert_eq!(outcome.state, WorkflowState::Failed);
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("quota exceeded")));
        match frames.last() {
            Some(StreamFrame::Error { error_text }) => assert!(error_text.contains("quota exceeded")),
            other => panic!("expected error frame, got {other:?}"),
        }
        let session = h.store.get_session("s1").await.expect("get").expect("session");
        assert_eq!(session.active_stream_id, None);
    }

    #[tokio::test]
    async fn analyze_failure_does_not_mark_progress_complete() {
        let h = harness("deep question").await;
        let (outcome, _) = run(
            &h,
            capabilities(
                ScriptedAnalyzer::failing("upstream 503"),
                ScriptedSearch::new(),
                ScriptedSynthesizer::done(),
                ScriptedReporter::new("unused"),
            ),
            ScriptedProvider::new("scripted"),
        )
        .await;
        assert_eq!(outcome.state, WorkflowState::Failed);
        let progress = h
            .store
            .load_progress(&h.ctx.message_id)
            .await
            .expect("load")
            .unwrap_or_default();
        assert!(!progress.is_complete);
    }

    #[test]
    fn line_budget_cuts_at_the_last_allowed_newline() {
        let mut budget = LineBudget::new(2);
        assert_eq!(budget.clip("one\ntw"), ("one\ntw", false));
        assert_eq!(budget.clip("o\nthree"), ("o", true));
    }

    #[test]
    fn step_budget_refuses_past_cap() {
        let mut budget = StepBudget::new(2);
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.used, 2);
    }

    #[test]
    fn queries_are_trimmed_and_deduplicated() {
        let queries = normalize_queries(vec![
            " rust ".to_string(),
            "Rust".to_string(),
            String::new(),
            "tokio".to_string(),
        ]);
        assert_eq!(queries, vec!["rust", "tokio"]);
    }
}
