use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::Level;
use uuid::Uuid;

use delve_observability::{emit_event, ObservabilityEvent, ProcessKind};
use delve_providers::ChatMessage;
use delve_types::{Message, ModelSpec, Session};
use delve_wire::{WireMessage, WireSession};

use crate::error::{DelveError, DelveResult};
use crate::orchestrator::{RunContext, RunOutcome, WorkflowOrchestrator, WorkflowState};
use crate::storage::Store;
use crate::stream_registry::{FrameSink, FrameStream, StreamRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    #[serde(default, alias = "id")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl StartRunRequest {
    fn validate(&self) -> DelveResult<(String, ModelSpec, String)> {
        let present = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let (Some(session_id), Some(model), Some(prompt)) = (
            present(&self.session_id),
            present(&self.model),
            present(&self.prompt),
        ) else {
            return Err(DelveError::Validation("Missing required fields".to_string()));
        };
        let model = ModelSpec::parse(&model)
            .ok_or_else(|| DelveError::Validation("Invalid model identifier".to_string()))?;
        Ok((session_id, model, prompt))
    }
}

/// A started run. `frames` is the live stream from its first frame.
pub struct RunHandle {
    pub session_id: String,
    pub message_id: String,
    pub stream_id: String,
    pub frames: FrameStream,
    pub task: JoinHandle<RunOutcome>,
}

pub enum ResumeOutcome {
    Streaming {
        stream_id: String,
        frames: FrameStream,
    },
    /// Nothing to reattach to; the client falls back to the stored message.
    NoActiveStream,
}

/// Session-scoped entry point: starts runs, reattaches readers and serves
/// session history.
#[derive(Clone)]
pub struct DeepSearchService {
    store: Arc<dyn Store>,
    registry: Arc<dyn StreamRegistry>,
    orchestrator: Arc<WorkflowOrchestrator>,
}

impl DeepSearchService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<dyn StreamRegistry>,
        orchestrator: WorkflowOrchestrator,
    ) -> Self {
        Self {
            store,
            registry,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<dyn StreamRegistry> {
        self.registry.clone()
    }

    pub async fn start_run(
        &self,
        principal: &str,
        request: StartRunRequest,
    ) -> DelveResult<RunHandle> {
        let (session_id, model, prompt) = request.validate()?;
        let session = self
            .store
            .get_or_create_session(&session_id, principal, Some(&prompt))
            .await?;
        ensure_owner(&session, principal)?;
        if let Some(active) = session.active_stream_id {
            if self.registry.is_live(&active).await {
                return Err(DelveError::Conflict {
                    active_stream_id: active,
                });
            }
            self.release_stale_stream(&session_id, &active).await?;
        }

        let history = self.history(&session_id).await?;
        let stream_id = Uuid::new_v4().to_string();
        let sink = self
            .registry
            .create_stream(&stream_id)
            .await
            .map_err(|err| self.registration_failed(&session_id, &stream_id, err))?;
        if !self
            .store
            .claim_active_stream(&session_id, &stream_id)
            .await?
        {
            self.registry.discard(&stream_id).await;
            let active_stream_id = self
                .store
                .get_session(&session_id)
                .await?
                .and_then(|s| s.active_stream_id)
                .unwrap_or_default();
            return Err(DelveError::Conflict { active_stream_id });
        }
        let frames = match self.registry.resume_stream(&stream_id, 0).await {
            Ok(Some(frames)) => frames,
            Ok(None) => {
                self.abandon_stream(&session_id, &stream_id).await?;
                return Err(self.registration_failed(
                    &session_id,
                    &stream_id,
                    anyhow::anyhow!("stream not readable after registration"),
                ));
            }
            Err(err) => {
                self.abandon_stream(&session_id, &stream_id).await?;
                return Err(self.registration_failed(&session_id, &stream_id, err));
            }
        };
        let message_id = match self.append_turn(&session_id, &prompt).await {
            Ok(message_id) => message_id,
            Err(err) => {
                self.abandon_stream(&session_id, &stream_id).await?;
                return Err(err);
            }
        };
        log_stream(
            Level::INFO,
            "stream.registered",
            &session_id,
            Some(&stream_id),
            None,
        );

        let ctx = RunContext {
            session_id: session_id.clone(),
            message_id: message_id.clone(),
            stream_id: stream_id.clone(),
            model,
            prompt,
            history,
        };
        let task = self.spawn_run(ctx, sink);

        Ok(RunHandle {
            session_id,
            message_id,
            stream_id,
            frames,
            task,
        })
    }

    /// Reattaches to the session's active stream from frame `cursor` on.
    pub async fn resume(
        &self,
        principal: &str,
        session_id: &str,
        cursor: u64,
    ) -> DelveResult<ResumeOutcome> {
        let Some(session) = self.store.get_session(session_id).await? else {
            log_stream(Level::INFO, "stream.resume.none", session_id, None, Some("unknown session"));
            return Ok(ResumeOutcome::NoActiveStream);
        };
        ensure_owner(&session, principal)?;
        let Some(stream_id) = session.active_stream_id else {
            log_stream(Level::INFO, "stream.resume.none", session_id, None, None);
            return Ok(ResumeOutcome::NoActiveStream);
        };
        match self.registry.resume_stream(&stream_id, cursor).await? {
            Some(frames) => Ok(ResumeOutcome::Streaming { stream_id, frames }),
            None => {
                log_stream(
                    Level::WARN,
                    "stream.resume.expired",
                    session_id,
                    Some(&stream_id),
                    Some("registry has no entry for the active stream"),
                );
                self.store
                    .clear_active_stream_if(session_id, &stream_id)
                    .await?;
                Ok(ResumeOutcome::NoActiveStream)
            }
        }
    }

    pub async fn list_sessions(&self, principal: &str) -> DelveResult<Vec<WireSession>> {
        let sessions = self.store.list_sessions(principal).await?;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            let messages = self.store.list_messages(&session.id).await?;
            let last = messages.iter().rev().find(|m| !m.content.trim().is_empty());
            out.push(WireSession::summary(&session, last));
        }
        Ok(out)
    }

    pub async fn get_session(&self, principal: &str, session_id: &str) -> DelveResult<WireSession> {
        let session = self.owned_session(principal, session_id).await?;
        let mut messages = Vec::new();
        for message in self.store.list_messages(session_id).await? {
            let steps = self.store.list_steps(&message.id).await?;
            let sources = self.store.list_sources(&message.id).await?;
            messages.push(WireMessage::assemble(&message, &steps, &sources));
        }
        Ok(WireSession::with_messages(&session, messages))
    }

    pub async fn rename_session(
        &self,
        principal: &str,
        session_id: &str,
        title: &str,
    ) -> DelveResult<WireSession> {
        let title = title.trim();
        if title.is_empty() {
            return Err(DelveError::Validation("Title must not be empty".to_string()));
        }
        self.owned_session(principal, session_id).await?;
        let session = self
            .store
            .rename_session(session_id, title)
            .await?
            .ok_or_else(|| DelveError::NotFound(format!("session `{session_id}`")))?;
        Ok(WireSession::summary(&session, None))
    }

    pub async fn delete_session(&self, principal: &str, session_id: &str) -> DelveResult<()> {
        let session = self.owned_session(principal, session_id).await?;
        if let Some(active) = session.active_stream_id {
            if self.registry.is_live(&active).await {
                return Err(DelveError::Conflict {
                    active_stream_id: active,
                });
            }
            self.release_stale_stream(session_id, &active).await?;
        }
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    async fn owned_session(&self, principal: &str, session_id: &str) -> DelveResult<Session> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DelveError::NotFound(format!("session `{session_id}`")))?;
        ensure_owner(&session, principal)?;
        Ok(session)
    }

    /// Appends the user turn and the assistant placeholder; returns the
    /// placeholder id. A failed placeholder write removes the user turn again.
    async fn append_turn(&self, session_id: &str, prompt: &str) -> DelveResult<String> {
        let user = Message::user(session_id, prompt);
        let user_id = user.id.clone();
        self.store.append_message(user).await?;
        let placeholder = Message::assistant_placeholder(session_id);
        let message_id = placeholder.id.clone();
        if let Err(err) = self.store.append_message(placeholder).await {
            if let Err(cleanup) = self.store.delete_message(&user_id).await {
                tracing::warn!(session_id = %session_id, "failed to remove orphaned user turn: {}", cleanup);
            }
            return Err(err.into());
        }
        Ok(message_id)
    }

    /// Runs the orchestrator on its own task. A panic there still releases
    /// the session's active stream and reports a failed outcome.
    fn spawn_run(&self, ctx: RunContext, sink: Box<dyn FrameSink>) -> JoinHandle<RunOutcome> {
        let orchestrator = self.orchestrator.clone();
        let store = self.store.clone();
        let session_id = ctx.session_id.clone();
        let stream_id = ctx.stream_id.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { orchestrator.run(ctx, sink).await });
            match run.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let detail = err.to_string();
                    log_stream(
                        Level::ERROR,
                        "run.panicked",
                        &session_id,
                        Some(&stream_id),
                        Some(&detail),
                    );
                    if let Err(clear) = store.clear_active_stream_if(&session_id, &stream_id).await {
                        tracing::error!(session_id = %session_id, "failed to clear active stream: {}", clear);
                    }
                    RunOutcome {
                        state: WorkflowState::Failed,
                        final_text: String::new(),
                        transitions: 0,
                        capped: false,
                        error: Some(detail),
                    }
                }
            }
        })
    }

    /// Clears an active stream id whose registry entry has no writer left,
    /// e.g. after a process restart.
    async fn release_stale_stream(&self, session_id: &str, stream_id: &str) -> DelveResult<()> {
        if self.store.clear_active_stream_if(session_id, stream_id).await? {
            log_stream(
                Level::WARN,
                "stream.stale.released",
                session_id,
                Some(stream_id),
                Some("active stream has no live writer"),
            );
        }
        Ok(())
    }

    /// Undoes a claim and registration that will not be used.
    async fn abandon_stream(&self, session_id: &str, stream_id: &str) -> DelveResult<()> {
        self.registry.discard(stream_id).await;
        self.store
            .clear_active_stream_if(session_id, stream_id)
            .await?;
        Ok(())
    }

    /// The last `context_turns` messages with content, oldest first.
    async fn history(&self, session_id: &str) -> DelveResult<Vec<ChatMessage>> {
        let turns = self.orchestrator.config().context_turns;
        let messages = self
            .store
            .list_messages(session_id)
            .await?
            .into_iter()
            .filter(|m| !m.content.trim().is_empty())
            .collect::<Vec<_>>();
        let skip = messages.len().saturating_sub(turns);
        Ok(messages
            .into_iter()
            .skip(skip)
            .map(|m| ChatMessage::new(m.role.as_str(), m.content))
            .collect())
    }

    fn registration_failed(
        &self,
        session_id: &str,
        stream_id: &str,
        err: anyhow::Error,
    ) -> DelveError {
        let detail = err.to_string();
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "stream.register.failed",
                component: "runs",
                session_id: Some(session_id),
                stream_id: Some(stream_id),
                status: Some("failed"),
                error_code: Some("stream_registration"),
                detail: Some(&detail),
                ..ObservabilityEvent::default()
            },
        );
        DelveError::StreamRegistration(detail)
    }
}

fn ensure_owner(session: &Session, principal: &str) -> DelveResult<()> {
    if session.is_owned_by(principal) {
        return Ok(());
    }
    Err(DelveError::Authorization(format!(
        "session `{}` belongs to another user",
        session.id
    )))
}

fn log_stream(
    level: Level,
    event: &str,
    session_id: &str,
    stream_id: Option<&str>,
    detail: Option<&str>,
) {
    emit_event(
        level,
        ProcessKind::Engine,
        ObservabilityEvent {
            event,
            component: "runs",
            session_id: Some(session_id),
            stream_id,
            detail,
            ..ObservabilityEvent::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::storage::FileStore;
    use delve_types::MessageRole;
    use crate::stream_registry::{FrameSink, MemoryStreamRegistry, SequencedFrame};
    use async_trait::async_trait;
    use delve_providers::scripted::ScriptedProvider;
    use delve_providers::{Provider, ProviderRegistry};
    use delve_tools::scripted::{
        ScriptedAnalyzer, ScriptedReporter, ScriptedSearch, ScriptedSynthesizer,
    };
    use delve_tools::{Capability, CapabilitySet, ToolContext, ToolInput, ToolKind, ToolResult};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn orchestrator(store: Arc<dyn Store>, capabilities: CapabilitySet) -> WorkflowOrchestrator {
        let provider: Arc<dyn Provider> =
            Arc::new(ScriptedProvider::new("scripted").with_fallback("Final answer."));
        WorkflowOrchestrator::new(
            store,
            capabilities,
            ProviderRegistry::with_providers(vec![provider], Some("scripted".to_string())),
            WorkflowConfig::default(),
        )
    }

    fn deep_capabilities(search: ScriptedSearch) -> CapabilitySet {
        CapabilitySet::new()
            .with(Arc::new(ScriptedAnalyzer::deep(&["q1", "q2", "q3"])))
            .with(Arc::new(search))
            .with(Arc::new(ScriptedSynthesizer::done()))
            .with(Arc::new(ScriptedReporter::new("# Report")))
    }

    fn direct_capabilities() -> CapabilitySet {
        CapabilitySet::new()
            .with(Arc::new(ScriptedAnalyzer::direct()))
            .with(Arc::new(ScriptedSearch::new()))
            .with(Arc::new(ScriptedSynthesizer::done()))
            .with(Arc::new(ScriptedReporter::new("unused")))
    }

    fn service(capabilities: CapabilitySet) -> DeepSearchService {
        let store: Arc<dyn Store> = Arc::new(FileStore::ephemeral());
        let registry: Arc<dyn StreamRegistry> =
            Arc::new(MemoryStreamRegistry::new(Duration::from_secs(60)));
        DeepSearchService::new(store.clone(), registry, orchestrator(store, capabilities))
    }

    fn request(session_id: &str, prompt: &str) -> StartRunRequest {
        StartRunRequest {
            session_id: Some(session_id.to_string()),
            model: Some("scripted/scripted-1".to_string()),
            prompt: Some(prompt.to_string()),
        }
    }

    async fn active_stream(service: &DeepSearchService, session_id: &str) -> Option<String> {
        service
            .store()
            .get_session(session_id)
            .await
            .expect("get")
            .and_then(|s| s.active_stream_id)
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_any_write() {
        let service = service(direct_capabilities());
        let err = service
            .start_run(
                "u1",
                StartRunRequest {
                    session_id: Some("s1".to_string()),
                    model: None,
                    prompt: Some("hi".to_string()),
                },
            )
            .await
            .err()
            .expect("validation error");
        assert!(matches!(err, DelveError::Validation(ref m) if m == "Missing required fields"));
        assert!(service.store().get_session("s1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn run_persists_turn_and_clears_active_stream() {
        let service = service(direct_capabilities());
        let handle = service
            .start_run("u1", request("s1", "what's 2+2"))
            .await
            .expect("start");
        let frames = handle.frames.collect::<Vec<_>>().await;
        let outcome = handle.task.await.expect("join");

        assert_eq!(outcome.state, WorkflowState::Done);
        assert!(frames.last().is_some_and(|f| f.frame().ok() == Some(delve_wire::StreamFrame::Finish)));
        assert_eq!(active_stream(&service, "s1").await, None);

        let messages = service.store().list_messages("s1").await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "what's 2+2");
        assert_eq!(messages[1].id, handle.message_id);
        assert_eq!(messages[1].content, "Final answer.");

        let session = service.get_session("u1", "s1").await.expect("session");
        assert_eq!(session.title, "what's 2+2");
        assert_eq!(session.messages[1].text(), "Final answer.");
    }

    #[tokio::test]
    async fn other_principals_cannot_run_in_a_session() {
        let service = service(direct_capabilities());
        let handle = service
            .start_run("u1", request("s1", "first"))
            .await
            .expect("start");
        handle.task.await.expect("join");

        let err = service
            .start_run("intruder", request("s1", "second"))
            .await
            .err()
            .expect("authorization error");
        assert_eq!(err.status_code(), 403);
        assert_eq!(service.store().list_messages("s1").await.expect("messages").len(), 2);
    }

    #[tokio::test]
    async fn second_run_while_active_is_a_conflict() {
        let gate = Arc::new(Semaphore::new(0));
        let service = service(deep_capabilities(ScriptedSearch::new().with_gate(gate.clone())));
        let first = service
            .start_run("u1", request("s1", "deep question"))
            .await
            .expect("start");

        let err = service
            .start_run("u1", request("s1", "another"))
            .await
            .err()
            .expect("conflict");
        match err {
            DelveError::Conflict { active_stream_id } => {
                assert_eq!(active_stream_id, first.stream_id)
            }
            other => panic!("unexpected error {other:?}"),
        }
        let err = service.delete_session("u1", "s1").await.expect_err("busy");
        assert_eq!(err.status_code(), 409);

        gate.add_permits(16);
        assert_eq!(first.task.await.expect("join").state, WorkflowState::Done);
        assert_eq!(active_stream(&service, "s1").await, None);
    }

    #[tokio::test]
    async fn reattach_without_a_run_reports_no_active_stream() {
        let service = service(direct_capabilities());
        let outcome = service.resume("u1", "never-started", 0).await.expect("resume");
        assert!(matches!(outcome, ResumeOutcome::NoActiveStream));
    }

    #[tokio::test]
    async fn reattach_to_a_lost_stream_reports_no_active_stream() {
        let service = service(direct_capabilities());
        let store = service.store();
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("session");
        assert!(store.claim_active_stream("s1", "ghost").await.expect("claim"));
        let outcome = service.resume("u1", "s1", 0).await.expect("resume");
        assert!(matches!(outcome, ResumeOutcome::NoActiveStream));
        assert_eq!(active_stream(&service, "s1").await, None);
    }

    #[tokio::test]
    async fn active_stream_left_by_a_previous_process_is_released() {
        let base = std::env::temp_dir().join(format!("delve-core-runs-{}", Uuid::new_v4()));
        {
            let store = FileStore::new(&base).await.expect("store");
            store
                .get_or_create_session("s1", "u1", None)
                .await
                .expect("session");
            assert!(store.claim_active_stream("s1", "inflight").await.expect("claim"));
        }

        let store: Arc<dyn Store> = Arc::new(FileStore::new(&base).await.expect("reopen"));
        let registry: Arc<dyn StreamRegistry> =
            Arc::new(MemoryStreamRegistry::new(Duration::from_secs(60)));
        let service = DeepSearchService::new(
            store.clone(),
            registry,
            orchestrator(store.clone(), direct_capabilities()),
        );
        assert_eq!(active_stream(&service, "s1").await.as_deref(), Some("inflight"));

        let handle = service
            .start_run("u1", request("s1", "after restart"))
            .await
            .expect("start despite stale id");
        assert_eq!(handle.task.await.expect("join").state, WorkflowState::Done);
        assert_eq!(active_stream(&service, "s1").await, None);

        assert!(store.claim_active_stream("s1", "inflight").await.expect("claim again"));
        let outcome = service.resume("u1", "s1", 0).await.expect("resume");
        assert!(matches!(outcome, ResumeOutcome::NoActiveStream));
        assert_eq!(active_stream(&service, "s1").await, None);

        assert!(store.claim_active_stream("s1", "inflight").await.expect("claim again"));
        service.delete_session("u1", "s1").await.expect("delete despite stale id");
        assert!(store.get_session("s1").await.expect("get").is_none());
        let _ = std::fs::remove_dir_all(&base);
    }

    struct PanickingAnalyzer;

    #[async_trait]
    impl Capability for PanickingAnalyzer {
        fn kind(&self) -> ToolKind {
            ToolKind::Analyze
        }

        async fn invoke(&self, _input: ToolInput, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
            panic!("analyzer crashed")
        }
    }

    #[tokio::test]
    async fn panicking_run_releases_the_active_stream() {
        let capabilities = CapabilitySet::new()
            .with(Arc::new(PanickingAnalyzer))
            .with(Arc::new(ScriptedSearch::new()))
            .with(Arc::new(ScriptedSynthesizer::done()))
            .with(Arc::new(ScriptedReporter::new("unused")));
        let service = service(capabilities);
        let handle = service
            .start_run("u1", request("s1", "boom"))
            .await
            .expect("start");
        let frames = handle.frames.collect::<Vec<_>>().await;
        let outcome = handle.task.await.expect("outer task");

        assert_eq!(outcome.state, WorkflowState::Failed);
        assert!(outcome.error.is_some());
        assert!(frames.iter().all(|f| f.frame().ok() != Some(delve_wire::StreamFrame::Finish)));
        assert_eq!(active_stream(&service, "s1").await, None);
        assert!(!service.registry().is_live(&handle.stream_id).await);

        let next = service
            .start_run("u1", request("s1", "again"))
            .await
            .expect("session usable after a panic");
        next.task.abort();
    }

    #[tokio::test]
    async fn midway_reattach_sees_the_same_sequence_as_a_full_reader() {
        let gate = Arc::new(Semaphore::new(0));
        let service = service(deep_capabilities(ScriptedSearch::new().with_gate(gate.clone())));
        let mut handle = service
            .start_run("u1", request("s1", "deep question"))
            .await
            .expect("start");

        // Analysis progress and step frames arrive before any search is let through.
        let mut first_connection: Vec<SequencedFrame> = Vec::new();
        for _ in 0..2 {
            first_connection.push(handle.frames.next().await.expect("early frame"));
        }
        drop(handle.frames);

        let cursor = first_connection.last().map(|f| f.seq + 1).unwrap_or(0);
        let ResumeOutcome::Streaming { stream_id, frames } =
            service.resume("u1", "s1", cursor).await.expect("resume")
        else {
            panic!("expected an active stream");
        };
        assert_eq!(stream_id, handle.stream_id);
        gate.add_permits(16);
        let second_connection = frames.collect::<Vec<_>>().await;
        handle.task.await.expect("join");

        let full = service
            .registry()
            .resume_stream(&handle.stream_id, 0)
            .await
            .expect("replay")
            .expect("retained")
            .collect::<Vec<_>>()
            .await;
        let stitched = first_connection
            .into_iter()
            .chain(second_connection)
            .collect::<Vec<_>>();
        assert_eq!(stitched, full);
        assert!(stitched.windows(2).all(|w| w[1].seq == w[0].seq + 1));
    }

    struct RejectingRegistry;

    #[async_trait]
    impl StreamRegistry for RejectingRegistry {
        async fn create_stream(&self, _stream_id: &str) -> anyhow::Result<Box<dyn FrameSink>> {
            anyhow::bail!("registry unreachable")
        }

        async fn resume_stream(
            &self,
            _stream_id: &str,
            _from_seq: u64,
        ) -> anyhow::Result<Option<FrameStream>> {
            Ok(None)
        }

        async fn is_live(&self, _stream_id: &str) -> bool {
            false
        }

        async fn discard(&self, _stream_id: &str) {}

        async fn reap_expired(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn registration_failure_fails_the_run_and_leaves_no_active_stream() {
        let store: Arc<dyn Store> = Arc::new(FileStore::ephemeral());
        let service = DeepSearchService::new(
            store.clone(),
            Arc::new(RejectingRegistry),
            orchestrator(store, direct_capabilities()),
        );
        let err = service
            .start_run("u1", request("s1", "hi"))
            .await
            .err()
            .expect("registration error");
        assert!(matches!(err, DelveError::StreamRegistration(_)));
        assert_eq!(active_stream(&service, "s1").await, None);
        assert!(service.store().list_messages("s1").await.expect("messages").is_empty());
    }

    #[tokio::test]
    async fn history_is_limited_to_recent_turns() {
        let service = service(direct_capabilities());
        let store = service.store();
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("session");
        for idx in 0..14 {
            store
                .append_message(Message::user("s1", format!("turn {idx}")))
                .await
                .expect("message");
        }
        let history = service.history("s1").await.expect("history");
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "turn 4");
        assert_eq!(history[9].role, "user");
    }

    #[tokio::test]
    async fn rename_and_list_sessions() {
        let service = service(direct_capabilities());
        let handle = service
            .start_run("u1", request("s1", "first question"))
            .await
            .expect("start");
        handle.task.await.expect("join");

        let renamed = service
            .rename_session("u1", "s1", "  Renamed  ")
            .await
            .expect("rename");
        assert_eq!(renamed.title, "Renamed");
        let listed = service.list_sessions("u1").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_message.as_deref(), Some("Final answer."));
        assert!(service.list_sessions("u2").await.expect("list").is_empty());

        service.delete_session("u1", "s1").await.expect("delete");
        let err = service.get_session("u1", "s1").await.expect_err("gone");
        assert_eq!(err.status_code(), 404);
    }
}
