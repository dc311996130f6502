use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use delve_types::{Message, ProgressState, Session, Source, Step};

/// Persistence seam for sessions, messages, the step ledger and progress.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>>;
    /// Returns the existing session or inserts `Session::new(id, owner, title)`.
    async fn get_or_create_session(
        &self,
        id: &str,
        owner_id: &str,
        title: Option<&str>,
    ) -> anyhow::Result<Session>;
    /// Sessions of `owner_id`, most recently updated first.
    async fn list_sessions(&self, owner_id: &str) -> anyhow::Result<Vec<Session>>;
    async fn rename_session(&self, id: &str, title: &str) -> anyhow::Result<Option<Session>>;
    async fn delete_session(&self, id: &str) -> anyhow::Result<bool>;

    /// Sets `active_stream_id` only when it is currently unset.
    async fn claim_active_stream(&self, session_id: &str, stream_id: &str) -> anyhow::Result<bool>;
    /// Clears `active_stream_id` only when it still equals `stream_id`.
    async fn clear_active_stream_if(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> anyhow::Result<bool>;

    async fn append_message(&self, message: Message) -> anyhow::Result<()>;
    /// Removes a message with its steps, sources and progress.
    async fn delete_message(&self, message_id: &str) -> anyhow::Result<bool>;
    /// Messages of a session in creation order.
    async fn list_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn update_message_content(&self, message_id: &str, content: &str) -> anyhow::Result<()>;
    async fn update_message_progress(&self, message_id: &str, progress: u8) -> anyhow::Result<()>;
    async fn mark_message_deep_search(&self, message_id: &str) -> anyhow::Result<()>;

    /// Returns false when a step with the same id was already recorded.
    async fn insert_step(&self, step: Step) -> anyhow::Result<bool>;
    /// Steps of a message ordered by dispatch order.
    async fn list_steps(&self, message_id: &str) -> anyhow::Result<Vec<Step>>;
    async fn insert_source(&self, message_id: &str, source: Source) -> anyhow::Result<bool>;
    async fn list_sources(&self, message_id: &str) -> anyhow::Result<Vec<Source>>;

    async fn save_progress(&self, message_id: &str, state: ProgressState) -> anyhow::Result<()>;
    async fn load_progress(&self, message_id: &str) -> anyhow::Result<Option<ProgressState>>;
}

/// On-disk shape of one session: the session row plus everything hanging off
/// its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionFile {
    session: Session,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    steps: HashMap<String, Vec<Step>>,
    #[serde(default)]
    sources: HashMap<String, Vec<Source>>,
    #[serde(default)]
    progress: HashMap<String, ProgressState>,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    /// Messages per session, in creation order.
    messages: HashMap<String, Vec<Message>>,
    /// message id -> session id
    message_sessions: HashMap<String, String>,
    steps: HashMap<String, Vec<Step>>,
    sources: HashMap<String, Vec<Source>>,
    progress: HashMap<String, ProgressState>,
}

impl StoreState {
    fn insert_file(&mut self, file: SessionFile) {
        let session_id = file.session.id.clone();
        for message in &file.messages {
            self.message_sessions
                .insert(message.id.clone(), session_id.clone());
        }
        self.steps.extend(file.steps);
        self.sources.extend(file.sources);
        self.progress.extend(file.progress);
        self.messages.insert(session_id.clone(), file.messages);
        self.sessions.insert(session_id, file.session);
    }

    fn session_file(&self, session_id: &str) -> Option<SessionFile> {
        let session = self.sessions.get(session_id)?.clone();
        let messages = self.messages.get(session_id).cloned().unwrap_or_default();
        let mut steps = HashMap::new();
        let mut sources = HashMap::new();
        let mut progress = HashMap::new();
        for message in &messages {
            if let Some(found) = self.steps.get(&message.id) {
                steps.insert(message.id.clone(), found.clone());
            }
            if let Some(found) = self.sources.get(&message.id) {
                sources.insert(message.id.clone(), found.clone());
            }
            if let Some(found) = self.progress.get(&message.id) {
                progress.insert(message.id.clone(), *found);
            }
        }
        Some(SessionFile {
            session,
            messages,
            steps,
            sources,
            progress,
        })
    }

    fn message_mut(&mut self, message_id: &str) -> Option<&mut Message> {
        let session_id = self.message_sessions.get(message_id)?;
        self.messages
            .get_mut(session_id)?
            .iter_mut()
            .find(|m| m.id == message_id)
    }
}

/// JSON-file store with one file per session under `<base>/sessions`. A
/// mutation rewrites only the file of the session it touches.
pub struct FileStore {
    base: Option<PathBuf>,
    state: RwLock<StoreState>,
    write_lock: Mutex<()>,
}

const SESSIONS_DIR: &str = "sessions";

impl FileStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        let sessions_dir = base.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).await?;

        let mut state = StoreState::default();
        let mut entries = fs::read_dir(&sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).await?;
            let file = serde_json::from_str::<SessionFile>(&raw)
                .with_context(|| format!("parse {}", path.display()))?;
            state.insert_file(file);
        }
        tracing::debug!("loaded {} sessions from {}", state.sessions.len(), sessions_dir.display());

        Ok(Self {
            base: Some(base),
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// A store that never touches disk.
    pub fn ephemeral() -> Self {
        Self {
            base: None,
            state: RwLock::new(StoreState::default()),
            write_lock: Mutex::new(()),
        }
    }

    /// Rewrites the file of `session_id`, or removes it when the session is gone.
    async fn flush_session(&self, session_id: &str) -> anyhow::Result<()> {
        let Some(base) = &self.base else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let path = base.join(SESSIONS_DIR).join(session_file_name(session_id));
        let payload = {
            let state = self.state.read().await;
            match state.session_file(session_id) {
                Some(file) => Some(serde_json::to_string_pretty(&file)?),
                None => None,
            }
        };
        let Some(payload) = payload else {
            if path.exists() {
                fs::remove_file(&path).await?;
            }
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Flushes the session owning `message_id`. Records of messages no
    /// session knows about stay in memory.
    async fn flush_message(&self, message_id: &str) -> anyhow::Result<()> {
        let session_id = self
            .state
            .read()
            .await
            .message_sessions
            .get(message_id)
            .cloned();
        match session_id {
            Some(session_id) => self.flush_session(&session_id).await,
            None => {
                tracing::debug!(message_id = %message_id, "no session for message; not persisted");
                Ok(())
            }
        }
    }
}

/// Session ids are client supplied; anything outside `[A-Za-z0-9_-]` is hex encoded.
fn session_file_name(session_id: &str) -> String {
    let safe = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        return format!("{session_id}.json");
    }
    let encoded = session_id
        .bytes()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    format!("x{encoded}.json")
}

#[async_trait]
impl Store for FileStore {
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn get_or_create_session(
        &self,
        id: &str,
        owner_id: &str,
        title: Option<&str>,
    ) -> anyhow::Result<Session> {
        let created = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.sessions.get(id) {
                return Ok(existing.clone());
            }
            let title = title.map(sanitize_text);
            let session = Session::new(id, owner_id, title.as_deref());
            state.sessions.insert(id.to_string(), session.clone());
            session
        };
        self.flush_session(id).await?;
        Ok(created)
    }

    async fn list_sessions(&self, owner_id: &str) -> anyhow::Result<Vec<Session>> {
        let mut sessions = self
            .state
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.is_owned_by(owner_id))
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn rename_session(&self, id: &str, title: &str) -> anyhow::Result<Option<Session>> {
        let updated = {
            let mut state = self.state.write().await;
            let Some(session) = state.sessions.get_mut(id) else {
                return Ok(None);
            };
            session.title = sanitize_text(title.trim());
            session.updated_at = Utc::now();
            session.clone()
        };
        self.flush_session(id).await?;
        Ok(Some(updated))
    }

    async fn delete_session(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.sessions.remove(id).is_some();
            for message in state.messages.remove(id).unwrap_or_default() {
                state.message_sessions.remove(&message.id);
                state.steps.remove(&message.id);
                state.sources.remove(&message.id);
                state.progress.remove(&message.id);
            }
            removed
        };
        if removed {
            self.flush_session(id).await?;
        }
        Ok(removed)
    }

    async fn claim_active_stream(&self, session_id: &str, stream_id: &str) -> anyhow::Result<bool> {
        {
            let mut state = self.state.write().await;
            let session = state
                .sessions
                .get_mut(session_id)
                .context("session not found for claim_active_stream")?;
            if session.active_stream_id.is_some() {
                return Ok(false);
            }
            session.active_stream_id = Some(stream_id.to_string());
            session.updated_at = Utc::now();
        }
        self.flush_session(session_id).await?;
        Ok(true)
    }

    async fn clear_active_stream_if(
        &self,
        session_id: &str,
        stream_id: &str,
    ) -> anyhow::Result<bool> {
        {
            let mut state = self.state.write().await;
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Ok(false);
            };
            if session.active_stream_id.as_deref() != Some(stream_id) {
                return Ok(false);
            }
            session.active_stream_id = None;
        }
        self.flush_session(session_id).await?;
        Ok(true)
    }

    async fn append_message(&self, mut message: Message) -> anyhow::Result<()> {
        message.content = sanitize_text(&message.content);
        let session_id = message.session_id.clone();
        {
            let mut state = self.state.write().await;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                anyhow::bail!("session not found for append_message");
            };
            session.updated_at = Utc::now();
            state
                .message_sessions
                .insert(message.id.clone(), session_id.clone());
            state
                .messages
                .entry(session_id.clone())
                .or_default()
                .push(message);
        }
        self.flush_session(&session_id).await
    }

    async fn delete_message(&self, message_id: &str) -> anyhow::Result<bool> {
        let session_id = {
            let mut state = self.state.write().await;
            let Some(session_id) = state.message_sessions.remove(message_id) else {
                return Ok(false);
            };
            if let Some(messages) = state.messages.get_mut(&session_id) {
                messages.retain(|m| m.id != message_id);
            }
            state.steps.remove(message_id);
            state.sources.remove(message_id);
            state.progress.remove(message_id);
            session_id
        };
        self.flush_session(&session_id).await?;
        Ok(true)
    }

    async fn list_messages(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_message_content(&self, message_id: &str, content: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let message = state
                .message_mut(message_id)
                .context("message not found for update_message_content")?;
            message.content = sanitize_text(content);
        }
        self.flush_message(message_id).await
    }

    async fn update_message_progress(&self, message_id: &str, progress: u8) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let message = state
                .message_mut(message_id)
                .context("message not found for update_message_progress")?;
            message.progress = progress.min(100);
        }
        self.flush_message(message_id).await
    }

    async fn mark_message_deep_search(&self, message_id: &str) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            let message = state
                .message_mut(message_id)
                .context("message not found for mark_message_deep_search")?;
            message.is_deep_search_initiated = true;
        }
        self.flush_message(message_id).await
    }

    async fn insert_step(&self, mut step: Step) -> anyhow::Result<bool> {
        step.reasoning_text = sanitize_text(&step.reasoning_text);
        step.input = sanitize_value(step.input);
        step.output = sanitize_value(step.output);
        let message_id = step.message_id.clone();
        {
            let mut state = self.state.write().await;
            let steps = state.steps.entry(message_id.clone()).or_default();
            if steps.iter().any(|existing| existing.id == step.id) {
                return Ok(false);
            }
            steps.push(step);
        }
        self.flush_message(&message_id).await?;
        Ok(true)
    }

    async fn list_steps(&self, message_id: &str) -> anyhow::Result<Vec<Step>> {
        let mut steps = self
            .state
            .read()
            .await
            .steps
            .get(message_id)
            .cloned()
            .unwrap_or_default();
        steps.sort_by_key(|step| step.order);
        Ok(steps)
    }

    async fn insert_source(&self, message_id: &str, mut source: Source) -> anyhow::Result<bool> {
        source.name = sanitize_text(&source.name);
        source.content = sanitize_text(&source.content);
        {
            let mut state = self.state.write().await;
            let sources = state.sources.entry(message_id.to_string()).or_default();
            if sources.iter().any(|existing| existing.id == source.id) {
                return Ok(false);
            }
            sources.push(source);
        }
        self.flush_message(message_id).await?;
        Ok(true)
    }

    async fn list_sources(&self, message_id: &str) -> anyhow::Result<Vec<Source>> {
        Ok(self
            .state
            .read()
            .await
            .sources
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_progress(&self, message_id: &str, state: ProgressState) -> anyhow::Result<()> {
        self.state
            .write()
            .await
            .progress
            .insert(message_id.to_string(), state);
        self.flush_message(message_id).await
    }

    async fn load_progress(&self, message_id: &str) -> anyhow::Result<Option<ProgressState>> {
        Ok(self.state.read().await.progress.get(message_id).copied())
    }
}

/// Drops NUL and C0 control characters other than newline, carriage return and tab.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t') || !c.is_ascii())
        .collect()
}

pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_text(&k), sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_types::StepType;
    use serde_json::json;
    use uuid::Uuid;

    fn temp_base() -> PathBuf {
        std::env::temp_dir().join(format!("delve-core-store-{}", Uuid::new_v4()))
    }

    fn step(id: &str, message_id: &str, order: u64) -> Step {
        Step {
            id: id.to_string(),
            message_id: message_id.to_string(),
            step_type: StepType::Search,
            reasoning_text: "Searching".to_string(),
            input: json!({"query": "q"}),
            output: json!({}),
            order,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_and_keeps_first_title() {
        let store = FileStore::ephemeral();
        let first = store
            .get_or_create_session("s1", "u1", Some("first prompt"))
            .await
            .expect("create");
        let second = store
            .get_or_create_session("s1", "u2", Some("second prompt"))
            .await
            .expect("get");
        assert_eq!(first, second);
        assert_eq!(second.owner_id, "u1");
        assert_eq!(second.title, "first prompt");
    }

    #[tokio::test]
    async fn active_stream_claim_and_compare_and_clear() {
        let store = FileStore::ephemeral();
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("create");
        assert!(store.claim_active_stream("s1", "stream-a").await.expect("claim"));
        assert!(!store.claim_active_stream("s1", "stream-b").await.expect("second claim"));
        assert!(!store
            .clear_active_stream_if("s1", "stream-b")
            .await
            .expect("foreign clear"));
        let session = store.get_session("s1").await.expect("get").expect("session");
        assert_eq!(session.active_stream_id.as_deref(), Some("stream-a"));
        assert!(store
            .clear_active_stream_if("s1", "stream-a")
            .await
            .expect("own clear"));
        let session = store.get_session("s1").await.expect("get").expect("session");
        assert!(session.active_stream_id.is_none());
    }

    #[tokio::test]
    async fn inserting_same_step_twice_keeps_one_entry() {
        let store = FileStore::ephemeral();
        assert!(store.insert_step(step("st1", "m1", 0)).await.expect("insert"));
        assert!(!store.insert_step(step("st1", "m1", 0)).await.expect("replay"));
        assert_eq!(store.list_steps("m1").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn steps_are_listed_in_dispatch_order() {
        let store = FileStore::ephemeral();
        store.insert_step(step("late", "m1", 2)).await.expect("insert");
        store.insert_step(step("early", "m1", 1)).await.expect("insert");
        let ids = store
            .list_steps("m1")
            .await
            .expect("list")
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let base = temp_base();
        let message_id;
        {
            let store = FileStore::new(&base).await.expect("store");
            store
                .get_or_create_session("s1", "u1", Some("persisted"))
                .await
                .expect("create");
            let message = Message::user("s1", "hello");
            message_id = message.id.clone();
            store.append_message(message).await.expect("append");
            store
                .save_progress(&message_id, ProgressState::deep_search(3))
                .await
                .expect("progress");
        }
        let reopened = FileStore::new(&base).await.expect("reopen");
        let session = reopened.get_session("s1").await.expect("get").expect("session");
        assert_eq!(session.title, "persisted");
        assert_eq!(reopened.list_messages("s1").await.expect("messages").len(), 1);
        assert_eq!(
            reopened.load_progress(&message_id).await.expect("load"),
            Some(ProgressState::deep_search(3))
        );
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn delete_session_drops_messages_and_ledger() {
        let store = FileStore::ephemeral();
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("create");
        let message = Message::assistant_placeholder("s1");
        let message_id = message.id.clone();
        store.append_message(message).await.expect("append");
        store
            .insert_step(step("st1", &message_id, 0))
            .await
            .expect("step");
        assert!(store.delete_session("s1").await.expect("delete"));
        assert!(store.list_messages("s1").await.expect("messages").is_empty());
        assert!(store.list_steps(&message_id).await.expect("steps").is_empty());
        assert!(!store.delete_session("s1").await.expect("second delete"));
    }

    #[tokio::test]
    async fn sessions_list_newest_first_per_owner() {
        let store = FileStore::ephemeral();
        store.get_or_create_session("a", "u1", None).await.expect("a");
        store.get_or_create_session("b", "u1", None).await.expect("b");
        store.get_or_create_session("c", "u2", None).await.expect("c");
        store
            .append_message(Message::user("a", "bump"))
            .await
            .expect("append");
        let ids = store
            .list_sessions("u1")
            .await
            .expect("list")
            .into_iter()
            .map(|s| s.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn each_session_gets_its_own_file() {
        let base = temp_base();
        let store = FileStore::new(&base).await.expect("store");
        store.get_or_create_session("s1", "u1", None).await.expect("s1");
        store.get_or_create_session("s2", "u1", None).await.expect("s2");
        let dir = base.join(SESSIONS_DIR);
        assert!(dir.join("s1.json").exists());
        assert!(dir.join("s2.json").exists());

        let before = std::fs::read_to_string(dir.join("s2.json")).expect("read s2");
        store
            .append_message(Message::user("s1", "only s1 changes"))
            .await
            .expect("append");
        let after = std::fs::read_to_string(dir.join("s2.json")).expect("read s2");
        assert_eq!(before, after);

        assert!(store.delete_session("s1").await.expect("delete"));
        assert!(!dir.join("s1.json").exists());
        assert!(dir.join("s2.json").exists());
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn delete_message_drops_its_ledger() {
        let store = FileStore::ephemeral();
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("create");
        let message = Message::assistant_placeholder("s1");
        let message_id = message.id.clone();
        store.append_message(message).await.expect("append");
        store
            .insert_step(step("st1", &message_id, 0))
            .await
            .expect("step");
        assert!(store.delete_message(&message_id).await.expect("delete"));
        assert!(store.list_messages("s1").await.expect("messages").is_empty());
        assert!(store.list_steps(&message_id).await.expect("steps").is_empty());
        assert!(!store.delete_message(&message_id).await.expect("second delete"));
    }

    #[test]
    fn unsafe_session_ids_are_hex_encoded_in_file_names() {
        assert_eq!(session_file_name("chat_01-a"), "chat_01-a.json");
        assert_eq!(session_file_name("../x"), "x2e2e2f78.json");
        assert_eq!(session_file_name(""), "x.json");
    }

    #[test]
    fn sanitize_strips_control_characters_recursively() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c\nd\te"), "abc\nd\te");
        let value = sanitize_value(json!({"k\u{1}": ["x\u{0}y", {"z": "ok\u{1b}"}], "n": 3}));
        assert_eq!(value, json!({"k": ["xy", {"z": "ok"}], "n": 3}));
    }
}
