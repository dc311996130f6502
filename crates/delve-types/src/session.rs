use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
pub const SESSION_TITLE_MAX_CHARS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    /// Set while a run is producing output for this session.
    #[serde(default)]
    pub active_stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, title: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            title: derive_session_title(title.unwrap_or_default()),
            active_stream_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, principal: &str) -> bool {
        self.owner_id == principal
    }
}

/// The trimmed prompt clipped to the title budget.
pub fn derive_session_title(prompt: &str) -> String {
    let title = prompt
        .trim()
        .chars()
        .take(SESSION_TITLE_MAX_CHARS)
        .collect::<String>();
    let title = title.trim_end();
    if title.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }
    title.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    /// Unknown stored roles are treated as user turns.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    /// Percentage of planned search work completed (0..=100).
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub is_deep_search_initiated: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            progress: 0,
            is_deep_search_initiated: false,
            created_at: Utc::now(),
        }
    }

    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::User, content)
    }

    /// Empty assistant message created before a run starts streaming.
    pub fn assistant_placeholder(session_id: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::Assistant, String::new())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Analysis,
    Search,
    Evaluation,
    Report,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Search => "search",
            Self::Evaluation => "evaluation",
            Self::Report => "report",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub reasoning_text: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    /// Dispatch order within the owning message.
    pub order: u64,
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Report text carried in the output of a report step.
    pub fn report_text(&self) -> Option<&str> {
        if self.step_type != StepType::Report {
            return None;
        }
        self.output.get("report").and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.output.get("error").is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub step_id: String,
    pub url: String,
    #[serde(alias = "title")]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub favicon: String,
    #[serde(default)]
    pub images: Vec<String>,
}
