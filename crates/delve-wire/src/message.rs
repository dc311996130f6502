use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use delve_types::{Message, MessageRole, Session, Source, Step};

use crate::{ReportFrame, SourceFrame, StepFrame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessageMetadata {
    pub progress: u8,
    pub is_deep_search_initiated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WirePart {
    #[serde(rename = "data-progress")]
    Progress { data: WireMessageMetadata },
    #[serde(rename = "data-report")]
    Report { data: ReportFrame },
    #[serde(rename = "data-step")]
    Step { id: String, data: StepFrame },
    #[serde(rename = "data-source")]
    Source { id: String, data: SourceFrame },
    #[serde(rename = "text")]
    Text { text: String },
}

/// A stored message rebuilt into the client-facing part list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    pub role: MessageRole,
    pub metadata: WireMessageMetadata,
    pub parts: Vec<WirePart>,
}

impl WireMessage {
    /// Part order: progress summary, report, steps in dispatch order,
    /// url-deduplicated sources, then the final text.
    pub fn assemble(message: &Message, steps: &[Step], sources: &[Source]) -> Self {
        let mut ordered_steps = steps.iter().collect::<Vec<_>>();
        ordered_steps.sort_by_key(|step| step.order);

        let has_deep_search_data = !steps.is_empty() || !sources.is_empty();
        let mut parts = Vec::new();
        if has_deep_search_data && message.is_deep_search_initiated {
            parts.push(WirePart::Progress {
                data: WireMessageMetadata {
                    progress: message.progress,
                    is_deep_search_initiated: true,
                },
            });
        }
        if let Some(report) = ordered_steps.iter().copied().find_map(Step::report_text) {
            parts.push(WirePart::Report {
                data: ReportFrame {
                    report_text: report.to_string(),
                },
            });
        }
        for step in &ordered_steps {
            parts.push(WirePart::Step {
                id: step.id.clone(),
                data: StepFrame::from_step(step, sources),
            });
        }
        for source in dedup_sources_by_url(sources) {
            parts.push(WirePart::Source {
                id: source.id.clone(),
                data: SourceFrame::from(source),
            });
        }
        parts.push(WirePart::Text {
            text: message.content.clone(),
        });

        Self {
            id: message.id.clone(),
            role: message.role,
            metadata: WireMessageMetadata {
                progress: message.progress,
                is_deep_search_initiated: has_deep_search_data || message.is_deep_search_initiated,
            },
            parts,
        }
    }

    pub fn text(&self) -> &str {
        self.parts
            .iter()
            .rev()
            .find_map(|part| match part {
                WirePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Keeps the first source seen for each url, preserving order.
pub fn dedup_sources_by_url(sources: &[Source]) -> Vec<&Source> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for source in sources {
        if seen.insert(source.url.as_str()) {
            unique.push(source);
        }
    }
    unique
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSession {
    pub id: String,
    pub title: String,
    pub active_stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<WireMessage>,
}

impl WireSession {
    pub fn summary(session: &Session, last_message: Option<&Message>) -> Self {
        Self {
            id: session.id.clone(),
            title: session.title.clone(),
            active_stream_id: session.active_stream_id.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            last_message: last_message.map(|m| m.content.clone()),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(session: &Session, messages: Vec<WireMessage>) -> Self {
        Self {
            messages,
            ..Self::summary(session, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_types::StepType;
    use serde_json::json;

    fn step(id: &str, step_type: StepType, order: u64) -> Step {
        let output = if step_type == StepType::Report {
            json!({"report": "full report"})
        } else {
            json!({})
        };
        Step {
            id: id.to_string(),
            message_id: "m1".to_string(),
            step_type,
            reasoning_text: format!("reasoning {id}"),
            input: json!({}),
            output,
            order,
            created_at: Utc::now(),
        }
    }

    fn source(id: &str, step_id: &str, url: &str) -> Source {
        Source {
            id: id.to_string(),
            step_id: step_id.to_string(),
            url: url.to_string(),
            name: id.to_string(),
            content: "snippet".to_string(),
            favicon: String::new(),
            images: Vec::new(),
        }
    }

    fn assistant(deep: bool) -> Message {
        let mut message = Message::assistant_placeholder("s1");
        message.content = "final answer".to_string();
        message.progress = 100;
        message.is_deep_search_initiated = deep;
        message
    }

    #[test]
    fn duplicate_urls_render_once() {
        let steps = vec![
            step("st1", StepType::Search, 1),
            step("st2", StepType::Search, 2),
        ];
        let sources = vec![
            source("a", "st1", "https://same.example"),
            source("b", "st2", "https://same.example"),
            source("c", "st2", "https://other.example"),
        ];
        let wire = WireMessage::assemble(&assistant(true), &steps, &sources);
        let urls = wire
            .parts
            .iter()
            .filter_map(|part| match part {
                WirePart::Source { data, .. } => Some(data.url.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://same.example", "https://other.example"]);
    }

    #[test]
    fn parts_follow_replay_order() {
        let steps = vec![
            step("report", StepType::Report, 3),
            step("analysis", StepType::Analysis, 0),
            step("search", StepType::Search, 1),
        ];
        let sources = vec![source("a", "search", "https://a.example")];
        let wire = WireMessage::assemble(&assistant(true), &steps, &sources);
        let kinds = wire
            .parts
            .iter()
            .map(|part| match part {
                WirePart::Progress { .. } => "progress".to_string(),
                WirePart::Report { .. } => "report".to_string(),
                WirePart::Step { id, .. } => format!("step:{id}"),
                WirePart::Source { .. } => "source".to_string(),
                WirePart::Text { .. } => "text".to_string(),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                "progress",
                "report",
                "step:analysis",
                "step:search",
                "step:report",
                "source",
                "text"
            ]
        );
        assert_eq!(wire.text(), "final answer");
    }

    #[test]
    fn plain_message_has_only_text() {
        let wire = WireMessage::assemble(&assistant(false), &[], &[]);
        assert_eq!(wire.parts.len(), 1);
        assert!(!wire.metadata.is_deep_search_initiated);
    }

    #[test]
    fn steps_mark_message_as_deep_search_in_metadata() {
        let steps = vec![step("analysis", StepType::Analysis, 0)];
        let wire = WireMessage::assemble(&assistant(false), &steps, &[]);
        assert!(wire.metadata.is_deep_search_initiated);
        assert!(!wire
            .parts
            .iter()
            .any(|part| matches!(part, WirePart::Progress { .. })));
    }
}
