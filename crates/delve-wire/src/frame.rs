use serde::{Deserialize, Serialize};

use delve_types::{ProgressState, Source, Step, StepType};

/// One outbound event of a run stream.
///
/// Text segments use `text-start`/`text-delta`/`text-end` sharing one `id`;
/// everything else is a typed `data-*` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamFrame {
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    DataProgress {
        data: ProgressFrame,
    },
    DataStep {
        id: String,
        data: StepFrame,
    },
    DataSource {
        id: String,
        data: SourceFrame,
    },
    DataReport {
        data: ReportFrame,
    },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    Finish,
}

impl StreamFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::DataProgress { .. } => "data-progress",
            Self::DataStep { .. } => "data-step",
            Self::DataSource { .. } => "data-source",
            Self::DataReport { .. } => "data-report",
            Self::Error { .. } => "error",
            Self::Finish => "finish",
        }
    }

    /// Segment id for text frames.
    pub fn segment_id(&self) -> Option<&str> {
        match self {
            Self::TextStart { id } | Self::TextDelta { id, .. } | Self::TextEnd { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Error { .. })
    }

    pub fn progress(state: &ProgressState, label: impl Into<String>, status: ProgressStatus) -> Self {
        Self::DataProgress {
            data: ProgressFrame {
                total: state.total,
                completed: state.completed,
                is_complete: state.is_complete,
                label: label.into(),
                status,
            },
        }
    }

    pub fn step(step: &Step, sources: &[Source]) -> Self {
        Self::DataStep {
            id: step.id.clone(),
            data: StepFrame::from_step(step, sources),
        }
    }

    pub fn source(source: &Source) -> Self {
        Self::DataSource {
            id: source.id.clone(),
            data: SourceFrame::from(source),
        }
    }

    pub fn report(report_text: impl Into<String>) -> Self {
        Self::DataReport {
            data: ReportFrame {
                report_text: report_text.into(),
            },
        }
    }

    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }

    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFrame {
    pub total: u32,
    pub completed: u32,
    pub is_complete: bool,
    pub label: String,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub favicon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFrame {
    pub step_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub reasoning_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<SearchHit>>,
}

impl StepFrame {
    /// `sources` may hold sources of other steps; only this step's are listed.
    pub fn from_step(step: &Step, sources: &[Source]) -> Self {
        let hits = sources
            .iter()
            .filter(|source| source.step_id == step.id)
            .map(|source| SearchHit {
                title: source.name.clone(),
                url: source.url.clone(),
                favicon: source.favicon.clone(),
            })
            .collect::<Vec<_>>();
        let search = (step.step_type == StepType::Search && !hits.is_empty()).then_some(hits);
        Self {
            step_id: step.id.clone(),
            step_type: step.step_type,
            reasoning_text: step.reasoning_text.clone(),
            search,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFrame {
    pub source_id: String,
    pub step_id: String,
    pub name: String,
    pub url: String,
    pub content: String,
    pub favicon: String,
    #[serde(default)]
    pub images: Vec<String>,
}

impl From<&Source> for SourceFrame {
    fn from(source: &Source) -> Self {
        Self {
            source_id: source.id.clone(),
            step_id: source.step_id.clone(),
            name: source.name.clone(),
            url: source.url.clone(),
            content: source.content.clone(),
            favicon: source.favicon.clone(),
            images: source.images.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFrame {
    pub report_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn step(id: &str, step_type: StepType) -> Step {
        Step {
            id: id.to_string(),
            message_id: "m1".to_string(),
            step_type,
            reasoning_text: "looking".to_string(),
            input: json!({}),
            output: json!({}),
            order: 0,
            created_at: Utc::now(),
        }
    }

    fn source(id: &str, step_id: &str, url: &str) -> Source {
        Source {
            id: id.to_string(),
            step_id: step_id.to_string(),
            url: url.to_string(),
            name: format!("title {id}"),
            content: String::new(),
            favicon: String::new(),
            images: Vec::new(),
        }
    }

    #[test]
    fn text_frames_use_kebab_case_tags() {
        let frame = StreamFrame::TextDelta {
            id: "m1".to_string(),
            delta: "hi".to_string(),
        };
        let value: Value = serde_json::from_str(&frame.to_payload().expect("encode")).expect("json");
        assert_eq!(value, json!({"type": "text-delta", "id": "m1", "delta": "hi"}));
        assert_eq!(frame.segment_id(), Some("m1"));
    }

    #[test]
    fn progress_frame_carries_tracker_snapshot() {
        let mut state = ProgressState::deep_search(3);
        state.completed = 2;
        let frame = StreamFrame::progress(&state, "Searching", ProgressStatus::Running);
        let value = serde_json::to_value(&frame).expect("encode");
        assert_eq!(value["type"], "data-progress");
        assert_eq!(value["data"]["total"], 3);
        assert_eq!(value["data"]["completed"], 2);
        assert_eq!(value["data"]["isComplete"], false);
        assert_eq!(value["data"]["status"], "running");
    }

    #[test]
    fn error_frame_uses_error_text_field() {
        let value = serde_json::to_value(StreamFrame::error("quota exceeded")).expect("encode");
        assert_eq!(value, json!({"type": "error", "errorText": "quota exceeded"}));
        assert!(StreamFrame::error("x").is_terminal());
    }

    #[test]
    fn search_step_lists_only_its_own_sources() {
        let search = step("st1", StepType::Search);
        let sources = vec![
            source("a", "st1", "https://a.example"),
            source("b", "st2", "https://b.example"),
        ];
        let frame = StepFrame::from_step(&search, &sources);
        let hits = frame.search.expect("search hits");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://a.example");

        let analysis = StepFrame::from_step(&step("st2", StepType::Analysis), &sources);
        assert!(analysis.search.is_none());
    }

    #[test]
    fn payload_decodes_back_into_frame() {
        let frame = StreamFrame::report("report body");
        let decoded = StreamFrame::from_payload(&frame.to_payload().expect("encode")).expect("decode");
        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind(), "data-report");
    }
}
