use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle notification published on the engine event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.properties
            .get("sessionId")
            .or_else(|| self.properties.get("sessionID"))
            .and_then(Value::as_str)
    }
}
