use serde::{Deserialize, Serialize};

/// A model reference as sent by clients: either `model` or `provider/model`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelSpec {
    #[serde(default, alias = "providerID", alias = "providerId")]
    pub provider_id: Option<String>,
    #[serde(alias = "modelID", alias = "modelId")]
    pub model_id: String,
}

impl ModelSpec {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Some(Self {
                provider_id: Some(provider.to_string()),
                model_id: model.to_string(),
            }),
            _ => Some(Self {
                provider_id: None,
                model_id: trimmed.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}
