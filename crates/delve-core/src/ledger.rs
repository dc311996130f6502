use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use delve_tools::DiscoveredSource;
use delve_types::{Source, Step, StepType};

use crate::storage::Store;

/// A step position reserved at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSlot {
    pub step_id: String,
    pub order: u64,
}

#[derive(Debug, Clone)]
pub struct CommittedStep {
    pub step: Step,
    /// Every source this step surfaced.
    pub sources: Vec<Source>,
    /// Sources whose url had not been seen earlier in the message.
    pub new_sources: Vec<Source>,
    /// False when the step had already been recorded.
    pub inserted: bool,
}

/// Append-only record of the steps and sources of one assistant message.
///
/// Slots are reserved in dispatch order, so the persisted order of steps is the
/// dispatch order no matter which invocation completes first.
pub struct StepLedger {
    store: Arc<dyn Store>,
    message_id: String,
    next_order: AtomicU64,
    seen_urls: Mutex<HashSet<String>>,
}

impl StepLedger {
    pub async fn open(store: Arc<dyn Store>, message_id: impl Into<String>) -> anyhow::Result<Self> {
        let message_id = message_id.into();
        let steps = store.list_steps(&message_id).await?;
        let next_order = steps.iter().map(|s| s.order + 1).max().unwrap_or(0);
        let seen_urls = store
            .list_sources(&message_id)
            .await?
            .into_iter()
            .map(|s| s.url)
            .collect::<HashSet<_>>();
        Ok(Self {
            store,
            message_id,
            next_order: AtomicU64::new(next_order),
            seen_urls: Mutex::new(seen_urls),
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn reserve(&self) -> StepSlot {
        StepSlot {
            step_id: Uuid::new_v4().to_string(),
            order: self.next_order.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub async fn commit(
        &self,
        slot: &StepSlot,
        step_type: StepType,
        reasoning_text: &str,
        input: Value,
        output: Value,
        discovered: Vec<DiscoveredSource>,
    ) -> anyhow::Result<CommittedStep> {
        let step = Step {
            id: slot.step_id.clone(),
            message_id: self.message_id.clone(),
            step_type,
            reasoning_text: reasoning_text.to_string(),
            input,
            output,
            order: slot.order,
            created_at: Utc::now(),
        };
        let inserted = self.store.insert_step(step.clone()).await?;

        let sources = discovered
            .into_iter()
            .enumerate()
            .map(|(idx, found)| Source {
                id: format!("{}-src-{idx}", slot.step_id),
                step_id: slot.step_id.clone(),
                url: found.url,
                name: found.title,
                content: found.content,
                favicon: found.favicon,
                images: found.images,
            })
            .collect::<Vec<_>>();
        if !inserted {
            return Ok(CommittedStep {
                step,
                sources,
                new_sources: Vec::new(),
                inserted,
            });
        }

        let mut new_sources = Vec::new();
        let mut seen = self.seen_urls.lock().await;
        for source in &sources {
            self.store
                .insert_source(&self.message_id, source.clone())
                .await?;
            if seen.insert(source.url.clone()) {
                new_sources.push(source.clone());
            }
        }
        drop(seen);

        Ok(CommittedStep {
            step,
            sources,
            new_sources,
            inserted,
        })
    }

    pub async fn steps(&self) -> anyhow::Result<Vec<Step>> {
        self.store.list_steps(&self.message_id).await
    }

    pub async fn sources(&self) -> anyhow::Result<Vec<Source>> {
        self.store.list_sources(&self.message_id).await
    }
}
