use std::sync::Arc;

use tokio::sync::Mutex;

use delve_types::ProgressState;
use delve_wire::{ProgressStatus, StreamFrame};

use crate::multiplexer::MuxWriter;
use crate::storage::Store;

/// Search progress of one assistant message.
///
/// Every mutation runs under one lock and is persisted before the lock is
/// released, so concurrent search completions never lose an increment and the
/// stored state always matches some snapshot handed out.
pub struct ProgressTracker {
    store: Arc<dyn Store>,
    message_id: String,
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub async fn load(store: Arc<dyn Store>, message_id: impl Into<String>) -> anyhow::Result<Self> {
        let message_id = message_id.into();
        let state = store.load_progress(&message_id).await?.unwrap_or_default();
        Ok(Self {
            store,
            message_id,
            state: Mutex::new(state),
        })
    }

    pub async fn initialize(&self, total: u32) -> anyhow::Result<ProgressState> {
        self.update(|state| *state = ProgressState::deep_search(total))
            .await
    }

    /// Raises `total` when a later round plans more searches.
    pub async fn add_total(&self, extra: u32) -> anyhow::Result<ProgressState> {
        self.update(|state| {
            state.total = state.total.saturating_add(extra);
            state.is_deep_search = true;
            state.is_complete = false;
        })
        .await
    }

    pub async fn increment(&self) -> anyhow::Result<ProgressState> {
        self.update(|state| {
            if state.completed < state.total {
                state.completed += 1;
            }
        })
        .await
    }

    /// Idempotent.
    pub async fn mark_complete(&self) -> anyhow::Result<ProgressState> {
        let mut state = self.state.lock().await;
        if state.is_complete {
            return Ok(*state);
        }
        state.is_complete = true;
        state.completed = state.total;
        self.persist(&*state).await?;
        Ok(*state)
    }

    pub async fn mark_direct_answer(&self) -> anyhow::Result<ProgressState> {
        self.update(|state| *state = ProgressState::direct_answer())
            .await
    }

    pub async fn state(&self) -> ProgressState {
        *self.state.lock().await
    }

    /// Writes the current snapshot as a progress frame. Does not persist.
    pub async fn emit_progress(
        &self,
        writer: &MuxWriter,
        label: &str,
        status: ProgressStatus,
    ) -> bool {
        let state = self.state().await;
        writer
            .send(StreamFrame::progress(&state, label, status))
            .await
    }

    async fn update(&self, apply: impl FnOnce(&mut ProgressState)) -> anyhow::Result<ProgressState> {
        let mut state = self.state.lock().await;
        apply(&mut *state);
        self.persist(&*state).await?;
        Ok(*state)
    }

    async fn persist(&self, state: &ProgressState) -> anyhow::Result<()> {
        self.store.save_progress(&self.message_id, *state).await?;
        self.store
            .update_message_progress(&self.message_id, state.percent())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;
    use delve_types::Message;

    async fn tracker() -> (Arc<dyn Store>, Arc<ProgressTracker>, String) {
        let store: Arc<dyn Store> = Arc::new(FileStore::ephemeral());
        store
            .get_or_create_session("s1", "u1", None)
            .await
            .expect("session");
        let message = Message::assistant_placeholder("s1");
        let message_id = message.id.clone();
        store.append_message(message).await.expect("message");
        let tracker = ProgressTracker::load(store.clone(), &message_id)
            .await
            .expect("tracker");
        (store, Arc::new(tracker), message_id)
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let (store, tracker, message_id) = tracker().await;
        tracker.initialize(20).await.expect("init");
        let tasks = (0..20)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.increment().await.expect("increment") })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            let snapshot = task.await.expect("join");
            assert!(snapshot.completed <= snapshot.total);
        }
        let state = tracker.state().await;
        assert_eq!(state.completed, 20);
        assert_eq!(store.load_progress(&message_id).await.expect("load"), Some(state));
    }

    #[tokio::test]
    async fn increment_saturates_at_total() {
        let (_store, tracker, _) = tracker().await;
        tracker.initialize(1).await.expect("init");
        tracker.increment().await.expect("first");
        let state = tracker.increment().await.expect("second");
        assert_eq!(state.completed, 1);
        assert!(state.is_consistent());
    }

    #[tokio::test]
    async fn mark_complete_is_idempotent_and_fills_completed() {
        let (store, tracker, message_id) = tracker().await;
        tracker.initialize(3).await.expect("init");
        tracker.increment().await.expect("increment");
        let first = tracker.mark_complete().await.expect("complete");
        let second = tracker.mark_complete().await.expect("again");
        assert_eq!(first, second);
        assert_eq!(first.completed, 3);
        assert!(first.is_complete && first.is_consistent());
        let message = store
            .list_messages("s1")
            .await
            .expect("messages")
            .into_iter()
            .find(|m| m.id == message_id)
            .expect("message");
        assert_eq!(message.progress, 100);
    }

    #[tokio::test]
    async fn added_rounds_raise_total_and_reopen_progress() {
        let (_store, tracker, _) = tracker().await;
        tracker.initialize(2).await.expect("init");
        tracker.increment().await.expect("one");
        tracker.increment().await.expect("two");
        let state = tracker.add_total(1).await.expect("add");
        assert_eq!((state.completed, state.total), (2, 3));
        assert!(!state.is_complete);
    }

    #[tokio::test]
    async fn direct_answer_is_complete_at_one_of_one() {
        let (_store, tracker, _) = tracker().await;
        let state = tracker.mark_direct_answer().await.expect("direct");
        assert_eq!((state.total, state.completed, state.is_complete), (1, 1, true));
        assert!(!state.is_deep_search);
    }
}
