use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{Notify, RwLock};

use delve_wire::StreamFrame;

/// One encoded frame and its position in the stream, starting at 0.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedFrame {
    pub seq: u64,
    pub payload: Arc<str>,
}

impl SequencedFrame {
    pub fn frame(&self) -> serde_json::Result<StreamFrame> {
        StreamFrame::from_payload(&self.payload)
    }
}

pub type FrameStream = Pin<Box<dyn Stream<Item = SequencedFrame> + Send>>;

/// Write side of a registered stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn append(&mut self, frame: &StreamFrame) -> anyhow::Result<()>;
    async fn finish(&mut self) -> anyhow::Result<()>;
}

/// Keyed store of in-flight frame sequences that readers can attach to at any
/// position.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Registers `stream_id`; fails when the id is taken or the registry is unavailable.
    async fn create_stream(&self, stream_id: &str) -> anyhow::Result<Box<dyn FrameSink>>;
    /// Frames from `from_seq` on, following the live tail until the stream
    /// finishes. `None` when the stream is unknown or expired.
    async fn resume_stream(
        &self,
        stream_id: &str,
        from_seq: u64,
    ) -> anyhow::Result<Option<FrameStream>>;
    /// True while a writer is still attached to `stream_id`.
    async fn is_live(&self, stream_id: &str) -> bool;
    /// Forgets `stream_id` immediately. Attached readers end after the frames
    /// they already hold.
    async fn discard(&self, stream_id: &str);
    /// Drops finished streams past retention; returns how many were dropped.
    async fn reap_expired(&self) -> usize;
}

#[derive(Default)]
struct EntryState {
    frames: Vec<Arc<str>>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct StreamEntry {
    state: Mutex<EntryState>,
    notify: Notify,
}

impl StreamEntry {
    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_finished(&self) {
        let mut state = self.lock();
        if state.finished_at.is_none() {
            state.finished_at = Some(Instant::now());
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// In-process registry. Finished streams stay resumable for `retention`.
pub struct MemoryStreamRegistry {
    entries: RwLock<HashMap<String, Arc<StreamEntry>>>,
    retention: Duration,
}

impl MemoryStreamRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn is_expired(&self, entry: &StreamEntry, now: Instant) -> bool {
        entry
            .lock()
            .finished_at
            .is_some_and(|at| now.duration_since(at) >= self.retention)
    }
}

struct MemorySink {
    entry: Arc<StreamEntry>,
    finished: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn append(&mut self, frame: &StreamFrame) -> anyhow::Result<()> {
        if self.finished {
            anyhow::bail!("stream already finished");
        }
        let payload: Arc<str> = Arc::from(frame.to_payload()?);
        self.entry.lock().frames.push(payload);
        self.entry.notify.notify_waiters();
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.finished = true;
        self.entry.mark_finished();
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        if !self.finished {
            self.entry.mark_finished();
        }
    }
}

#[async_trait]
impl StreamRegistry for MemoryStreamRegistry {
    async fn create_stream(&self, stream_id: &str) -> anyhow::Result<Box<dyn FrameSink>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(stream_id) {
            anyhow::bail!("stream `{}` is already registered", stream_id);
        }
        let entry = Arc::new(StreamEntry::default());
        entries.insert(stream_id.to_string(), entry.clone());
        Ok(Box::new(MemorySink {
            entry,
            finished: false,
        }))
    }

    async fn resume_stream(
        &self,
        stream_id: &str,
        from_seq: u64,
    ) -> anyhow::Result<Option<FrameStream>> {
        let Some(entry) = self.entries.read().await.get(stream_id).cloned() else {
            return Ok(None);
        };
        if self.is_expired(&entry, Instant::now()) {
            return Ok(None);
        }
        let frames = stream! {
            let mut cursor = usize::try_from(from_seq).unwrap_or(usize::MAX);
            loop {
                let notified = entry.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (batch, finished) = {
                    let state = entry.lock();
                    let start = cursor.min(state.frames.len());
                    (state.frames[start..].to_vec(), state.finished_at.is_some())
                };
                let drained = batch.is_empty();
                for payload in batch {
                    yield SequencedFrame { seq: cursor as u64, payload };
                    cursor += 1;
                }
                if finished {
                    break;
                }
                if drained {
                    notified.await;
                }
            }
        };
        Ok(Some(Box::pin(frames)))
    }

    async fn is_live(&self, stream_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(stream_id)
            .is_some_and(|entry| entry.lock().finished_at.is_none())
    }

    async fn discard(&self, stream_id: &str) {
        if let Some(entry) = self.entries.write().await.remove(stream_id) {
            entry.mark_finished();
        }
    }

    async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !self.is_expired(entry, now));
        before - entries.len()
    }
}
