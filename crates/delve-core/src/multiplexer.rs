use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use delve_wire::StreamFrame;

use crate::stream_registry::FrameSink;

enum MuxCommand {
    Frame(StreamFrame),
    Close,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxSummary {
    pub written: u64,
    pub rejected: u64,
    pub sink_errors: u64,
}

/// Enforces `text-start` < `text-delta`* < `text-end` per segment id and that
/// nothing follows a terminal frame.
#[derive(Debug, Default)]
struct SegmentTracker {
    open: Vec<String>,
    closed: HashSet<String>,
    terminated: bool,
}

impl SegmentTracker {
    fn accept(&mut self, frame: &StreamFrame) -> bool {
        if self.terminated {
            return false;
        }
        match frame {
            StreamFrame::TextStart { id } => {
                if self.open.contains(id) || self.closed.contains(id) {
                    return false;
                }
                self.open.push(id.clone());
                true
            }
            StreamFrame::TextDelta { id, .. } => self.open.contains(id),
            StreamFrame::TextEnd { id } => {
                let Some(pos) = self.open.iter().position(|open| open == id) else {
                    return false;
                };
                self.open.remove(pos);
                self.closed.insert(id.clone());
                true
            }
            StreamFrame::Finish | StreamFrame::Error { .. } => {
                self.terminated = true;
                true
            }
            _ => true,
        }
    }

    fn drain_open(&mut self) -> Vec<String> {
        let open = std::mem::take(&mut self.open);
        self.closed.extend(open.iter().cloned());
        open
    }
}

/// Cloneable producer handle. All frames of a run go through one of these.
#[derive(Clone)]
pub struct MuxWriter {
    tx: mpsc::Sender<MuxCommand>,
}

impl MuxWriter {
    /// Queues `frame`; false once the multiplexer has closed.
    pub async fn send(&self, frame: StreamFrame) -> bool {
        self.tx.send(MuxCommand::Frame(frame)).await.is_ok()
    }

    pub async fn text_start(&self, id: &str) -> bool {
        self.send(StreamFrame::TextStart { id: id.to_string() }).await
    }

    pub async fn text_delta(&self, id: &str, delta: impl Into<String>) -> bool {
        self.send(StreamFrame::TextDelta {
            id: id.to_string(),
            delta: delta.into(),
        })
        .await
    }

    pub async fn text_end(&self, id: &str) -> bool {
        self.send(StreamFrame::TextEnd { id: id.to_string() }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single writer of a run's outbound frame sequence.
pub struct StreamMultiplexer {
    writer: MuxWriter,
    task: JoinHandle<MuxSummary>,
}

impl StreamMultiplexer {
    pub fn spawn(mut sink: Box<dyn FrameSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<MuxCommand>(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut summary = MuxSummary::default();
            let mut segments = SegmentTracker::default();
            while let Some(command) = rx.recv().await {
                let frame = match command {
                    MuxCommand::Frame(frame) => frame,
                    MuxCommand::Close => break,
                };
                if frame.is_terminal() {
                    for id in segments.drain_open() {
                        write_frame(&mut sink, &mut summary, &StreamFrame::TextEnd { id }).await;
                    }
                }
                if !segments.accept(&frame) {
                    tracing::warn!(kind = frame.kind(), "dropping out-of-order stream frame");
                    summary.rejected += 1;
                    continue;
                }
                write_frame(&mut sink, &mut summary, &frame).await;
            }
            rx.close();
            for id in segments.drain_open() {
                write_frame(&mut sink, &mut summary, &StreamFrame::TextEnd { id }).await;
            }
            if let Err(err) = sink.finish().await {
                tracing::warn!("failed to finish stream: {}", err);
                summary.sink_errors += 1;
            }
            summary
        });
        Self {
            writer: MuxWriter { tx },
            task,
        }
    }

    pub fn writer(&self) -> MuxWriter {
        self.writer.clone()
    }

    /// Flushes frames queued before this call, closes open segments and
    /// finishes the sink. Frames sent afterwards are discarded.
    pub async fn close(self) -> MuxSummary {
        let _ = self.writer.tx.send(MuxCommand::Close).await;
        match self.task.await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::error!("stream multiplexer task failed: {}", err);
                MuxSummary::default()
            }
        }
    }
}

async fn write_frame(sink: &mut Box<dyn FrameSink>, summary: &mut MuxSummary, frame: &StreamFrame) {
    match sink.append(frame).await {
        Ok(()) => summary.written += 1,
        Err(err) => {
            tracing::warn!(kind = frame.kind(), "failed to append stream frame: {}", err);
            summary.sink_errors += 1;
        }
    }
}
