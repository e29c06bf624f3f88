//! Progress events emitted while a document moves through the acquisition stages.

use serde::Serialize;
use std::fmt;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Pipeline stage of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Resolving,
    Fetching,
    Verifying,
    Persisting,
    Rejected,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle       => "idle",
            Stage::Resolving  => "resolving",
            Stage::Fetching   => "fetching",
            Stage::Verifying  => "verifying",
            Stage::Persisting => "persisting",
            Stage::Rejected   => "rejected",
            Stage::Done       => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event (cloneable for broadcast).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub doc_id: i64,
    pub stage: Stage,
    pub status: String,
}

/// What the callback task receives: events, and markers a caller can wait on.
enum Delivery {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone, Default)]
enum Sink {
    #[default]
    Silent,
    Broadcast(broadcast::Sender<ProgressEvent>),
    Callback(mpsc::UnboundedSender<Delivery>),
}

/// Where progress events go. Emitting never blocks the pipeline and never fails it.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Sink,
    doc_id: i64,
}

impl ProgressReporter {
    pub fn silent() -> Self {
        Self::default()
    }

    /// Broadcast channel; late subscribers miss earlier events.
    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<ProgressEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self { sink: Sink::Broadcast(tx), doc_id: 0 }, rx)
    }

    pub fn from_sender(tx: broadcast::Sender<ProgressEvent>) -> Self {
        Self { sink: Sink::Broadcast(tx), doc_id: 0 }
    }

    /// The callback runs on its own task, in emission order, so a slow
    /// callback never holds up acquisition. Must be called within a Tokio runtime.
    pub fn from_callback<F>(callback: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Event(event) => callback(&event),
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { sink: Sink::Callback(tx), doc_id: 0 }
    }

    /// Waits until the callback has seen every event emitted so far.
    pub async fn flush(&self) {
        if let Sink::Callback(tx) = &self.sink {
            let (done, delivered) = oneshot::channel();
            if tx.send(Delivery::Flush(done)).is_ok() {
                let _ = delivered.await;
            }
        }
    }

    pub(crate) fn for_doc(&self, doc_id: i64) -> Self {
        Self { sink: self.sink.clone(), doc_id }
    }

    pub fn emit(&self, stage: Stage, status: impl Into<String>) {
        let event = ProgressEvent { doc_id: self.doc_id, stage, status: status.into() };
        match &self.sink {
            Sink::Silent => {}
            Sink::Broadcast(tx) => {
                let _ = tx.send(event);
            }
            Sink::Callback(tx) => {
                let _ = tx.send(Delivery::Event(event));
            }
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sink = match self.sink {
            Sink::Silent => "silent",
            Sink::Broadcast(_) => "broadcast",
            Sink::Callback(_) => "callback",
        };
        f.debug_struct("ProgressReporter").field("sink", &sink).field("doc_id", &self.doc_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_callback_receives_doc_scoped_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::from_callback(move |e| sink.lock().unwrap().push(e.clone()));

        reporter.for_doc(42).emit(Stage::Resolving, "Trying Unpaywall");
        reporter.flush().await;
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].doc_id, 42);
        assert_eq!(events[0].stage, Stage::Resolving);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_hold_up_emit() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::from_callback(move |e| {
            std::thread::sleep(Duration::from_millis(50));
            sink.lock().unwrap().push(e.stage);
        });

        let started = Instant::now();
        reporter.emit(Stage::Resolving, "a");
        reporter.emit(Stage::Fetching, "b");
        reporter.emit(Stage::Verifying, "c");
        assert!(started.elapsed() < Duration::from_millis(50));

        reporter.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![Stage::Resolving, Stage::Fetching, Stage::Verifying]);
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_harmless() {
        let (reporter, rx) = ProgressReporter::channel(4);
        drop(rx);
        reporter.emit(Stage::Done, "finished");
    }

    #[tokio::test]
    async fn test_broadcast_delivers() {
        let (reporter, mut rx) = ProgressReporter::channel(4);
        reporter.for_doc(7).emit(Stage::Fetching, "Downloading");
        let event = rx.recv().await.unwrap();
        assert_eq!(event, ProgressEvent { doc_id: 7, stage: Stage::Fetching, status: "Downloading".into() });
    }
}
