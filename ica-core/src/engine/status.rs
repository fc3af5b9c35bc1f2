use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::engine::registry::SubprocessorId;
use crate::ipc::events::{TrainingStatus, TrainingStatusEvent};

/// Broadcast channel capacity for status events.
const BROADCAST_CAP: usize = 64;

/// Shared sender for training status. Cloned into every training run.
#[derive(Debug, Clone)]
pub(crate) struct StatusReporter {
    tx: broadcast::Sender<TrainingStatusEvent>,
    seq: Arc<AtomicU64>,
    last: Arc<Mutex<TrainingStatusEvent>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            last: Arc::new(Mutex::new(TrainingStatusEvent {
                seq: 0,
                subprocessor: None,
                status: TrainingStatus::Idle,
                detail: None,
            })),
        }
    }

    pub fn report(
        &self,
        subprocessor: Option<SubprocessorId>,
        status: TrainingStatus,
        detail: Option<String>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = TrainingStatusEvent {
            seq,
            subprocessor: subprocessor.map(|id| id.to_string()),
            status,
            detail,
        };
        *self.last.lock() = event.clone();
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrainingStatusEvent> {
        self.tx.subscribe()
    }

    pub fn last(&self) -> TrainingStatusEvent {
        self.last.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_sequenced_and_remembered() {
        let reporter = StatusReporter::new();
        let mut rx = reporter.subscribe();
        assert_eq!(reporter.last().status, TrainingStatus::Idle);

        let id = SubprocessorId::new(3, 1);
        reporter.report(Some(id), TrainingStatus::Preparing, None);
        reporter.report(Some(id), TrainingStatus::Failed, Some("boom".into()));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.subprocessor.as_deref(), Some("3/1"));
        assert_eq!(reporter.last(), second);
    }
}
