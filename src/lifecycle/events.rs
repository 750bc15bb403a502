//! Lifecycle notifications delivered over channels

use crate::lifecycle::NodeHandle;
use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorEvent {
    SetupSucceeded { node: NodeHandle, name: String },
    SetupFailed { node: NodeHandle, name: String, reason: String },
    DataResized { node: NodeHandle },
    DataGenerated { node: NodeHandle },
    CleanedUp { node: NodeHandle },
}

/// Fan-out of events to every live subscriber
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Sender<GeneratorEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> Receiver<GeneratorEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver to all subscribers, dropping the ones whose receiver is gone
    pub fn emit(&mut self, event: GeneratorEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
