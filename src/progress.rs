use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Named event on an operation's stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Events that end an operation's stream.
pub fn is_terminal(event: &str) -> bool {
    event == "complete" || event == "error"
}

struct Operation {
    buffer: Vec<ProgressEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    terminal: bool,
}

/// One-shot per-operation event streams.
///
/// Events are buffered from the first publish; every subscriber first
/// receives the full buffer in order, then live events. After the terminal
/// event the buffer is kept for a grace window so late subscribers still
/// observe the outcome, then evicted.
pub struct ProgressBroker {
    ops: Mutex<HashMap<String, Operation>>,
    grace: Duration,
}

impl ProgressBroker {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(HashMap::new()),
            grace,
        })
    }

    /// Create the operation's (empty) stream so subscribers arriving before
    /// the first event attach live instead of seeing a closed stream.
    pub fn register(&self, op_id: &str) {
        let mut ops = self.ops.lock().expect("progress broker lock");
        ops.entry(op_id.to_string()).or_insert_with(|| Operation {
            buffer: Vec::new(),
            subscribers: Vec::new(),
            terminal: false,
        });
    }

    pub fn publish(self: &Arc<Self>, op_id: &str, event: &str, payload: serde_json::Value) {
        let progress_event = ProgressEvent {
            event: event.to_string(),
            payload,
        };
        let terminal = is_terminal(event);
        {
            let mut ops = self.ops.lock().expect("progress broker lock");
            let op = ops.entry(op_id.to_string()).or_insert_with(|| Operation {
                buffer: Vec::new(),
                subscribers: Vec::new(),
                terminal: false,
            });
            op.buffer.push(progress_event.clone());
            op.subscribers
                .retain(|tx| tx.send(progress_event.clone()).is_ok());
            if terminal {
                op.terminal = true;
                // Terminal events end every live stream
                op.subscribers.clear();
            }
        }

        if terminal {
            let broker = Arc::clone(self);
            let op_id = op_id.to_string();
            let grace = self.grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let mut ops = broker.ops.lock().expect("progress broker lock");
                if ops.get(&op_id).is_some_and(|op| op.terminal) {
                    debug!(op = %op_id, "evicting finished progress stream");
                    ops.remove(&op_id);
                }
            });
        }
    }

    /// Attach to an operation's stream: buffered history first, then live
    /// events. Subscribing to an evicted (or never-started) operation yields
    /// an empty, closed stream.
    pub fn subscribe(&self, op_id: &str) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ops = self.ops.lock().expect("progress broker lock");
        match ops.get_mut(op_id) {
            Some(op) => {
                for event in &op.buffer {
                    let _ = tx.send(event.clone());
                }
                if !op.terminal {
                    op.subscribers.push(tx);
                }
                // terminal: tx drops here, closing the stream after replay
            }
            None => {
                // Unknown id: nothing buffered, stream closes immediately
            }
        }
        rx
    }

    /// True while the operation is known and not yet terminal.
    pub fn is_active(&self, op_id: &str) -> bool {
        self.ops
            .lock()
            .expect("progress broker lock")
            .get(op_id)
            .is_some_and(|op| !op.terminal)
    }
}
