//! Log broadcasting for running tasks
//!
//! One producer (the container log reader) fans lines out to any number of
//! subscribers through bounded per-subscriber queues. A subscriber that
//! cannot keep up is dropped, never waited on; the producer is also the path
//! feeding the result log tail, so it must never block on a slow reader.

use shared::api::LogLine;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub struct LogBroadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<LogLine>>>,
    /// Per-subscriber queue capacity
    capacity: usize,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attach a new subscriber with its own bounded queue
    pub fn subscribe(&self) -> mpsc::Receiver<LogLine> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .expect("log subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Publish one line to every live subscriber. Full queues drop their
    /// subscriber; closed queues are cleaned up.
    pub fn publish(&self, line: LogLine) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("log subscriber lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|tx| match tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.len() < before {
            debug!(
                dropped = before - subscribers.len(),
                remaining = subscribers.len(),
                "Dropped slow or closed log subscribers"
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("log subscriber lock poisoned")
            .len()
    }
}

/// Bounded tail of a task's log output, retained for the final result
pub struct LogTail {
    buffer: Vec<u8>,
    capacity: usize,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append bytes, keeping only the newest `capacity` bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > self.capacity {
            let excess = self.buffer.len() - self.capacity;
            self.buffer.drain(..excess);
        }
    }

    /// The retained tail as lossy UTF-8
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
