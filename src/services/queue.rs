use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{config::OverflowPolicy, error::BridgeError, services::transport::FrameSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    DroppedOldest(String),
    Rejected,
}

/// Serialized messages waiting for an open link, oldest first.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<String>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    pub fn enqueue(&mut self, message: String) -> Enqueued {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return Enqueued::Accepted;
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                let dropped = self.messages.pop_front().unwrap_or_default();
                self.messages.push_back(message);
                warn!(
                    target = "bridge.queue",
                    capacity = self.capacity,
                    "outbound queue full; dropped oldest message"
                );
                Enqueued::DroppedOldest(dropped)
            }
            OverflowPolicy::RejectNew => {
                warn!(
                    target = "bridge.queue",
                    capacity = self.capacity,
                    "outbound queue full; rejected new message"
                );
                Enqueued::Rejected
            }
        }
    }

    /// Sends queued messages front to back. A message whose send fails goes
    /// back to the front and flushing stops there.
    pub async fn flush(&mut self, sink: &mut dyn FrameSink) -> Result<usize, BridgeError> {
        let mut sent = 0;
        while let Some(message) = self.messages.pop_front() {
            if let Err(error) = sink.send_text(message.clone()).await {
                self.messages.push_front(message);
                debug!(target = "bridge.queue", sent, remaining = self.messages.len(), "flush interrupted");
                return Err(error);
            }
            sent += 1;
        }
        Ok(sent)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
