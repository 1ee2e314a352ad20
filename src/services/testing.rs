//! In-process stand-ins for the network edges.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use crate::{
    error::BridgeError,
    services::{
        discovery::PortProbe,
        transport::{Connector, FrameSink, TransportEvent, TransportLink},
    },
};

/// Answers from a fixed table and records every port it was asked about.
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    answers: HashMap<u16, u16>,
    calls: Mutex<Vec<(u16, Duration)>>,
}

impl ScriptedProbe {
    pub(crate) fn answering(answers: &[(u16, u16)]) -> Arc<Self> {
        Arc::new(Self {
            answers: answers.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<(u16, Duration)> {
        self.calls.lock().clone()
    }

    pub(crate) fn probed_ports(&self) -> Vec<u16> {
        self.calls.lock().iter().map(|(port, _)| *port).collect()
    }
}

#[async_trait]
impl PortProbe for ScriptedProbe {
    async fn probe(&self, port: u16, timeout: Duration) -> Option<u16> {
        self.calls.lock().push((port, timeout));
        self.answers.get(&port).copied()
    }
}

/// Records sent frames; fails the sends whose 0-based index is listed.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    sent: Arc<Mutex<Vec<String>>>,
    fail_on: Vec<usize>,
    attempts: Arc<Mutex<usize>>,
}

impl RecordingSink {
    pub(crate) fn failing_on(fail_on: &[usize]) -> Self {
        Self {
            fail_on: fail_on.to_vec(),
            ..Self::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let current = *attempts;
            *attempts += 1;
            current
        };
        if self.fail_on.contains(&attempt) {
            return Err(BridgeError::transport("socket not writable"));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// The test-side ends of a link handed out by [`ScriptedConnector`].
#[derive(Clone)]
pub(crate) struct LinkControl {
    pub(crate) events: mpsc::UnboundedSender<TransportEvent>,
    pub(crate) sink: RecordingSink,
}

/// Hands out in-memory links. Every attempt waits for a gate permit, so a
/// test can hold the manager in CONNECTING for as long as it likes.
pub(crate) struct ScriptedConnector {
    gate: Semaphore,
    refusals: Mutex<usize>,
    first_link_fails_on: Vec<usize>,
    urls: Mutex<Vec<String>>,
    links: Mutex<Vec<LinkControl>>,
}

impl ScriptedConnector {
    fn with_permits(permits: usize, first_link_fails_on: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(permits),
            refusals: Mutex::new(0),
            first_link_fails_on: first_link_fails_on.to_vec(),
            urls: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn open() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS, &[])
    }

    pub(crate) fn gated() -> Arc<Self> {
        Self::with_permits(0, &[])
    }

    pub(crate) fn gated_with_failing_first_link(fail_on: &[usize]) -> Arc<Self> {
        Self::with_permits(0, fail_on)
    }

    pub(crate) fn release(&self, attempts: usize) {
        self.gate.add_permits(attempts);
    }

    pub(crate) fn refuse_next(&self, attempts: usize) {
        *self.refusals.lock() = attempts;
    }

    pub(crate) fn attempts(&self) -> usize {
        self.urls.lock().len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    pub(crate) fn link(&self, index: usize) -> LinkControl {
        self.links.lock()[index].clone()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.lock().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, BridgeError> {
        self.urls.lock().push(url.to_string());

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| BridgeError::transport("gate closed"))?;
        permit.forget();

        {
            let mut refusals = self.refusals.lock();
            if *refusals > 0 {
                *refusals -= 1;
                return Err(BridgeError::transport("connection refused"));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut links = self.links.lock();
        let sink = if links.is_empty() {
            RecordingSink::failing_on(&self.first_link_fails_on)
        } else {
            RecordingSink::default()
        };
        links.push(LinkControl {
            events: tx,
            sink: sink.clone(),
        });

        Ok(TransportLink {
            sink: Box::new(sink),
            events: rx,
        })
    }
}
