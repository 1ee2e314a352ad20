use std::{pin::Pin, sync::Arc};

use futures_util::future::{BoxFuture, OptionFuture};
use serde::Serialize;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, Sleep},
};
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    error::BridgeError,
    protocol::Inbound,
    services::{
        discovery::{BridgeEndpoint, PortResolver},
        queue::{Enqueued, OutboundQueue},
        transport::{Connector, TransportEvent, TransportLink},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

pub(crate) enum Command {
    Connect,
    Send(String),
    Pending(oneshot::Sender<Vec<String>>),
    Stop(oneshot::Sender<()>),
}

/// Cheap, cloneable front door to the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { commands, state }
    }

    pub fn connect(&self) -> Result<(), BridgeError> {
        self.command(Command::Connect)
    }

    /// Hands a serialized frame to the connection task. Never waits on I/O.
    pub fn send_text(&self, text: String) -> Result<(), BridgeError> {
        self.command(Command::Send(text))
    }

    pub fn send_value<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BridgeError> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text)
    }

    pub async fn pending(&self) -> Result<Vec<String>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Pending(tx))?;
        rx.await.map_err(|_| BridgeError::Stopped)
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: Command) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| BridgeError::Stopped)
    }
}

/// Result of one connect attempt. The endpoint is reported even when the
/// connect itself failed so a fresh discovery is not repeated next time.
struct AttemptOutcome {
    endpoint: Option<BridgeEndpoint>,
    result: Result<TransportLink, BridgeError>,
}

type ConnectAttempt = BoxFuture<'static, AttemptOutcome>;

enum Step {
    Command(Option<Command>),
    Attempt(AttemptOutcome),
    Transport(TransportEvent),
    Retry,
}

/// Owns the single transport link, the outbound queue and the reconnect
/// timer. Runs as one task; everything else talks to it via commands.
pub(crate) struct ConnectionManager {
    config: Arc<BridgeConfig>,
    resolver: Arc<PortResolver>,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    inbound: broadcast::Sender<Inbound>,
    queue: OutboundQueue,
    endpoint: Option<BridgeEndpoint>,
    link: Option<TransportLink>,
    attempt: Option<ConnectAttempt>,
    retry: Option<Pin<Box<Sleep>>>,
    failures: u32,
}

impl ConnectionManager {
    pub(crate) fn spawn(
        config: Arc<BridgeConfig>,
        resolver: Arc<PortResolver>,
        connector: Arc<dyn Connector>,
        inbound: broadcast::Sender<Inbound>,
        runtime: &Handle,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let queue = OutboundQueue::new(config.queue_capacity, config.overflow_policy);

        let manager = Self {
            config,
            resolver,
            connector,
            commands: commands_rx,
            state: state_tx,
            inbound,
            queue,
            endpoint: None,
            link: None,
            attempt: None,
            retry: None,
            failures: 0,
        };
        let task = runtime.spawn(manager.run());

        (ConnectionHandle::new(commands_tx, state_rx), task)
    }

    async fn run(mut self) {
        loop {
            match self.next_step().await {
                Step::Command(Some(Command::Stop(done))) => {
                    self.commands.close();
                    self.shutdown().await;
                    let _ = done.send(());
                    break;
                }
                Step::Command(None) => {
                    self.shutdown().await;
                    break;
                }
                Step::Command(Some(Command::Connect)) => self.connect(),
                Step::Command(Some(Command::Send(text))) => self.send(text).await,
                Step::Command(Some(Command::Pending(reply))) => {
                    let _ = reply.send(self.queue.snapshot());
                }
                Step::Attempt(outcome) => self.finish_attempt(outcome).await,
                Step::Transport(event) => self.handle_transport(event),
                Step::Retry => {
                    self.retry = None;
                    if self.current_state() != ConnectionState::Open {
                        debug!(target = "bridge.connection", "reconnect timer fired");
                        self.connect();
                    }
                }
            }
        }
    }

    async fn next_step(&mut self) -> Step {
        let attempting = self.attempt.is_some();
        let linked = self.link.is_some();
        let waiting = self.retry.is_some();

        tokio::select! {
            command = self.commands.recv() => Step::Command(command),
            Some(outcome) = OptionFuture::from(self.attempt.as_mut()), if attempting => {
                Step::Attempt(outcome)
            }
            Some(event) = OptionFuture::from(self.link.as_mut().map(|link| link.events.recv())), if linked => {
                Step::Transport(event.unwrap_or(TransportEvent::Closed))
            }
            Some(()) = OptionFuture::from(self.retry.as_mut()), if waiting => Step::Retry,
        }
    }

    /// No-op while a link exists or an attempt is in flight. Supersedes any
    /// scheduled reconnect.
    fn connect(&mut self) {
        if self.link.is_some() || self.attempt.is_some() {
            return;
        }
        if self.retry.take().is_some() {
            debug!(target = "bridge.connection", "connect superseded scheduled reconnect");
        }

        self.set_state(ConnectionState::Connecting);

        let resolver = Arc::clone(&self.resolver);
        let connector = Arc::clone(&self.connector);
        let known = self.endpoint.clone();
        self.attempt = Some(Box::pin(async move {
            let endpoint = match known {
                Some(endpoint) => endpoint,
                None => match resolver.resolve().await {
                    Some(resolution) => resolution.endpoint,
                    None => {
                        return AttemptOutcome {
                            endpoint: None,
                            result: Err(BridgeError::PortNotFound),
                        }
                    }
                },
            };
            let result = connector.connect(&endpoint.url).await;
            AttemptOutcome {
                endpoint: Some(endpoint),
                result,
            }
        }));
    }

    async fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        self.attempt = None;
        if outcome.endpoint.is_some() {
            self.endpoint = outcome.endpoint;
        }

        match outcome.result {
            Ok(link) => {
                info!(
                    target = "bridge.connection",
                    url = self.endpoint.as_ref().map(|endpoint| endpoint.url.as_str()),
                    queued = self.queue.len(),
                    "bridge connected"
                );
                self.link = Some(link);
                self.failures = 0;
                self.set_state(ConnectionState::Open);
                self.flush().await;
            }
            Err(error) => {
                self.failures += 1;
                warn!(
                    target = "bridge.connection",
                    error = %error,
                    failures = self.failures,
                    "bridge connect failed"
                );

                let threshold = self.config.rediscover_after_failures;
                if threshold > 0 && self.failures >= threshold {
                    if let Some(stale) = self.endpoint.take() {
                        info!(target = "bridge.connection", port = stale.port, "endpoint unreachable; rediscovering on next attempt");
                        self.failures = 0;
                    }
                }

                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    async fn send(&mut self, text: String) {
        let open = self.current_state() == ConnectionState::Open;

        if open && self.queue.is_empty() {
            if let Some(link) = self.link.as_mut() {
                match link.sink.send_text(text.clone()).await {
                    Ok(()) => return,
                    Err(error) => {
                        warn!(target = "bridge.connection", error = %error, "bridge send failed; keeping message");
                        self.enqueue(text);
                        self.abandon_link().await;
                        return;
                    }
                }
            }
        }

        self.enqueue(text);
        if open {
            self.flush().await;
        } else {
            self.connect();
        }
    }

    fn enqueue(&mut self, text: String) {
        match self.queue.enqueue(text) {
            Enqueued::Accepted => {
                debug!(target = "bridge.queue", queued = self.queue.len(), "message queued")
            }
            Enqueued::DroppedOldest(_) | Enqueued::Rejected => {}
        }
    }

    async fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match self.queue.flush(link.sink.as_mut()).await {
            Ok(sent) => debug!(target = "bridge.queue", sent, "outbound queue flushed"),
            Err(error) => {
                warn!(
                    target = "bridge.queue",
                    error = %error,
                    remaining = self.queue.len(),
                    "flush failed; dropping link"
                );
                self.abandon_link().await;
            }
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => match Inbound::from_text(&text) {
                Some(inbound) => {
                    let _ = self.inbound.send(inbound);
                }
                None => debug!(target = "bridge.connection", "ignoring non-JSON frame"),
            },
            TransportEvent::Error(error) => {
                // The link stays until its close event arrives.
                warn!(target = "bridge.connection", error = %error, "bridge transport error");
                self.set_state(ConnectionState::Disconnected);
            }
            TransportEvent::Closed => {
                info!(target = "bridge.connection", "bridge connection closed");
                self.link = None;
                self.set_state(ConnectionState::Disconnected);
                self.schedule_retry();
            }
        }
    }

    async fn abandon_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.sink.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }
        debug!(
            target = "bridge.connection",
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.retry = Some(Box::pin(sleep(self.config.reconnect_delay)));
    }

    async fn shutdown(&mut self) {
        self.set_state(ConnectionState::Closing);
        self.retry = None;
        self.attempt = None;
        if let Some(mut link) = self.link.take() {
            link.sink.close().await;
        }
        if !self.queue.is_empty() {
            info!(target = "bridge.connection", undelivered = self.queue.len(), "bridge stopped with queued messages");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(target = "bridge.connection", state = ?next, "connection state changed");
        }
    }
}
