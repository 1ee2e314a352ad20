use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::{runtime::Handle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{config::EmitTransport, error::BridgeError, services::ConnectionHandle};

pub type HostHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Where the host's emission hook lives once (if ever) it is registered.
#[derive(Clone, Default)]
pub struct HostHookSlot {
    hook: Arc<RwLock<Option<HostHook>>>,
}

impl HostHookSlot {
    pub fn register(&self, hook: HostHook) {
        *self.hook.write() = Some(hook);
    }

    pub fn clear(&self) {
        *self.hook.write() = None;
    }

    pub fn current(&self) -> Option<HostHook> {
        self.hook.read().clone()
    }
}

#[derive(Debug, Default)]
pub struct EmitStats {
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStatsSnapshot {
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
}

impl EmitStats {
    pub fn snapshot(&self) -> EmitStatsSnapshot {
        EmitStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub limit: u32,
    pub delay: Duration,
}

/// Fire-and-forget event delivery over either the host hook or the socket.
pub struct EmitGateway {
    transport: EmitTransport,
    hook: HostHookSlot,
    connection: ConnectionHandle,
    retry: RetryPolicy,
    runtime: Handle,
    cancel: CancellationToken,
    stats: Arc<EmitStats>,
}

impl EmitGateway {
    pub fn new(
        transport: EmitTransport,
        retry: RetryPolicy,
        hook: HostHookSlot,
        connection: ConnectionHandle,
        runtime: Handle,
    ) -> Self {
        Self {
            transport,
            hook,
            connection,
            retry,
            runtime,
            cancel: CancellationToken::new(),
            stats: Arc::new(EmitStats::default()),
        }
    }

    /// Serialization errors and emits after `shutdown` are returned
    /// immediately; delivery problems never are.
    pub fn emit<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BridgeError> {
        let value = serde_json::to_value(payload)?;
        if self.cancel.is_cancelled() {
            debug!(target = "bridge.emit", kind = event_kind(&value), "emit after shutdown refused");
            return Err(BridgeError::Stopped);
        }
        match self.transport {
            EmitTransport::Socket => self.connection.send_value(&value),
            EmitTransport::HostHook => {
                self.emit_via_hook(value);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> EmitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Cancels every retry chain still waiting for the hook.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn emit_via_hook(&self, payload: Value) {
        if let Some(hook) = self.hook.current() {
            hook(&payload);
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Each payload gets its own attempt budget.
        let slot = self.hook.clone();
        let stats = Arc::clone(&self.stats);
        let cancel = self.cancel.clone();
        let RetryPolicy { limit, delay } = self.retry;

        self.runtime.spawn(async move {
            for attempt in 1..=limit {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
                stats.retried.fetch_add(1, Ordering::Relaxed);

                if let Some(hook) = slot.current() {
                    hook(&payload);
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(target = "bridge.emit", attempt, "host hook appeared; payload delivered");
                    return;
                }
            }

            stats.dropped.fetch_add(1, Ordering::Relaxed);
            let kind = event_kind(&payload);
            warn!(
                target = "bridge.emit",
                attempts = limit,
                kind,
                "host hook never registered; payload dropped"
            );
        });
    }
}

fn event_kind(payload: &Value) -> &str {
    payload.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde::ser::Error as _;
    use serde_json::json;
    use tokio::sync::{mpsc, watch};

    use super::*;
    use crate::services::{connection::Command, ConnectionState};

    struct Fixture {
        gateway: EmitGateway,
        hook: HostHookSlot,
        commands: mpsc::UnboundedReceiver<Command>,
        _state: watch::Sender<ConnectionState>,
    }

    fn fixture(transport: EmitTransport) -> Fixture {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let hook = HostHookSlot::default();
        let gateway = EmitGateway::new(
            transport,
            RetryPolicy {
                limit: 60,
                delay: Duration::from_millis(200),
            },
            hook.clone(),
            ConnectionHandle::new(commands_tx, state_rx),
            Handle::current(),
        );
        Fixture {
            gateway,
            hook,
            commands,
            _state: state_tx,
        }
    }

    fn recording_hook() -> (HostHook, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook: HostHook = Arc::new(move |payload: &Value| sink.lock().push(payload.clone()));
        (hook, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn present_hook_is_called_synchronously() {
        let fixture = fixture(EmitTransport::HostHook);
        let (hook, seen) = recording_hook();
        fixture.hook.register(hook);

        fixture.gateway.emit(&json!({ "type": "request-maps" })).unwrap();

        assert_eq!(seen.lock().as_slice(), [json!({ "type": "request-maps" })]);
        assert_eq!(
            fixture.gateway.stats(),
            EmitStatsSnapshot {
                delivered: 1,
                retried: 0,
                dropped: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_hook_receives_the_pending_payload() {
        let fixture = fixture(EmitTransport::HostHook);
        fixture.gateway.emit(&json!({ "type": "request-fonts" })).unwrap();

        sleep(Duration::from_millis(1_100)).await;
        let (hook, seen) = recording_hook();
        fixture.hook.register(hook);
        sleep(Duration::from_millis(300)).await;

        assert_eq!(seen.lock().as_slice(), [json!({ "type": "request-fonts" })]);
        let stats = fixture.gateway.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 6);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_hook_gives_up_after_the_retry_ceiling() {
        let fixture = fixture(EmitTransport::HostHook);
        fixture.gateway.emit(&json!({ "type": "request-others" })).unwrap();

        sleep(Duration::from_millis(60 * 200 + 100)).await;
        assert_eq!(
            fixture.gateway.stats(),
            EmitStatsSnapshot {
                delivered: 0,
                retried: 60,
                dropped: 1,
            }
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        fixture.hook.register(Arc::new(move |_: &Value| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
        sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(fixture.gateway.stats().retried, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn each_payload_has_its_own_retry_budget() {
        let fixture = fixture(EmitTransport::HostHook);
        fixture.gateway.emit(&json!({ "type": "first" })).unwrap();
        sleep(Duration::from_millis(6_100)).await;
        fixture.gateway.emit(&json!({ "type": "second" })).unwrap();

        // The first chain runs out at 12s; the second has until ~18.1s.
        sleep(Duration::from_millis(6_100)).await;
        assert_eq!(fixture.gateway.stats().dropped, 1);

        let (hook, seen) = recording_hook();
        fixture.hook.register(hook);
        sleep(Duration::from_millis(300)).await;

        assert_eq!(seen.lock().as_slice(), [json!({ "type": "second" })]);
        assert_eq!(fixture.gateway.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_waiting_retries() {
        let fixture = fixture(EmitTransport::HostHook);
        fixture.gateway.emit(&json!({ "type": "request-maps" })).unwrap();
        sleep(Duration::from_millis(500)).await;

        fixture.gateway.shutdown();
        sleep(Duration::from_secs(20)).await;

        let stats = fixture.gateway.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_after_shutdown_is_refused_on_both_transports() {
        for transport in [EmitTransport::HostHook, EmitTransport::Socket] {
            let mut fixture = fixture(transport);
            fixture.gateway.shutdown();

            let result = fixture.gateway.emit(&json!({ "type": "request-maps" }));

            assert!(matches!(result, Err(BridgeError::Stopped)));
            assert!(fixture.commands.try_recv().is_err());
            sleep(Duration::from_secs(20)).await;
            assert_eq!(fixture.gateway.stats(), EmitStatsSnapshot::default());
        }
    }

    #[tokio::test]
    async fn socket_transport_hands_serialized_json_to_the_connection() {
        let mut fixture = fixture(EmitTransport::Socket);
        let (hook, seen) = recording_hook();
        fixture.hook.register(hook);

        fixture
            .gateway
            .emit(&json!({ "type": "request-skin-mods", "championId": 1, "skinId": 1001 }))
            .unwrap();

        match fixture.commands.try_recv() {
            Ok(Command::Send(text)) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "request-skin-mods");
                assert_eq!(value["skinId"], 1001);
            }
            _ => panic!("expected a send command"),
        }
        assert!(seen.lock().is_empty());
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("cannot encode"))
        }
    }

    #[tokio::test]
    async fn unserializable_payload_is_rejected_up_front() {
        let mut fixture = fixture(EmitTransport::Socket);

        let result = fixture.gateway.emit(&Unserializable);

        assert!(matches!(result, Err(BridgeError::Serialize(_))));
        assert!(fixture.commands.try_recv().is_err());
    }
}
