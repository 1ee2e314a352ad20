use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::info;

use crate::{
    config::BridgeConfig,
    error::BridgeError,
    protocol::Inbound,
    services::{
        connection::ConnectionManager, ConnectionHandle, ConnectionState, Connector,
        EmitGateway, EmitStatsSnapshot, FilePortStore, HostHookSlot, HttpPortProbe,
        MemoryPortStore, PortCache, PortProbe, PortResolver, PortStore, RetryPolicy, WsConnector,
    },
};

const INBOUND_CAPACITY: usize = 64;

pub struct BridgeClientBuilder {
    config: BridgeConfig,
    store: Option<Arc<dyn PortStore>>,
    probe: Option<Arc<dyn PortProbe>>,
    connector: Option<Arc<dyn Connector>>,
}

impl BridgeClientBuilder {
    pub fn store(mut self, store: Arc<dyn PortStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Spawns the connection task on the current tokio runtime and asks it
    /// to connect straight away.
    pub fn start(self) -> Result<BridgeClient, BridgeError> {
        self.config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| BridgeError::config("bridge client must start inside a tokio runtime"))?;

        let config = Arc::new(self.config);
        let store = self.store.unwrap_or_else(|| default_store(&config));
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpPortProbe::new(config.host.clone())));
        let connector = self.connector.unwrap_or_else(|| Arc::new(WsConnector));

        let resolver = Arc::new(PortResolver::new(
            Arc::clone(&config),
            probe,
            PortCache::new(store),
        ));
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (connection, task) = ConnectionManager::spawn(
            Arc::clone(&config),
            resolver,
            connector,
            inbound.clone(),
            &runtime,
        );

        let hook = HostHookSlot::default();
        let gateway = EmitGateway::new(
            config.emit_transport,
            RetryPolicy {
                limit: config.emit_retry_limit,
                delay: config.emit_retry_delay,
            },
            hook.clone(),
            connection.clone(),
            runtime,
        );

        connection.connect()?;
        info!(
            target = "bridge.connection",
            transport = ?config.emit_transport,
            range = %format!("{}..={}", config.discovery_start, config.discovery_end),
            "bridge client started"
        );

        Ok(BridgeClient {
            connection,
            gateway,
            hook,
            inbound,
            task: Mutex::new(Some(task)),
        })
    }
}

fn default_store(config: &BridgeConfig) -> Arc<dyn PortStore> {
    match &config.store_path {
        Some(path) => Arc::new(FilePortStore::new(path)),
        None => Arc::new(MemoryPortStore::new()),
    }
}

/// The one owned entry point for UI code: emits events, exposes the
/// connection state and inbound messages, and tears everything down on
/// `stop`.
pub struct BridgeClient {
    connection: ConnectionHandle,
    gateway: EmitGateway,
    hook: HostHookSlot,
    inbound: broadcast::Sender<Inbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn builder(config: BridgeConfig) -> BridgeClientBuilder {
        BridgeClientBuilder {
            config,
            store: None,
            probe: None,
            connector: None,
        }
    }

    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::builder(config).start()
    }

    /// Sends through the configured emit transport. Returns immediately.
    pub fn emit<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BridgeError> {
        self.gateway.emit(payload)
    }

    /// Sends over the WebSocket bridge regardless of the emit transport.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), BridgeError> {
        self.connection.send_value(payload)
    }

    pub fn connect(&self) -> Result<(), BridgeError> {
        self.connection.connect()
    }

    pub fn register_host_hook<F>(&self, hook: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.hook.register(Arc::new(hook));
    }

    pub fn clear_host_hook(&self) {
        self.hook.clear();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inbound.subscribe()
    }

    /// Serialized messages still waiting for an open connection.
    pub async fn pending(&self) -> Result<Vec<String>, BridgeError> {
        self.connection.pending().await
    }

    pub fn emit_stats(&self) -> EmitStatsSnapshot {
        self.gateway.stats()
    }

    pub async fn stop(&self) {
        self.gateway.shutdown();
        self.connection.stop().await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(target = "bridge.connection", "bridge client stopped");
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.gateway.shutdown();
    }
}
