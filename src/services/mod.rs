pub mod connection;
pub mod discovery;
pub mod emit;
pub mod port_store;
pub mod queue;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionHandle, ConnectionState};
pub use discovery::{
    BridgeEndpoint, DiscoverySource, HttpPortProbe, PortProbe, PortResolver, Resolution,
};
pub use emit::{EmitGateway, EmitStatsSnapshot, HostHook, HostHookSlot, RetryPolicy};
pub use port_store::{FilePortStore, MemoryPortStore, PortCache, PortStore, PORT_STORAGE_KEY};
pub use queue::{Enqueued, OutboundQueue};
pub use transport::{Connector, FrameSink, TransportEvent, TransportLink, WsConnector};
