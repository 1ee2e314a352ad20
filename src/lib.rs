//! Client side of the Rose mod bridge.
//!
//! The champion-select overlay talks to a local backend process that lists
//! installed skin, map, font, announcer and miscellaneous mods. This crate
//! finds the port that backend listens on, keeps a WebSocket to it alive,
//! buffers outgoing events while the link is down, and offers a
//! fire-and-forget `emit` that can also target a callback injected by the
//! host instead of the socket.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod services;

pub use client::{BridgeClient, BridgeClientBuilder};
pub use config::{BridgeConfig, EmitTransport, OverflowPolicy};
pub use error::BridgeError;
pub use protocol::{ConnectionNotice, Inbound, InboundEvent, OutboundEvent};
pub use services::{BridgeEndpoint, ConnectionState, EmitStatsSnapshot};
