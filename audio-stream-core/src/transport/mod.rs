//! Wire protocol and the WebSocket transport built on it.

pub mod protocol;
pub mod ws;

pub use ws::{TransportDiagnostics, WsConfig, WsTransport};
