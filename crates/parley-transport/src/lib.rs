//! WebSocket transport to the conferencing media bridge.
//!
//! Audio travels as binary messages; everything else is a JSON envelope
//! (see [`protocol::BridgeMessage`]).

pub mod protocol;
pub mod ws;

pub use protocol::BridgeMessage;
pub use ws::{bridge_url, WsConnector, WsTransport};
