//! Transport layer between the master and its slaves.
//!
//! Provides:
//! - Wire protocol (JSON + base64)
//! - WebSocket endpoint and `SlaveCallback` over the socket (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::{MasterMessage, SlaveMessage};

#[cfg(feature = "websocket")]
pub use websocket::{WsCallback, create_ws_router};
