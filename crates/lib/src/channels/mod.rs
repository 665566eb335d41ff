//! Channels and the connection registry.
//!
//! A channel is the hub's send handle to one remote endpoint (WebSocket or in-process).
//! The registry maps endpoint identities to their live connection.

mod handle;
mod memory;
mod registry;
mod ws;

pub use handle::{ChannelError, ChannelHandle, ClosedSignal};
pub use memory::MemoryChannel;
pub use registry::{Connection, ConnectionRegistry, ConnectionTag, ConnectionToken, Role};
pub use ws::WsChannel;
