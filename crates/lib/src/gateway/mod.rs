//! Gateway: HTTP + WebSocket surface of the hub.
//!
//! Single port serves both. Endpoints connect at `/ws/{role}/{id}` and exchange envelopes;
//! the HTTP routes cover the offer/answer store, the proxy tunnel and status.

mod protocol;
mod server;

pub use protocol::{AuthQuery, ErrorBody, ProxyQuery, PROTOCOL_VERSION};
pub use server::{router, run_hub, GatewayState};
