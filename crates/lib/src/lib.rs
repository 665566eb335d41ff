//! Junction core library: rendezvous and relay hub for devices, viewers and proxy clients.
//!
//! A [`Hub`] owns the connection registry, the message router, the broadcast fanout, the proxy
//! tunnel correlator and the offer/answer store; the gateway exposes it over HTTP + WebSocket.

pub mod channels;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod handshake;
pub mod hub;
pub mod init;
pub mod routing;

pub use envelope::{Envelope, EnvelopeKind};
pub use error::HubError;
pub use hub::{Hub, HubStatus};
