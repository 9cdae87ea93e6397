//! postwire protocol core: request / ack / response RPC over an unreliable
//! one-way message channel, plus proxy windows.
//! Host-driven: no I/O; the host supplies a `Transport` and feeds inbound
//! messages to a `Peer`.

pub mod capability;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod domain;
pub mod listeners;
pub mod protocol;
pub mod proxy;
pub mod send;
pub mod transport;
pub mod window;
pub mod wire;

#[cfg(test)]
mod testing;

pub use crate::core::{Peer, ReceiveError};
pub use capability::{InstanceIdentity, LocalCapability, RemoteCapability, WindowCapability};
pub use config::PeerConfig;
pub use dispatch::{DispatchError, Dispatcher};
pub use domain::DomainPattern;
pub use listeners::{
    handler, Handler, ListenOptions, ListenerError, ListenerHandle, RequestContext, Response,
};
pub use protocol::Message;
pub use proxy::{ProxyRegistry, ProxyWindow, WindowDescriptor};
pub use send::{SendError, SendOptions};
pub use transport::{Transport, TransportError};
pub use window::{Handle, HandleId, Window, WindowError};
pub use wire::{decode_message, encode_message, DecodeError, EncodeError};
