//! SSH transport layer
//!
//! The managers depend only on the `SshConnector` / `RemoteSession` traits.
//! `RusshConnector` is the production implementation on top of russh.
//!
//! # Features
//! - Password and private key authentication
//! - SSH-over-SSH through a direct-tcpip channel (jump hosts)
//! - Remote forward channels routed per connection
//! - Host key verification via ~/.ssh/known_hosts

mod client;
mod config;
mod error;
mod handle_owner;
mod transport;

pub use client::{ClientHandler, RusshConnector};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, ForwardTable, HandleCommand, HandleController};
pub use transport::{
    BoxedChannel, ChannelStream, ForwardedChannel, PingResult, RemoteListener, RemoteSession,
    SshConnector,
};
