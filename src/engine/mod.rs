//! Container engine access: connection handling and the client trait seam.
//!
//! Everything above this module talks to the engine exclusively through the
//! [`ContainerClient`] trait, so the sandbox, pool, and manager are all
//! unit-testable without a live daemon.

mod client;
mod connection;

pub use client::{ClientFuture, ContainerClient, ExecOutput, StatsSample};
#[cfg(test)]
pub(crate) use client::MockEngineClient;
pub use connection::{SocketResolver, connect, connect_with_fallback, resolve_socket};
