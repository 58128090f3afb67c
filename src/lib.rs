//! charon - keep-alive connection pooling for request/response clients
//!
//! An [`Agent`] keeps connections to each destination open after an exchange
//! finishes and hands them to the next request for the same destination. It
//! caps concurrent connections per destination, queues requests beyond the
//! cap in arrival order, closes connections that sit idle too long, and makes
//! sure every request sees exactly one outcome.
//!
//! The pool is transport-agnostic: bring a [`Transport`] and a [`Protocol`],
//! or use the bundled HTTP/1.1 pair in [`http`].

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
mod idle;
pub mod key;
mod pending;
mod pool;
mod router;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentStats, Completed, RequestHandle};
pub use config::{AgentConfig, ConfigError, ConfigFile};
pub use connection::{
    ConnState, Connection, ConnectionId, Exchange, ManagedConnection, Protocol, RequestId,
    Transport,
};
pub use error::PoolError;
pub use key::DestinationKey;
