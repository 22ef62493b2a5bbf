//! The broker daemon: serves carved-out virtual SSDs over TCP and,
//! for remote sessions, proxies block I/O against the carved blocks.

pub mod config;
pub mod conn;
pub mod netif;
pub mod proto;
pub mod reactor;
pub mod server;

pub use config::BrokerConfig;
pub use server::{BrokerCtx, Server, ServerError};
