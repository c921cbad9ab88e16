// src/lib.rs
pub mod config;
pub mod env;
pub mod handlers;
pub mod rabbitmq;
pub mod status;

pub use config::{ClientSettings, ClientsConfig};
pub use env::BrokerConfig;
pub use rabbitmq::{CallOptions, ErrorKind, MultiplexClient, RpcClient, RpcError};
