//! Common types and utilities shared between shepherd-api and shepherd-cli

pub mod auth;
pub mod cluster;
pub mod table;

pub use cluster::{Cluster, ClusterConfig, ClusterField, ConnectionState, ConnectionStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
