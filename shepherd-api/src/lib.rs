//! Shepherd API Library
//!
//! Cluster registration and access control: the registry, its credential
//! store, remote RBAC provisioning, connectivity probes and the HTTP surface
//! in front of them.

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod shutdown;

// Application state
pub mod state;
pub use state::AppState;

// Authentication & Authorization
pub mod auth;
pub mod middleware;

// Cluster registry
pub mod clusters;

// Database
pub mod db;

// HTTP surface
pub mod routes;
pub use routes::router;
