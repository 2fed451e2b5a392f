//! Berth - host-local orchestrator for containerized MCP servers
//!
//! This crate deploys, supervises, and tears down coordinated groups of
//! Model Context Protocol servers: ordered batch deployment, per-instance
//! health monitoring with automatic restart, OAuth credential injection
//! with scheduled refresh, and layered container spec resolution.

pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;
pub mod types;

pub use error::{BerthError, Result};

// Export main types at root level
pub use events::{Event, EventBus};
pub use orchestrator::{DeployOptions, GroupDeployReport, Orchestrator, RemoveOptions};
pub use types::{GroupSnapshot, GroupStatus, HealthState, Instance, ServerSpec, TransportKind};
