//! Usage meter library
//!
//! This crate provides the core functionality for:
//! - Container introspection backends (cgroup v2 and in-memory)
//! - The filter pipeline and its bounded dispatcher
//! - Periodic usage sampling of tracked containers
//! - Report delivery over HTTP
//! - Health checks and observability

pub mod agent;
pub mod api;
pub mod collector;
pub mod containers;
pub mod factory;
pub mod health;
pub mod message;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod reporting;

pub use agent::{Agent, AgentBuilder};
pub use factory::{Factories, FactoryError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use message::{Message, MessageBody, MessageType};
pub use models::*;
pub use observability::{MeterMetrics, StructuredLogger};
