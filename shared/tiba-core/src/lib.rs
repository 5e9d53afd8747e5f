//! Tiba Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Standard service trait every Tiba service implements
//! - Common domain types (PhoneNumber, Operator)
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use config::ServiceConfig;
pub use domain::*;
pub use error::{Result, TibaError};
pub use service::{
    DependencyStatus, HealthStatus, MicroserviceRuntime, ReadinessStatus, TibaService,
};
