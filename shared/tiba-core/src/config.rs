//! Configuration management for services

use crate::error::{Result, TibaError};
use std::env;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub shutdown_grace_secs: u64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            shutdown_grace_secs: env::var("SHUTDOWN_GRACE_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|e| TibaError::Config(format!("Invalid SHUTDOWN_GRACE_SECS: {}", e)))?,
        })
    }
}
