//! Per-rail bearer token cache
//!
//! Tokens live only in process memory. The lock is held for map access only;
//! fetching a token happens outside it, so a slow auth call for one rail never
//! blocks readers of another.

use crate::error::Result;
use crate::model::Rail;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tiba_telemetry::redact_secret;
use tracing::debug;

/// How long a fetched token may be reused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPolicy {
    /// Fetch a new token for every call
    AlwaysFresh,
    /// Trust the expiry the rail returns, minus `skew`
    Advertised { skew: Duration },
    /// Reuse for a fixed window regardless of what the rail says
    Fixed(Duration),
}

/// Token as returned by a rail's auth endpoint
#[derive(Debug, Clone)]
pub struct FetchedToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub rail: Rail,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<Rail, AccessToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a valid cached token for `rail`, or call `fetch` and cache the result per `policy`
    pub async fn get_token<F, Fut>(
        &self,
        rail: Rail,
        policy: TokenPolicy,
        fetch: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchedToken>>,
    {
        if policy != TokenPolicy::AlwaysFresh {
            if let Some(cached) = self.cached(rail) {
                return Ok(cached);
            }
        }

        let fetched = fetch().await?;
        debug!(
            rail = %rail,
            token = %redact_secret(&fetched.token),
            "Fetched access token"
        );

        let now = Utc::now();
        let expires_at = match policy {
            TokenPolicy::AlwaysFresh => None,
            TokenPolicy::Fixed(ttl) => chrono::Duration::from_std(ttl).ok().map(|ttl| now + ttl),
            TokenPolicy::Advertised { skew } => fetched.expires_at.and_then(|at| {
                chrono::Duration::from_std(skew).ok().map(|skew| at - skew)
            }),
        };

        match expires_at {
            Some(expires_at) if expires_at > now => {
                self.entries.write().insert(
                    rail,
                    AccessToken {
                        rail,
                        token: fetched.token.clone(),
                        expires_at,
                    },
                );
            }
            _ => {
                self.entries.write().remove(&rail);
            }
        }

        Ok(fetched.token)
    }

    /// Drop the cached token for `rail`, e.g. after the rail answered 401
    pub fn invalidate(&self, rail: Rail) {
        if self.entries.write().remove(&rail).is_some() {
            debug!(rail = %rail, "Invalidated cached access token");
        }
    }

    pub fn snapshot(&self, rail: Rail) -> Option<AccessToken> {
        self.entries.read().get(&rail).cloned()
    }

    fn cached(&self, rail: Rail) -> Option<String> {
        let now = Utc::now();
        self.entries
            .read()
            .get(&rail)
            .filter(|t| t.is_valid(now))
            .map(|t| t.token.clone())
    }
}
