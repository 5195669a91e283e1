//! Registry for named circuit breakers.
//!
//! One breaker per protected name: callers in different parts of an application that guard
//! the same downstream share one circuit by looking it up here.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError, CircuitState, Counts,
};
use thiserror::Error;
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerRegistryError {
    /// The requested circuit breaker name was not found.
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
    #[error(transparent)]
    Config(#[from] CircuitBreakerConfigError),
}

/// Point-in-time view of one registered breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub counts: Counts,
}

/// In-memory registry backed by an RwLock. Clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker registered as `name`, creating it from `config` if absent.
    ///
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker, CircuitBreakerRegistryError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(name) {
            return Ok(existing.clone());
        }
        let breaker = CircuitBreaker::new(name, config)?;
        map.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Register an existing breaker under its own name, replacing any previous one.
    pub fn register(&self, breaker: CircuitBreaker) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let name = breaker.name().to_string();
        if map.contains_key(&name) {
            warn!(breaker = %name, "circuit breaker name replaced; last registration wins");
        }
        map.insert(name, breaker);
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Force the named breaker back to Closed.
    pub fn reset(&self, name: &str) -> Result<(), CircuitBreakerRegistryError> {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<CircuitBreaker> =
            self.inner.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut entries: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|b| BreakerSnapshot {
                name: b.name().to_string(),
                state: b.state(),
                counts: b.counts(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}
