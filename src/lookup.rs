//! Asynchronous lookup collaborator (SLF slice lookup, NF discovery).
//!
//! The engine never performs the lookup itself. A `lookup` action pauses
//! the state machine and hands the host a [`LookupRequest`]; the host drives
//! its [`LookupService`] and feeds the result back through
//! [`Engine::resume`].
//!
//! [`Engine::resume`]: crate::filter::Engine::resume

use async_trait::async_trait;
use serde_json::Value;

use crate::config::LookupServiceKind;
use crate::error::LookupError;

/// What a paused exchange is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub service: LookupServiceKind,
    /// Rendered query value (e.g. a SUPI)
    pub query: String,
}

/// A completed lookup; the value lands in the destination variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub value: Value,
}

#[async_trait]
pub trait LookupService: Send + Sync {
    async fn issue(&self, request: &LookupRequest) -> Result<LookupResult, LookupError>;

    /// Abandon an in-flight lookup. Called when the owning exchange is torn
    /// down before the result arrives; the continuation is discarded and
    /// never resumed.
    fn cancel(&self, request: &LookupRequest);
}

/// Table-backed lookup used by tests and bench/demo hosts.
#[derive(Debug, Default)]
pub struct MemoryLookupService {
    entries: std::collections::HashMap<String, Value>,
}

impl MemoryLookupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, query: impl Into<String>, value: Value) {
        self.entries.insert(query.into(), value);
    }
}

#[async_trait]
impl LookupService for MemoryLookupService {
    async fn issue(&self, request: &LookupRequest) -> Result<LookupResult, LookupError> {
        match self.entries.get(&request.query) {
            Some(value) => Ok(LookupResult { value: value.clone() }),
            None => Err(LookupError::NotFound),
        }
    }

    fn cancel(&self, _request: &LookupRequest) {}
}
