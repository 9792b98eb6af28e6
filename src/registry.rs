// ABOUTME: Registry mapping request IDs to streaming token sinks using sharded concurrent HashMap
// ABOUTME: Lets the HTTP streaming layer hand a sink to the pipeline without plumbing it through every stage
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

use std::sync::Arc;

use dashmap::DashMap;

use crate::llm::TokenSink;

/// Registry of streaming sinks keyed by request ID
/// Uses `DashMap` for fine-grained locking instead of global `Mutex` to reduce contention
#[derive(Clone, Default)]
pub struct TokenCallbackRegistry {
    /// Request ID -> token sink for the in-flight turn
    sinks: Arc<DashMap<String, TokenSink>>,
}

impl std::fmt::Debug for TokenCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCallbackRegistry")
            .field("registered", &self.sinks.len())
            .finish()
    }
}

impl TokenCallbackRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: Arc::new(DashMap::new()),
        }
    }

    /// Register a sink for a request ID
    ///
    /// The returned guard unregisters the sink when dropped, covering turns
    /// that fail before the model stage claims it.
    #[must_use]
    pub fn register(&self, request_id: impl Into<String>, sink: TokenSink) -> RegistrationGuard {
        let request_id = request_id.into();
        self.sinks.insert(request_id.clone(), sink);
        RegistrationGuard {
            registry: self.clone(),
            request_id,
        }
    }

    /// Claim the sink for a request ID, removing it from the registry
    ///
    /// At most one caller observes the sink; later calls return `None`.
    #[must_use]
    pub fn take(&self, request_id: &str) -> Option<TokenSink> {
        self.sinks.remove(request_id).map(|(_, sink)| sink)
    }

    /// Drop a registration without claiming the sink
    pub fn remove(&self, request_id: &str) {
        self.sinks.remove(request_id);
    }

    /// Number of registered sinks
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Unregisters a sink when dropped
pub struct RegistrationGuard {
    registry: TokenCallbackRegistry,
    request_id: String,
}

impl std::fmt::Debug for RegistrationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationGuard")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}
