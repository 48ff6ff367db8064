//! Named protocol registry

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::protocol::{BinaryProtocol, Protocol, TextProtocol};

/// Maps protocol names to implementations
///
/// A process-wide registry is available through [`ProtocolRegistry::global`];
/// it is initialized with the built-in protocols on first access. Separate
/// instances can be created for isolated setups and tests.
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, Arc<dyn Protocol>>>,
}

static GLOBAL: OnceLock<ProtocolRegistry> = OnceLock::new();

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            protocols: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry holding the built-in protocols
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(TextProtocol::new()));
        registry.register(Arc::new(BinaryProtocol::new()));
        registry
    }

    /// The process-wide registry
    pub fn global() -> &'static ProtocolRegistry {
        GLOBAL.get_or_init(Self::with_builtins)
    }

    /// Register a protocol under its own name, replacing any previous one
    pub fn register(&self, protocol: Arc<dyn Protocol>) {
        let name = protocol.name().to_string();
        debug!(protocol = %name, "Registering protocol");
        self.protocols.write().insert(name, protocol);
    }

    /// Look up a protocol by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn Protocol>> {
        self.protocols
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| LinkError::UnknownProtocol(name.to_string()))
    }

    /// Names of all registered protocols, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.protocols.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.names())
            .finish()
    }
}
