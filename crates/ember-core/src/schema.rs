//! Two-level schema registry gating payloads before dispatch.
//!
//! The registry maps `event_type → schema_version → validator` and is
//! supplied at bus construction. Publish and transact refuse any event
//! whose `(event_type, schema_version)` pair has no validator, or whose
//! payload the validator rejects. Subscriber-level schemas (attached at
//! subscribe time) gate only that one listener and never block others.

use std::collections::HashMap;
use std::sync::Arc;

use core::fmt;
use serde_json::Value;

/// Validator applied to an event payload.
pub trait PayloadSchema: Send + Sync {
    /// Returns `true` when the payload conforms to the schema.
    fn validate(&self, payload: &Value) -> bool;
}

impl<F> PayloadSchema for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn validate(&self, payload: &Value) -> bool {
        self(payload)
    }
}

/// Shared handle to a payload validator.
pub type SchemaRef = Arc<dyn PayloadSchema>;

/// Registry mapping `event_type → schema_version → validator`.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, HashMap<String, SchemaRef>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator for an `(event_type, schema_version)` pair,
    /// replacing any previous registration.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        version: impl Into<String>,
        schema: impl PayloadSchema + 'static,
    ) {
        self.schemas
            .entry(event_type.into())
            .or_default()
            .insert(version.into(), Arc::new(schema));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_schema(
        mut self,
        event_type: impl Into<String>,
        version: impl Into<String>,
        schema: impl PayloadSchema + 'static,
    ) -> Self {
        self.register(event_type, version, schema);
        self
    }

    /// Look up the validator for an `(event_type, schema_version)` pair.
    pub fn lookup(&self, event_type: &str, version: &str) -> Option<&SchemaRef> {
        self.schemas.get(event_type)?.get(version)
    }

    /// Number of event types with at least one registered version.
    pub fn event_type_count(&self) -> usize {
        self.schemas.len()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("event_types", &self.schemas.len())
            .finish()
    }
}
