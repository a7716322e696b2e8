//! Immutable message envelope and the causality model built around it.
//!
//! Every published or persisted event travels inside an [`Envelope`]: a
//! frozen value carrying identity (`message_id`), chain membership
//! (`correlation_id`), ancestry (`causation_path`) and the opaque payload.
//! Envelopes are never mutated after construction; deriving a child message
//! produces a fresh value that shares the parent's correlation id and
//! extends its causation path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;
use crate::DEFAULT_SCHEMA_VERSION;

//─────────────────────────────
//  Causation path
//─────────────────────────────

/// One step of ancestry: the `(module, event_type)` pair of an ancestor.
///
/// Cycle detection compares these pairs by value equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausationStep {
    /// Module tag of the ancestor publisher.
    pub module: String,
    /// Event type the ancestor carried.
    pub event_type: String,
}

impl CausationStep {
    /// Build a step from a module and event-type pair.
    pub fn new(module: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            event_type: event_type.into(),
        }
    }
}

//─────────────────────────────
//  Envelope
//─────────────────────────────

/// Immutable message value wrapping a payload with identity and causality
/// metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-message unique id, freshly generated at construction.
    pub message_id: Uuid,
    /// Identifier shared by all envelopes of one causal chain.
    pub correlation_id: Uuid,
    /// Ordered ancestry of `(module, event_type)` pairs, oldest first.
    pub causation_path: Vec<CausationStep>,
    /// Event type tag. Required, non-empty.
    pub message_type: String,
    /// Module tag of the publishing component. Required, non-empty.
    pub module: String,
    /// Schema version the payload claims to conform to.
    pub schema_version: String,
    /// Opaque payload, validated against the registry before dispatch.
    pub payload: Value,
}

/// Options for building a root envelope.
#[derive(Debug, Clone, Default)]
pub struct RootOpts {
    /// Module tag of the publisher. Required.
    pub module: String,
    /// Correlation id to join an existing chain; a fresh id when `None`.
    pub correlation_id: Option<Uuid>,
    /// Schema version; defaults to [`DEFAULT_SCHEMA_VERSION`].
    pub schema_version: Option<String>,
}

/// Options for deriving a child envelope from a parent.
#[derive(Debug, Clone, Default)]
pub struct DeriveOpts {
    /// Module tag of the deriving publisher. Required.
    pub module: String,
    /// Schema version for the child; defaults to [`DEFAULT_SCHEMA_VERSION`].
    pub schema_version: Option<String>,
    /// Upper bound on the resulting causation-path length.
    pub max_depth: Option<usize>,
}

impl Envelope {
    /// Construct a root envelope with an empty causation path.
    ///
    /// A missing module tag fails fast with [`BusError::MissingModule`];
    /// the correlation id defaults to a fresh unique id.
    pub fn root(
        event_type: impl Into<String>,
        payload: Value,
        opts: RootOpts,
    ) -> Result<Self, BusError> {
        if opts.module.is_empty() {
            return Err(BusError::MissingModule);
        }
        Ok(Self {
            message_id: Uuid::new_v4(),
            correlation_id: opts.correlation_id.unwrap_or_else(Uuid::new_v4),
            causation_path: Vec::new(),
            message_type: event_type.into(),
            module: opts.module,
            schema_version: opts
                .schema_version
                .unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_string()),
            payload,
        })
    }

    /// Derive a child envelope from this one.
    ///
    /// The child shares the parent's `correlation_id` and its causation path
    /// is the parent's path extended with the parent's own
    /// `(module, message_type)` pair. Derivation fails with
    /// [`BusError::CycleDetected`] when the child's `(module, event_type)`
    /// pair already occurs in the extended path, and with
    /// [`BusError::MaxDepthExceeded`] when the extended path outgrows
    /// `opts.max_depth`. The cycle check runs before the depth check.
    pub fn derive(
        &self,
        event_type: impl Into<String>,
        payload: Value,
        opts: DeriveOpts,
    ) -> Result<Self, BusError> {
        let event_type = event_type.into();

        let mut new_path = self.causation_path.clone();
        new_path.push(CausationStep::new(&self.module, &self.message_type));

        let own_step = CausationStep::new(&opts.module, &event_type);
        if new_path.contains(&own_step) {
            return Err(BusError::CycleDetected {
                module: opts.module,
                event_type,
            });
        }
        if let Some(max_depth) = opts.max_depth {
            if new_path.len() > max_depth {
                return Err(BusError::MaxDepthExceeded {
                    depth: new_path.len(),
                    max_depth,
                });
            }
        }

        let mut child = Self::root(
            event_type,
            payload,
            RootOpts {
                module: opts.module,
                correlation_id: Some(self.correlation_id),
                schema_version: opts.schema_version,
            },
        )?;
        child.causation_path = new_path;
        Ok(child)
    }

    /// Length of the causation path, i.e. how many ancestors this message has.
    pub fn depth(&self) -> usize {
        self.causation_path.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root(module: &str, event_type: &str) -> Envelope {
        Envelope::root(
            event_type,
            json!({"n": 1}),
            RootOpts {
                module: module.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn root_defaults() {
        let env = root("m", "test.event");
        assert_eq!(env.message_type, "test.event");
        assert_eq!(env.module, "m");
        assert_eq!(env.schema_version, DEFAULT_SCHEMA_VERSION);
        assert!(env.causation_path.is_empty());
        assert_ne!(env.message_id, Uuid::nil());
    }

    #[test]
    fn root_requires_module() {
        let err = Envelope::root("test.event", json!(null), RootOpts::default()).unwrap_err();
        assert!(matches!(err, BusError::MissingModule));
    }

    #[test]
    fn root_honors_explicit_correlation() {
        let corr = Uuid::new_v4();
        let env = Envelope::root(
            "test.event",
            json!(null),
            RootOpts {
                module: "m".into(),
                correlation_id: Some(corr),
                schema_version: Some("2.0".into()),
            },
        )
        .unwrap();
        assert_eq!(env.correlation_id, corr);
        assert_eq!(env.schema_version, "2.0");
    }

    #[test]
    fn derive_extends_path_and_shares_correlation() {
        let parent = root("m", "a");
        let child = parent
            .derive(
                "b",
                json!({"n": 2}),
                DeriveOpts {
                    module: "m2".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.causation_path, vec![CausationStep::new("m", "a")]);
        assert_ne!(child.message_id, parent.message_id);
        // Parent is untouched.
        assert!(parent.causation_path.is_empty());
    }

    #[test]
    fn derive_detects_cycles() {
        let a = root("loop", "a");
        let b = a
            .derive("b", json!(null), DeriveOpts { module: "loop".into(), ..Default::default() })
            .unwrap();
        let err = b
            .derive("a", json!(null), DeriveOpts { module: "loop".into(), ..Default::default() })
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::CycleDetected { ref module, ref event_type }
                if module == "loop" && event_type == "a"
        ));
    }

    #[test]
    fn derive_enforces_max_depth() {
        let mut env = root("m", "e0");
        for i in 1..=3 {
            env = env
                .derive(
                    format!("e{i}"),
                    json!(null),
                    DeriveOpts {
                        module: "m".into(),
                        max_depth: Some(3),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        let err = env
            .derive(
                "e4",
                json!(null),
                DeriveOpts {
                    module: "m".into(),
                    max_depth: Some(3),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, BusError::MaxDepthExceeded { depth: 4, max_depth: 3 }));
    }

    #[test]
    fn cycle_check_runs_before_depth_check() {
        // A path already at the bound whose next step is also a repeat must
        // report the cycle, not the depth overflow.
        let a = root("m", "a");
        let b = a
            .derive("b", json!(null), DeriveOpts { module: "m".into(), ..Default::default() })
            .unwrap();
        let err = b
            .derive(
                "a",
                json!(null),
                DeriveOpts {
                    module: "m".into(),
                    max_depth: Some(1),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, BusError::CycleDetected { .. }));
    }

    #[test]
    fn envelope_serde_round_trip() {
        let env = root("m", "test.event");
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }
}
