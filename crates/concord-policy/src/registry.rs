use concord_core::PolicyIdentifier;
use std::collections::HashMap;

use crate::catalog;
use crate::error::{PolicyError, PolicyResult};
use crate::types::PolicyDefinition;

/// Collects policy definitions at startup. Frozen into a
/// [`MechanismRegistry`] by [`build`](Self::build).
#[derive(Debug, Default)]
pub struct MechanismRegistryBuilder {
    definitions: HashMap<PolicyIdentifier, PolicyDefinition>,
}

impl MechanismRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with the built-in device policy catalog.
    pub fn with_builtin_catalog() -> Self {
        let mut builder = Self::new();
        for definition in catalog::builtin_definitions() {
            builder
                .definitions
                .insert(definition.identifier.clone(), definition);
        }
        builder
    }

    /// Register a new policy type. Duplicate identifiers are rejected.
    pub fn register(&mut self, definition: PolicyDefinition) -> PolicyResult<&mut Self> {
        if self.definitions.contains_key(&definition.identifier) {
            return Err(PolicyError::InvalidRegistration(format!(
                "policy type '{}' is already registered",
                definition.identifier
            )));
        }
        self.insert_validated(definition)
    }

    /// Register a policy type, replacing any existing definition for it.
    pub fn register_or_replace(
        &mut self,
        definition: PolicyDefinition,
    ) -> PolicyResult<&mut Self> {
        self.insert_validated(definition)
    }

    fn insert_validated(&mut self, definition: PolicyDefinition) -> PolicyResult<&mut Self> {
        if definition.identifier.as_str().trim().is_empty() {
            return Err(PolicyError::InvalidRegistration(
                "policy identifier must not be empty".into(),
            ));
        }
        definition.mechanism.validate().map_err(|e| {
            PolicyError::InvalidRegistration(format!("{}: {}", definition.identifier, e))
        })?;
        tracing::debug!(
            identifier = %definition.identifier,
            mechanism = %definition.mechanism,
            "registered policy type"
        );
        self.definitions
            .insert(definition.identifier.clone(), definition);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn build(self) -> MechanismRegistry {
        MechanismRegistry {
            definitions: self.definitions,
        }
    }
}

/// Immutable mapping from policy type to its definition.
///
/// There is no way to add or change a definition once built; share it
/// behind an `Arc`.
#[derive(Debug, Clone)]
pub struct MechanismRegistry {
    definitions: HashMap<PolicyIdentifier, PolicyDefinition>,
}

impl MechanismRegistry {
    pub fn lookup(&self, identifier: &PolicyIdentifier) -> Option<&PolicyDefinition> {
        self.definitions.get(identifier)
    }

    pub fn contains(&self, identifier: &PolicyIdentifier) -> bool {
        self.definitions.contains_key(identifier)
    }

    /// All definitions, sorted by identifier.
    pub fn definitions(&self) -> Vec<&PolicyDefinition> {
        let mut all: Vec<&PolicyDefinition> = self.definitions.values().collect();
        all.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        all
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
