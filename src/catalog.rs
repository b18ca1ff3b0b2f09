//! Catalog: relation schemes by name
//!
//! The compiler only ever pulls schemes out of a catalog to type-check
//! scans. [`RelationCatalog`] is the seam an execution-engine connection
//! would implement; [`Catalog`] is the in-memory version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::scheme::Scheme;

/// Pull-based lookup of relation schemes
pub trait RelationCatalog {
    fn scheme(&self, relation: &str) -> Option<Scheme>;
}

/// Catalog held in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    schemes: BTreeMap<String, Scheme>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Register (or replace) a relation's scheme
    pub fn register_relation(&mut self, relation: impl Into<String>, scheme: Scheme) {
        self.schemes.insert(relation.into(), scheme);
    }

    pub fn has_relation(&self, relation: &str) -> bool {
        self.schemes.contains_key(relation)
    }

    /// Registered relation names, sorted
    pub fn all_relations(&self) -> Vec<String> {
        self.schemes.keys().cloned().collect()
    }
}

impl RelationCatalog for Catalog {
    fn scheme(&self, relation: &str) -> Option<Scheme> {
        self.schemes.get(relation).cloned()
    }
}
