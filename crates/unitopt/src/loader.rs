//! What the host loader hands to `transform` besides the bytes.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

/// Facts about other units that passes may rely on.
///
/// Every fact a pass uses is recorded as a dependency, so a unit optimized
/// with a fact about `Owner` is invalidated when `Owner` changes.
pub trait FactProvider: Send + Sync {
    /// `owner` has no subtypes, so virtual calls on it have one target.
    fn is_sealed(&self, owner: &str) -> bool;

    /// `owner::method` takes no arguments and always returns this constant.
    fn constant_result(&self, owner: &str, method: &str) -> Option<i64>;
}

/// Opaque per-call context from the loader.
#[derive(Clone, Default)]
pub struct LoaderContext {
    facts: Option<Arc<dyn FactProvider>>,
}

impl LoaderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_facts(facts: Arc<dyn FactProvider>) -> Self {
        Self { facts: Some(facts) }
    }

    pub fn facts(&self) -> Option<&dyn FactProvider> {
        self.facts.as_deref()
    }
}

impl fmt::Debug for LoaderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderContext")
            .field("facts", &self.facts.is_some())
            .finish()
    }
}

/// In-memory [`FactProvider`] built up front, used by the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFacts {
    sealed: FxHashSet<String>,
    constants: FxHashMap<(String, String), i64>,
}

impl StaticFacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seal(mut self, owner: &str) -> Self {
        self.sealed.insert(owner.to_string());
        self
    }

    pub fn constant(mut self, owner: &str, method: &str, value: i64) -> Self {
        self.constants
            .insert((owner.to_string(), method.to_string()), value);
        self
    }
}

impl FactProvider for StaticFacts {
    fn is_sealed(&self, owner: &str) -> bool {
        self.sealed.contains(owner)
    }

    fn constant_result(&self, owner: &str, method: &str) -> Option<i64> {
        self.constants
            .get(&(owner.to_string(), method.to_string()))
            .copied()
    }
}

/// Split a pool method reference `Owner::method`.
pub fn split_method_ref(reference: &str) -> Option<(&str, &str)> {
    let (owner, method) = reference.rsplit_once("::")?;
    (!owner.is_empty() && !method.is_empty()).then_some((owner, method))
}
