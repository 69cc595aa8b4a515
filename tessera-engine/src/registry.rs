use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    error::{Error, ErrorType},
    methods::{LimitOverDuration, RestrictionMethod},
};

/// Name of the built-in windowed-limit method.
pub const LIMIT_OVER_DURATION: &str = "limitOverDuration";

/// Process-wide map from restriction method name to implementation.
///
/// Populated during initialization; lookups afterwards are read-only.
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<dyn RestrictionMethod>>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in methods already registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .methods
            .write()
            .insert(LIMIT_OVER_DURATION.to_string(), Arc::new(LimitOverDuration));
        registry
    }

    pub fn register(
        &self,
        method: &str,
        implementation: Arc<dyn RestrictionMethod>,
    ) -> Result<(), Error> {
        let mut methods = self.methods.write();
        if methods.contains_key(method) {
            return Err(ErrorType::DuplicateMethod {
                method: method.to_string(),
            }
            .into());
        }
        methods.insert(method.to_string(), implementation);
        Ok(())
    }

    pub fn get(&self, method: &str) -> Result<Arc<dyn RestrictionMethod>, Error> {
        self.methods.read().get(method).cloned().ok_or_else(|| {
            ErrorType::MethodNotRegistered {
                method: method.to_string(),
            }
            .into()
        })
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = MethodRegistry::with_builtins();
        assert!(registry.get(LIMIT_OVER_DURATION).is_ok());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = MethodRegistry::with_builtins();
        let err = registry
            .register(LIMIT_OVER_DURATION, Arc::new(LimitOverDuration))
            .unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::DuplicateMethod { .. }
        ));
    }

    #[test]
    fn missing_method_lookup_fails() {
        let registry = MethodRegistry::new();
        let err = registry.get("unknown").unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::MethodNotRegistered { .. }
        ));
    }
}
