//! Process-wide backend factory registry
//!
//! Backends register a factory under a name with a priority; engine
//! construction asks for the highest-priority backend that initializes
//! successfully. A failed factory is skipped with a warning, never retried
//! within the same call.

use super::Backend;
use crate::error::{CrucibleError, CrucibleResult};
use lazy_static::lazy_static;
use parking_lot::Mutex;

type BackendFactory = Box<dyn Fn() -> CrucibleResult<Box<dyn Backend>> + Send + Sync>;

struct RegistryEntry {
    name: String,
    priority: i32,
    factory: BackendFactory,
}

lazy_static! {
    static ref REGISTRY: Mutex<Vec<RegistryEntry>> = Mutex::new(Vec::new());
}

/// Register a backend factory. Returns false (and keeps the existing entry)
/// if the name is already taken.
pub fn register_backend<F>(name: &str, priority: i32, factory: F) -> bool
where
    F: Fn() -> CrucibleResult<Box<dyn Backend>> + Send + Sync + 'static,
{
    let mut registry = REGISTRY.lock();
    if registry.iter().any(|e| e.name == name) {
        tracing::warn!(backend = name, "backend was already registered, reusing existing factory");
        return false;
    }
    registry.push(RegistryEntry {
        name: name.to_string(),
        priority,
        factory: Box::new(factory),
    });
    true
}

/// Names of all registered backends, highest priority first.
pub fn registered_backends() -> Vec<String> {
    let mut registry: Vec<(String, i32)> = REGISTRY
        .lock()
        .iter()
        .map(|e| (e.name.clone(), e.priority))
        .collect();
    registry.sort_by_key(|(_, priority)| -priority);
    registry.into_iter().map(|(name, _)| name).collect()
}

/// Instantiate a backend by name.
pub fn create_backend(name: &str) -> CrucibleResult<Box<dyn Backend>> {
    let registry = REGISTRY.lock();
    let entry = registry.iter().find(|e| e.name == name).ok_or_else(|| {
        CrucibleError::BackendError(format!("backend '{}' not found in registry", name))
    })?;
    (entry.factory)()
}

/// Instantiate the highest-priority backend whose factory succeeds.
pub fn create_best_backend() -> CrucibleResult<Box<dyn Backend>> {
    let registry = REGISTRY.lock();
    if registry.is_empty() {
        return Err(CrucibleError::BackendError(
            "no backend found in registry".to_string(),
        ));
    }
    let mut sorted: Vec<&RegistryEntry> = registry.iter().collect();
    sorted.sort_by_key(|e| -e.priority);
    for entry in sorted {
        match (entry.factory)() {
            Ok(backend) => {
                tracing::debug!(backend = %entry.name, "selected backend");
                return Ok(backend);
            }
            Err(err) => {
                tracing::warn!(backend = %entry.name, error = %err, "backend initialization failed");
            }
        }
    }
    Err(CrucibleError::BackendError(
        "could not initialize any backend, all backend initializations failed".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    #[test]
    fn test_register_and_create() {
        register_backend("cpu-registry-test", 1, || Ok(Box::new(CpuBackend::new())));
        let backend = create_backend("cpu-registry-test").unwrap();
        assert_eq!(backend.name(), "cpu");
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        assert!(register_backend("cpu-dup-test", 1, || Ok(Box::new(CpuBackend::new()))));
        assert!(!register_backend("cpu-dup-test", 2, || Ok(Box::new(CpuBackend::new()))));
    }

    #[test]
    fn test_best_backend_skips_failing_factory() {
        register_backend("always-fails", 1000, || {
            Err(CrucibleError::BackendError("device unavailable".to_string()))
        });
        register_backend("cpu-fallback-test", -1000, || Ok(Box::new(CpuBackend::new())));
        // The failing high-priority factory is skipped in favor of a working one.
        let backend = create_best_backend().unwrap();
        assert!(!backend.name().is_empty());
    }

    #[test]
    fn test_unknown_backend_errors() {
        assert!(create_backend("no-such-backend").is_err());
    }
}
