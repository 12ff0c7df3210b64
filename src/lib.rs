//! Crucible: a backend-agnostic tensor execution runtime
//!
//! Crucible coordinates tensor computation for higher-level numeric code:
//! it owns tensor lifecycle (reference-counted buffers, scope-based
//! auto-disposal), records an operation tape for reverse-mode
//! differentiation, and dispatches all numeric work through pluggable
//! compute backends.
//!
//! ```no_run
//! use crucible::{ops, CpuBackend, Engine, EngineConfig};
//!
//! let engine = Engine::new(Box::new(CpuBackend::new()), EngineConfig::default());
//! let x = ops::scalar(&engine, 3.0).unwrap();
//! let dx = crucible::gradients::grad(&engine, &x, |e| ops::square(e, &x)).unwrap();
//! assert_eq!(engine.read_sync(&dx).unwrap(), vec![6.0]);
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod gradients;
pub mod ops;
pub mod profiling;
pub mod tape;
pub mod tensor;

pub use backend::{Backend, CpuBackend};
pub use config::EngineConfig;
pub use engine::{CustomGradient, Engine, GradientResult, MemoryInfo, TimingInfo};
pub use error::{CrucibleError, CrucibleResult};
pub use tensor::{DType, DataId, Tensor, TensorContainer, TensorId};

/// Initialize logging and register the built-in backends. Safe to call more
/// than once; later calls are no-ops.
pub fn init() -> CrucibleResult<()> {
    let _ = tracing_subscriber::fmt::try_init();
    backend::register_backend("cpu", 1, || {
        Ok(Box::new(CpuBackend::new()) as Box<dyn Backend>)
    });
    tracing::info!(version = version(), "crucible runtime initialized");
    Ok(())
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
