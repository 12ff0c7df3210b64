//! Pluggable compute backends
//!
//! The engine never touches memory directly; it forwards all numeric work and
//! data transfer through the [`Backend`] trait. A backend owns the physical
//! storage behind every [`DataId`] registered with it and implements a fixed
//! catalogue of kernels that the engine dispatches by name and shape, never
//! inspecting numeric results itself.

pub mod cpu;
pub mod registry;

pub use cpu::CpuBackend;
pub use registry::{create_backend, create_best_backend, register_backend, registered_backends};

use crate::error::CrucibleResult;
use crate::tensor::{DType, DataId};
use async_trait::async_trait;
use serde::Serialize;

/// Elementwise kernels over one operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKernel {
    Neg,
    Square,
    Exp,
    Sqrt,
}

impl UnaryKernel {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryKernel::Neg => "Neg",
            UnaryKernel::Square => "Square",
            UnaryKernel::Exp => "Exp",
            UnaryKernel::Sqrt => "Sqrt",
        }
    }
}

/// Elementwise kernels over two operands.
///
/// Operand shapes must match exactly, or either operand may be a single
/// element, which is broadcast against the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKernel {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryKernel {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryKernel::Add => "Add",
            BinaryKernel::Sub => "Sub",
            BinaryKernel::Mul => "Mul",
            BinaryKernel::Div => "Div",
        }
    }
}

/// Dimensions for a 2-d matrix product: `[m, k] x [k, n] -> [m, n]`
#[derive(Debug, Clone, Copy)]
pub struct MatmulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

/// Timing report from a backend's own clock
#[derive(Debug, Clone, Serialize)]
pub struct BackendTiming {
    pub kernel_ms: f64,
    /// Additional backend-specific timing detail (e.g. transfer overhead)
    pub extra: Option<String>,
}

/// Best-effort memory usage report.
///
/// Some backends cannot report exact live usage; they set `unreliable` and
/// explain why in `reasons`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendMemory {
    pub unreliable: bool,
    pub reasons: Vec<String>,
}

/// Capability contract any compute backend must implement.
///
/// Bookkeeping calls (`register`, `write`, `dispose_data`) are synchronous;
/// only final numeric readback and timing may be asynchronous.
#[async_trait(?Send)]
pub trait Backend {
    fn name(&self) -> &str;

    /// Acknowledge a new logical buffer and allocate storage for it.
    fn register(&self, id: DataId, shape: &[usize], dtype: DType) -> CrucibleResult<()>;

    /// Upload values into a registered buffer.
    fn write(&self, id: DataId, values: &[f32]) -> CrucibleResult<()>;

    /// Synchronous readback.
    fn read_sync(&self, id: DataId) -> CrucibleResult<Vec<f32>>;

    /// Asynchronous readback; the only suspension point besides `time`.
    async fn read(&self, id: DataId) -> CrucibleResult<Vec<f32>>;

    /// Release physical storage. Idempotent: unknown ids are a no-op.
    fn dispose_data(&self, id: DataId) -> CrucibleResult<()>;

    /// Measure execution time of a unit of work on the backend's clock.
    async fn time(
        &self,
        f: &mut (dyn FnMut() -> CrucibleResult<()> + '_),
    ) -> CrucibleResult<BackendTiming>;

    /// Best-effort usage report.
    fn memory(&self) -> BackendMemory;

    // The kernel catalogue. Output buffers are registered by the engine
    // before dispatch; kernels only fill them.

    fn fill(&self, out: DataId, value: f32) -> CrucibleResult<()>;

    fn unary(&self, kernel: UnaryKernel, x: DataId, out: DataId) -> CrucibleResult<()>;

    fn binary(&self, kernel: BinaryKernel, a: DataId, b: DataId, out: DataId)
        -> CrucibleResult<()>;

    /// Full reduction to a single element.
    fn sum(&self, x: DataId, out: DataId) -> CrucibleResult<()>;

    fn matmul(&self, a: DataId, b: DataId, out: DataId, dims: MatmulDims) -> CrucibleResult<()>;

    fn transpose(&self, x: DataId, out: DataId, rows: usize, cols: usize) -> CrucibleResult<()>;
}
