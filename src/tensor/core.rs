//! Core tensor handle types
//!
//! A [`Tensor`] is a lightweight handle: shape, element type and an opaque
//! [`DataId`] naming a backend-owned memory region. Handles carry no data and
//! no destructor; their lifetime is managed by the engine's scope stack.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a backend-owned memory region.
///
/// Unique per logical allocation and never reused while referenced. Multiple
/// tensor handles may share one `DataId` (aliasing, reshape-without-copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataId(pub u64);

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data#{}", self.0)
    }
}

/// Unique identifier for a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// Element types understood by the engine.
///
/// All buffer traffic through the backend interface uses `f32` values; the
/// dtype is metadata for byte accounting and the float-only
/// differentiability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
    Bool,
}

impl DType {
    /// Size in bytes of one element of this type
    pub const fn byte_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
            DType::Bool => 1,
        }
    }

    /// Whether gradients may flow through tensors of this type
    pub const fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::Bool => "bool",
        };
        write!(f, "{}", name)
    }
}

/// Number of elements described by a shape. The empty shape is a scalar.
pub fn size_from_shape(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Lightweight tensor handle.
///
/// Cloning a handle does NOT touch the engine's reference counts; it only
/// copies the descriptor. New handles against the same buffer are created
/// through the engine (`alias`, `make_variable`), which does the accounting.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub data_id: DataId,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl Tensor {
    /// Number of elements
    pub fn size(&self) -> usize {
        size_from_shape(&self.shape)
    }

    /// Number of dimensions; scalars have rank 0
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Bytes occupied by the underlying buffer
    pub fn bytes(&self) -> usize {
        self.size() * self.dtype.byte_size()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, {:?}, {})", self.id, self.shape, self.dtype)
    }
}
