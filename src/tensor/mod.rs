//! Tensor handles and result containers

pub mod container;
pub mod core;

pub use container::{tensors_in_container, TensorContainer};
pub use core::{size_from_shape, DType, DataId, Tensor, TensorId};
