//! Containers of tensors returned from scopes
//!
//! When a scope's function returns a nested structure, every tensor inside it
//! must be preserved at scope end, not just a top-level one. This trait walks
//! arbitrary nestings of tuples, vectors, options and maps.

use super::core::Tensor;
use std::collections::HashMap;

/// A value from which all contained tensor handles can be collected.
pub trait TensorContainer {
    fn collect_tensors(&self, out: &mut Vec<Tensor>);
}

/// Collect every tensor handle inside a container.
pub fn tensors_in_container<T: TensorContainer + ?Sized>(container: &T) -> Vec<Tensor> {
    let mut out = Vec::new();
    container.collect_tensors(&mut out);
    out
}

impl TensorContainer for Tensor {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        out.push(self.clone());
    }
}

impl TensorContainer for () {
    fn collect_tensors(&self, _out: &mut Vec<Tensor>) {}
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        if let Some(inner) = self {
            inner.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        for item in self {
            item.collect_tensors(out);
        }
    }
}

impl<T: TensorContainer> TensorContainer for HashMap<String, T> {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        for item in self.values() {
            item.collect_tensors(out);
        }
    }
}

impl<A: TensorContainer, B: TensorContainer> TensorContainer for (A, B) {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.0.collect_tensors(out);
        self.1.collect_tensors(out);
    }
}

impl<A: TensorContainer, B: TensorContainer, C: TensorContainer> TensorContainer for (A, B, C) {
    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        self.0.collect_tensors(out);
        self.1.collect_tensors(out);
        self.2.collect_tensors(out);
    }
}
