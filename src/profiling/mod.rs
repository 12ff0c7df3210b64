//! Kernel profiling and debug instrumentation
//!
//! Two layers: per-kernel allocation profiles collected by
//! [`Engine::profile`](crate::engine::Engine::profile), and the debug-mode
//! [`Profiler`] that times every kernel and scans its outputs for non-finite
//! values. Debug mode forces a synchronous readback after each kernel, so it
//! is strictly for development.

use crate::engine::Engine;
use crate::error::CrucibleResult;
use crate::tensor::Tensor;
use serde::Serialize;
use std::time::Instant;

/// One kernel's entry in an allocation profile.
#[derive(Debug, Clone, Serialize)]
pub struct KernelProfile {
    pub name: String,
    /// Net bytes allocated by this kernel (negative when it freed more than
    /// it allocated).
    pub bytes_added: i64,
    pub total_bytes_snapshot: usize,
    pub tensors_added: i64,
    pub total_tensors_snapshot: usize,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shapes: Vec<Vec<usize>>,
}

/// Allocation profile of a query run under `Engine::profile`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileInfo {
    pub new_bytes: i64,
    pub new_tensors: i64,
    pub peak_bytes: usize,
    pub kernels: Vec<KernelProfile>,
}

impl ProfileInfo {
    pub fn to_json(&self) -> CrucibleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn first_non_finite(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite())
        .map(|(i, v)| (i, *v))
}

/// Debug-mode kernel instrumentation.
#[derive(Debug, Default)]
pub struct Profiler;

impl Profiler {
    pub fn new() -> Self {
        Self
    }

    /// Run a kernel's forward function, log its wall time, and warn on any
    /// NaN or infinity in its outputs.
    pub fn profile_kernel<F>(
        &self,
        name: &str,
        engine: &Engine,
        f: F,
    ) -> CrucibleResult<Vec<Tensor>>
    where
        F: FnOnce() -> CrucibleResult<Vec<Tensor>>,
    {
        let start = Instant::now();
        let outputs = f()?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
        for output in &outputs {
            let values = engine.read_sync(output)?;
            if let Some((index, value)) = first_non_finite(&values) {
                tracing::warn!(
                    kernel = name,
                    index,
                    value = value as f64,
                    "non-finite value in kernel output"
                );
            }
        }
        tracing::info!(
            kernel = name,
            ms = elapsed_ms,
            outputs = outputs.len(),
            "kernel profile"
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_non_finite() {
        assert_eq!(first_non_finite(&[1.0, 2.0, 3.0]), None);
        let (index, value) = first_non_finite(&[1.0, f32::NAN, 3.0]).unwrap();
        assert_eq!(index, 1);
        assert!(value.is_nan());
        let (index, value) = first_non_finite(&[f32::INFINITY]).unwrap();
        assert_eq!(index, 0);
        assert!(value.is_infinite());
    }

    #[test]
    fn test_profile_info_serializes() {
        let profile = ProfileInfo {
            new_bytes: 128,
            new_tensors: 2,
            peak_bytes: 256,
            kernels: vec![KernelProfile {
                name: "Add".to_string(),
                bytes_added: 64,
                total_bytes_snapshot: 256,
                tensors_added: 1,
                total_tensors_snapshot: 4,
                input_shapes: vec![vec![2], vec![2]],
                output_shapes: vec![vec![2]],
            }],
        };
        let json = profile.to_json().unwrap();
        assert!(json.contains("\"Add\""));
        assert!(json.contains("peak_bytes"));
    }
}
