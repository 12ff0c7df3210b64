//! Reference CPU backend
//!
//! Stores every buffer as a plain `Vec<f32>` behind a read-write lock. Exact
//! byte accounting is possible here, so `memory()` reports reliable usage.

use super::{Backend, BackendMemory, BackendTiming, BinaryKernel, MatmulDims, UnaryKernel};
use crate::error::{CrucibleError, CrucibleResult};
use crate::tensor::{size_from_shape, DType, DataId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

struct Buffer {
    values: Vec<f32>,
    #[allow(dead_code)]
    shape: Vec<usize>,
    #[allow(dead_code)]
    dtype: DType,
}

/// CPU backend backed by heap-allocated buffers
pub struct CpuBackend {
    buffers: RwLock<HashMap<DataId, Buffer>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, id: DataId) -> CrucibleResult<Vec<f32>> {
        let buffers = self.buffers.read();
        buffers
            .get(&id)
            .map(|b| b.values.clone())
            .ok_or_else(|| CrucibleError::backend("cpu", &format!("{} is not registered", id)))
    }

    fn put(&self, id: DataId, values: Vec<f32>) -> CrucibleResult<()> {
        let mut buffers = self.buffers.write();
        let buffer = buffers
            .get_mut(&id)
            .ok_or_else(|| CrucibleError::backend("cpu", &format!("{} is not registered", id)))?;
        if buffer.values.len() != values.len() {
            return Err(CrucibleError::shape(
                "cpu write",
                &format!("{} elements", buffer.values.len()),
                &format!("{} elements", values.len()),
            ));
        }
        buffer.values = values;
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn register(&self, id: DataId, shape: &[usize], dtype: DType) -> CrucibleResult<()> {
        let mut buffers = self.buffers.write();
        if buffers.contains_key(&id) {
            return Err(CrucibleError::backend(
                "cpu",
                &format!("{} is already registered", id),
            ));
        }
        buffers.insert(
            id,
            Buffer {
                values: vec![0.0; size_from_shape(shape)],
                shape: shape.to_vec(),
                dtype,
            },
        );
        Ok(())
    }

    fn write(&self, id: DataId, values: &[f32]) -> CrucibleResult<()> {
        self.put(id, values.to_vec())
    }

    fn read_sync(&self, id: DataId) -> CrucibleResult<Vec<f32>> {
        self.get(id)
    }

    async fn read(&self, id: DataId) -> CrucibleResult<Vec<f32>> {
        self.read_sync(id)
    }

    fn dispose_data(&self, id: DataId) -> CrucibleResult<()> {
        self.buffers.write().remove(&id);
        Ok(())
    }

    async fn time(
        &self,
        f: &mut (dyn FnMut() -> CrucibleResult<()> + '_),
    ) -> CrucibleResult<BackendTiming> {
        let start = Instant::now();
        f()?;
        Ok(BackendTiming {
            kernel_ms: start.elapsed().as_secs_f64() * 1e3,
            extra: None,
        })
    }

    fn memory(&self) -> BackendMemory {
        BackendMemory {
            unreliable: false,
            reasons: Vec::new(),
        }
    }

    fn fill(&self, out: DataId, value: f32) -> CrucibleResult<()> {
        let len = self.get(out)?.len();
        self.put(out, vec![value; len])
    }

    fn unary(&self, kernel: UnaryKernel, x: DataId, out: DataId) -> CrucibleResult<()> {
        let input = self.get(x)?;
        let result: Vec<f32> = match kernel {
            UnaryKernel::Neg => input.iter().map(|v| -v).collect(),
            UnaryKernel::Square => input.iter().map(|v| v * v).collect(),
            UnaryKernel::Exp => input.iter().map(|v| v.exp()).collect(),
            UnaryKernel::Sqrt => input.iter().map(|v| v.sqrt()).collect(),
        };
        self.put(out, result)
    }

    fn binary(
        &self,
        kernel: BinaryKernel,
        a: DataId,
        b: DataId,
        out: DataId,
    ) -> CrucibleResult<()> {
        let lhs = self.get(a)?;
        let rhs = self.get(b)?;
        let apply = |x: f32, y: f32| match kernel {
            BinaryKernel::Add => x + y,
            BinaryKernel::Sub => x - y,
            BinaryKernel::Mul => x * y,
            BinaryKernel::Div => x / y,
        };
        let result: Vec<f32> = if lhs.len() == rhs.len() {
            lhs.iter().zip(rhs.iter()).map(|(&x, &y)| apply(x, y)).collect()
        } else if lhs.len() == 1 {
            rhs.iter().map(|&y| apply(lhs[0], y)).collect()
        } else if rhs.len() == 1 {
            lhs.iter().map(|&x| apply(x, rhs[0])).collect()
        } else {
            return Err(CrucibleError::shape(
                kernel.name(),
                "matching element counts or a scalar operand",
                &format!("{} and {} elements", lhs.len(), rhs.len()),
            ));
        };
        self.put(out, result)
    }

    fn sum(&self, x: DataId, out: DataId) -> CrucibleResult<()> {
        let input = self.get(x)?;
        self.put(out, vec![input.iter().sum()])
    }

    fn matmul(&self, a: DataId, b: DataId, out: DataId, dims: MatmulDims) -> CrucibleResult<()> {
        let lhs = self.get(a)?;
        let rhs = self.get(b)?;
        let MatmulDims { m, k, n } = dims;
        if lhs.len() != m * k || rhs.len() != k * n {
            return Err(CrucibleError::shape(
                "Matmul",
                &format!("{}x{} and {}x{} operands", m, k, k, n),
                &format!("{} and {} elements", lhs.len(), rhs.len()),
            ));
        }
        let mut result = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += lhs[i * k + p] * rhs[p * n + j];
                }
                result[i * n + j] = acc;
            }
        }
        self.put(out, result)
    }

    fn transpose(&self, x: DataId, out: DataId, rows: usize, cols: usize) -> CrucibleResult<()> {
        let input = self.get(x)?;
        if input.len() != rows * cols {
            return Err(CrucibleError::shape(
                "Transpose",
                &format!("{}x{} operand", rows, cols),
                &format!("{} elements", input.len()),
            ));
        }
        let mut result = vec![0.0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = input[i * cols + j];
            }
        }
        self.put(out, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_write_read() {
        let backend = CpuBackend::new();
        let id = DataId(0);
        backend.register(id, &[2, 2], DType::F32).unwrap();
        backend.write(id, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(backend.read_sync(id).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_double_register_fails() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[1], DType::F32).unwrap();
        assert!(backend.register(DataId(0), &[1], DType::F32).is_err());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let backend = CpuBackend::new();
        backend.register(DataId(3), &[4], DType::F32).unwrap();
        backend.dispose_data(DataId(3)).unwrap();
        backend.dispose_data(DataId(3)).unwrap();
        assert!(backend.read_sync(DataId(3)).is_err());
    }

    #[test]
    fn test_binary_broadcast_scalar() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[3], DType::F32).unwrap();
        backend.register(DataId(1), &[], DType::F32).unwrap();
        backend.register(DataId(2), &[3], DType::F32).unwrap();
        backend.write(DataId(0), &[1.0, 2.0, 3.0]).unwrap();
        backend.write(DataId(1), &[10.0]).unwrap();
        backend
            .binary(BinaryKernel::Mul, DataId(0), DataId(1), DataId(2))
            .unwrap();
        assert_eq!(backend.read_sync(DataId(2)).unwrap(), vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_binary_shape_mismatch() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[3], DType::F32).unwrap();
        backend.register(DataId(1), &[2], DType::F32).unwrap();
        backend.register(DataId(2), &[3], DType::F32).unwrap();
        let err = backend
            .binary(BinaryKernel::Add, DataId(0), DataId(1), DataId(2))
            .unwrap_err();
        assert!(matches!(err, CrucibleError::ShapeError(_)));
    }

    #[test]
    fn test_matmul() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[2, 2], DType::F32).unwrap();
        backend.register(DataId(1), &[2, 2], DType::F32).unwrap();
        backend.register(DataId(2), &[2, 2], DType::F32).unwrap();
        backend.write(DataId(0), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        backend.write(DataId(1), &[5.0, 6.0, 7.0, 8.0]).unwrap();
        backend
            .matmul(DataId(0), DataId(1), DataId(2), MatmulDims { m: 2, k: 2, n: 2 })
            .unwrap();
        assert_eq!(
            backend.read_sync(DataId(2)).unwrap(),
            vec![19.0, 22.0, 43.0, 50.0]
        );
    }

    #[test]
    fn test_transpose() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[2, 3], DType::F32).unwrap();
        backend.register(DataId(1), &[3, 2], DType::F32).unwrap();
        backend
            .write(DataId(0), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        backend.transpose(DataId(0), DataId(1), 2, 3).unwrap();
        assert_eq!(
            backend.read_sync(DataId(1)).unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn test_sum() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[4], DType::F32).unwrap();
        backend.register(DataId(1), &[], DType::F32).unwrap();
        backend.write(DataId(0), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        backend.sum(DataId(0), DataId(1)).unwrap();
        assert_eq!(backend.read_sync(DataId(1)).unwrap(), vec![10.0]);
    }

    #[test]
    fn test_async_read_matches_sync() {
        let backend = CpuBackend::new();
        backend.register(DataId(0), &[2], DType::F32).unwrap();
        backend.write(DataId(0), &[1.5, 2.5]).unwrap();
        let values = pollster::block_on(backend.read(DataId(0))).unwrap();
        assert_eq!(values, vec![1.5, 2.5]);
    }

    #[test]
    fn test_time_reports_duration() {
        let backend = CpuBackend::new();
        let timing =
            pollster::block_on(backend.time(&mut || Ok(()))).unwrap();
        assert!(timing.kernel_ms >= 0.0);
    }
}
