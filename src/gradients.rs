//! Functional gradient helpers
//!
//! Convenience wrappers over [`Engine::gradients`] for the common
//! single-source and multi-source cases.

use crate::engine::{Engine, GradientResult};
use crate::error::{CrucibleError, CrucibleResult};
use crate::tensor::Tensor;

/// Gradient of `f` with respect to `x`. Fails if no gradient path exists.
pub fn grad<F>(engine: &Engine, x: &Tensor, f: F) -> CrucibleResult<Tensor>
where
    F: FnOnce(&Engine) -> CrucibleResult<Tensor>,
{
    let result = engine.gradients(f, std::slice::from_ref(x), None, false)?;
    result.grads.into_iter().next().flatten().ok_or_else(|| {
        CrucibleError::graph("grad", "no gradient flowed to the requested source")
    })
}

/// Like [`grad`], but also returns the value of `f`.
pub fn value_and_grad<F>(engine: &Engine, x: &Tensor, f: F) -> CrucibleResult<(Tensor, Tensor)>
where
    F: FnOnce(&Engine) -> CrucibleResult<Tensor>,
{
    let result = engine.gradients(f, std::slice::from_ref(x), None, false)?;
    let gradient = result.grads.into_iter().next().flatten().ok_or_else(|| {
        CrucibleError::graph("value_and_grad", "no gradient flowed to the requested source")
    })?;
    Ok((result.value, gradient))
}

/// Value of `f` plus the gradient with respect to each source, in order.
/// Sources with no gradient path come back as `None`.
pub fn value_and_grads<F>(
    engine: &Engine,
    sources: &[Tensor],
    f: F,
) -> CrucibleResult<GradientResult>
where
    F: FnOnce(&Engine) -> CrucibleResult<Tensor>,
{
    engine.gradients(f, sources, None, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::config::EngineConfig;
    use crate::ops;

    fn test_engine() -> Engine {
        Engine::new(Box::new(CpuBackend::new()), EngineConfig::default())
    }

    #[test]
    fn test_grad_of_square() {
        let engine = test_engine();
        let x = ops::scalar(&engine, 5.0).unwrap();
        let dx = grad(&engine, &x, |e| ops::square(e, &x)).unwrap();
        assert_eq!(engine.read_sync(&dx).unwrap(), vec![10.0]);
    }

    #[test]
    fn test_value_and_grad() {
        let engine = test_engine();
        let x = ops::scalar(&engine, 2.0).unwrap();
        let (value, dx) = value_and_grad(&engine, &x, |e| {
            let cubed = ops::mul(e, &x, &x)?;
            ops::mul(e, &cubed, &x)
        })
        .unwrap();
        assert_eq!(engine.read_sync(&value).unwrap(), vec![8.0]);
        assert_eq!(engine.read_sync(&dx).unwrap(), vec![12.0]);
    }

    #[test]
    fn test_value_and_grads_reports_missing_paths() {
        let engine = test_engine();
        let x = ops::scalar(&engine, 1.0).unwrap();
        let unused = ops::scalar(&engine, 2.0).unwrap();
        let result = value_and_grads(&engine, &[x.clone(), unused.clone()], |e| {
            ops::square(e, &x)
        })
        .unwrap();
        assert!(result.grads[0].is_some());
        assert!(result.grads[1].is_none());
    }
}
