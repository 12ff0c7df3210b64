//! Operation layer
//!
//! Thin functions over [`Engine::run_kernel`]: each op validates shapes,
//! dispatches a backend kernel into a freshly allocated output, and supplies
//! the backward closure that the tape replays during gradient computation.
//!
//! Binary ops accept operands of identical shape, or one single-element
//! operand broadcast against the other. Backward closures undo that
//! broadcast by reducing the incoming gradient back to the operand's shape,
//! so every gradient always matches its input exactly.

use crate::backend::{BinaryKernel, MatmulDims, UnaryKernel};
use crate::engine::Engine;
use crate::error::{CrucibleError, CrucibleResult};
use crate::tape::{GradThunk, GradientFn, InputGradientMap};
use crate::tensor::{size_from_shape, DType, Tensor};
use rand::Rng;
use std::collections::BTreeMap;
use std::rc::Rc;

fn single(op: &str, outputs: Vec<Tensor>) -> CrucibleResult<Tensor> {
    outputs.into_iter().next().ok_or_else(|| {
        CrucibleError::InternalError(format!("kernel '{}' produced no output", op))
    })
}

// Creation ops. These allocate and fill; nothing to differentiate, so they
// never touch the tape.

pub fn tensor(engine: &Engine, values: &[f32], shape: &[usize]) -> CrucibleResult<Tensor> {
    engine.make_tensor(values.to_vec(), shape.to_vec(), DType::F32)
}

/// Rank-0 tensor holding a single value.
pub fn scalar(engine: &Engine, value: f32) -> CrucibleResult<Tensor> {
    tensor(engine, &[value], &[])
}

pub fn fill(engine: &Engine, shape: &[usize], value: f32) -> CrucibleResult<Tensor> {
    let out = engine.alloc_tensor(shape.to_vec(), DType::F32)?;
    engine.backend().fill(out.data_id, value)?;
    Ok(out)
}

pub fn ones(engine: &Engine, shape: &[usize]) -> CrucibleResult<Tensor> {
    fill(engine, shape, 1.0)
}

pub fn zeros(engine: &Engine, shape: &[usize]) -> CrucibleResult<Tensor> {
    fill(engine, shape, 0.0)
}

/// Uniform samples from `[lo, hi)`.
pub fn random_uniform(
    engine: &Engine,
    shape: &[usize],
    lo: f32,
    hi: f32,
) -> CrucibleResult<Tensor> {
    if !(lo < hi) {
        return Err(CrucibleError::usage(
            "random_uniform",
            &format!("empty range [{}, {})", lo, hi),
        ));
    }
    let mut rng = rand::thread_rng();
    let values: Vec<f32> = (0..size_from_shape(shape))
        .map(|_| rng.gen_range(lo..hi))
        .collect();
    engine.make_tensor(values, shape.to_vec(), DType::F32)
}

// Structural ops

/// New handle over the same buffer. Gradient is the identity.
pub fn identity(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let backward: Rc<GradientFn> = Rc::new(|_, dy, _| {
        let dy = dy.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| identity(e, &dy)) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        "Identity",
        inputs,
        move |engine, _save| Ok(vec![engine.alias(&x_fwd)?]),
        Some(backward),
    )?;
    single("Identity", outputs)
}

/// View of the same buffer under a different shape. Element counts must
/// match; no data moves.
pub fn reshape(engine: &Engine, x: &Tensor, shape: &[usize]) -> CrucibleResult<Tensor> {
    if size_from_shape(shape) != x.size() {
        return Err(CrucibleError::shape(
            "Reshape",
            &format!("{} elements", x.size()),
            &format!("{:?} ({} elements)", shape, size_from_shape(shape)),
        ));
    }
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let original_shape = x.shape.clone();
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let dy = dy.clone();
        let original = original_shape.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| reshape(e, &dy, &original)) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let new_shape = shape.to_vec();
    let outputs = engine.run_kernel(
        "Reshape",
        inputs,
        move |engine, _save| Ok(vec![engine.alias_as(&x_fwd, new_shape)?]),
        Some(backward),
    )?;
    single("Reshape", outputs)
}

// Elementwise binary ops

fn broadcast_shape(op: &str, a: &Tensor, b: &Tensor) -> CrucibleResult<Vec<usize>> {
    if a.shape == b.shape {
        Ok(a.shape.clone())
    } else if a.size() == 1 {
        Ok(b.shape.clone())
    } else if b.size() == 1 {
        Ok(a.shape.clone())
    } else {
        Err(CrucibleError::shape(
            op,
            "matching shapes or a single-element operand",
            &format!("{:?} and {:?}", a.shape, b.shape),
        ))
    }
}

/// Reduce a gradient produced at the broadcast shape back to an operand's
/// own shape. Only whole-tensor reduction onto a single-element operand can
/// occur under the supported broadcast rule.
fn reduce_to_shape(engine: &Engine, grad: &Tensor, shape: &[usize]) -> CrucibleResult<Tensor> {
    if grad.shape == shape {
        return identity(engine, grad);
    }
    if size_from_shape(shape) == 1 {
        let total = sum(engine, grad)?;
        if shape.is_empty() {
            return Ok(total);
        }
        return reshape(engine, &total, shape);
    }
    Err(CrucibleError::shape(
        "gradient reduction",
        &format!("{:?}", shape),
        &format!("{:?}", grad.shape),
    ))
}

fn run_binary(
    engine: &Engine,
    name: &str,
    kernel: BinaryKernel,
    a: &Tensor,
    b: &Tensor,
    backward: Option<Rc<GradientFn>>,
) -> CrucibleResult<Tensor> {
    let out_shape = broadcast_shape(name, a, b)?;
    let inputs: BTreeMap<String, Tensor> =
        [("a".to_string(), a.clone()), ("b".to_string(), b.clone())]
            .into_iter()
            .collect();
    let (a_fwd, b_fwd) = (a.clone(), b.clone());
    let outputs = engine.run_kernel(
        name,
        inputs,
        move |engine, _save| {
            let out = engine.alloc_tensor(out_shape, DType::F32)?;
            engine
                .backend()
                .binary(kernel, a_fwd.data_id, b_fwd.data_id, out.data_id)?;
            Ok(vec![out])
        },
        backward,
    )?;
    single(name, outputs)
}

pub fn add(engine: &Engine, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    let (a_shape, b_shape) = (a.shape.clone(), b.shape.clone());
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let mut map = InputGradientMap::new();
        {
            let dy = dy.clone();
            let shape = a_shape.clone();
            map.insert(
                "a".to_string(),
                Box::new(move |e: &Engine| reduce_to_shape(e, &dy, &shape)) as GradThunk,
            );
        }
        {
            let dy = dy.clone();
            let shape = b_shape.clone();
            map.insert(
                "b".to_string(),
                Box::new(move |e: &Engine| reduce_to_shape(e, &dy, &shape)) as GradThunk,
            );
        }
        Ok(map)
    });
    run_binary(engine, "Add", BinaryKernel::Add, a, b, Some(backward))
}

pub fn sub(engine: &Engine, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    let (a_shape, b_shape) = (a.shape.clone(), b.shape.clone());
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let mut map = InputGradientMap::new();
        {
            let dy = dy.clone();
            let shape = a_shape.clone();
            map.insert(
                "a".to_string(),
                Box::new(move |e: &Engine| reduce_to_shape(e, &dy, &shape)) as GradThunk,
            );
        }
        {
            let dy = dy.clone();
            let shape = b_shape.clone();
            map.insert(
                "b".to_string(),
                Box::new(move |e: &Engine| {
                    let negated = neg(e, &dy)?;
                    reduce_to_shape(e, &negated, &shape)
                }) as GradThunk,
            );
        }
        Ok(map)
    });
    run_binary(engine, "Sub", BinaryKernel::Sub, a, b, Some(backward))
}

pub fn mul(engine: &Engine, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    let (a_op, b_op) = (a.clone(), b.clone());
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let mut map = InputGradientMap::new();
        {
            let dy = dy.clone();
            let other = b_op.clone();
            let shape = a_op.shape.clone();
            map.insert(
                "a".to_string(),
                Box::new(move |e: &Engine| {
                    let grad = mul(e, &dy, &other)?;
                    reduce_to_shape(e, &grad, &shape)
                }) as GradThunk,
            );
        }
        {
            let dy = dy.clone();
            let other = a_op.clone();
            let shape = b_op.shape.clone();
            map.insert(
                "b".to_string(),
                Box::new(move |e: &Engine| {
                    let grad = mul(e, &dy, &other)?;
                    reduce_to_shape(e, &grad, &shape)
                }) as GradThunk,
            );
        }
        Ok(map)
    });
    run_binary(engine, "Mul", BinaryKernel::Mul, a, b, Some(backward))
}

pub fn div(engine: &Engine, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    let (a_op, b_op) = (a.clone(), b.clone());
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let mut map = InputGradientMap::new();
        {
            let dy = dy.clone();
            let denom = b_op.clone();
            let shape = a_op.shape.clone();
            map.insert(
                "a".to_string(),
                Box::new(move |e: &Engine| {
                    let grad = div(e, &dy, &denom)?;
                    reduce_to_shape(e, &grad, &shape)
                }) as GradThunk,
            );
        }
        {
            let dy = dy.clone();
            let numer = a_op.clone();
            let denom = b_op.clone();
            let shape = b_op.shape.clone();
            map.insert(
                "b".to_string(),
                Box::new(move |e: &Engine| {
                    // d(a/b)/db = -a / b^2
                    let scaled = mul(e, &dy, &numer)?;
                    let denom_sq = mul(e, &denom, &denom)?;
                    let quotient = div(e, &scaled, &denom_sq)?;
                    let negated = neg(e, &quotient)?;
                    reduce_to_shape(e, &negated, &shape)
                }) as GradThunk,
            );
        }
        Ok(map)
    });
    run_binary(engine, "Div", BinaryKernel::Div, a, b, Some(backward))
}

// Elementwise unary ops

fn run_unary(
    engine: &Engine,
    kernel: UnaryKernel,
    x: &Tensor,
    backward: Option<Rc<GradientFn>>,
) -> CrucibleResult<Tensor> {
    let name = kernel.name();
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        name,
        inputs,
        move |engine, _save| {
            let out = engine.alloc_tensor(x_fwd.shape.clone(), DType::F32)?;
            engine
                .backend()
                .unary(kernel, x_fwd.data_id, out.data_id)?;
            Ok(vec![out])
        },
        backward,
    )?;
    single(name, outputs)
}

pub fn neg(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let backward: Rc<GradientFn> = Rc::new(|_, dy, _| {
        let dy = dy.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| neg(e, &dy)) as GradThunk,
        );
        Ok(map)
    });
    run_unary(engine, UnaryKernel::Neg, x, Some(backward))
}

pub fn square(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let x_op = x.clone();
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let dy = dy.clone();
        let x_op = x_op.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| {
                let two = scalar(e, 2.0)?;
                let doubled = mul(e, &x_op, &two)?;
                mul(e, &dy, &doubled)
            }) as GradThunk,
        );
        Ok(map)
    });
    run_unary(engine, UnaryKernel::Square, x, Some(backward))
}

/// Elementwise exponential. The forward pass saves its own output; the
/// gradient is `dy * exp(x)` and reuses it instead of recomputing.
pub fn exp(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let backward: Rc<GradientFn> = Rc::new(|_, dy, saved| {
        let output = saved.first().cloned().ok_or_else(|| {
            CrucibleError::InternalError("Exp recorded no saved output".to_string())
        })?;
        let dy = dy.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| mul(e, &dy, &output)) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        "Exp",
        inputs,
        move |engine, save| {
            let out = engine.alloc_tensor(x_fwd.shape.clone(), DType::F32)?;
            engine
                .backend()
                .unary(UnaryKernel::Exp, x_fwd.data_id, out.data_id)?;
            save(&out)?;
            Ok(vec![out])
        },
        Some(backward),
    )?;
    single("Exp", outputs)
}

/// Elementwise square root; gradient is `dy / (2 * sqrt(x))`, reusing the
/// saved output.
pub fn sqrt(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let backward: Rc<GradientFn> = Rc::new(|_, dy, saved| {
        let output = saved.first().cloned().ok_or_else(|| {
            CrucibleError::InternalError("Sqrt recorded no saved output".to_string())
        })?;
        let dy = dy.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| {
                let two = scalar(e, 2.0)?;
                let denom = mul(e, &output, &two)?;
                div(e, &dy, &denom)
            }) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        "Sqrt",
        inputs,
        move |engine, save| {
            let out = engine.alloc_tensor(x_fwd.shape.clone(), DType::F32)?;
            engine
                .backend()
                .unary(UnaryKernel::Sqrt, x_fwd.data_id, out.data_id)?;
            save(&out)?;
            Ok(vec![out])
        },
        Some(backward),
    )?;
    single("Sqrt", outputs)
}

// Reductions and linear algebra

/// Reduce all elements to a rank-0 scalar. The gradient broadcasts `dy`
/// across the input's shape.
pub fn sum(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let x_shape = x.shape.clone();
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let dy = dy.clone();
        let shape = x_shape.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| {
                let expanded = ones(e, &shape)?;
                mul(e, &expanded, &dy)
            }) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        "Sum",
        inputs,
        move |engine, _save| {
            let out = engine.alloc_tensor(Vec::new(), DType::F32)?;
            engine.backend().sum(x_fwd.data_id, out.data_id)?;
            Ok(vec![out])
        },
        Some(backward),
    )?;
    single("Sum", outputs)
}

/// 2-d matrix product `[m, k] x [k, n] -> [m, n]`.
pub fn matmul(engine: &Engine, a: &Tensor, b: &Tensor) -> CrucibleResult<Tensor> {
    if a.rank() != 2 || b.rank() != 2 || a.shape[1] != b.shape[0] {
        return Err(CrucibleError::shape(
            "Matmul",
            "rank-2 operands with an equal inner dimension",
            &format!("{:?} and {:?}", a.shape, b.shape),
        ));
    }
    let dims = MatmulDims {
        m: a.shape[0],
        k: a.shape[1],
        n: b.shape[1],
    };
    let inputs: BTreeMap<String, Tensor> =
        [("a".to_string(), a.clone()), ("b".to_string(), b.clone())]
            .into_iter()
            .collect();
    let (a_op, b_op) = (a.clone(), b.clone());
    let backward: Rc<GradientFn> = Rc::new(move |_, dy, _| {
        let mut map = InputGradientMap::new();
        {
            let dy = dy.clone();
            let rhs = b_op.clone();
            map.insert(
                "a".to_string(),
                Box::new(move |e: &Engine| {
                    let rhs_t = transpose(e, &rhs)?;
                    matmul(e, &dy, &rhs_t)
                }) as GradThunk,
            );
        }
        {
            let dy = dy.clone();
            let lhs = a_op.clone();
            map.insert(
                "b".to_string(),
                Box::new(move |e: &Engine| {
                    let lhs_t = transpose(e, &lhs)?;
                    matmul(e, &lhs_t, &dy)
                }) as GradThunk,
            );
        }
        Ok(map)
    });
    let (a_fwd, b_fwd) = (a.clone(), b.clone());
    let outputs = engine.run_kernel(
        "Matmul",
        inputs,
        move |engine, _save| {
            let out = engine.alloc_tensor(vec![dims.m, dims.n], DType::F32)?;
            engine
                .backend()
                .matmul(a_fwd.data_id, b_fwd.data_id, out.data_id, dims)?;
            Ok(vec![out])
        },
        Some(backward),
    )?;
    single("Matmul", outputs)
}

/// 2-d transpose.
pub fn transpose(engine: &Engine, x: &Tensor) -> CrucibleResult<Tensor> {
    if x.rank() != 2 {
        return Err(CrucibleError::shape(
            "Transpose",
            "a rank-2 operand",
            &format!("{:?}", x.shape),
        ));
    }
    let (rows, cols) = (x.shape[0], x.shape[1]);
    let inputs: BTreeMap<String, Tensor> = [("x".to_string(), x.clone())].into_iter().collect();
    let backward: Rc<GradientFn> = Rc::new(|_, dy, _| {
        let dy = dy.clone();
        let mut map = InputGradientMap::new();
        map.insert(
            "x".to_string(),
            Box::new(move |e: &Engine| transpose(e, &dy)) as GradThunk,
        );
        Ok(map)
    });
    let x_fwd = x.clone();
    let outputs = engine.run_kernel(
        "Transpose",
        inputs,
        move |engine, _save| {
            let out = engine.alloc_tensor(vec![cols, rows], DType::F32)?;
            engine
                .backend()
                .transpose(x_fwd.data_id, out.data_id, rows, cols)?;
            Ok(vec![out])
        },
        Some(backward),
    )?;
    single("Transpose", outputs)
}
