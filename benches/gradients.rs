use criterion::{criterion_group, criterion_main, Criterion};
use crucible::{ops, CpuBackend, Engine, EngineConfig};

fn bench_scalar_gradient(c: &mut Criterion) {
    let engine = Engine::new(Box::new(CpuBackend::new()), EngineConfig::default());
    let x = ops::scalar(&engine, 3.0).unwrap();
    c.bench_function("grad of x*x + x", |b| {
        b.iter(|| {
            engine
                .tidy(|e| {
                    let result = e.gradients(
                        |e| {
                            let squared = ops::mul(e, &x, &x)?;
                            ops::add(e, &squared, &x)
                        },
                        std::slice::from_ref(&x),
                        None,
                        false,
                    )?;
                    Ok(result.grads.into_iter().next().flatten())
                })
                .unwrap()
        })
    });
}

fn bench_matmul_gradient(c: &mut Criterion) {
    let engine = Engine::new(Box::new(CpuBackend::new()), EngineConfig::default());
    let a = ops::random_uniform(&engine, &[32, 32], -1.0, 1.0).unwrap();
    let b = ops::random_uniform(&engine, &[32, 32], -1.0, 1.0).unwrap();
    c.bench_function("grad of sum(a x b), 32x32", |bench| {
        bench.iter(|| {
            engine
                .tidy(|e| {
                    let result = e.gradients(
                        |e| {
                            let product = ops::matmul(e, &a, &b)?;
                            ops::sum(e, &product)
                        },
                        std::slice::from_ref(&a),
                        None,
                        false,
                    )?;
                    Ok(result.grads.into_iter().next().flatten())
                })
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_scalar_gradient, bench_matmul_gradient);
criterion_main!(benches);
