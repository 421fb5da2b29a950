use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use epigp_gp::{
    ExpQuad, GaussianProcess, IntoKernel, KernelOptions, Matern52, Observations, Solver,
};
use ndarray::{Array1, Array2};
use ndarray_npy::{read_npy, write_npy};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use rand_xoshiro::Xoshiro256Plus;

fn training_points(nt: usize) -> Array1<f64> {
    let xfilename = format!("gp_xt_{nt}.npy");
    match read_npy(&xfilename) {
        Ok(xt) => xt,
        Err(_) => {
            let mut rng = Xoshiro256Plus::seed_from_u64(42);
            let xt = Array1::random_using(nt, Uniform::new(0., 100.), &mut rng);
            write_npy(&xfilename, &xt).expect("cannot save xt");
            xt
        }
    }
}

fn criterion_prior_cov(c: &mut Criterion) {
    let mut group = c.benchmark_group("prior_cov");
    group.sample_size(20);
    for nt in [100, 300] {
        let xt = training_points(nt);
        let kernel = Matern52
            .into_kernel(KernelOptions::new().scale(5.))
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(nt), &xt, |b, xt| {
            b.iter(|| {
                std::hint::black_box(kernel.matrix(&xt.clone().into(), &xt.clone().into()))
            });
        });
    }
    group.finish();
}

fn criterion_decompositions(c: &mut Criterion) {
    let mut group = c.benchmark_group("decomposition");
    group.sample_size(10);
    let xt = training_points(200);
    let k: Array2<f64> = ExpQuad
        .into_kernel(KernelOptions::new().scale(5.))
        .unwrap()
        .matrix(&xt.clone().into(), &xt.into())
        .unwrap();
    for solver in [
        Solver::Cholesky,
        Solver::CholGersh { eps: None },
        Solver::CholMaxEig { eps: None },
        Solver::Svd,
        Solver::SvdLowRank { eps: None },
        Solver::LowRank { rank: 20 },
    ] {
        group.bench_function(format!("{solver}"), |b| {
            b.iter(|| std::hint::black_box(solver.decompose(&k)));
        });
    }
    group.finish();
}

fn criterion_marginal_likelihood(c: &mut Criterion) {
    let mut group = c.benchmark_group("marginal_likelihood");
    group.sample_size(20);
    for nt in [100, 300] {
        let xt = training_points(nt);
        let y = xt.mapv(|v| (v / 10.).sin());
        let obs = Observations::new().exact("data", y);
        group.bench_with_input(BenchmarkId::from_parameter(nt), &xt, |b, xt| {
            b.iter(|| {
                let kernel = ExpQuad
                    .into_kernel(KernelOptions::new().scale(10.))
                    .unwrap();
                let mut gp = GaussianProcess::params(kernel)
                    .checkpos(false)
                    .build()
                    .unwrap();
                gp.addx(xt.clone(), "data").unwrap();
                std::hint::black_box(gp.marginal_likelihood(&obs).expect("likelihood error"))
            });
        });
    }
    group.finish();
}

fn criterion_predfromdata(c: &mut Criterion) {
    let mut group = c.benchmark_group("predfromdata");
    group.sample_size(20);
    let xt = training_points(100);
    let obs = Observations::new().exact("data", xt.mapv(|v| (v / 10.).sin()));
    let kernel = ExpQuad
        .into_kernel(KernelOptions::new().scale(10.))
        .unwrap();
    let mut gp = GaussianProcess::params(kernel).build().unwrap();
    gp.addx(xt, "data").unwrap();
    gp.addx(Array1::<f64>::linspace(-20., 120., 500), "pred").unwrap();
    group.bench_function("100x500", |b| {
        b.iter(|| std::hint::black_box(gp.predfromdata(&obs, "pred").expect("prediction error")));
    });
    group.finish();
}

criterion_group!(
    benches,
    criterion_prior_cov,
    criterion_decompositions,
    criterion_marginal_likelihood,
    criterion_predfromdata
);
criterion_main!(benches);
