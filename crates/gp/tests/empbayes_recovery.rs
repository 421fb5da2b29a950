use epigp_gp::{
    Correlated, EmpBayesParams, ExpQuad, GaussianProcess, HyperPrior, Hyperparams, IntoKernel,
    KernelOptions, Observations, Result, SamplingMethod, Transform, empbayes_fit,
};
use linfa::ParamGuard;
use ndarray::{Array1, Array2, Zip};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256Plus;

const NOISE: f64 = 0.1;

fn factory(x: &Array1<f64>) -> impl Fn(&Hyperparams) -> Result<GaussianProcess> + '_ {
    move |hp: &Hyperparams| {
        let kernel = ExpQuad
            .into_kernel(KernelOptions::new().scale(hp.scalar("scale")?))?
            .try_scale(hp.scalar("sigma")?.powi(2))?;
        let mut gp = GaussianProcess::params(kernel).checkpos(false).build()?;
        gp.addx(x.clone(), "data")?;
        Ok(gp)
    }
}

#[test]
fn test_empbayes_recovers_hyperparameters() {
    let _ = env_logger::builder().is_test(true).try_init();
    let prior = HyperPrior::new()
        .add_scalar("scale", Transform::Log, 3f64.ln(), 0.5)
        .unwrap()
        .add_scalar("sigma", Transform::Log, 0., 0.5)
        .unwrap();
    let x = Array1::<f64>::linspace(0., 30., 30);
    let gpfactory = factory(&x);
    let params = EmpBayesParams::new().check().unwrap();

    let n_seeds = 20;
    let mut n_ok = 0;
    // standardized errors (fitted - true) / sdev, one row per seed
    let mut z = Array2::<f64>::zeros((n_seeds, 2));
    for seed in 0..n_seeds {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed as u64);
        let sdev = prior.cov().diag().mapv(f64::sqrt);
        let u_true: Array1<f64> =
            prior.mean() + &sdev * &Array1::<f64>::random_using(2, StandardNormal, &mut rng);
        let truth = prior.hyperparams(&u_true).unwrap();

        let gp = gpfactory(&truth).unwrap();
        let y = gp
            .sample_prior("data", 1, SamplingMethod::EigenValues, &mut rng)
            .unwrap()
            .column(0)
            .to_owned();
        let noise = Array1::<f64>::random_using(x.len(), StandardNormal, &mut rng) * NOISE;
        let data = Correlated::new(y + noise, Array2::eye(x.len()) * NOISE.powi(2)).unwrap();
        let obs = Observations::new().uncertain("data", data);

        let fit = empbayes_fit(&prior, &gpfactory, &obs, &params).unwrap();
        let usdev = fit.u.sdev();
        Zip::from(z.row_mut(seed))
            .and(&fit.u.mean)
            .and(&usdev)
            .and(&u_true)
            .for_each(|z, &m, &s, &t| *z = (m - t) / s);
        if z.row(seed).iter().all(|z| z.abs() <= 2.) {
            n_ok += 1;
        } else {
            log::info!("seed {seed}: true {u_true} fitted {} +/- {usdev}", fit.u.mean);
        }
    }
    assert!(n_ok >= 16, "only {n_ok}/{n_seeds} fits within 2 sdev of the truth");
    for (j, col) in z.columns().into_iter().enumerate() {
        // no systematic bias
        let bias = col.mean().unwrap();
        assert!(bias.abs() < 0.75, "parameter {j}: mean standardized error {bias}");
        // error bars are not too narrow
        let mut abs: Vec<f64> = col.iter().map(|v| v.abs()).collect();
        abs.sort_by(|a, b| a.total_cmp(b));
        let median = 0.5 * (abs[n_seeds / 2 - 1] + abs[n_seeds / 2]);
        assert!(median < 1.2, "parameter {j}: median |standardized error| {median}");
    }
}
