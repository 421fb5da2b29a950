use approx::assert_abs_diff_eq;
use epigp_gp::{
    ExpQuad, GaussianProcess, IntoKernel, KernelOptions, Matern, Observations, SamplingMethod,
};
use ndarray::{Array1, Axis};
use ndarray_npy::write_npy;
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

fn sin_gp(scale: f64) -> (GaussianProcess, Array1<f64>, Array1<f64>, Observations) {
    let kernel = ExpQuad
        .into_kernel(KernelOptions::new().scale(scale))
        .unwrap();
    let mut gp = GaussianProcess::params(kernel).build().unwrap();
    let xdata = Array1::<f64>::linspace(0., 10., 10);
    let xpred = Array1::<f64>::linspace(-15., 25., 500);
    gp.addx(xdata.clone(), "data").unwrap();
    gp.addx(xpred.clone(), "pred").unwrap();
    let obs = Observations::new().exact("data", xdata.mapv(f64::sin));
    (gp, xdata, xpred, obs)
}

#[test]
fn test_sin_forecast() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (gp, xdata, xpred, obs) = sin_gp(3.);
    let pred = gp.predfromdata(&obs, "pred").unwrap();
    let sdev = pred.sdev();
    assert_eq!(pred.mean.len(), 500);
    assert_eq!(pred.shape, vec![500]);

    let test_dir = "target/tests";
    std::fs::create_dir_all(test_dir).ok();
    write_npy(format!("{test_dir}/sin_xpred.npy"), &xpred).expect("xpred saved");
    write_npy(format!("{test_dir}/sin_mean.npy"), &pred.mean).expect("mean saved");
    write_npy(format!("{test_dir}/sin_sdev.npy"), &sdev).expect("sdev saved");

    for ((x, m), s) in xpred.iter().zip(pred.mean.iter()).zip(sdev.iter()) {
        // the truth stays within the error band
        assert!(
            (m - x.sin()).abs() <= 3. * s + 0.1,
            "x={x} mean={m} sdev={s}"
        );
        // far from the data the prior is recovered: unit sdev and a mean
        // compatible with zero
        if *x < -10. || *x > 20. {
            assert_abs_diff_eq!(*s, 1., epsilon = 0.05);
            assert!(m.abs() <= 3. * s, "x={x} mean={m} sdev={s}");
        }
    }

    // the data are interpolated
    let pred = gp.predfromdata(&obs, "data").unwrap();
    assert_abs_diff_eq!(pred.mean, xdata.mapv(f64::sin), epsilon = 1e-3);
    assert!(pred.sdev().iter().all(|s| *s < 1e-2));
}

#[test]
fn test_sin_scale_selection() {
    // sin has a natural length of about one, a very long scale should
    // explain the data worse
    let (short, _, _, obs) = sin_gp(1.);
    let (long, _, _, _) = sin_gp(10.);
    let ml_short = short.marginal_likelihood(&obs).unwrap();
    let ml_long = long.marginal_likelihood(&obs).unwrap();
    assert!(ml_short > ml_long, "{ml_short} <= {ml_long}");
}

#[test]
fn test_matern_trajectories() {
    let kernel = Matern::new(2.5)
        .unwrap()
        .into_kernel(KernelOptions::new().scale(2.))
        .unwrap();
    let mut gp = GaussianProcess::params(kernel).build().unwrap();
    let xdata = Array1::<f64>::linspace(0., 10., 10);
    gp.addx(xdata.clone(), "data").unwrap();
    // every fourth prediction point is a data point
    gp.addx(Array1::<f64>::linspace(0., 10., 37), "pred").unwrap();
    let obs = Observations::new().exact("data", xdata.mapv(f64::sin));
    let pred = gp.predfromdata(&obs, "pred").unwrap();

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let samples = gp
        .sample_posterior(&pred, 200, SamplingMethod::EigenValues, &mut rng)
        .unwrap();
    assert_eq!(samples.dim(), (37, 200));
    let mean = samples.mean_axis(Axis(1)).unwrap();
    for (j, x) in xdata.iter().enumerate() {
        assert_abs_diff_eq!(mean[4 * j], x.sin(), epsilon = 1e-2);
    }
    let spread = samples.std_axis(Axis(1), 1.);
    let sdev = pred.sdev();
    for (a, b) in spread.iter().zip(sdev.iter()) {
        assert!((a - b).abs() <= 0.3 * b + 1e-3, "{a} vs {b}");
    }
}
