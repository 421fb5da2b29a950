use approx::assert_abs_diff_eq;
use epigp_gp::{
    Categorical, Deriv, ExpQuad, FieldSpec, GaussianProcess, GpError, IntoKernel, Kernel,
    KernelOptions, Observations, Schema, StructuredArray,
};
use ndarray::{Array1, Array2, arr2};

fn series(times: &Array1<f64>, label: f64) -> StructuredArray {
    let schema = Schema::new([FieldSpec::float("time"), FieldSpec::int("label")]).unwrap();
    let labels = Array1::from_elem(times.len(), label);
    StructuredArray::from_arrays(schema, vec![times.clone().into_dyn(), labels.into_dyn()])
        .unwrap()
}

fn time_label_kernel(labelcov: Array2<f64>) -> Kernel {
    let time = ExpQuad
        .into_kernel(KernelOptions::new().dim("time").scale(3.))
        .unwrap();
    let label = Categorical::new(labelcov)
        .unwrap()
        .into_kernel(KernelOptions::new().dim("label"))
        .unwrap();
    time * label
}

/// Predict the second series beyond its data, where only the first series
/// has been observed
fn forecast_second_series(labelcov: Array2<f64>) -> (f64, f64) {
    let mut gp = GaussianProcess::params(time_label_kernel(labelcov))
        .build()
        .unwrap();
    let t0 = Array1::<f64>::linspace(0., 25., 26);
    let t1 = Array1::<f64>::linspace(0., 10., 11);
    gp.addx(series(&t0, 0.), "first").unwrap();
    gp.addx(series(&t1, 1.), "second").unwrap();
    gp.addx(series(&Array1::from_elem(1, 22.), 1.), "pred").unwrap();
    let obs = Observations::new()
        .exact("first", t0.mapv(|t| (t / 3.).sin()))
        .exact("second", t1.mapv(|t| (t / 3.).sin()));
    let pred = gp.predfromdata(&obs, "pred").unwrap();
    (pred.mean[0], pred.sdev()[0])
}

#[test]
fn test_correlated_series() {
    let truth = (22f64 / 3.).sin();
    let (mean, sdev) = forecast_second_series(arr2(&[[1., 0.95], [0.95, 1.]]));
    assert_abs_diff_eq!(mean, truth, epsilon = 0.2);
    let (mean_ind, sdev_ind) = forecast_second_series(Array2::eye(2));
    // independent series do not share information
    assert!((mean_ind - truth).abs() > (mean - truth).abs());
    assert!(sdev < sdev_ind, "{sdev} >= {sdev_ind}");
}

#[test]
fn test_derivative_along_time() {
    let kernel = ExpQuad
        .into_kernel(KernelOptions::new().dim("time").scale(2.))
        .unwrap();
    let mut gp = GaussianProcess::params(kernel).build().unwrap();
    let t = Array1::<f64>::linspace(0., 10., 30);
    let tpred = Array1::<f64>::linspace(1., 9., 17);
    gp.addx(series(&t, 0.), "f").unwrap();
    gp.addx_deriv(series(&tpred, 0.), "df", Deriv::new(1).dim("time"))
        .unwrap();
    let obs = Observations::new().exact("f", t.mapv(f64::sin));
    let pred = gp.predfromdata(&obs, "df").unwrap();
    assert_abs_diff_eq!(pred.mean, tpred.mapv(f64::cos), epsilon = 0.05);
}

#[test]
fn test_categorical_is_not_derivable() {
    let mut gp = GaussianProcess::params(time_label_kernel(Array2::eye(2)))
        .build()
        .unwrap();
    let t = Array1::<f64>::linspace(0., 1., 3);
    gp.addx(series(&t, 0.), "f").unwrap();
    let res = gp.addx_deriv(series(&t, 0.), "df", Deriv::new(1).dim("time"));
    assert!(matches!(res, Err(GpError::NotDerivable(_))));
}

#[test]
fn test_schema_mismatch() {
    let kernel = ExpQuad
        .into_kernel(KernelOptions::new().dim("time"))
        .unwrap();
    let mut gp = GaussianProcess::params(kernel).build().unwrap();
    let t = Array1::<f64>::linspace(0., 1., 3);
    gp.addx(series(&t, 0.), "f").unwrap();
    let other = Schema::new([FieldSpec::float("time")]).unwrap();
    let x = StructuredArray::from_arrays(other, vec![t.into_dyn()]).unwrap();
    assert!(matches!(
        gp.addx(x, "g"),
        Err(GpError::SchemaMismatch(_))
    ));
}
