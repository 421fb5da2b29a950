use epigp_gp::{
    CatalogParams, FieldSpec, GaussianProcess, KernelCatalog, KernelOptions, Observations,
    Schema, StructuredArray,
};
use ndarray::{Array1, arr2};
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;

/// Two daily counts sharing their shape, labelled 0 and 1
fn series(times: &Array1<f64>, label: f64) -> StructuredArray {
    let schema = Schema::new([FieldSpec::float("time"), FieldSpec::int("label")])
        .expect("schema");
    let labels = Array1::from_elem(times.len(), label);
    StructuredArray::from_arrays(schema, vec![times.clone().into_dyn(), labels.into_dyn()])
        .expect("structured array")
}

fn main() {
    env_logger::init();

    let catalog = KernelCatalog::standard();
    let time = catalog
        .build(
            "ExpQuad",
            &CatalogParams::new(),
            KernelOptions::new().dim("time").scale(10.),
        )
        .expect("time kernel");
    let labels = catalog
        .build(
            "Categorical",
            &CatalogParams::new().cov(arr2(&[[1., 0.8], [0.8, 1.]])),
            KernelOptions::new().dim("label"),
        )
        .expect("label kernel");
    let kernel = (time * labels).try_scale(100.).expect("kernel");

    let days = Array1::<f64>::linspace(0., 59., 60);
    let future = Array1::<f64>::linspace(60., 119., 60);
    let wave = |t: f64| 50. * (-((t - 40.) / 15.).powi(2)).exp();

    let mut gp = GaussianProcess::params(kernel).build().expect("gp");
    for label in [0., 1.] {
        gp.addx(series(&days, label), &format!("data{label}")).expect("data");
        gp.addx(series(&future, label), &format!("pred{label}")).expect("pred");
    }

    let obs = Observations::new()
        .exact("data0", days.mapv(wave))
        .exact("data1", days.mapv(|t| 0.6 * wave(t)));
    println!("log likelihood = {:.3}", gp.marginal_likelihood(&obs).expect("likelihood"));

    let pred = gp.predfromdata(&obs, "pred0").expect("prediction");
    let sdev = pred.sdev();
    for i in (0..future.len()).step_by(10) {
        println!(
            "day {:5.0}: {:7.2} +/- {:5.2}",
            future[i], pred.mean[i], sdev[i]
        );
    }

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let trajectories = gp
        .sample_posterior(&pred, 10, Default::default(), &mut rng)
        .expect("trajectories");
    println!("sampled {} trajectories", trajectories.ncols());
}
