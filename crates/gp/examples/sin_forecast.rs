use epigp_gp::{
    EmpBayesParams, GaussianProcess, HyperPrior, Hyperparams, IntoKernel, KernelOptions, Matern,
    Observations, Result, Transform, empbayes_fit,
};
use linfa::ParamGuard;
use ndarray::Array1;

fn main() {
    env_logger::init();

    let xdata = Array1::<f64>::linspace(0., 10., 10);
    let xpred = Array1::<f64>::linspace(-15., 25., 500);
    let obs = Observations::new().exact("data", xdata.mapv(f64::sin));

    let makegp = |hp: &Hyperparams| -> Result<GaussianProcess> {
        let kernel = Matern::new(hp.scalar("nu")?)?
            .into_kernel(KernelOptions::new().scale(hp.scalar("scale")?))?;
        let mut gp = GaussianProcess::params(kernel).build()?;
        gp.addx(xdata.clone(), "data")?;
        Ok(gp)
    };

    let prior = HyperPrior::new()
        .add_scalar("scale", Transform::Log, 5f64.ln(), 1.)
        .and_then(|p| p.add_scalar("nu", Transform::Log, 5f64.ln(), 1.))
        .expect("hyperprior");
    let params = EmpBayesParams::new().check().expect("empbayes parameters");
    let fit = empbayes_fit(&prior, &makegp, &obs, &params).expect("empbayes fit");
    println!("{fit}");

    let mut gp = makegp(&fit.hyperparams).expect("gp");
    gp.addx(xpred.clone(), "pred").expect("prediction points");
    let pred = gp.predfromdata(&obs, "pred").expect("prediction");
    let sdev = pred.sdev();
    for i in (0..xpred.len()).step_by(50) {
        println!(
            "x = {:7.2}  f = {:7.3} +/- {:.3}  (sin = {:7.3})",
            xpred[i],
            pred.mean[i],
            sdev[i],
            xpred[i].sin()
        );
    }
}
