//! Empirical Bayes estimation of kernel hyperparameters.
//!
//! The hyperparameters are given a gaussian prior on a transformed scale
//! (log for positive values, arctanh for values in `(-1, 1)`), and the
//! posterior `log L(u) + log p(u)` is maximized over the transformed values
//! `u`, where `L` is the marginal likelihood of the data under the GP built
//! by a user factory. The uncertainty of the estimate is given by the
//! inverse hessian at the optimum (Laplace approximation).

use crate::algorithm::{GaussianProcess, Observations};
use crate::decomposition::{Correlated, Decomposition, Solver};
use crate::errors::{GpError, Result};
use crate::optimization::{OptimParams, optimize_params};
use crate::parameters::EmpBayesValidParams;

use finitediff::ndarr;
use log::{debug, info, warn};
use ndarray::{Array1, Array2, s};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::time::Instant;

/// Default max number of posterior evaluations in [`empbayes_fit`]
pub const EMPBAYES_MAX_EVAL: usize = 500;
/// Minimum of posterior evaluations allowed in [`empbayes_fit`]
pub const EMPBAYES_MIN_EVAL: usize = 25;

/// Reparameterization from the optimized value `u` to the natural one
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Transform {
    /// `x = u`
    #[default]
    Identity,
    /// `x = exp(u)`, for positive values
    Log,
    /// `x = tanh(u)`, for values in `(-1, 1)`
    Arctanh,
}

impl Transform {
    /// Natural value of `u`
    pub fn to_natural(&self, u: f64) -> f64 {
        match self {
            Transform::Identity => u,
            Transform::Log => u.exp(),
            Transform::Arctanh => u.tanh(),
        }
    }

    /// Transformed value of the natural value `x`
    pub fn from_natural(&self, x: f64) -> Result<f64> {
        match self {
            Transform::Identity => Ok(x),
            Transform::Log if x > 0. => Ok(x.ln()),
            Transform::Arctanh if x.abs() < 1. => Ok(x.atanh()),
            _ => Err(GpError::InvalidValueError(format!(
                "{x} is out of the domain of {self}"
            ))),
        }
    }

    /// `dx/du`
    pub fn derivative(&self, u: f64) -> f64 {
        match self {
            Transform::Identity => 1.,
            Transform::Log => u.exp(),
            Transform::Arctanh => 1. - u.tanh().powi(2),
        }
    }

    /// Name of the transformed parameter
    pub fn label(&self, name: &str) -> String {
        match self {
            Transform::Identity => name.to_string(),
            _ => format!("{self}({name})"),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => write!(f, "identity"),
            Transform::Log => write!(f, "log"),
            Transform::Arctanh => write!(f, "arctanh"),
        }
    }
}

/// Natural values of named hyperparameters
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Hyperparams(BTreeMap<String, Array1<f64>>);

impl Hyperparams {
    /// Values of `name`
    pub fn get(&self, name: &str) -> Result<&Array1<f64>> {
        self.0
            .get(name)
            .ok_or_else(|| GpError::KeyNotFound(name.to_string()))
    }

    /// Value of the scalar hyperparameter `name`
    pub fn scalar(&self, name: &str) -> Result<f64> {
        let v = self.get(name)?;
        match v.len() {
            1 => Ok(v[0]),
            n => Err(GpError::ShapeMismatch(format!(
                "hyperparameter '{name}' has {n} components, expected one"
            ))),
        }
    }

    /// Iterate over names and values
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array1<f64>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Clone, Debug, PartialEq)]
struct PriorEntry {
    name: String,
    transform: Transform,
    prior: Correlated<f64>,
}

/// Gaussian prior over transformed hyperparameters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HyperPrior {
    entries: Vec<PriorEntry>,
}

impl HyperPrior {
    /// Empty prior
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the (possibly vector) hyperparameter `name` whose `transform`ed
    /// value has the gaussian `prior`
    pub fn add(mut self, name: &str, transform: Transform, prior: Correlated<f64>) -> Result<Self> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(GpError::DuplicateKey(name.to_string()));
        }
        if prior.is_empty() {
            return Err(GpError::InvalidValueError(format!(
                "prior of '{name}' has no component"
            )));
        }
        let finite = prior.mean.iter().chain(prior.cov.iter()).all(|v| v.is_finite());
        if !finite || prior.cov.diag().iter().any(|&v| v <= 0.) {
            return Err(GpError::InvalidValueError(format!(
                "prior of '{name}' should be finite with positive variances"
            )));
        }
        self.entries.push(PriorEntry {
            name: name.to_string(),
            transform,
            prior,
        });
        Ok(self)
    }

    /// Add the scalar hyperparameter `name` with independent gaussian prior
    /// on its `transform`ed value
    pub fn add_scalar(self, name: &str, transform: Transform, mean: f64, sdev: f64) -> Result<Self> {
        let prior = Correlated::new(Array1::from_elem(1, mean), Array2::from_elem((1, 1), sdev * sdev))?;
        self.add(name, transform, prior)
    }

    /// Total number of transformed components
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.prior.len()).sum()
    }

    /// Whether the prior is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of the transformed hyperparameters, such as `log(scale)`
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.transform.label(&e.name))
            .collect()
    }

    /// Stacked prior mean of the transformed components
    pub fn mean(&self) -> Array1<f64> {
        self.entries
            .iter()
            .flat_map(|e| e.prior.mean.iter().copied())
            .collect()
    }

    /// Block diagonal prior covariance of the transformed components
    pub fn cov(&self) -> Array2<f64> {
        let n = self.len();
        let mut cov = Array2::zeros((n, n));
        let mut offset = 0;
        for e in &self.entries {
            let m = e.prior.len();
            cov.slice_mut(s![offset..offset + m, offset..offset + m])
                .assign(&e.prior.cov);
            offset += m;
        }
        cov
    }

    /// Natural hyperparameters of the stacked transformed values `u`
    pub fn hyperparams(&self, u: &Array1<f64>) -> Result<Hyperparams> {
        self.map_entries(u, |t, v| t.to_natural(v))
    }

    fn map_entries(&self, u: &Array1<f64>, f: impl Fn(&Transform, f64) -> f64) -> Result<Hyperparams> {
        if u.len() != self.len() {
            return Err(GpError::ShapeMismatch(format!(
                "{} transformed values given, expected {}",
                u.len(),
                self.len()
            )));
        }
        let mut map = BTreeMap::new();
        let mut offset = 0;
        for e in &self.entries {
            let m = e.prior.len();
            let x = u
                .slice(s![offset..offset + m])
                .mapv(|v| f(&e.transform, v));
            map.insert(e.name.clone(), x);
            offset += m;
        }
        Ok(Hyperparams(map))
    }
}

/// Result of [`empbayes_fit`]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct EmpBayesFit {
    /// Labels of the transformed hyperparameters
    pub labels: Vec<String>,
    /// Maximum a posteriori of the transformed values and the inverse
    /// hessian covariance
    pub u: Correlated<f64>,
    /// Natural values at the optimum
    pub hyperparams: Hyperparams,
    /// Natural standard deviations, propagated to first order
    pub sdev: Hyperparams,
    /// Log posterior at the optimum (up to the normalization of the data)
    pub log_posterior: f64,
    /// Whether the optimizer reached its tolerance
    pub converged: bool,
    /// Number of objective evaluations
    pub n_eval: usize,
}

impl fmt::Display for EmpBayesFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sdev = self.u.sdev();
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label} = {:.4} +/- {:.4}", self.u.mean[i], sdev[i])?;
        }
        Ok(())
    }
}

/// Log posterior of the transformed hyperparameters and its gradient
struct Posterior<'a, G> {
    hyperprior: &'a HyperPrior,
    prior_mean: Array1<f64>,
    prior_dec: Box<dyn Decomposition<f64>>,
    gpfactory: &'a G,
    data: &'a Observations,
    keys: Vec<&'a str>,
}

impl<'a, G> Posterior<'a, G>
where
    G: Fn(&Hyperparams) -> Result<GaussianProcess>,
{
    fn new(hyperprior: &'a HyperPrior, gpfactory: &'a G, data: &'a Observations) -> Result<Self> {
        let prior_dec = Solver::Cholesky.decompose(&hyperprior.cov())?;
        Ok(Posterior {
            hyperprior,
            prior_mean: hyperprior.mean(),
            prior_dec,
            gpfactory,
            data,
            keys: data.keys().collect(),
        })
    }

    fn gp(&self, u: &Array1<f64>) -> Result<GaussianProcess> {
        (self.gpfactory)(&self.hyperprior.hyperparams(u)?)
    }

    fn log_prior(&self, u: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        let d = u - &self.prior_mean;
        let solved = self.prior_dec.solve_vec(d.view())?;
        let n = d.len() as f64;
        let value = -0.5 * (d.dot(&solved) + self.prior_dec.logdet() + n * (2. * PI).ln());
        Ok((value, -solved))
    }

    fn value(&self, u: &Array1<f64>) -> Result<f64> {
        let ml = self.gp(u)?.marginal_likelihood(self.data)?;
        Ok(ml + self.log_prior(u)?.0)
    }

    /// Prior covariance of the observed keys, flattened
    fn flat_cov(&self, u: &Array1<f64>) -> Result<Array1<f64>> {
        let cov = self.gp(u)?.prior_cov(&self.keys)?;
        Ok(cov.iter().copied().collect())
    }

    fn value_and_grad(&self, u: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        let gp = self.gp(u)?;
        let ml = gp.marginal_likelihood(self.data)?;
        let (lp, mut grad) = self.log_prior(u)?;

        let f = |v: &Array1<f64>| -> std::result::Result<Array1<f64>, anyhow::Error> {
            Ok(self.flat_cov(v)?)
        };
        let jvp = ndarr::central_jacobian_vec_prod(&f);
        let m = gp.prior_cov(&self.keys)?.nrows();
        for j in 0..u.len() {
            let mut e = Array1::zeros(u.len());
            e[j] = 1.;
            let dk = jvp(u, &e)
                .map_err(|err| GpError::OptimizationError(err.to_string()))?
                .into_shape_with_order((m, m))
                .map_err(|err| GpError::ShapeMismatch(err.to_string()))?;
            grad[j] += gp.marginal_likelihood_tangent(self.data, &dk)?;
        }
        Ok((ml + lp, grad))
    }
}

/// Fit the hyperparameters of the GP built by `gpfactory` to `data` by
/// maximizing their posterior.
///
/// The search starts at the prior mean and is bounded to
/// `bound_sigmas` prior standard deviations around it. The likelihood
/// gradient combines the decomposition tangents with central finite
/// differences of the covariance built by the factory, and the hessian at
/// the optimum is obtained by central differences of that gradient.
pub fn empbayes_fit<G>(
    hyperprior: &HyperPrior,
    gpfactory: G,
    data: &Observations,
    params: &EmpBayesValidParams,
) -> Result<EmpBayesFit>
where
    G: Fn(&Hyperparams) -> Result<GaussianProcess>,
{
    if hyperprior.is_empty() {
        return Err(GpError::InvalidValueError(
            "no hyperparameter to fit".to_string(),
        ));
    }
    let now = Instant::now();
    let posterior = Posterior::new(hyperprior, &gpfactory, data)?;
    let u0 = hyperprior.mean();
    let sdev0 = hyperprior.cov().diag().mapv(f64::sqrt);
    let bounds: Vec<(f64, f64)> = u0
        .iter()
        .zip(sdev0.iter())
        .map(|(m, s)| (m - params.bound_sigmas * s, m + params.bound_sigmas * s))
        .collect();

    let n_eval = Cell::new(0);
    let objfn = |x: &[f64], gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
        n_eval.set(n_eval.get() + 1);
        let u = Array1::from_vec(x.to_vec());
        let res = match gradient {
            Some(g) => posterior.value_and_grad(&u).map(|(v, grad)| {
                g.iter_mut()
                    .zip(grad.iter())
                    .for_each(|(gi, di)| *gi = -di);
                v
            }),
            None => posterior.value(&u),
        };
        match res {
            Ok(v) if v.is_finite() => -v,
            Ok(_) => f64::INFINITY,
            Err(err) => {
                debug!("empbayes: objective failed at {u}: {err}");
                f64::INFINITY
            }
        }
    };
    let res = optimize_params(
        params.algorithm,
        objfn,
        &u0,
        &bounds,
        OptimParams {
            ftol_rel: params.ftol_rel,
            maxeval: params.max_eval,
            ..OptimParams::default()
        },
    );
    let n_eval = n_eval.get();
    if !res.fmin.is_finite() {
        return Err(GpError::OptimizationError(format!(
            "posterior could not be evaluated, last point {}",
            res.x
        )));
    }
    let uopt = res.x;

    let grad = |v: &Array1<f64>| -> std::result::Result<Array1<f64>, anyhow::Error> {
        Ok(posterior.value_and_grad(v)?.1.mapv(|d| -d))
    };
    let hess = ndarr::central_hessian(&grad)(&uopt)
        .map_err(|err| GpError::OptimizationError(err.to_string()))?;
    let hess = (&hess + &hess.t()) * 0.5;
    let cov = params.solver.decompose(&hess)?.inverse()?;
    if cov.diag().iter().any(|&v| !(v > 0.)) {
        warn!("empbayes: the hessian at the optimum is not positive definite");
    }
    let u = Correlated::new(uopt, cov)?;

    let hyperparams = hyperprior.hyperparams(&u.mean)?;
    let usdev = u.sdev();
    let jac = hyperprior.map_entries(&u.mean, |t, v| t.derivative(v).abs())?;
    let mut sdev = BTreeMap::new();
    let mut offset = 0;
    for e in &hyperprior.entries {
        let m = e.prior.len();
        let d = jac.get(&e.name)? * &usdev.slice(s![offset..offset + m]);
        sdev.insert(e.name.clone(), d);
        offset += m;
    }

    let fit = EmpBayesFit {
        labels: hyperprior.labels(),
        u,
        hyperparams,
        sdev: Hyperparams(sdev),
        log_posterior: -res.fmin,
        converged: res.converged,
        n_eval,
    };
    if !fit.converged {
        warn!("empbayes: optimizer stopped before convergence after {n_eval} evaluations");
    }
    info!(
        "empbayes: {fit} (log posterior {:.4}, {n_eval} evaluations in {:?})",
        fit.log_posterior,
        now.elapsed()
    );
    Ok(fit)
}
