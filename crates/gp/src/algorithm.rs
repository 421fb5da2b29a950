use crate::decomposition::{Correlated, Decomposition};
use crate::errors::{GpError, Result};
use crate::kernel::Kernel;
use crate::parameters::{GpParams, GpValidParams};
use crate::structured::Points;

use linfa_linalg::{cholesky::*, eigh::*};
use ndarray::{Array, Array1, Array2, ArrayD, Axis, Dimension, IxDyn, Zip, s};
use ndarray_rand::RandomExt;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_stats::QuantileExt;

use log::debug;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Tolerance factor of the positivity check: eigenvalues below
/// `-CHECKPOS_TOL * n * eps * max eigenvalue` are rejected
const CHECKPOS_TOL: f64 = 10.;

/// Derivative order of registered observations
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Deriv {
    order: usize,
    dim: Option<String>,
}

impl Deriv {
    /// Observations of the `order`-th derivative of the process
    pub fn new(order: usize) -> Self {
        Deriv { order, dim: None }
    }

    /// Differentiate along field `dim` of structured inputs
    pub fn dim(mut self, dim: impl Into<String>) -> Self {
        self.dim = Some(dim.into());
        self
    }

    /// Derivative order
    pub fn order(&self) -> usize {
        self.order
    }

    /// Field along which the derivative is taken
    pub fn get_dim(&self) -> Option<&str> {
        self.dim.as_deref()
    }
}

/// Observed values at one registered key
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// Exactly known values, shaped as the registered points
    Exact(ArrayD<f64>),
    /// Values known with a (flattened) covariance
    Uncertain(Correlated<f64>),
}

impl Observation {
    fn len(&self) -> usize {
        match self {
            Observation::Exact(y) => y.len(),
            Observation::Uncertain(c) => c.len(),
        }
    }
}

/// Observations keyed by the GP key they were taken at
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Observations(BTreeMap<String, Observation>);

impl Observations {
    /// No observation
    pub fn new() -> Self {
        Self::default()
    }

    /// Add exact values at `key`
    pub fn exact<D: Dimension>(mut self, key: &str, values: Array<f64, D>) -> Self {
        self.0
            .insert(key.to_string(), Observation::Exact(values.into_dyn()));
        self
    }

    /// Add uncertain values at `key`
    pub fn uncertain(mut self, key: &str, values: Correlated<f64>) -> Self {
        self.0
            .insert(key.to_string(), Observation::Uncertain(values));
        self
    }

    /// Observed keys, in the order their values are stacked
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Observation at `key`
    pub fn get(&self, key: &str) -> Option<&Observation> {
        self.0.get(key)
    }

    /// Number of observed keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is observed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Method used to factor the covariance when sampling
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplingMethod {
    /// Cholesky factor, fails on singular covariances
    Cholesky,
    /// Eigen decomposition with tiny eigenvalues clamped to zero
    #[default]
    EigenValues,
}

/// Gaussian distribution of the process at the points of one key
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Prediction {
    /// Flattened mean
    pub mean: Array1<f64>,
    /// Covariance of the flattened values
    pub cov: Array2<f64>,
    /// Shape of the registered points
    pub shape: Vec<usize>,
    /// For uncertain data, the part of the uncertainty of the mean carried
    /// by the data covariance (`A C A'` with `A` the conditioning operator)
    pub data_cov: Option<Array2<f64>>,
}

impl Prediction {
    /// Standard deviations, negative variances are clamped to zero
    pub fn sdev(&self) -> Array1<f64> {
        self.cov.diag().mapv(|v| v.max(0.).sqrt())
    }

    /// Mean reshaped as the registered points
    pub fn mean_shaped(&self) -> Result<ArrayD<f64>> {
        self.mean
            .clone()
            .into_shape_with_order(IxDyn(&self.shape))
            .map_err(|e| GpError::ShapeMismatch(e.to_string()))
    }

    /// Draw `n_traj` trajectories as the columns of a `(n, n_traj)` array
    pub fn sample<R: Rng>(&self, n_traj: usize, method: SamplingMethod, rng: &mut R) -> Result<Array2<f64>> {
        sample(&self.mean, &self.cov, n_traj, method, rng)
    }
}

#[derive(Clone, Debug)]
struct XEntry {
    key: String,
    points: Points,
    shape: Vec<usize>,
    deriv: Deriv,
    offset: usize,
}

/// Data stacked in key order with its optional covariance
struct Stacked {
    keys: Vec<String>,
    y: Array1<f64>,
    ycov: Option<Array2<f64>>,
}

/// Gaussian process over a set of keyed input points.
///
/// A GP is created with no input from [`GpParams::build`], points are
/// registered under string keys with [`GaussianProcess::addx`] (or
/// [`GaussianProcess::addx_deriv`] for derivative observations), then the
/// joint prior covariance is built lazily on the first query and factorized
/// with the configured [`Solver`](crate::Solver). Factorizations are cached
/// per set of observed keys, registering new points drops every cache.
///
/// The covariance is only ever handed to a decomposition, never inverted
/// directly.
///
/// # Example
///
/// ```
/// use epigp_gp::{ExpQuad, GaussianProcess, IntoKernel, KernelOptions, Observations};
/// use ndarray::Array;
///
/// let kernel = ExpQuad.into_kernel(KernelOptions::new().scale(3.)).unwrap();
/// let mut gp = GaussianProcess::params(kernel).build().unwrap();
///
/// let x = Array::linspace(0., 10., 10);
/// let y = x.mapv(f64::sin);
/// gp.addx(x, "data").unwrap();
/// gp.addx(Array::linspace(-5., 15., 100), "pred").unwrap();
///
/// let obs = Observations::new().exact("data", y);
/// let pred = gp.predfromdata(&obs, "pred").unwrap();
/// let loglik = gp.marginal_likelihood(&obs).unwrap();
/// assert_eq!(pred.mean.len(), 100);
/// assert!(loglik.is_finite());
/// ```
pub struct GaussianProcess {
    /// Parameters used to build this process
    params: GpValidParams,
    /// Registered inputs in registration order
    entries: Vec<XEntry>,
    /// Prior covariance over every registered point
    cov: OnceCell<Array2<f64>>,
    /// Factorizations of the prior covariance restricted to observed keys
    decompositions: RefCell<HashMap<Vec<String>, Rc<dyn Decomposition<f64>>>>,
}

impl GaussianProcess {
    /// Gp parameters contructor
    pub fn params(kernel: Kernel) -> GpParams {
        GpParams::new(kernel)
    }

    pub(crate) fn new(params: GpValidParams) -> Self {
        GaussianProcess {
            params,
            entries: Vec::new(),
            cov: OnceCell::new(),
            decompositions: RefCell::new(HashMap::new()),
        }
    }

    /// Prior kernel
    pub fn kernel(&self) -> &Kernel {
        &self.params.kernel
    }

    /// Parameters used to build this process
    pub fn gp_params(&self) -> &GpValidParams {
        &self.params
    }

    /// Registered keys in registration order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Shape of the points registered at `key`
    pub fn shape(&self, key: &str) -> Result<&[usize]> {
        Ok(&self.entry(key)?.shape)
    }

    /// Total number of registered points
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.points.len()).sum()
    }

    /// Whether no point is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register points of the process under `key`
    pub fn addx(&mut self, x: impl Into<Points>, key: &str) -> Result<()> {
        self.addx_deriv(x, key, Deriv::default())
    }

    /// Register points where a derivative of the process is observed
    pub fn addx_deriv(&mut self, x: impl Into<Points>, key: &str, deriv: Deriv) -> Result<()> {
        let x = x.into();
        if self.entries.iter().any(|e| e.key == key) {
            return Err(GpError::DuplicateKey(key.to_string()));
        }
        if let Some(first) = self.entries.first() {
            first.points.check_compatible(&x)?;
        }
        if x.is_empty() {
            return Err(GpError::ShapeMismatch(format!("no point given for key '{key}'")));
        }
        let (dx, _) = self.params.kernel.derivable();
        if deriv.order > dx {
            return Err(GpError::NotDerivable(format!(
                "key '{key}' observes derivative {} but the kernel is derivable {dx} times",
                deriv.order
            )));
        }
        let shape = x.shape().to_vec();
        let offset = self.len();
        debug!("GP: registering {} points under '{key}'", x.len());
        self.entries.push(XEntry {
            key: key.to_string(),
            points: x.flatten()?,
            shape,
            deriv,
            offset,
        });
        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        self.cov = OnceCell::new();
        self.decompositions.get_mut().clear();
    }

    fn entry(&self, key: &str) -> Result<&XEntry> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .ok_or_else(|| GpError::KeyNotFound(key.to_string()))
    }

    /// Row indices of `keys` in the full covariance
    fn indices(&self, keys: &[&str]) -> Result<Vec<usize>> {
        let mut idx = Vec::new();
        for key in keys {
            let e = self.entry(key)?;
            idx.extend(e.offset..e.offset + e.points.len());
        }
        Ok(idx)
    }

    fn full_cov(&self) -> Result<&Array2<f64>> {
        if let Some(cov) = self.cov.get() {
            return Ok(cov);
        }
        let cov = self.build_cov()?;
        Ok(self.cov.get_or_init(|| cov))
    }

    fn build_cov(&self) -> Result<Array2<f64>> {
        let now = Instant::now();
        let n = self.len();
        let kernel = &self.params.kernel;
        let mut cov = Array2::zeros((n, n));
        for (i, ei) in self.entries.iter().enumerate() {
            for ej in &self.entries[i..] {
                let k = kernel.diff(
                    ei.deriv.order,
                    ej.deriv.order,
                    ei.deriv.get_dim(),
                    ej.deriv.get_dim(),
                )?;
                let block = k.matrix(&ei.points, &ej.points)?;
                let (ri, rj) = (
                    ei.offset..ei.offset + ei.points.len(),
                    ej.offset..ej.offset + ej.points.len(),
                );
                cov.slice_mut(s![ri.clone(), rj.clone()]).assign(&block);
                if ei.offset != ej.offset {
                    cov.slice_mut(s![rj, ri]).assign(&block.t());
                }
            }
        }
        if self.params.checksym {
            check_symmetric(&cov)?;
        }
        if self.params.checkpos {
            check_positive(&cov)?;
        }
        debug!("GP: prior covariance {n}x{n} built in {:?}", now.elapsed());
        Ok(cov)
    }

    /// Prior covariance of the points registered under `keys`, stacked in
    /// the given order
    pub fn prior_cov(&self, keys: &[&str]) -> Result<Array2<f64>> {
        let idx = self.indices(keys)?;
        let cov = self.full_cov()?;
        Ok(cov.select(Axis(0), &idx).select(Axis(1), &idx))
    }

    /// Prior distribution of the process at `key`
    pub fn prior(&self, key: &str) -> Result<Prediction> {
        let entry = self.entry(key)?;
        let cov = self.prior_cov(&[key])?;
        Ok(Prediction {
            mean: Array1::zeros(cov.nrows()),
            cov,
            shape: entry.shape.clone(),
            data_cov: None,
        })
    }

    fn stack(&self, observations: &Observations) -> Result<Stacked> {
        if observations.is_empty() {
            return Err(GpError::InvalidValueError("no observation given".to_string()));
        }
        let mut keys = Vec::new();
        let mut y = Vec::new();
        let mut blocks = Vec::new();
        for (key, obs) in &observations.0 {
            let entry = self.entry(key)?;
            match obs {
                Observation::Exact(values) if values.shape() != entry.shape.as_slice() => {
                    return Err(GpError::ShapeMismatch(format!(
                        "observation at '{key}' has shape {:?}, expected {:?}",
                        values.shape(),
                        entry.shape
                    )));
                }
                _ if obs.len() != entry.points.len() => {
                    return Err(GpError::ShapeMismatch(format!(
                        "observation at '{key}' has {} values, expected {}",
                        obs.len(),
                        entry.points.len()
                    )));
                }
                Observation::Exact(values) => {
                    y.extend(values.iter().copied());
                    blocks.push(None);
                }
                Observation::Uncertain(values) => {
                    y.extend(values.mean.iter().copied());
                    blocks.push(Some(&values.cov));
                }
            }
            keys.push(key.clone());
        }
        let ycov = if blocks.iter().any(Option::is_some) {
            let n = y.len();
            let mut ycov = Array2::zeros((n, n));
            let mut offset = 0;
            for ((key, obs), block) in observations.0.iter().zip(blocks) {
                let m = obs.len();
                if let Some(c) = block {
                    if c.iter().any(|v| !v.is_finite()) {
                        return Err(GpError::InvalidValueError(format!(
                            "covariance of observation at '{key}' is not finite"
                        )));
                    }
                    ycov.slice_mut(s![offset..offset + m, offset..offset + m])
                        .assign(c);
                }
                offset += m;
            }
            Some(ycov)
        } else {
            None
        };
        let y = Array1::from_vec(y);
        if y.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "observed values are not finite".to_string(),
            ));
        }
        Ok(Stacked { keys, y, ycov })
    }

    fn decomposition(&self, data: &Stacked) -> Result<Rc<dyn Decomposition<f64>>> {
        let keys: Vec<&str> = data.keys.iter().map(String::as_str).collect();
        match &data.ycov {
            None => {
                if let Some(dec) = self.decompositions.borrow().get(&data.keys) {
                    return Ok(dec.clone());
                }
                let k = self.prior_cov(&keys)?;
                let dec: Rc<dyn Decomposition<f64>> = Rc::from(self.params.solver.decompose(&k)?);
                debug!("GP: factorized {} points with {}", k.nrows(), self.params.solver);
                self.decompositions
                    .borrow_mut()
                    .insert(data.keys.clone(), dec.clone());
                Ok(dec)
            }
            Some(ycov) => {
                let k = self.prior_cov(&keys)? + ycov;
                Ok(Rc::from(self.params.solver.decompose(&k)?))
            }
        }
    }

    /// Log marginal likelihood of `observations`:
    /// `-1/2 (y' K^-1 y + log det K + n log 2 pi)` where `K` is the prior
    /// covariance of the observed keys plus the data covariance
    pub fn marginal_likelihood(&self, observations: &Observations) -> Result<f64> {
        let data = self.stack(observations)?;
        let dec = self.decomposition(&data)?;
        let quad = dec.quad_vec(data.y.view())?;
        let logdet = dec.logdet();
        let n = data.y.len() as f64;
        let ml = -0.5 * (quad + logdet + n * (2. * PI).ln());
        debug!("GP: marginal likelihood = {ml} (quad = {quad}, logdet = {logdet})");
        Ok(ml)
    }

    /// Directional derivative of [`GaussianProcess::marginal_likelihood`]
    /// along a variation `dk` of the prior covariance of the observed keys
    /// (stacked as [`Observations::keys`])
    pub fn marginal_likelihood_tangent(&self, observations: &Observations, dk: &Array2<f64>) -> Result<f64> {
        let data = self.stack(observations)?;
        let n = data.y.len();
        if dk.shape() != [n, n] {
            return Err(GpError::ShapeMismatch(format!(
                "covariance tangent has shape {:?}, expected [{n}, {n}]",
                dk.shape()
            )));
        }
        let dec = self.decomposition(&data)?;
        let dquad = dec.quad_tangent(dk.view(), data.y.view())?;
        let dlogdet = dec.logdet_tangent(dk.view())?;
        Ok(-0.5 * (dquad + dlogdet))
    }

    /// Posterior distribution of the process at `target` given
    /// `observations`
    pub fn predfromdata(&self, observations: &Observations, target: &str) -> Result<Prediction> {
        let entry = self.entry(target)?;
        let data = self.stack(observations)?;
        let dec = self.decomposition(&data)?;
        let xidx = self.indices(&data.keys.iter().map(String::as_str).collect::<Vec<_>>())?;
        let tidx = self.indices(&[target])?;
        let cov = self.full_cov()?;
        let kxs = cov.select(Axis(0), &xidx).select(Axis(1), &tidx);
        let kss = cov.select(Axis(0), &tidx).select(Axis(1), &tidx);

        let (mean, data_cov) = match data.ycov {
            None => (kxs.t().dot(&dec.solve_vec(data.y.view())?), None),
            Some(ycov) => {
                let u = dec.usolve(&Correlated {
                    mean: data.y,
                    cov: ycov,
                })?;
                (kxs.t().dot(&u.mean), Some(kxs.t().dot(&u.cov).dot(&kxs)))
            }
        };
        let mut post = kss - kxs.t().dot(&dec.solve(kxs.view())?);
        symmetrize(&mut post);
        Ok(Prediction {
            mean,
            cov: post,
            shape: entry.shape.clone(),
            data_cov,
        })
    }

    /// Draw `n_traj` prior trajectories at `key`
    pub fn sample_prior<R: Rng>(
        &self,
        key: &str,
        n_traj: usize,
        method: SamplingMethod,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        self.prior(key)?.sample(n_traj, method, rng)
    }

    /// Draw `n_traj` posterior trajectories from a prediction
    pub fn sample_posterior<R: Rng>(
        &self,
        prediction: &Prediction,
        n_traj: usize,
        method: SamplingMethod,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        prediction.sample(n_traj, method, rng)
    }
}

impl fmt::Display for GaussianProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(kernel={:?}, solver={}, keys=[{}])",
            self.params.kernel,
            self.params.solver,
            self.keys().collect::<Vec<_>>().join(", ")
        )
    }
}

impl fmt::Debug for GaussianProcess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GaussianProcess")
            .field("params", &self.params)
            .field("keys", &self.keys().collect::<Vec<_>>())
            .field("factored", &self.cov.get().is_some())
            .finish()
    }
}

fn symmetrize(a: &mut Array2<f64>) {
    let at = a.t().to_owned();
    Zip::from(a).and(&at).for_each(|v, &w| *v = 0.5 * (*v + w));
}

fn check_symmetric(cov: &Array2<f64>) -> Result<()> {
    let ok = Zip::from(cov)
        .and(&cov.t())
        .all(|&a, &b| (a - b).abs() <= 1e-8 + 1e-5 * b.abs());
    if ok {
        Ok(())
    } else {
        Err(GpError::numerical("checksym", "prior covariance is not symmetric"))
    }
}

fn check_positive(cov: &Array2<f64>) -> Result<()> {
    let (w, _) = cov.to_owned().eigh_into()?;
    let wmin = *w.min().map_err(|e| GpError::numerical("checkpos", e.to_string()))?;
    let wmax = *w.max().map_err(|e| GpError::numerical("checkpos", e.to_string()))?;
    let bound = -CHECKPOS_TOL * cov.nrows() as f64 * f64::EPSILON * wmax;
    if wmin < bound {
        return Err(GpError::numerical(
            "checkpos",
            format!("prior covariance is not positive semidefinite, min eigenvalue {wmin} < {bound}"),
        ));
    }
    Ok(())
}

/// Sample `n_traj` draws of a gaussian vector of given `mean` and `cov`
/// using either cholesky or eigenvalues decomposition of the covariance.
/// The later one is recommended as cholesky decomposition suffer from
/// occurence of ill-conditioned matrices when the number of points increase.
pub(crate) fn sample<R: Rng>(
    mean: &Array1<f64>,
    cov: &Array2<f64>,
    n_traj: usize,
    method: SamplingMethod,
    rng: &mut R,
) -> Result<Array2<f64>> {
    let n = mean.len();
    if cov.shape() != [n, n] {
        return Err(GpError::ShapeMismatch(format!(
            "covariance of shape {:?} for a mean of length {n}",
            cov.shape()
        )));
    }
    let c = match method {
        SamplingMethod::Cholesky => cov
            .cholesky()
            .map_err(|e| GpError::numerical("sample", e.to_string()))?,
        SamplingMethod::EigenValues => {
            let (v, w) = cov.to_owned().eigh_into()?;
            // We lower bound the eigenvalues at 1e-9
            let v = v.mapv(|x| if x < 1e-9 { 0. } else { x.sqrt() });
            w.dot(&Array2::from_diag(&v))
        }
    };
    let ary: Array2<f64> = Array::random_using((n, n_traj), StandardNormal, rng);
    Ok(mean.clone().insert_axis(Axis(1)) + c.dot(&ary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ExpQuad, FieldSpec, IntoKernel, KernelOptions, PairFunction, Point, Scalar, Schema,
        Solver, StructuredArray, kernel,
    };
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use finitediff::ndarr;
    use ndarray::{Array1, arr1, array};
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn expquad(scale: f64) -> Kernel {
        ExpQuad
            .into_kernel(KernelOptions::new().scale(scale))
            .unwrap()
    }

    #[test]
    fn test_addx_errors() {
        let mut gp = GaussianProcess::params(expquad(1.)).build().unwrap();
        gp.addx(arr1(&[0., 1.]), "a").unwrap();
        assert!(matches!(
            gp.addx(arr1(&[2.]), "a"),
            Err(GpError::DuplicateKey(_))
        ));
        let schema = Schema::new([FieldSpec::float("t")]).unwrap();
        let x = StructuredArray::zeros(schema, &[2]);
        assert!(matches!(gp.addx(x, "b"), Err(GpError::SchemaMismatch(_))));
        assert!(matches!(
            gp.prior_cov(&["nope"]),
            Err(GpError::KeyNotFound(_))
        ));
        assert!(matches!(
            gp.addx_deriv(arr1(&[1.]), "c", Deriv::new(1)),
            Ok(())
        ));
        let mut rough = GaussianProcess::params(
            crate::Matern12.into_kernel(KernelOptions::new()).unwrap(),
        )
        .build()
        .unwrap();
        assert!(matches!(
            rough.addx_deriv(arr1(&[1.]), "d", Deriv::new(1)),
            Err(GpError::NotDerivable(_))
        ));
    }

    #[test]
    fn test_marginal_likelihood_values() {
        let mut gp = GaussianProcess::params(expquad(1.)).build().unwrap();
        gp.addx(arr1(&[0.]), "one").unwrap();
        gp.addx(arr1(&[0., 1.]), "two").unwrap();
        let ml = gp
            .marginal_likelihood(&Observations::new().exact("one", arr1(&[2.])))
            .unwrap();
        assert_abs_diff_eq!(ml, -0.5 * (4. + (2. * PI).ln()), epsilon = 1e-10);

        let c = (-0.5f64).exp();
        let y = arr1(&[1., -1.]);
        let det = 1. - c * c;
        let quad = (y[0] * y[0] + y[1] * y[1] - 2. * c * y[0] * y[1]) / det;
        let expected = -0.5 * (quad + det.ln() + 2. * (2. * PI).ln());
        let ml = gp
            .marginal_likelihood(&Observations::new().exact("two", y))
            .unwrap();
        assert_abs_diff_eq!(ml, expected, epsilon = 1e-8);
    }

    #[test]
    fn test_marginal_likelihood_tangent() {
        let x = Array1::linspace(0., 5., 8);
        let y = x.mapv(f64::cos);
        let obs = Observations::new().exact("x", y);
        let build = |scale: f64| {
            let mut gp = GaussianProcess::params(expquad(scale)).build().unwrap();
            gp.addx(x.clone(), "x").unwrap();
            gp
        };
        let scale = 1.7;
        let h = 1e-6;
        let dk = (build(scale + h).prior_cov(&["x"]).unwrap()
            - build(scale - h).prior_cov(&["x"]).unwrap())
            / (2. * h);
        let tangent = build(scale)
            .marginal_likelihood_tangent(&obs, &dk)
            .unwrap();
        let f = |s: &Array1<f64>| -> std::result::Result<f64, anyhow::Error> {
            Ok(build(s[0]).marginal_likelihood(&obs)?)
        };
        let fd = ndarr::central_diff(&f)(&arr1(&[scale])).unwrap();
        assert_relative_eq!(tangent, fd[0], max_relative = 1e-4);
    }

    #[test]
    fn test_predfromdata_interpolates() {
        let x = arr1(&[0., 1.5, 3., 4.5]);
        let y = arr1(&[0.3, -0.2, 0.8, 0.1]);
        let mut gp = GaussianProcess::params(expquad(1.))
            .solver(Solver::Cholesky)
            .build()
            .unwrap();
        gp.addx(x.clone(), "data").unwrap();
        gp.addx(x.into_shape_with_order((2, 2)).unwrap(), "again").unwrap();
        let obs = Observations::new().exact("data", y.clone());
        let pred = gp.predfromdata(&obs, "again").unwrap();
        assert_eq!(pred.shape, vec![2, 2]);
        assert_abs_diff_eq!(pred.mean, y, epsilon = 1e-8);
        assert_abs_diff_eq!(pred.cov, Array2::zeros((4, 4)), epsilon = 1e-8);
        assert_eq!(pred.mean_shaped().unwrap().shape(), &[2, 2]);
        assert!(pred.data_cov.is_none());
    }

    #[test]
    fn test_predfromdata_uncertain() {
        let x = arr1(&[0., 1., 2.]);
        let y = arr1(&[1., 0.5, -0.5]);
        let c = Array2::from_diag(&arr1(&[0.1, 0.2, 0.1]));
        let mut gp = GaussianProcess::params(expquad(1.)).build().unwrap();
        gp.addx(x, "data").unwrap();
        gp.addx(arr1(&[0.5, 3.]), "pred").unwrap();
        let obs = Observations::new().uncertain("data", Correlated::new(y.clone(), c.clone()).unwrap());
        let pred = gp.predfromdata(&obs, "pred").unwrap();

        let kxx = gp.prior_cov(&["data"]).unwrap();
        let s = &kxx + &c;
        let kxs = {
            let all = gp.prior_cov(&["data", "pred"]).unwrap();
            all.slice(s![..3, 3..]).to_owned()
        };
        let sol = Solver::Svd.decompose(&s).unwrap();
        let a = sol.solve(kxs.view()).unwrap().t().to_owned();
        assert_abs_diff_eq!(pred.mean, a.dot(&y), epsilon = 1e-8);
        let data_cov = pred.data_cov.as_ref().unwrap();
        assert_abs_diff_eq!(*data_cov, a.dot(&c).dot(&a.t()), epsilon = 1e-8);
        let prior = gp.prior("pred").unwrap();
        assert!(
            pred.sdev()
                .iter()
                .zip(prior.sdev().iter())
                .all(|(p, q)| p <= q)
        );
    }

    #[test]
    fn test_derivative_observations() {
        // the derivative of the process is observed where the data of sin'
        // is, predictions recover sin up to a constant given one value
        let x = Array1::linspace(0., 6., 15);
        let mut gp = GaussianProcess::params(expquad(1.5)).build().unwrap();
        gp.addx_deriv(x.clone(), "dx", Deriv::new(1)).unwrap();
        gp.addx(arr1(&[0.]), "origin").unwrap();
        gp.addx(arr1(&[1., 2.]), "pred").unwrap();
        let obs = Observations::new()
            .exact("dx", x.mapv(f64::cos))
            .exact("origin", arr1(&[0.]));
        let pred = gp.predfromdata(&obs, "pred").unwrap();
        assert_abs_diff_eq!(pred.mean, arr1(&[1f64.sin(), 2f64.sin()]), epsilon = 1e-2);
    }

    #[test]
    fn test_addx_invalidates_cache() {
        let mut gp = GaussianProcess::params(expquad(1.)).build().unwrap();
        gp.addx(arr1(&[0., 1.]), "a").unwrap();
        let obs = Observations::new().exact("a", arr1(&[1., 1.]));
        let ml1 = gp.marginal_likelihood(&obs).unwrap();
        gp.addx(arr1(&[0.5]), "b").unwrap();
        assert_eq!(gp.prior_cov(&["a", "b"]).unwrap().shape(), &[3, 3]);
        let ml2 = gp.marginal_likelihood(&obs).unwrap();
        assert_abs_diff_eq!(ml1, ml2, epsilon = 1e-12);
    }

    #[test]
    fn test_observation_errors() {
        let mut gp = GaussianProcess::params(expquad(1.)).build().unwrap();
        gp.addx(arr1(&[0., 1.]), "a").unwrap();
        let bad_shape = Observations::new().exact("a", arr1(&[1., 2., 3.]));
        assert!(matches!(
            gp.marginal_likelihood(&bad_shape),
            Err(GpError::ShapeMismatch(_))
        ));
        let unknown = Observations::new().exact("b", arr1(&[1.]));
        assert!(matches!(
            gp.marginal_likelihood(&unknown),
            Err(GpError::KeyNotFound(_))
        ));
        assert!(gp.marginal_likelihood(&Observations::new()).is_err());
        let ok = Observations::new().exact("a", arr1(&[1., 2.]));
        assert!(matches!(
            gp.marginal_likelihood_tangent(&ok, &Array2::zeros((3, 3))),
            Err(GpError::ShapeMismatch(_))
        ));
    }

    /// Squared distance, symmetric but not positive
    struct Distance;
    impl PairFunction for Distance {
        fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
            Ok(x.squared_distance(y))
        }
    }

    /// First argument only, not symmetric
    struct Left;
    impl PairFunction for Left {
        fn call<T: Scalar>(&self, x: &Point<T>, _y: &Point<T>) -> Result<T> {
            Ok(x.scalar()?.clone())
        }
    }

    #[test]
    fn test_prior_checks() {
        let x = arr1(&[0., 1., 2.]);
        let mut gp = GaussianProcess::params(kernel(Distance, KernelOptions::new()).unwrap())
            .build()
            .unwrap();
        gp.addx(x.clone(), "a").unwrap();
        assert!(matches!(
            gp.prior_cov(&["a"]),
            Err(GpError::NumericalError { .. })
        ));

        let mut gp = GaussianProcess::params(kernel(Distance, KernelOptions::new()).unwrap())
            .checkpos(false)
            .build()
            .unwrap();
        gp.addx(x.clone(), "a").unwrap();
        assert!(gp.prior_cov(&["a"]).is_ok());

        let mut gp = GaussianProcess::params(kernel(Left, KernelOptions::new()).unwrap())
            .checkpos(false)
            .build()
            .unwrap();
        gp.addx(x, "a").unwrap();
        assert!(matches!(
            gp.prior_cov(&["a"]),
            Err(GpError::NumericalError { .. })
        ));
    }

    #[test]
    fn test_sampling() {
        let xdoe = array![-8.5, -4.0, -3.0, -1.0, 4.0, 7.5];
        let ydoe = xdoe.mapv(|v: f64| v * v.sin());
        let mut gp = GaussianProcess::params(expquad(2.)).build().unwrap();
        gp.addx(xdoe, "doe").unwrap();
        let n_plot = 35;
        let n_traj = 10;
        gp.addx(Array1::linspace(-10., 10., n_plot), "plot").unwrap();
        let pred = gp
            .predfromdata(&Observations::new().exact("doe", ydoe), "plot")
            .unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let trajs = gp
            .sample_posterior(&pred, n_traj, SamplingMethod::EigenValues, &mut rng)
            .unwrap();
        assert_eq!(&[n_plot, n_traj], trajs.shape());
        assert!(!trajs.fold(false, |acc, v| acc || v.is_nan()));

        let prior = gp
            .sample_prior("doe", 3, SamplingMethod::Cholesky, &mut rng)
            .unwrap();
        assert_eq!(&[6, 3], prior.shape());
    }
}
