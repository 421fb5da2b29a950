//! A library of usual covariance kernels.
//!
//! Each entry is a small parameter struct implementing [`IsotropicFunction`]
//! or [`PairFunction`], turned into a [`Kernel`] with
//! [`IntoKernel::into_kernel`]:
//!
//! ```
//! use epigp_gp::{ExpQuad, IntoKernel, KernelOptions, Matern};
//!
//! let k = ExpQuad.into_kernel(KernelOptions::new().scale(3.)).unwrap()
//!     + Matern::new(1.5).unwrap().into_kernel(KernelOptions::new()).unwrap();
//! assert_eq!(k.derivable(), (1, 1));
//! ```
//!
//! Isotropic kernels are normalized to unit variance and roughly unit
//! length scale. See Rasmussen & Williams (2006), *Gaussian Processes for
//! Machine Learning*, chapter 4.

use crate::errors::{GpError, Result};
use crate::jet::Scalar;
use crate::kernel::{
    InputMode, IsotropicFunction, Kernel, KernelOptions, PairFunction, Point, isotropic_kernel,
    kernel,
};
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fmt;

/// Conversion of a kernel function into a [`Kernel`]
pub trait IntoKernel {
    /// Build the kernel with the given input options
    fn into_kernel(self, options: KernelOptions) -> Result<Kernel>;
}

macro_rules! impl_into_kernel {
    (isotropic: $($name:ty),*) => {
        $(impl IntoKernel for $name {
            fn into_kernel(self, options: KernelOptions) -> Result<Kernel> {
                isotropic_kernel(self, options)
            }
        })*
    };
    (pair: $($name:ty),*) => {
        $(impl IntoKernel for $name {
            fn into_kernel(self, options: KernelOptions) -> Result<Kernel> {
                kernel(self, options)
            }
        })*
    };
}

fn check_positive(kernel: &str, name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0. {
        return Err(GpError::InvalidValueError(format!(
            "{kernel}: {name} should be finite and positive, got {value}"
        )));
    }
    Ok(())
}

/// Constant kernel `k = 1`, equivalent to fitting a constant
#[derive(Clone, Copy, Debug, Default)]
pub struct Constant;

impl IsotropicFunction for Constant {
    fn call<T: Scalar>(&self, _r2: T) -> T {
        T::constant(1.)
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "Constant".to_string()
    }
}

/// White noise: 1 on coincident points, 0 elsewhere
#[derive(Clone, Copy, Debug, Default)]
pub struct White;

impl IsotropicFunction for White {
    fn call<T: Scalar>(&self, r2: T) -> T {
        T::constant(if r2.value() == 0. { 1. } else { 0. })
    }
    fn name(&self) -> String {
        "White".to_string()
    }
}

/// Squared exponential (gaussian) kernel `exp(-r^2 / 2)`
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpQuad;

impl IsotropicFunction for ExpQuad {
    fn call<T: Scalar>(&self, r2: T) -> T {
        (r2 * -0.5).exp()
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "ExpQuad".to_string()
    }
}

/// Closed form Matérn function for `nu = p + 1/2`
fn maternp<T: Scalar>(x: T, p: usize) -> T {
    let fact = |n: usize| (1..=n).fold(1., |acc, k| acc * k as f64);
    let mut poly = T::constant(0.);
    for i in 0..=p {
        let c = fact(p + i) / (fact(i) * fact(p - i));
        poly = poly + (x.clone() * 2.).powi((p - i) as i32) * c;
    }
    (-x).exp() * poly * (fact(p) / fact(2 * p))
}

/// Matérn kernel of real order `nu > 0`:
///
/// `2^(1 - nu) / Gamma(nu) x^nu K_nu(x)` with `x = sqrt(2 nu) r`.
///
/// The process is `ceil(nu) - 1` times differentiable. Half integer orders
/// use the closed form.
#[derive(Clone, Copy, Debug)]
pub struct Matern {
    nu: f64,
}

impl Matern {
    /// Matérn kernel of order `nu`
    pub fn new(nu: f64) -> Result<Self> {
        check_positive("Matern", "nu", nu)?;
        Ok(Matern { nu })
    }

    /// Order of the kernel
    pub fn nu(&self) -> f64 {
        self.nu
    }

    fn half_integer(&self) -> Option<usize> {
        let p = self.nu - 0.5;
        (p >= 0. && p.fract() == 0. && p < 100.).then_some(p as usize)
    }
}

impl IsotropicFunction for Matern {
    fn call<T: Scalar>(&self, r: T) -> T {
        let x = r * (2. * self.nu).sqrt();
        match self.half_integer() {
            Some(p) => maternp(x, p),
            None => {
                let norm = 2f64.powf(1. - self.nu) / libm::tgamma(self.nu);
                x.powf(self.nu) * x.bessel_k(self.nu) * norm
            }
        }
    }
    fn input(&self) -> InputMode {
        InputMode::Soft
    }
    fn derivable(&self) -> usize {
        (self.nu.ceil() as usize).saturating_sub(1)
    }
    fn name(&self) -> String {
        format!("Matern(nu={})", self.nu)
    }
}

/// Matérn kernel with `nu = 1/2`: `exp(-r)`
#[derive(Clone, Copy, Debug, Default)]
pub struct Matern12;

impl IsotropicFunction for Matern12 {
    fn call<T: Scalar>(&self, r: T) -> T {
        (-r).exp()
    }
    fn input(&self) -> InputMode {
        InputMode::Soft
    }
    fn name(&self) -> String {
        "Matern12".to_string()
    }
}

/// Matérn kernel with `nu = 3/2`: `(1 + x) exp(-x)`, `x = sqrt(3) r`
#[derive(Clone, Copy, Debug, Default)]
pub struct Matern32;

impl IsotropicFunction for Matern32 {
    fn call<T: Scalar>(&self, r: T) -> T {
        let x = r * 3f64.sqrt();
        (x.clone() + 1.) * (-x).exp()
    }
    fn input(&self) -> InputMode {
        InputMode::Soft
    }
    fn derivable(&self) -> usize {
        1
    }
    fn name(&self) -> String {
        "Matern32".to_string()
    }
}

/// Matérn kernel with `nu = 5/2`: `(1 + x + x^2 / 3) exp(-x)`, `x = sqrt(5) r`
#[derive(Clone, Copy, Debug, Default)]
pub struct Matern52;

impl IsotropicFunction for Matern52 {
    fn call<T: Scalar>(&self, r: T) -> T {
        let x = r * 5f64.sqrt();
        (x.clone() + x.clone() * x.clone() / 3. + 1.) * (-x).exp()
    }
    fn input(&self) -> InputMode {
        InputMode::Soft
    }
    fn derivable(&self) -> usize {
        2
    }
    fn name(&self) -> String {
        "Matern52".to_string()
    }
}

/// Gamma exponential kernel `exp(-r^gamma)`, `0 < gamma <= 2`.
///
/// Only `gamma = 2` is differentiable.
#[derive(Clone, Copy, Debug)]
pub struct GammaExp {
    gamma: f64,
}

impl GammaExp {
    /// Gamma exponential kernel of exponent `gamma`
    pub fn new(gamma: f64) -> Result<Self> {
        if !(gamma > 0. && gamma <= 2.) {
            return Err(GpError::InvalidValueError(format!(
                "GammaExp: gamma should be in (0, 2], got {gamma}"
            )));
        }
        Ok(GammaExp { gamma })
    }
}

impl IsotropicFunction for GammaExp {
    fn call<T: Scalar>(&self, r: T) -> T {
        (-r.powf(self.gamma)).exp()
    }
    fn input(&self) -> InputMode {
        InputMode::Soft
    }
    fn derivable(&self) -> usize {
        if self.gamma == 2. { usize::MAX } else { 0 }
    }
    fn name(&self) -> String {
        format!("GammaExp(gamma={})", self.gamma)
    }
}

/// Rational quadratic kernel `(1 + r^2 / (2 alpha))^-alpha`, a scale mixture
/// of gaussian kernels
#[derive(Clone, Copy, Debug)]
pub struct RatQuad {
    alpha: f64,
}

impl RatQuad {
    /// Rational quadratic kernel of shape `alpha > 0`
    pub fn new(alpha: f64) -> Result<Self> {
        check_positive("RatQuad", "alpha", alpha)?;
        Ok(RatQuad { alpha })
    }
}

impl IsotropicFunction for RatQuad {
    fn call<T: Scalar>(&self, r2: T) -> T {
        (r2 / (2. * self.alpha) + 1.).powf(-self.alpha)
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        format!("RatQuad(alpha={})", self.alpha)
    }
}

/// Linear kernel `x . y`, equivalent to fitting a line through the origin
#[derive(Clone, Copy, Debug, Default)]
pub struct Linear;

impl PairFunction for Linear {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        Ok(x.dot(y))
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "Linear".to_string()
    }
}

/// Polynomial kernel `(x . y + sigma0^2)^exponent`, equivalent to fitting a
/// polynomial of degree `exponent`
#[derive(Clone, Copy, Debug)]
pub struct Polynomial {
    exponent: u32,
    sigma0: f64,
}

impl Polynomial {
    /// Polynomial kernel of degree `exponent` and offset `sigma0`
    pub fn new(exponent: u32, sigma0: f64) -> Result<Self> {
        if !sigma0.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "Polynomial: sigma0 should be finite, got {sigma0}"
            )));
        }
        Ok(Polynomial { exponent, sigma0 })
    }
}

impl PairFunction for Polynomial {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        Ok((x.dot(y) + self.sigma0 * self.sigma0).powi(self.exponent as i32))
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        format!("Polynomial(exponent={})", self.exponent)
    }
}

/// Kernel of a neural network with one infinite hidden layer of sigmoid units
///
/// `2/pi asin(2 (s + x.y) / sqrt((1 + 2 (s + x.x)) (1 + 2 (s + y.y))))`,
/// `s = sigma0^2`.
#[derive(Clone, Copy, Debug)]
pub struct NNKernel {
    sigma0: f64,
}

impl NNKernel {
    /// Neural network kernel with bias scale `sigma0 > 0`
    pub fn new(sigma0: f64) -> Result<Self> {
        check_positive("NNKernel", "sigma0", sigma0)?;
        Ok(NNKernel { sigma0 })
    }
}

impl Default for NNKernel {
    fn default() -> Self {
        NNKernel { sigma0: 1. }
    }
}

impl PairFunction for NNKernel {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let s = self.sigma0 * self.sigma0;
        let nx = (x.dot(x) + s) * 2. + 1.;
        let ny = (y.dot(y) + s) * 2. + 1.;
        let arg = (x.dot(y) + s) * 2. / (nx * ny).sqrt();
        Ok(arg.asin() * (2. / PI))
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "NNKernel".to_string()
    }
}

/// Wiener process (random walk) kernel `min(x, y)` for `x, y >= 0`
#[derive(Clone, Copy, Debug, Default)]
pub struct Wiener;

impl PairFunction for Wiener {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let (x, y) = (x.scalar()?, y.scalar()?);
        if x.value() < 0. || y.value() < 0. {
            return Err(GpError::InvalidValueError(format!(
                "Wiener: inputs should be non negative, got {} and {}",
                x.value(),
                y.value()
            )));
        }
        Ok(if x.value() <= y.value() {
            x.clone()
        } else {
            y.clone()
        })
    }
    fn forcekron(&self) -> bool {
        true
    }
    fn name(&self) -> String {
        "Wiener".to_string()
    }
}

/// A positive length scale varying along the input, used by [`Gibbs`]
pub trait ScaleFunction: Send + Sync + 'static {
    /// Length scale at `x`
    fn call<T: Scalar>(&self, x: T) -> T;
}

/// A constant length scale
impl ScaleFunction for f64 {
    fn call<T: Scalar>(&self, _x: T) -> T {
        T::constant(*self)
    }
}

/// Gaussian kernel with a variable length scale `s(x)`:
///
/// `sqrt(2 s(x) s(y) / (s(x)^2 + s(y)^2)) exp(-(x - y)^2 / (s(x)^2 + s(y)^2))`
#[derive(Clone, Copy, Debug)]
pub struct Gibbs<S: ScaleFunction = f64> {
    scalefun: S,
}

impl<S: ScaleFunction> Gibbs<S> {
    /// Gibbs kernel with length scale function `scalefun`
    pub fn new(scalefun: S) -> Self {
        Gibbs { scalefun }
    }
}

impl Default for Gibbs<f64> {
    fn default() -> Self {
        Gibbs { scalefun: 1. }
    }
}

impl<S: ScaleFunction> PairFunction for Gibbs<S> {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let (x, y) = (x.scalar()?, y.scalar()?);
        let sx = self.scalefun.call(x.clone());
        let sy = self.scalefun.call(y.clone());
        if !(sx.value() > 0. && sy.value() > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "Gibbs: length scale should be positive, got {} and {}",
                sx.value(),
                sy.value()
            )));
        }
        let denom = sx.clone() * sx.clone() + sy.clone() * sy.clone();
        let factor = (sx * sy * 2. / denom.clone()).sqrt();
        let d = x.clone() - y.clone();
        Ok(factor * (-(d.clone() * d) / denom).exp())
    }
    fn forcekron(&self) -> bool {
        true
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "Gibbs".to_string()
    }
}

/// Periodic gaussian kernel `exp(-2 (sin((x - y) / 2) / outerscale)^2)`, of
/// period `2 pi`
#[derive(Clone, Copy, Debug)]
pub struct Periodic {
    outerscale: f64,
}

impl Periodic {
    /// Periodic kernel with length scale `outerscale > 0` within one period
    pub fn new(outerscale: f64) -> Result<Self> {
        check_positive("Periodic", "outerscale", outerscale)?;
        Ok(Periodic { outerscale })
    }
}

impl Default for Periodic {
    fn default() -> Self {
        Periodic { outerscale: 1. }
    }
}

impl PairFunction for Periodic {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let (x, y) = (x.scalar()?, y.scalar()?);
        let s = ((x.clone() - y.clone()) / 2.).sin() / self.outerscale;
        Ok((s.clone() * s * -2.).exp())
    }
    fn forcekron(&self) -> bool {
        true
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "Periodic".to_string()
    }
}

/// Arbitrary covariance `cov[x, y]` over the integer categories `0..n`
#[derive(Clone, Debug)]
pub struct Categorical {
    cov: Array2<f64>,
}

impl Categorical {
    /// Categorical kernel with the given symmetric covariance matrix
    pub fn new(cov: Array2<f64>) -> Result<Self> {
        if cov.nrows() != cov.ncols() || cov.is_empty() {
            return Err(GpError::InvalidValueError(format!(
                "Categorical: covariance should be a non empty square matrix, got {:?}",
                cov.shape()
            )));
        }
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(
                "Categorical: covariance contains non finite values".to_string(),
            ));
        }
        let asym = (&cov - &cov.t()).mapv(f64::abs).fold(0., |a: f64, &b| a.max(b));
        if asym > 1e-12 * cov.mapv(f64::abs).fold(0., |a: f64, &b| a.max(b)) {
            return Err(GpError::InvalidValueError(
                "Categorical: covariance should be symmetric".to_string(),
            ));
        }
        Ok(Categorical { cov })
    }

    fn category(&self, v: f64) -> Result<usize> {
        let n = self.cov.nrows();
        if v.fract() != 0. || v < 0. || v >= n as f64 {
            return Err(GpError::InvalidValueError(format!(
                "Categorical: input {v} is not a category in 0..{n}"
            )));
        }
        Ok(v as usize)
    }
}

impl PairFunction for Categorical {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let i = self.category(x.scalar()?.value())?;
        let j = self.category(y.scalar()?.value())?;
        Ok(T::constant(self.cov[[i, j]]))
    }
    fn forcekron(&self) -> bool {
        true
    }
    fn name(&self) -> String {
        "Categorical".to_string()
    }
}

/// Cosine kernel `cos(x - y)`, a single periodic mode of period `2 pi`
#[derive(Clone, Copy, Debug, Default)]
pub struct Cos;

impl PairFunction for Cos {
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        Ok((x.scalar()?.clone() - y.scalar()?.clone()).cos())
    }
    fn forcekron(&self) -> bool {
        true
    }
    fn derivable(&self) -> usize {
        usize::MAX
    }
    fn name(&self) -> String {
        "Cos".to_string()
    }
}

impl_into_kernel!(isotropic: Constant, White, ExpQuad, Matern, Matern12, Matern32, Matern52, GammaExp, RatQuad);
impl_into_kernel!(pair: Linear, Polynomial, NNKernel, Wiener, Periodic, Categorical, Cos);

impl<S: ScaleFunction> IntoKernel for Gibbs<S> {
    fn into_kernel(self, options: KernelOptions) -> Result<Kernel> {
        kernel(self, options)
    }
}

/// Named parameters handed to [`KernelCatalog`] factories
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CatalogParams {
    values: HashMap<String, f64>,
    cov: Option<Array2<f64>>,
}

impl CatalogParams {
    /// No parameter
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a scalar parameter
    pub fn set(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Set the covariance matrix of a categorical kernel
    pub fn cov(mut self, cov: Array2<f64>) -> Self {
        self.cov = Some(cov);
        self
    }

    /// Scalar parameter value
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    fn get_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).unwrap_or(default)
    }

    fn require(&self, kernel: &str, name: &str) -> Result<f64> {
        self.get(name).ok_or_else(|| {
            GpError::InvalidValueError(format!("{kernel}: missing parameter `{name}`"))
        })
    }
}

/// Factory building a catalog kernel from its parameters and input options
pub type KernelFactory = fn(&CatalogParams, KernelOptions) -> Result<Kernel>;

/// Immutable mapping from kernel names to factories
#[derive(Clone)]
pub struct KernelCatalog {
    factories: BTreeMap<String, KernelFactory>,
}

impl KernelCatalog {
    /// Catalog of every kernel of this module, keyed by type name
    pub fn standard() -> Self {
        let entries: [(&str, KernelFactory); 17] = [
            ("Constant", |_, o| Constant.into_kernel(o)),
            ("White", |_, o| White.into_kernel(o)),
            ("ExpQuad", |_, o| ExpQuad.into_kernel(o)),
            ("Linear", |_, o| Linear.into_kernel(o)),
            ("Polynomial", |p, o| {
                let exponent = p.require("Polynomial", "exponent")?;
                if exponent < 0. || exponent.fract() != 0. || exponent > u32::MAX as f64 {
                    return Err(GpError::InvalidValueError(format!(
                        "Polynomial: exponent should be a non negative integer, got {exponent}"
                    )));
                }
                Polynomial::new(exponent as u32, p.get_or("sigma0", 1.))?.into_kernel(o)
            }),
            ("Matern", |p, o| {
                Matern::new(p.require("Matern", "nu")?)?.into_kernel(o)
            }),
            ("Matern12", |_, o| Matern12.into_kernel(o)),
            ("Matern32", |_, o| Matern32.into_kernel(o)),
            ("Matern52", |_, o| Matern52.into_kernel(o)),
            ("GammaExp", |p, o| {
                GammaExp::new(p.get_or("gamma", 1.))?.into_kernel(o)
            }),
            ("RatQuad", |p, o| {
                RatQuad::new(p.get_or("alpha", 2.))?.into_kernel(o)
            }),
            ("NNKernel", |p, o| {
                NNKernel::new(p.get_or("sigma0", 1.))?.into_kernel(o)
            }),
            ("Wiener", |_, o| Wiener.into_kernel(o)),
            ("Gibbs", |p, o| {
                let width = p.get_or("width", 1.);
                check_positive("Gibbs", "width", width)?;
                Gibbs::new(width).into_kernel(o)
            }),
            ("Periodic", |p, o| {
                Periodic::new(p.get_or("outerscale", 1.))?.into_kernel(o)
            }),
            ("Categorical", |p, o| {
                let cov = p.cov.clone().ok_or_else(|| {
                    GpError::InvalidValueError("Categorical: missing covariance".to_string())
                })?;
                Categorical::new(cov)?.into_kernel(o)
            }),
            ("Cos", |_, o| Cos.into_kernel(o)),
        ];
        KernelCatalog {
            factories: entries
                .into_iter()
                .map(|(name, f)| (name.to_string(), f))
                .collect(),
        }
    }

    /// A new catalog with one more (or a replaced) entry
    pub fn with(&self, name: impl Into<String>, factory: KernelFactory) -> Self {
        let mut factories = self.factories.clone();
        factories.insert(name.into(), factory);
        KernelCatalog { factories }
    }

    /// Registered names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the kernel registered as `name`
    pub fn build(&self, name: &str, params: &CatalogParams, options: KernelOptions) -> Result<Kernel> {
        let factory = self.factories.get(name).ok_or_else(|| {
            GpError::InvalidValueError(format!("unknown kernel `{name}`"))
        })?;
        factory(params, options)
    }
}

impl fmt::Debug for KernelCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
