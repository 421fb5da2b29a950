//! Covariance kernel algebra.
//!
//! A [`Kernel`] is an immutable, cheaply clonable description of a covariance
//! function `k(x, y) = Cov[f(x), f(y)]`. Leaves are built from user functions
//! with [`kernel`] (a function of the two points) or [`isotropic_kernel`] (a
//! function of the squared or soft distance) and are then combined with `+`,
//! `*`, scalar shifts and scales, powers and derivatives.
//!
//! Kernel functions are written once, generically over [`Scalar`], so that the
//! derivative kernels returned by [`Kernel::diff`] are computed by forward
//! automatic differentiation of the very same code.
//!
//! ```
//! use epigp_gp::{isotropic_kernel, IsotropicFunction, KernelOptions, Scalar};
//! use ndarray::array;
//!
//! struct Cauchy;
//! impl IsotropicFunction for Cauchy {
//!     fn call<T: Scalar>(&self, r2: T) -> T {
//!         (r2 + 1.).powf(-1.)
//!     }
//!     fn derivable(&self) -> usize {
//!         usize::MAX
//!     }
//! }
//!
//! let k = isotropic_kernel(Cauchy, KernelOptions::new().scale(2.)).unwrap();
//! let x = array![0., 1., 2.];
//! let cov = k.matrix(&x.clone().into(), &x.into()).unwrap();
//! assert_eq!(cov[[0, 0]], 1.);
//! assert_eq!(cov[[0, 2]], 0.5);
//!
//! let dk = k.diff(1, 1, None, None).unwrap();
//! assert!(dk.matrix(&array![0.].into(), &array![0.].into()).unwrap()[[0, 0]] > 0.);
//! ```

use crate::errors::{GpError, Result};
use crate::jet::{Jet, Scalar, ScalarRepr};
use crate::structured::{Points, Schema};
use ndarray::{Array2, ArrayD, Ix2, IxDyn};
use rayon::prelude::*;
use std::fmt;
use std::ops::{Add, Mul};
use std::str::FromStr;
use std::sync::Arc;

/// One input location as seen by kernel functions
#[derive(Clone, Debug, PartialEq)]
pub enum Point<T> {
    /// A scalar coordinate
    Scalar(T),
    /// The components of a field with a sub-shape, flattened row-major
    Vector(Vec<T>),
    /// The fields of a structured input, in schema order
    Record(Vec<Point<T>>),
}

impl<T: Scalar> Point<T> {
    /// The coordinate of a scalar point
    pub fn scalar(&self) -> Result<&T> {
        match self {
            Point::Scalar(v) => Ok(v),
            _ => Err(GpError::ShapeMismatch(
                "expected a scalar input, use `dim` or `forcekron` with structured inputs"
                    .to_string(),
            )),
        }
    }

    /// All the scalar components, fields being concatenated
    pub fn components(&self) -> Vec<&T> {
        let mut out = Vec::new();
        self.collect_components(&mut out);
        out
    }

    fn collect_components<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Point::Scalar(v) => out.push(v),
            Point::Vector(vs) => out.extend(vs.iter()),
            Point::Record(fields) => fields.iter().for_each(|f| f.collect_components(out)),
        }
    }

    /// Euclidean inner product `sum_k x_k y_k` over all components
    pub fn dot(&self, other: &Point<T>) -> T {
        self.components()
            .into_iter()
            .zip(other.components())
            .fold(T::constant(0.), |acc, (a, b)| acc + a.clone() * b.clone())
    }

    /// Squared Euclidean distance over all components
    pub fn squared_distance(&self, other: &Point<T>) -> T {
        self.components()
            .into_iter()
            .zip(other.components())
            .fold(T::constant(0.), |acc, (a, b)| {
                let d = a.clone() - b.clone();
                acc + d.clone() * d
            })
    }

    /// Apply `f` to every component
    pub fn map<U: Scalar>(&self, f: &impl Fn(&T) -> U) -> Point<U> {
        match self {
            Point::Scalar(v) => Point::Scalar(f(v)),
            Point::Vector(vs) => Point::Vector(vs.iter().map(f).collect()),
            Point::Record(fields) => Point::Record(fields.iter().map(|p| p.map(f)).collect()),
        }
    }

    fn field(&self, index: usize) -> Result<&Point<T>> {
        match self {
            Point::Record(fields) => fields.get(index).ok_or_else(|| {
                GpError::FieldNotFound(format!("field index {index} out of record"))
            }),
            _ => Err(GpError::FieldNotFound(
                "field selection on a plain input".to_string(),
            )),
        }
    }
}

/// How an isotropic kernel function receives the distance between points
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputMode {
    /// The squared euclidean distance `q = |x - y|^2`
    #[default]
    Squared,
    /// The distance softened around zero `sqrt(q + eps^2)`, with `eps` the
    /// machine epsilon, so that it stays differentiable
    Soft,
}

impl FromStr for InputMode {
    type Err = GpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "squared" => Ok(InputMode::Squared),
            "soft" => Ok(InputMode::Soft),
            other => Err(GpError::InvalidValueError(format!(
                "input mode should be 'squared' or 'soft', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMode::Squared => write!(f, "squared"),
            InputMode::Soft => write!(f, "soft"),
        }
    }
}

/// A covariance function of the distance between two points.
///
/// The result at zero distance should be 1.
pub trait IsotropicFunction: Send + Sync + 'static {
    /// Evaluate at squared distance (or soft distance, see [`InputMode`])
    fn call<T: Scalar>(&self, r: T) -> T;

    /// Expected input
    fn input(&self) -> InputMode {
        InputMode::Squared
    }

    /// Number of times the kernel can be differentiated in each argument
    fn derivable(&self) -> usize {
        0
    }

    /// Name shown in debug output
    fn name(&self) -> String {
        "Isotropic".to_string()
    }
}

/// A covariance function of two points
pub trait PairFunction: Send + Sync + 'static {
    /// Evaluate `Cov[f(x), f(y)]`
    fn call<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T>;

    /// Whether structured inputs are handled field by field, multiplying the
    /// results, instead of passing whole records
    fn forcekron(&self) -> bool {
        false
    }

    /// Number of times the kernel can be differentiated in each argument
    fn derivable(&self) -> usize {
        0
    }

    /// Name shown in debug output
    fn name(&self) -> String {
        "Kernel".to_string()
    }
}

trait ErasedIsotropic: Send + Sync {
    fn call_f64(&self, r: f64) -> f64;
    fn call_jet(&self, r: Jet) -> Jet;
}

impl<F: IsotropicFunction> ErasedIsotropic for F {
    fn call_f64(&self, r: f64) -> f64 {
        self.call(r)
    }
    fn call_jet(&self, r: Jet) -> Jet {
        self.call(r)
    }
}

trait ErasedPair: Send + Sync {
    fn call_f64(&self, x: &Point<f64>, y: &Point<f64>) -> Result<f64>;
    fn call_jet(&self, x: &Point<Jet>, y: &Point<Jet>) -> Result<Jet>;
}

impl<F: PairFunction> ErasedPair for F {
    fn call_f64(&self, x: &Point<f64>, y: &Point<f64>) -> Result<f64> {
        self.call(x, y)
    }
    fn call_jet(&self, x: &Point<Jet>, y: &Point<Jet>) -> Result<Jet> {
        self.call(x, y)
    }
}

fn is_perturbed<T: Scalar>(v: &T) -> bool {
    matches!(v.clone().into_repr(), ScalarRepr::Jet(j) if j.order().is_some())
}

fn as_jet<T: Scalar>(v: &T) -> Jet {
    Jet::from_repr(v.clone().into_repr())
}

fn as_f64<T: Scalar>(v: &T) -> f64 {
    v.value()
}

/// Options shared by every kernel leaf.
///
/// The input transformation order is: field selection with `dim`, then
/// `(x - loc) / scale`, then the kernel function.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelOptions {
    dim: Option<String>,
    loc: f64,
    scale: f64,
    forcekron: bool,
    input: Option<InputMode>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            dim: None,
            loc: 0.,
            scale: 1.,
            forcekron: false,
            input: None,
        }
    }
}

impl KernelOptions {
    /// Default options: all fields, no shift, unit scale
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the kernel to one field of structured inputs
    pub fn dim(mut self, dim: impl Into<String>) -> Self {
        self.dim = Some(dim.into());
        self
    }

    /// Input shift
    pub fn loc(mut self, loc: f64) -> Self {
        self.loc = loc;
        self
    }

    /// Input scale
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Apply the kernel field by field on structured inputs and multiply
    pub fn forcekron(mut self, forcekron: bool) -> Self {
        self.forcekron = forcekron;
        self
    }

    /// Override the input mode of an isotropic kernel
    pub fn input(mut self, input: InputMode) -> Self {
        self.input = Some(input);
        self
    }

    /// Selected field
    pub fn get_dim(&self) -> Option<&str> {
        self.dim.as_deref()
    }

    /// Input shift
    pub fn get_loc(&self) -> f64 {
        self.loc
    }

    /// Input scale
    pub fn get_scale(&self) -> f64 {
        self.scale
    }

    fn check(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0. {
            return Err(GpError::InvalidValueError(format!(
                "scale should be finite and positive, got {}",
                self.scale
            )));
        }
        if !self.loc.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "loc should be finite, got {}",
                self.loc
            )));
        }
        if self.dim.as_deref() == Some("") {
            return Err(GpError::InvalidValueError(
                "dim should be a non empty field name".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
enum LeafFunction {
    Isotropic {
        f: Arc<dyn ErasedIsotropic>,
        input: InputMode,
    },
    Pair(Arc<dyn ErasedPair>),
}

#[derive(Clone)]
struct Leaf {
    name: String,
    function: LeafFunction,
    options: KernelOptions,
    forcekron: bool,
}

impl Leaf {
    fn transform<T: Scalar>(&self, p: &Point<T>) -> Point<T> {
        let (loc, scale) = (self.options.loc, self.options.scale);
        if loc == 0. && scale == 1. {
            p.clone()
        } else {
            p.map(&|v: &T| (v.clone() - loc) / scale)
        }
    }

    fn apply<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        match &self.function {
            LeafFunction::Isotropic { f, input } => {
                let mut r = x.squared_distance(y);
                if *input == InputMode::Soft {
                    r = (r + f64::EPSILON * f64::EPSILON).sqrt();
                }
                Ok(if is_perturbed(&r) {
                    T::from_repr(ScalarRepr::Jet(f.call_jet(as_jet(&r))))
                } else {
                    T::from_repr(ScalarRepr::Real(f.call_f64(r.value())))
                })
            }
            LeafFunction::Pair(f) => {
                let perturbed = x
                    .components()
                    .into_iter()
                    .chain(y.components())
                    .any(|v| is_perturbed(v));
                if perturbed {
                    let v = f.call_jet(&x.map(&as_jet::<T>), &y.map(&as_jet::<T>))?;
                    Ok(T::from_repr(ScalarRepr::Jet(v)))
                } else {
                    let v = f.call_f64(&x.map(&as_f64::<T>), &y.map(&as_f64::<T>))?;
                    Ok(T::from_repr(ScalarRepr::Real(v)))
                }
            }
        }
    }

    fn eval<T: Scalar>(&self, field: Option<usize>, x: &Point<T>, y: &Point<T>) -> Result<T> {
        let (x, y) = match field {
            Some(i) => (x.field(i)?, y.field(i)?),
            None => (x, y),
        };
        let (x, y) = (self.transform(x), self.transform(y));
        match (&x, &y) {
            (Point::Record(xf), Point::Record(yf)) if self.forcekron => {
                xf.iter()
                    .zip(yf.iter())
                    .try_fold(T::constant(1.), |acc, (a, b)| Ok(acc * self.apply(a, b)?))
            }
            _ => self.apply(&x, &y),
        }
    }
}

#[derive(Clone)]
enum Node {
    Leaf(Leaf),
    Sum(Kernel, Kernel),
    Product(Kernel, Kernel),
    AddScalar(Kernel, f64),
    Scale(Kernel, f64),
    Power(Kernel, f64),
    Diff {
        kernel: Kernel,
        xorder: usize,
        yorder: usize,
        xdim: Option<String>,
        ydim: Option<String>,
    },
}

/// A covariance kernel.
///
/// Kernels are immutable: every operation returns a new kernel sharing the
/// operands, so cloning is cheap and kernels can be shared across threads
/// and Gaussian processes.
#[derive(Clone)]
pub struct Kernel {
    node: Arc<Node>,
    derivable: (usize, usize),
    isotropic: bool,
}

/// Build a kernel from a function of two points
pub fn kernel<F: PairFunction>(f: F, options: KernelOptions) -> Result<Kernel> {
    options.check()?;
    let derivable = f.derivable();
    let leaf = Leaf {
        name: f.name(),
        forcekron: options.forcekron || f.forcekron(),
        function: LeafFunction::Pair(Arc::new(f)),
        options,
    };
    Ok(Kernel {
        node: Arc::new(Node::Leaf(leaf)),
        derivable: (derivable, derivable),
        isotropic: false,
    })
}

/// Build an isotropic kernel from a function of the squared (or soft) distance
pub fn isotropic_kernel<F: IsotropicFunction>(f: F, options: KernelOptions) -> Result<Kernel> {
    options.check()?;
    let derivable = f.derivable();
    let input = options.input.unwrap_or_else(|| f.input());
    let leaf = Leaf {
        name: f.name(),
        forcekron: options.forcekron,
        function: LeafFunction::Isotropic {
            f: Arc::new(f),
            input,
        },
        options,
    };
    Ok(Kernel {
        node: Arc::new(Node::Leaf(leaf)),
        derivable: (derivable, derivable),
        isotropic: true,
    })
}

fn check_scalar(what: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0. {
        return Err(GpError::InvalidValueError(format!(
            "{what} should be finite and non negative, got {value}"
        )));
    }
    Ok(())
}

impl Kernel {
    fn wrap(&self, node: Node, derivable: (usize, usize), isotropic: bool) -> Kernel {
        Kernel {
            node: Arc::new(node),
            derivable,
            isotropic,
        }
    }

    /// Number of derivatives available with respect to the first and the
    /// second argument, `usize::MAX` meaning unlimited
    pub fn derivable(&self) -> (usize, usize) {
        self.derivable
    }

    /// Whether the kernel depends only on the distance between points
    pub fn is_isotropic(&self) -> bool {
        self.isotropic
    }

    /// `k + c` for a finite non negative constant `c`
    pub fn try_add_scalar(&self, c: f64) -> Result<Kernel> {
        check_scalar("added constant", c)?;
        Ok(self.wrap(
            Node::AddScalar(self.clone(), c),
            self.derivable,
            self.isotropic,
        ))
    }

    /// `c * k` for a finite non negative constant `c`
    pub fn try_scale(&self, c: f64) -> Result<Kernel> {
        check_scalar("scale factor", c)?;
        Ok(self.wrap(Node::Scale(self.clone(), c), self.derivable, self.isotropic))
    }

    /// `k^p` for a finite non negative exponent `p`
    pub fn pow(&self, p: f64) -> Result<Kernel> {
        check_scalar("exponent", p)?;
        Ok(self.wrap(Node::Power(self.clone(), p), self.derivable, self.isotropic))
    }

    /// Derivative kernel `d^xorder/dx^xorder d^yorder/dy^yorder k(x, y)`.
    ///
    /// `xdim` and `ydim` name the field to differentiate when inputs are
    /// structured, they are ignored on plain inputs. Returns `self` when both
    /// orders are zero.
    pub fn diff(
        &self,
        xorder: usize,
        yorder: usize,
        xdim: Option<&str>,
        ydim: Option<&str>,
    ) -> Result<Kernel> {
        if xorder == 0 && yorder == 0 {
            return Ok(self.clone());
        }
        if xorder > self.derivable.0 || yorder > self.derivable.1 {
            return Err(GpError::NotDerivable(format!(
                "requested orders ({xorder}, {yorder}) but {self:?} is derivable ({}, {}) times",
                self.derivable.0, self.derivable.1
            )));
        }
        if let Node::Diff {
            xorder: ix,
            yorder: iy,
            xdim: ixdim,
            ydim: iydim,
            ..
        } = self.node.as_ref()
        {
            let clash = |inner: usize, outer: usize, a: &Option<String>, b: Option<&str>| {
                inner > 0 && outer > 0 && a.as_deref() != b
            };
            if clash(*ix, xorder, ixdim, xdim) || clash(*iy, yorder, iydim, ydim) {
                return Err(GpError::NotDerivable(
                    "chained derivatives along different fields".to_string(),
                ));
            }
        }
        let derivable = (self.derivable.0 - xorder, self.derivable.1 - yorder);
        Ok(self.wrap(
            Node::Diff {
                kernel: self.clone(),
                xorder,
                yorder,
                xdim: xdim.map(str::to_string),
                ydim: ydim.map(str::to_string),
            },
            derivable,
            false,
        ))
    }

    /// Evaluate the kernel on two sets of points.
    ///
    /// Outer shapes are broadcast together following NumPy rules and the
    /// result has exactly the broadcast shape. Structured inputs must share
    /// the same schema.
    pub fn call(&self, x: &Points, y: &Points) -> Result<ArrayD<f64>> {
        x.check_compatible(y)?;
        let plan = Plan::new(self, x.schema())?;
        let (shape, pairs) = broadcast_pairs(x.shape(), y.shape())?;
        let xs = PointTable::new(x);
        let ys = PointTable::new(y);
        let values = pairs
            .par_iter()
            .map(|&(i, j)| plan.eval::<f64>(&xs.point(i), &ys.point(j)))
            .collect::<Result<Vec<f64>>>()?;
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| GpError::ShapeMismatch(e.to_string()))
    }

    /// Cross covariance matrix between all the points of `x` and all the
    /// points of `y`, both flattened in row-major order
    pub fn matrix(&self, x: &Points, y: &Points) -> Result<Array2<f64>> {
        let x = x.reshape(&[x.len(), 1])?;
        let y = y.reshape(&[1, y.len()])?;
        self.call(&x, &y)?
            .into_dimensionality::<Ix2>()
            .map_err(|e| GpError::ShapeMismatch(e.to_string()))
    }
}

impl Add for Kernel {
    type Output = Kernel;

    fn add(self, rhs: Kernel) -> Kernel {
        let derivable = (
            self.derivable.0.min(rhs.derivable.0),
            self.derivable.1.min(rhs.derivable.1),
        );
        let isotropic = self.isotropic && rhs.isotropic;
        self.wrap(Node::Sum(self.clone(), rhs), derivable, isotropic)
    }
}

impl Mul for Kernel {
    type Output = Kernel;

    fn mul(self, rhs: Kernel) -> Kernel {
        let derivable = (
            self.derivable.0.min(rhs.derivable.0),
            self.derivable.1.min(rhs.derivable.1),
        );
        let isotropic = self.isotropic && rhs.isotropic;
        self.wrap(Node::Product(self.clone(), rhs), derivable, isotropic)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.as_ref() {
            Node::Leaf(leaf) => {
                write!(f, "{}", leaf.name)?;
                let o = &leaf.options;
                if let Some(dim) = &o.dim {
                    write!(f, "[{dim}]")?;
                }
                if o.loc != 0. || o.scale != 1. {
                    write!(f, "(loc={}, scale={})", o.loc, o.scale)?;
                }
                Ok(())
            }
            Node::Sum(a, b) => write!(f, "({a:?} + {b:?})"),
            Node::Product(a, b) => write!(f, "{a:?} * {b:?}"),
            Node::AddScalar(a, c) => write!(f, "({a:?} + {c})"),
            Node::Scale(a, c) => write!(f, "{c} * {a:?}"),
            Node::Power(a, p) => write!(f, "{a:?}^{p}"),
            Node::Diff {
                kernel,
                xorder,
                yorder,
                ..
            } => write!(f, "D({xorder}, {yorder}) {kernel:?}"),
        }
    }
}

/// A kernel tree with field names resolved against the input schema
enum Plan<'k> {
    Leaf(&'k Leaf, Option<usize>),
    Sum(Box<Plan<'k>>, Box<Plan<'k>>),
    Product(Box<Plan<'k>>, Box<Plan<'k>>),
    AddScalar(Box<Plan<'k>>, f64),
    Scale(Box<Plan<'k>>, f64),
    Power(Box<Plan<'k>>, f64),
    Diff {
        plan: Box<Plan<'k>>,
        xorder: usize,
        yorder: usize,
        xfield: Option<usize>,
        yfield: Option<usize>,
    },
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    X,
    Y,
}

fn resolve_diff_field(schema: Option<&Schema>, order: usize, dim: Option<&str>) -> Result<Option<usize>> {
    match (schema, order) {
        (None, _) | (_, 0) => Ok(None),
        (Some(schema), _) => {
            let Some(dim) = dim else {
                return Err(GpError::NotDerivable(format!(
                    "can not differentiate w.r.t structured input {schema} if dim is not specified"
                )));
            };
            let i = schema.position(dim)?;
            if !schema.fields()[i].is_scalar() {
                return Err(GpError::NotDerivable(format!(
                    "can not differentiate w.r.t non scalar field `{dim}`"
                )));
            }
            Ok(Some(i))
        }
    }
}

impl<'k> Plan<'k> {
    fn new(kernel: &'k Kernel, schema: Option<&Schema>) -> Result<Plan<'k>> {
        let sub = |k: &'k Kernel| Plan::new(k, schema).map(Box::new);
        Ok(match kernel.node.as_ref() {
            Node::Leaf(leaf) => {
                let field = match (&leaf.options.dim, schema) {
                    (None, _) => None,
                    (Some(dim), Some(schema)) => Some(schema.position(dim)?),
                    (Some(dim), None) => {
                        return Err(GpError::FieldNotFound(format!(
                            "kernel called on a plain array but dim = `{dim}`"
                        )));
                    }
                };
                Plan::Leaf(leaf, field)
            }
            Node::Sum(a, b) => Plan::Sum(sub(a)?, sub(b)?),
            Node::Product(a, b) => Plan::Product(sub(a)?, sub(b)?),
            Node::AddScalar(a, c) => Plan::AddScalar(sub(a)?, *c),
            Node::Scale(a, c) => Plan::Scale(sub(a)?, *c),
            Node::Power(a, p) => Plan::Power(sub(a)?, *p),
            Node::Diff {
                kernel,
                xorder,
                yorder,
                xdim,
                ydim,
            } => Plan::Diff {
                plan: sub(kernel)?,
                xorder: *xorder,
                yorder: *yorder,
                xfield: resolve_diff_field(schema, *xorder, xdim.as_deref())?,
                yfield: resolve_diff_field(schema, *yorder, ydim.as_deref())?,
            },
        })
    }

    fn eval<T: Scalar>(&self, x: &Point<T>, y: &Point<T>) -> Result<T> {
        match self {
            Plan::Leaf(leaf, field) => leaf.eval(*field, x, y),
            Plan::Sum(a, b) => Ok(a.eval(x, y)? + b.eval(x, y)?),
            Plan::Product(a, b) => Ok(a.eval(x, y)? * b.eval(x, y)?),
            Plan::AddScalar(a, c) => Ok(a.eval(x, y)? + *c),
            Plan::Scale(a, c) => Ok(a.eval(x, y)? * *c),
            Plan::Power(a, p) => {
                let v = a.eval(x, y)?;
                Ok(if p.fract() == 0. && *p <= i32::MAX as f64 {
                    v.powi(*p as i32)
                } else {
                    v.powf(*p)
                })
            }
            Plan::Diff {
                plan,
                xorder,
                yorder,
                xfield,
                yfield,
            } => {
                let (px, py) = perturbation_order(x, y);
                let (qx, qy) = (px + xorder, py + yorder);
                let xs = seed(x, *xorder, *xfield, (qx, qy), Side::X)?;
                let ys = seed(y, *yorder, *yfield, (qx, qy), Side::Y)?;
                let r = plan.eval::<Jet>(&xs, &ys)?;
                Ok(T::from_repr(ScalarRepr::Jet(r.shift(*xorder, *yorder))))
            }
        }
    }
}

/// Truncation orders of the perturbations already carried by the points
fn perturbation_order<T: Scalar>(x: &Point<T>, y: &Point<T>) -> (usize, usize) {
    x.components()
        .into_iter()
        .chain(y.components())
        .find_map(|v| match v.clone().into_repr() {
            ScalarRepr::Jet(j) => j.order(),
            ScalarRepr::Real(_) => None,
        })
        .unwrap_or((0, 0))
}

/// Re-expand an incoming value at higher truncation orders
fn reseed<T: Scalar>(v: &T, order: (usize, usize)) -> Jet {
    match v.clone().into_repr() {
        ScalarRepr::Real(v) => Jet::constant(v),
        ScalarRepr::Jet(j) => {
            if j.coefficient(1, 0) != 0. {
                Jet::variable_x(j.value(), order.0, order.1)
            } else if j.coefficient(0, 1) != 0. {
                Jet::variable_y(j.value(), order.0, order.1)
            } else {
                Jet::constant(j.value())
            }
        }
    }
}

fn carries(j: &Jet, side: Side) -> bool {
    match side {
        Side::X => j.coefficient(1, 0) != 0.,
        Side::Y => j.coefficient(0, 1) != 0.,
    }
}

/// Points as jets, with the differentiated coordinate perturbed
fn seed<T: Scalar>(
    p: &Point<T>,
    order: usize,
    field: Option<usize>,
    trunc: (usize, usize),
    side: Side,
) -> Result<Point<Jet>> {
    let mut out = p.map(&|v: &T| reseed(v, trunc));
    if order == 0 {
        return Ok(out);
    }
    let target = match (&mut out, field) {
        (Point::Scalar(v), None) => v,
        (Point::Record(fields), Some(i)) => {
            let others = fields
                .iter()
                .enumerate()
                .filter(|(k, _)| *k != i)
                .flat_map(|(_, f)| f.components())
                .any(|j| carries(j, side));
            if others {
                return Err(GpError::NotDerivable(
                    "mixed derivatives along different fields of the same argument".to_string(),
                ));
            }
            match fields.get_mut(i) {
                Some(Point::Scalar(v)) => v,
                _ => {
                    return Err(GpError::NotDerivable(
                        "differentiated field should be scalar".to_string(),
                    ));
                }
            }
        }
        _ => {
            return Err(GpError::NotDerivable(
                "can not differentiate w.r.t a non scalar input".to_string(),
            ));
        }
    };
    let value = target.value();
    *target = match side {
        Side::X => Jet::variable_x(value, trunc.0, trunc.1),
        Side::Y => Jet::variable_y(value, trunc.0, trunc.1),
    };
    Ok(out)
}

/// Flat row-major access to the points of a [`Points`] value
struct PointTable {
    structured: bool,
    fields: Vec<(usize, Vec<f64>)>,
}

impl PointTable {
    fn new(points: &Points) -> Self {
        match points {
            Points::Plain(a) => PointTable {
                structured: false,
                fields: vec![(1, a.iter().copied().collect())],
            },
            Points::Structured(s) => PointTable {
                structured: true,
                fields: s
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| f.size())
                    .zip(s.flat_fields())
                    .collect(),
            },
        }
    }

    fn point(&self, i: usize) -> Point<f64> {
        let field = |(size, data): &(usize, Vec<f64>)| {
            if self.structured && *size != 1 {
                Point::Vector(data[i * size..(i + 1) * size].to_vec())
            } else {
                Point::Scalar(data[i])
            }
        };
        if self.structured {
            Point::Record(self.fields.iter().map(field).collect())
        } else {
            field(&self.fields[0])
        }
    }
}

/// Broadcast shape of `a` and `b` with the flat indices of both operands for
/// every element of the result
pub(crate) fn broadcast_pairs(a: &[usize], b: &[usize]) -> Result<(Vec<usize>, Vec<(usize, usize)>)> {
    let ndim = a.len().max(b.len());
    let pad = |s: &[usize]| {
        let mut out = vec![1; ndim - s.len()];
        out.extend_from_slice(s);
        out
    };
    let (pa, pb) = (pad(a), pad(b));
    let mut shape = Vec::with_capacity(ndim);
    for (&da, &db) in pa.iter().zip(pb.iter()) {
        shape.push(match (da, db) {
            _ if da == db => da,
            (1, _) => db,
            (_, 1) => da,
            _ => {
                return Err(GpError::ShapeMismatch(format!(
                    "can not broadcast shapes {a:?} and {b:?}"
                )));
            }
        });
    }
    let strides = |s: &[usize]| {
        let mut st = vec![0; ndim];
        let mut acc = 1;
        for k in (0..ndim).rev() {
            st[k] = if s[k] == 1 { 0 } else { acc };
            acc *= s[k];
        }
        st
    };
    let (sa, sb) = (strides(&pa), strides(&pb));
    let len: usize = shape.iter().product();
    let mut pairs = Vec::with_capacity(len);
    let mut index = vec![0; ndim];
    for _ in 0..len {
        let ia = index.iter().zip(sa.iter()).map(|(i, s)| i * s).sum();
        let ib = index.iter().zip(sb.iter()).map(|(i, s)| i * s).sum();
        pairs.push((ia, ib));
        for k in (0..ndim).rev() {
            index[k] += 1;
            if index[k] < shape[k] {
                break;
            }
            index[k] = 0;
        }
    }
    Ok((shape, pairs))
}
