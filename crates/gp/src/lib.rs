//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! with a composable kernel algebra, as used to fit and extrapolate epidemiological time series
//! (infected, deceased or recovered counts).
//!
//! * Kernels are immutable values built from a catalog ([`ExpQuad`], [`Matern`], [`Categorical`], ...)
//!   or from user functions with [`kernel`] and [`isotropic_kernel`], then combined with `+`, `*`,
//!   scalar operations, powers and derivatives ([`Kernel::diff`]) computed by forward mode
//!   automatic differentiation.
//! * Inputs are plain arrays or [`StructuredArray`]s with named fields, such as a time and a
//!   region label.
//! * Covariance matrices are handed to a [`Decomposition`] chosen with [`Solver`]: plain or
//!   thresholded SVD, truncated eigendecomposition, or regularized Cholesky factorizations.
//! * [`GaussianProcess`] registers keyed input points, evaluates the marginal likelihood
//!   of observations and conditions the process on them ([`GaussianProcess::predfromdata`]).
//! * [`empbayes_fit`] estimates kernel hyperparameters by maximizing their posterior.
//!
//! # Example
//!
//! ```
//! use epigp_gp::{GaussianProcess, IntoKernel, KernelOptions, Matern52, Observations};
//! use ndarray::Array;
//!
//! let kernel = Matern52.into_kernel(KernelOptions::new().scale(2.)).unwrap();
//! let mut gp = GaussianProcess::params(kernel).build().unwrap();
//!
//! let days = Array::linspace(0., 20., 21);
//! let counts = days.mapv(|d: f64| (d / 5.).sin());
//! gp.addx(days, "observed").unwrap();
//! gp.addx(Array::linspace(20., 27., 8), "forecast").unwrap();
//!
//! let obs = Observations::new().exact("observed", counts);
//! let forecast = gp.predfromdata(&obs, "forecast").unwrap();
//! assert_eq!(forecast.sdev().len(), 8);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
pub mod decomposition;
mod empbayes;
mod errors;
mod jet;
mod kernel;
mod kernels;
mod optimization;
mod parameters;
pub mod special;
mod structured;

pub use algorithm::*;
pub use decomposition::{Correlated, Decomposition, Solver};
pub use empbayes::*;
pub use errors::*;
pub use jet::{Jet, Scalar};
pub use kernel::{
    InputMode, IsotropicFunction, Kernel, KernelOptions, PairFunction, Point, isotropic_kernel,
    kernel,
};
pub use kernels::*;
pub use optimization::Algorithm;
pub use parameters::*;
pub use structured::*;
