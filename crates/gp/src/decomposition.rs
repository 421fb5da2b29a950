//! Factorizations of symmetric positive (semi)definite matrices.
//!
//! A [`Decomposition`] is built once from a covariance matrix `K` and then
//! answers the linear algebra queries the GP engine needs: solving `K x = b`,
//! quadratic forms `b' K^-1 b`, `log det K` and their first order variation
//! along a tangent matrix `dK`.
//!
//! Available strategies (see [`Solver`]):
//!
//! * [`Svd`]: plain singular value decomposition,
//! * [`SvdFullRank`]: SVD with small singular values raised to a floor,
//! * [`SvdLowRank`]: SVD with small singular values dropped,
//! * [`LowRank`]: truncated eigendecomposition keeping the `rank` largest eigenvalues,
//! * [`Cholesky`]: plain Cholesky factorization,
//! * [`CholMaxEig`]: Cholesky of `K + eps * max eigenvalue * I`,
//! * [`CholGersh`]: Cholesky of `K + eps * Gershgorin bound * I`.

use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::lobpcg::{Order, TruncatedEig};
use linfa_linalg::{cholesky::Cholesky as _, eigh::*, svd::*, triangular::*};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_stats::QuantileExt;
use rand_xoshiro::Xoshiro256Plus;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

const LOBPCG_SEED: u64 = 42;
const LOBPCG_PRECISION: f32 = 1e-9;

/// A vector of correlated uncertain values, described by its mean and covariance
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Correlated<F: Float> {
    /// Mean vector
    pub mean: Array1<F>,
    /// Covariance matrix
    pub cov: Array2<F>,
}

impl<F: Float> Correlated<F> {
    /// Constructor checking dimension consistency
    pub fn new(mean: Array1<F>, cov: Array2<F>) -> Result<Self> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return Err(GpError::ShapeMismatch(format!(
                "covariance {:?} does not match mean of length {}",
                cov.shape(),
                mean.len()
            )));
        }
        Ok(Correlated { mean, cov })
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    /// Whether there is no value
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Standard deviations, negative variances are clamped to zero
    pub fn sdev(&self) -> Array1<F> {
        self.cov.diag().mapv(|v| v.max(F::zero()).sqrt())
    }
}

/// Queries answered by a factorized symmetric matrix `K` of size `n`
pub trait Decomposition<F: Float>: fmt::Debug + Send + Sync {
    /// Size of the factorized matrix
    fn n(&self) -> usize;

    /// Solve `K x = b` for a matrix right hand side `(n, m)`
    fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>>;

    /// `log det K`
    fn logdet(&self) -> F;

    /// Solve `K x = b` for a vector right hand side
    fn solve_vec(&self, b: ArrayView1<F>) -> Result<Array1<F>> {
        let x = self.solve(b.insert_axis(Axis(1)))?;
        Ok(x.remove_axis(Axis(1)))
    }

    /// Quadratic form `b' K^-1 b` for a matrix `b` of shape `(n, m)`
    fn quad(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        Ok(b.t().dot(&self.solve(b)?))
    }

    /// Quadratic form `b' K^-1 b` for a vector `b`
    fn quad_vec(&self, b: ArrayView1<F>) -> Result<F> {
        Ok(b.dot(&self.solve_vec(b)?))
    }

    /// `K^-1` as seen through the decomposition
    fn inverse(&self) -> Result<Array2<F>> {
        self.solve(Array2::eye(self.n()).view())
    }

    /// Solve `K x = b` where `b` is uncertain, propagating its covariance:
    /// the result has mean `K^-1 mean` and covariance `K^-1 cov K^-1`
    fn usolve(&self, b: &Correlated<F>) -> Result<Correlated<F>> {
        let inv = self.inverse()?;
        let mean = inv.dot(&b.mean);
        let cov = inv.dot(&b.cov).dot(&inv.t());
        Ok(Correlated { mean, cov })
    }

    /// First order variation of `K^-1 b` along `dK`: `-K^-1 dK K^-1 b`
    fn solve_tangent(&self, dk: ArrayView2<F>, b: ArrayView2<F>) -> Result<Array2<F>> {
        let x = self.solve(b)?;
        Ok(self.solve(dk.dot(&x).view())?.mapv(|v| -v))
    }

    /// First order variation of `b' K^-1 b` along `dK`: `-x' dK x` with `x = K^-1 b`
    fn quad_tangent(&self, dk: ArrayView2<F>, b: ArrayView1<F>) -> Result<F> {
        let x = self.solve_vec(b)?;
        Ok(-x.dot(&dk.dot(&x)))
    }

    /// First order variation of `log det K` along `dK`: `tr(K^-1 dK)`
    fn logdet_tangent(&self, dk: ArrayView2<F>) -> Result<F> {
        Ok(self.solve(dk)?.diag().sum())
    }
}

fn check_square<F: Float>(k: &Array2<F>) -> Result<()> {
    if k.nrows() != k.ncols() {
        return Err(GpError::ShapeMismatch(format!(
            "expected a square matrix, got {:?}",
            k.shape()
        )));
    }
    if k.iter().any(|v| !v.is_finite()) {
        return Err(GpError::numerical(
            "decomposition",
            "matrix contains non finite values",
        ));
    }
    Ok(())
}

fn check_rhs<F: Float>(n: usize, b: &ArrayView2<F>) -> Result<()> {
    if b.nrows() != n {
        return Err(GpError::ShapeMismatch(format!(
            "right hand side has {} rows, expected {}",
            b.nrows(),
            n
        )));
    }
    Ok(())
}

fn default_eps<F: Float>(n: usize, eps: Option<F>) -> Result<F> {
    match eps {
        Some(e) if !e.is_finite() || e < F::zero() => Err(GpError::InvalidValueError(format!(
            "eps should be a non negative number, got {e}"
        ))),
        Some(e) => Ok(e),
        None => Ok(F::cast(n.max(1)) * F::epsilon()),
    }
}

/// Eigen pairs of a symmetric matrix sorted by decreasing eigenvalue
fn sorted_eigh<F: Float>(k: &Array2<F>) -> Result<(Array1<F>, Array2<F>)> {
    let (w, v) = k.to_owned().eigh_into()?;
    let mut idx: Vec<usize> = (0..w.len()).collect();
    idx.sort_by(|&a, &b| w[b].partial_cmp(&w[a]).unwrap_or(std::cmp::Ordering::Equal));
    Ok((w.select(Axis(0), &idx), v.select(Axis(1), &idx)))
}

/// The `num` largest eigen pairs of `k` in decreasing order.
///
/// LOBPCG is used when few pairs are requested, the dense eigendecomposition
/// otherwise or when LOBPCG does not converge.
fn largest_eigh<F: Float>(k: &Array2<F>, num: usize) -> Result<(Array1<F>, Array2<F>)> {
    let n = k.nrows();
    if num > 0 && 5 * num < n {
        let mut eig = TruncatedEig::new_with_rng(
            k.to_owned(),
            Order::Largest,
            Xoshiro256Plus::seed_from_u64(LOBPCG_SEED),
        )
        .precision(LOBPCG_PRECISION)
        .maxiter(10 * n);
        match eig.decompose(num) {
            Ok(res) => {
                let mut idx: Vec<usize> = (0..res.eigvals.len()).collect();
                idx.sort_by(|&a, &b| {
                    res.eigvals[b]
                        .partial_cmp(&res.eigvals[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                return Ok((
                    res.eigvals.select(Axis(0), &idx),
                    res.eigvecs.select(Axis(1), &idx),
                ));
            }
            Err((e, _)) => log::debug!("LOBPCG failed ({e}), using dense eigh"),
        }
    }
    let (w, v) = sorted_eigh(k)?;
    let keep: Vec<usize> = (0..num.min(n)).collect();
    Ok((w.select(Axis(0), &keep), v.select(Axis(1), &keep)))
}

/// `U diag(s) V'` factors shared by the SVD based strategies
#[derive(Clone, Debug)]
struct SvdFactors<F: Float> {
    n: usize,
    u: Array2<F>,
    s: Array1<F>,
    vt: Array2<F>,
}

impl<F: Float> SvdFactors<F> {
    fn new(k: &Array2<F>) -> Result<Self> {
        check_square(k)?;
        let (u, s, vt) = k.svd(true, true)?;
        match (u, vt) {
            (Some(u), Some(vt)) => Ok(SvdFactors {
                n: k.nrows(),
                u,
                s,
                vt,
            }),
            _ => Err(GpError::numerical("SVD", "singular vectors not computed")),
        }
    }

    fn smax(&self) -> F {
        self.s.max().map(|v| *v).unwrap_or_else(|_| F::zero())
    }

    fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        check_rhs(self.n, &b)?;
        let mut ub = self.u.t().dot(&b);
        for (mut row, s) in ub.outer_iter_mut().zip(self.s.iter()) {
            row.mapv_inplace(|v| v / *s);
        }
        Ok(self.vt.t().dot(&ub))
    }

    fn logdet(&self) -> F {
        self.s.mapv(|v| v.ln()).sum()
    }
}

macro_rules! impl_decomposition_by_svd {
    ($name:ident) => {
        impl<F: Float> Decomposition<F> for $name<F> {
            fn n(&self) -> usize {
                self.0.n
            }
            fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
                self.0.solve(b)
            }
            fn logdet(&self) -> F {
                self.0.logdet()
            }
        }
    };
}

/// Singular value decomposition `K = U S V'`, `K^-1 b = V S^-1 U' b`
#[derive(Clone, Debug)]
pub struct Svd<F: Float>(SvdFactors<F>);

impl<F: Float> Svd<F> {
    /// Factorize `k`
    pub fn new(k: &Array2<F>) -> Result<Self> {
        Ok(Svd(SvdFactors::new(k)?))
    }

    /// Singular values
    pub fn singular_values(&self) -> &Array1<F> {
        &self.0.s
    }
}

/// SVD where singular values below `eps * max singular value` are raised to that floor
#[derive(Clone, Debug)]
pub struct SvdFullRank<F: Float>(SvdFactors<F>);

impl<F: Float> SvdFullRank<F> {
    /// Factorize `k`, `eps` defaults to `n * machine epsilon`
    pub fn new(k: &Array2<F>, eps: Option<F>) -> Result<Self> {
        let mut f = SvdFactors::new(k)?;
        let floor = default_eps(f.n, eps)? * f.smax();
        let nclamped = f.s.iter().filter(|v| **v < floor).count();
        if nclamped > 0 {
            log::debug!("SvdFullRank: {nclamped} singular values raised to {floor}");
        }
        f.s.mapv_inplace(|v| v.max(floor));
        if f.s.iter().any(|v| *v <= F::zero()) {
            return Err(GpError::numerical("SvdFullRank", "matrix is zero"));
        }
        Ok(SvdFullRank(f))
    }

    /// Singular values after flooring
    pub fn singular_values(&self) -> &Array1<F> {
        &self.0.s
    }
}

/// SVD where singular values below `eps * max singular value` are dropped,
/// acting as a pseudo-inverse on the retained subspace
#[derive(Clone, Debug)]
pub struct SvdLowRank<F: Float>(SvdFactors<F>);

impl<F: Float> SvdLowRank<F> {
    /// Factorize `k`, `eps` defaults to `n * machine epsilon`
    pub fn new(k: &Array2<F>, eps: Option<F>) -> Result<Self> {
        let f = SvdFactors::new(k)?;
        let floor = default_eps(f.n, eps)? * f.smax();
        let keep: Vec<usize> = (0..f.s.len())
            .filter(|&i| f.s[i] >= floor && f.s[i] > F::zero())
            .collect();
        if keep.is_empty() {
            return Err(GpError::numerical("SvdLowRank", "matrix is zero"));
        }
        log::debug!("SvdLowRank: rank {} out of {}", keep.len(), f.n);
        Ok(SvdLowRank(SvdFactors {
            n: f.n,
            u: f.u.select(Axis(1), &keep),
            s: f.s.select(Axis(0), &keep),
            vt: f.vt.select(Axis(0), &keep),
        }))
    }

    /// Number of retained singular values
    pub fn rank(&self) -> usize {
        self.0.s.len()
    }
}

impl_decomposition_by_svd!(Svd);
impl_decomposition_by_svd!(SvdFullRank);
impl_decomposition_by_svd!(SvdLowRank);

/// Truncated eigendecomposition keeping the `rank` largest eigenvalues:
/// `K ~ V W V'` and `K^-1 b ~ V W^-1 V' b`
#[derive(Clone, Debug)]
pub struct LowRank<F: Float> {
    n: usize,
    w: Array1<F>,
    v: Array2<F>,
}

impl<F: Float> LowRank<F> {
    /// Factorize `k` keeping `rank` eigen pairs
    pub fn new(k: &Array2<F>, rank: usize) -> Result<Self> {
        check_square(k)?;
        let n = k.nrows();
        if rank == 0 || rank > n {
            return Err(GpError::InvalidValueError(format!(
                "rank should be in [1, {n}], got {rank}"
            )));
        }
        let (w, v) = largest_eigh(k, rank)?;
        if w.iter().any(|v| *v <= F::zero()) {
            return Err(GpError::numerical(
                "LowRank",
                format!("the {rank} largest eigenvalues are not all positive"),
            ));
        }
        Ok(LowRank { n, w, v })
    }

    /// Retained eigenvalues in decreasing order
    pub fn eigenvalues(&self) -> &Array1<F> {
        &self.w
    }

    fn project(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        check_rhs(self.n, &b)?;
        Ok(self.v.t().dot(&b))
    }
}

impl<F: Float> Decomposition<F> for LowRank<F> {
    fn n(&self) -> usize {
        self.n
    }

    fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        let mut vb = self.project(b)?;
        for (mut row, w) in vb.outer_iter_mut().zip(self.w.iter()) {
            row.mapv_inplace(|v| v / *w);
        }
        Ok(self.v.dot(&vb))
    }

    fn quad(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        let vb = self.project(b)?;
        let mut scaled = vb.clone();
        for (mut row, w) in scaled.outer_iter_mut().zip(self.w.iter()) {
            row.mapv_inplace(|v| v / *w);
        }
        Ok(vb.t().dot(&scaled))
    }

    fn logdet(&self) -> F {
        self.w.mapv(|v| v.ln()).sum()
    }
}

/// Cholesky factorization `K = L L'`
#[derive(Clone, Debug)]
pub struct Cholesky<F: Float> {
    l: Array2<F>,
}

impl<F: Float> Cholesky<F> {
    /// Factorize `k`, failing when `k` is not positive definite
    pub fn new(k: &Array2<F>) -> Result<Self> {
        check_square(k)?;
        Self::factorize("Cholesky", k)
    }

    fn factorize(operation: &str, k: &Array2<F>) -> Result<Self> {
        let l = k
            .cholesky()
            .map_err(|e| GpError::numerical(operation, format!("{e}")))?;
        Ok(Cholesky { l })
    }

    /// Lower triangular factor
    pub fn factor(&self) -> &Array2<F> {
        &self.l
    }

    /// `L^-1 b`
    fn half_solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        check_rhs(self.l.nrows(), &b)?;
        Ok(self.l.solve_triangular(&b, UPLO::Lower)?)
    }
}

impl<F: Float> Decomposition<F> for Cholesky<F> {
    fn n(&self) -> usize {
        self.l.nrows()
    }

    fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        let y = self.half_solve(b)?;
        Ok(self.l.t().solve_triangular(&y, UPLO::Upper)?)
    }

    fn quad(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
        let y = self.half_solve(b)?;
        Ok(y.t().dot(&y))
    }

    fn logdet(&self) -> F {
        F::cast(2.) * self.l.diag().mapv(|v| v.ln()).sum()
    }
}

macro_rules! impl_decomposition_by_cholesky {
    ($name:ident) => {
        impl<F: Float> $name<F> {
            /// Diagonal term added before factorization
            pub fn shift(&self) -> F {
                self.shift
            }
        }

        impl<F: Float> Decomposition<F> for $name<F> {
            fn n(&self) -> usize {
                self.chol.n()
            }
            fn solve(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
                self.chol.solve(b)
            }
            fn quad(&self, b: ArrayView2<F>) -> Result<Array2<F>> {
                self.chol.quad(b)
            }
            fn logdet(&self) -> F {
                self.chol.logdet()
            }
        }
    };
}

fn add_diagonal<F: Float>(k: &Array2<F>, shift: F) -> Array2<F> {
    let mut out = k.to_owned();
    out.diag_mut().mapv_inplace(|v| v + shift);
    out
}

/// Cholesky factorization of `K + eps * max eigenvalue * I`
#[derive(Clone, Debug)]
pub struct CholMaxEig<F: Float> {
    chol: Cholesky<F>,
    shift: F,
}

impl<F: Float> CholMaxEig<F> {
    /// Factorize `k`, `eps` defaults to `n * machine epsilon`
    pub fn new(k: &Array2<F>, eps: Option<F>) -> Result<Self> {
        check_square(k)?;
        let eps = default_eps(k.nrows(), eps)?;
        let (w, _) = largest_eigh(k, 1)?;
        let wmax = w.first().copied().unwrap_or_else(F::zero);
        let shift = eps * wmax.max(F::zero());
        let chol = Cholesky::factorize("CholMaxEig", &add_diagonal(k, shift))?;
        Ok(CholMaxEig { chol, shift })
    }
}

/// Cholesky factorization of `K + eps * max_i sum_j |K_ij| * I`, the row sum
/// being a Gershgorin upper bound of the largest eigenvalue
#[derive(Clone, Debug)]
pub struct CholGersh<F: Float> {
    chol: Cholesky<F>,
    shift: F,
}

impl<F: Float> CholGersh<F> {
    /// Factorize `k`, `eps` defaults to `n * machine epsilon`
    pub fn new(k: &Array2<F>, eps: Option<F>) -> Result<Self> {
        check_square(k)?;
        let eps = default_eps(k.nrows(), eps)?;
        let rowsums = k.mapv(|v| v.abs()).sum_axis(Axis(1));
        let bound = rowsums.max().map(|v| *v).unwrap_or_else(|_| F::zero());
        let shift = eps * bound;
        let chol = Cholesky::factorize("CholGersh", &add_diagonal(k, shift))?;
        Ok(CholGersh { chol, shift })
    }
}

impl_decomposition_by_cholesky!(CholMaxEig);
impl_decomposition_by_cholesky!(CholGersh);

/// Choice of factorization strategy used to handle covariance matrices
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Solver {
    /// [`Svd`]
    Svd,
    /// [`SvdFullRank`] with optional relative threshold
    SvdFullRank {
        /// Relative threshold, `n * machine epsilon` when `None`
        eps: Option<f64>,
    },
    /// [`SvdLowRank`] with optional relative threshold
    SvdLowRank {
        /// Relative threshold, `n * machine epsilon` when `None`
        eps: Option<f64>,
    },
    /// [`LowRank`] keeping `rank` eigen pairs
    LowRank {
        /// Number of retained eigen pairs
        rank: usize,
    },
    /// [`Cholesky`]
    Cholesky,
    /// [`CholMaxEig`] with optional relative regularization
    CholMaxEig {
        /// Relative regularization, `n * machine epsilon` when `None`
        eps: Option<f64>,
    },
    /// [`CholGersh`] with optional relative regularization
    CholGersh {
        /// Relative regularization, `n * machine epsilon` when `None`
        eps: Option<f64>,
    },
}

impl Default for Solver {
    fn default() -> Self {
        Solver::CholGersh { eps: None }
    }
}

impl Solver {
    /// Check option values independently of any matrix
    pub fn check(&self) -> Result<()> {
        match *self {
            Solver::SvdFullRank { eps: Some(e) }
            | Solver::SvdLowRank { eps: Some(e) }
            | Solver::CholMaxEig { eps: Some(e) }
            | Solver::CholGersh { eps: Some(e) }
                if !e.is_finite() || e < 0. =>
            {
                Err(GpError::InvalidValueError(format!(
                    "{self}: eps should be a non negative number, got {e}"
                )))
            }
            Solver::LowRank { rank: 0 } => Err(GpError::InvalidValueError(
                "reduce-rank: rank should be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Factorize `k` with the chosen strategy
    pub fn decompose<F: Float>(&self, k: &Array2<F>) -> Result<Box<dyn Decomposition<F>>> {
        self.check()?;
        let cast = |e: Option<f64>| e.map(F::cast);
        let dec: Box<dyn Decomposition<F>> = match *self {
            Solver::Svd => Box::new(Svd::new(k)?),
            Solver::SvdFullRank { eps } => Box::new(SvdFullRank::new(k, cast(eps))?),
            Solver::SvdLowRank { eps } => Box::new(SvdLowRank::new(k, cast(eps))?),
            Solver::LowRank { rank } => Box::new(LowRank::new(k, rank)?),
            Solver::Cholesky => Box::new(Cholesky::new(k)?),
            Solver::CholMaxEig { eps } => Box::new(CholMaxEig::new(k, cast(eps))?),
            Solver::CholGersh { eps } => Box::new(CholGersh::new(k, cast(eps))?),
        };
        Ok(dec)
    }
}

impl fmt::Display for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Solver::Svd => write!(f, "svd"),
            Solver::SvdFullRank { .. } => write!(f, "fullrank"),
            Solver::SvdLowRank { .. } => write!(f, "lowrank"),
            Solver::LowRank { rank } => write!(f, "reduce-rank:{rank}"),
            Solver::Cholesky => write!(f, "chol"),
            Solver::CholMaxEig { .. } => write!(f, "maxeig"),
            Solver::CholGersh { .. } => write!(f, "gersh"),
        }
    }
}

impl FromStr for Solver {
    type Err = GpError;

    /// Parse a solver name: `svd`, `fullrank`, `lowrank`, `reduce-rank:<rank>`,
    /// `chol`, `maxeig` or `gersh`
    fn from_str(s: &str) -> Result<Self> {
        let solver = match s.trim() {
            "svd" => Solver::Svd,
            "fullrank" => Solver::SvdFullRank { eps: None },
            "lowrank" => Solver::SvdLowRank { eps: None },
            "chol" => Solver::Cholesky,
            "maxeig" => Solver::CholMaxEig { eps: None },
            "gersh" => Solver::CholGersh { eps: None },
            other => match other.strip_prefix("reduce-rank:") {
                Some(rank) => Solver::LowRank {
                    rank: rank.parse().map_err(|_| {
                        GpError::InvalidValueError(format!("bad rank in solver '{other}'"))
                    })?,
                },
                None => {
                    return Err(GpError::InvalidValueError(format!(
                        "unknown solver '{other}'"
                    )));
                }
            },
        };
        solver.check()?;
        Ok(solver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array, s};
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    /// Random SPD matrix with eigenvalues in [1e-2, 1e2]
    fn random_spd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let a = Array::random_using((n, n), Uniform::new(-1., 1.), &mut rng);
        let (_, v) = sorted_eigh(&(&a + &a.t())).unwrap();
        let logw = Array::random_using(n, Uniform::new(-2., 2.), &mut rng);
        let w = logw.mapv(|v| 10f64.powf(v));
        let k = v.dot(&Array2::from_diag(&w)).dot(&v.t());
        (&k + &k.t()) / 2.
    }

    fn random_rhs(n: usize, m: usize, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed + 1000);
        Array::random_using((n, m), Uniform::new(-1., 1.), &mut rng)
    }

    fn logdet_by_eig(k: &Array2<f64>) -> f64 {
        let (w, _) = sorted_eigh(k).unwrap();
        w.mapv(f64::ln).sum()
    }

    macro_rules! test_full_rank_decomposition {
        ($name:ident, $build:expr) => {
            paste! {
                #[test]
                fn [<test_ $name:snake _solve_and_logdet>]() {
                    for n in 1..=20 {
                        let k = random_spd(n, n as u64);
                        let dec = $build(&k);
                        assert_eq!(dec.n(), n);
                        let b = random_rhs(n, 3, n as u64);
                        let x = dec.solve(b.view()).unwrap();
                        assert_abs_diff_eq!(k.dot(&x), b, epsilon = 1e-7);
                        let bv = b.column(0);
                        let q = dec.quad_vec(bv).unwrap();
                        assert_abs_diff_eq!(q, bv.dot(&x.column(0)), epsilon = 1e-6 * q.abs().max(1.));
                        let qm = dec.quad(b.view()).unwrap();
                        assert_abs_diff_eq!(qm, b.t().dot(&x), epsilon = 1e-6 * q.abs().max(1.));
                        assert_abs_diff_eq!(dec.logdet(), logdet_by_eig(&k), epsilon = 1e-8 * n as f64);
                    }
                }
            }
        };
    }

    test_full_rank_decomposition!(Svd, |k| Svd::new(k).unwrap());
    test_full_rank_decomposition!(SvdFullRank, |k| SvdFullRank::new(k, None).unwrap());
    test_full_rank_decomposition!(SvdLowRank, |k| SvdLowRank::new(k, None).unwrap());
    test_full_rank_decomposition!(LowRank, |k: &Array2<f64>| LowRank::new(k, k.nrows()).unwrap());
    test_full_rank_decomposition!(Cholesky, |k| Cholesky::new(k).unwrap());
    test_full_rank_decomposition!(CholMaxEig, |k| CholMaxEig::new(k, None).unwrap());
    test_full_rank_decomposition!(CholGersh, |k| CholGersh::new(k, None).unwrap());

    fn squared_exp(n: usize, s: f64) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| {
            let d = i as f64 - j as f64;
            (-0.5 * d * d / (s * s)).exp()
        })
    }

    fn squared_exp_ds(n: usize, s: f64) -> Array2<f64> {
        Array2::from_shape_fn((n, n), |(i, j)| {
            let d = i as f64 - j as f64;
            (-0.5 * d * d / (s * s)).exp() * d * d / (s * s * s)
        })
    }

    /// Closed form tangents of `quad`, `logdet` and `solve` along the
    /// lengthscale of a squared exponential matrix match central differences
    fn check_tangents(solver: Solver) {
        use finitediff::ndarr;

        let n = 6;
        let s0 = 0.7;
        let b = array![0.3, -1.2, 0.5, 2.0, -0.4, 0.9];
        let dec_at = |x: &Array1<f64>| solver.decompose(&squared_exp(n, x[0]));
        let quad = |x: &Array1<f64>| -> std::result::Result<f64, anyhow::Error> {
            Ok(dec_at(x)?.quad_vec(b.view())?)
        };
        let logdet = |x: &Array1<f64>| -> std::result::Result<f64, anyhow::Error> {
            Ok(dec_at(x)?.logdet())
        };
        let solve2 = |x: &Array1<f64>| -> std::result::Result<f64, anyhow::Error> {
            Ok(dec_at(x)?.solve_vec(b.view())?[2])
        };
        let x0 = array![s0];
        let dquad = ndarr::central_diff(&quad)(&x0).unwrap()[0];
        let dlogdet = ndarr::central_diff(&logdet)(&x0).unwrap()[0];
        let dsolve = ndarr::central_diff(&solve2)(&x0).unwrap()[0];

        let dec = dec_at(&x0).unwrap();
        let dk = squared_exp_ds(n, s0);
        let bm = b.clone().insert_axis(Axis(1));
        assert_abs_diff_eq!(
            dec.quad_tangent(dk.view(), b.view()).unwrap(),
            dquad,
            epsilon = 1e-4 * dquad.abs().max(1.)
        );
        assert_abs_diff_eq!(
            dec.logdet_tangent(dk.view()).unwrap(),
            dlogdet,
            epsilon = 1e-4 * dlogdet.abs().max(1.)
        );
        assert_abs_diff_eq!(
            dec.solve_tangent(dk.view(), bm.view()).unwrap()[[2, 0]],
            dsolve,
            epsilon = 1e-4 * dsolve.abs().max(1.)
        );
    }

    macro_rules! test_tangents {
        ($name:ident, $solver:expr) => {
            paste! {
                #[test]
                fn [<test_ $name:snake _tangents>]() {
                    check_tangents($solver);
                }
            }
        };
    }

    test_tangents!(Svd, Solver::Svd);
    test_tangents!(SvdFullRank, Solver::SvdFullRank { eps: None });
    test_tangents!(SvdLowRank, Solver::SvdLowRank { eps: None });
    test_tangents!(LowRank, Solver::LowRank { rank: 6 });
    test_tangents!(Cholesky, Solver::Cholesky);
    test_tangents!(CholMaxEig, Solver::CholMaxEig { eps: None });
    test_tangents!(CholGersh, Solver::CholGersh { eps: None });

    #[test]
    fn test_truncated_eigh_matches_dense() {
        let n = 60;
        let k = random_spd(n, 11);
        let (w, v) = sorted_eigh(&k).unwrap();
        let top = w.slice(s![..3]).to_owned();
        let (wl, vl) = largest_eigh(&k, 3).unwrap();
        assert_abs_diff_eq!(wl, top, epsilon = 1e-6 * w[0]);
        for j in 0..3 {
            // eigenvectors are defined up to their sign
            let c = vl.column(j).dot(&v.column(j)).abs();
            assert_abs_diff_eq!(c, 1., epsilon = 1e-5);
        }

        let low = LowRank::new(&k, 3).unwrap();
        assert_abs_diff_eq!(low.eigenvalues(), &top, epsilon = 1e-6 * w[0]);
        let maxeig = CholMaxEig::new(&k, Some(1e-3)).unwrap();
        assert_abs_diff_eq!(maxeig.shift(), 1e-3 * w[0], epsilon = 1e-8 * w[0]);
    }

    #[test]
    fn test_usolve_propagates_covariance() {
        let k = random_spd(5, 3) + Array2::<f64>::eye(5) * 10.;
        let dec = Svd::new(&k).unwrap();
        let mean = array![1., 2., 3., 4., 5.];
        let cov = random_spd(5, 4);
        let res = dec.usolve(&Correlated::new(mean.clone(), cov.clone()).unwrap()).unwrap();
        let inv = dec.inverse().unwrap();
        assert_abs_diff_eq!(k.dot(&res.mean), mean, epsilon = 1e-8);
        assert_abs_diff_eq!(res.cov, inv.dot(&cov).dot(&inv), epsilon = 1e-10);
    }

    #[test]
    fn test_singular_matrix() {
        // rank one matrix
        let v: Array2<f64> = array![[1.], [2.], [3.]];
        let k = v.dot(&v.t());
        assert!(matches!(Cholesky::new(&k), Err(GpError::NumericalError { .. })));
        let low = SvdLowRank::new(&k, Some(1e-10)).unwrap();
        assert_eq!(low.rank(), 1);
        // pseudo inverse on the range of k
        let x = low.solve_vec(array![1., 2., 3.].view()).unwrap();
        assert_abs_diff_eq!(k.dot(&x), array![1., 2., 3.], epsilon = 1e-10);
        let full = SvdFullRank::new(&k, None).unwrap();
        assert!(full.logdet().is_finite());
        let gersh = CholGersh::new(&k, Some(1e-8)).unwrap();
        assert_abs_diff_eq!(gersh.shift(), 1e-8 * 18., epsilon = 1e-15);
        let maxeig = CholMaxEig::new(&k, Some(1e-8)).unwrap();
        assert_abs_diff_eq!(maxeig.shift(), 1e-8 * 14., epsilon = 1e-12);
    }

    #[test]
    fn test_low_rank_truncation() {
        let k = Array2::from_diag(&array![4., 3., 2., 1.]);
        let dec = LowRank::new(&k, 2).unwrap();
        assert_abs_diff_eq!(dec.eigenvalues(), &array![4., 3.], epsilon = 1e-12);
        assert_abs_diff_eq!(dec.logdet(), 12f64.ln(), epsilon = 1e-12);
        let x = dec.solve_vec(array![4., 3., 2., 1.].view()).unwrap();
        assert_abs_diff_eq!(x, array![1., 1., 0., 0.], epsilon = 1e-12);
        assert!(LowRank::new(&k, 0).is_err());
        assert!(LowRank::new(&k, 5).is_err());
    }

    #[test]
    fn test_shape_errors() {
        let k = Array2::<f64>::zeros((2, 3));
        assert!(matches!(Svd::new(&k), Err(GpError::ShapeMismatch(_))));
        let dec = Cholesky::new(&Array2::<f64>::eye(3)).unwrap();
        let b = Array2::<f64>::zeros((2, 1));
        assert!(matches!(dec.solve(b.view()), Err(GpError::ShapeMismatch(_))));
        let mut k = Array2::<f64>::eye(2);
        k[[0, 1]] = f64::NAN;
        assert!(Cholesky::new(&k).is_err());
    }

    #[test]
    fn test_solver_from_str() {
        assert_eq!("svd".parse::<Solver>().unwrap(), Solver::Svd);
        assert_eq!("chol".parse::<Solver>().unwrap(), Solver::Cholesky);
        assert_eq!("gersh".parse::<Solver>().unwrap(), Solver::default());
        assert_eq!(
            "reduce-rank:3".parse::<Solver>().unwrap(),
            Solver::LowRank { rank: 3 }
        );
        assert!("reduce-rank:0".parse::<Solver>().is_err());
        assert!("qr".parse::<Solver>().is_err());
        for name in ["svd", "fullrank", "lowrank", "chol", "maxeig", "gersh", "reduce-rank:2"] {
            let solver: Solver = name.parse().unwrap();
            assert_eq!(solver.to_string(), name);
            let dec = solver.decompose(&random_spd(4, 7)).unwrap();
            assert_eq!(dec.n(), 4);
        }
        assert!(
            Solver::CholGersh { eps: Some(-1.) }
                .decompose(&Array2::<f64>::eye(2))
                .is_err()
        );
    }
}
