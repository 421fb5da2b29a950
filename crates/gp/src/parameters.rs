use crate::algorithm::GaussianProcess;
use crate::decomposition::Solver;
use crate::errors::{GpError, Result};
use crate::kernel::Kernel;
use crate::optimization::Algorithm;
use crate::{EMPBAYES_MAX_EVAL, EMPBAYES_MIN_EVAL};
use linfa::ParamGuard;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A set of validated GP parameters.
#[derive(Clone, Debug)]
pub struct GpValidParams {
    /// Prior covariance kernel of the process
    pub(crate) kernel: Kernel,
    /// Decomposition strategy of the covariance matrices
    pub(crate) solver: Solver,
    /// Check the prior covariance is positive semidefinite when built
    pub(crate) checkpos: bool,
    /// Check the prior covariance is symmetric when built
    pub(crate) checksym: bool,
}

impl GpValidParams {
    /// Get the prior kernel
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Get the decomposition strategy
    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    /// Whether positivity of the prior covariance is checked
    pub fn checkpos(&self) -> bool {
        self.checkpos
    }

    /// Whether symmetry of the prior covariance is checked
    pub fn checksym(&self) -> bool {
        self.checksym
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified to build a
/// [Gaussian process](struct.GaussianProcess.html).
pub struct GpParams(GpValidParams);

impl GpParams {
    /// A constructor for GP parameters given the prior kernel
    pub fn new(kernel: Kernel) -> GpParams {
        Self(GpValidParams {
            kernel,
            solver: Solver::default(),
            checkpos: true,
            checksym: true,
        })
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams) -> Self {
        Self(params.clone())
    }

    /// Set the prior kernel.
    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set the decomposition strategy.
    pub fn solver(mut self, solver: Solver) -> Self {
        self.0.solver = solver;
        self
    }

    /// Enable or disable the positivity check of the prior covariance.
    ///
    /// The check costs an eigen decomposition of the whole covariance.
    pub fn checkpos(mut self, checkpos: bool) -> Self {
        self.0.checkpos = checkpos;
        self
    }

    /// Enable or disable the symmetry check of the prior covariance.
    pub fn checksym(mut self, checksym: bool) -> Self {
        self.0.checksym = checksym;
        self
    }

    /// Validate parameters and build a GP with no registered input
    pub fn build(self) -> Result<GaussianProcess> {
        Ok(GaussianProcess::new(self.check()?))
    }
}

impl From<GpValidParams> for GpParams {
    fn from(valid: GpValidParams) -> Self {
        GpParams(valid)
    }
}

impl ParamGuard for GpParams {
    type Checked = GpValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.solver.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// A set of validated empirical Bayes parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct EmpBayesValidParams {
    /// Optimizer used to maximize the posterior
    pub(crate) algorithm: Algorithm,
    /// Max number of objective evaluations
    pub(crate) max_eval: usize,
    /// Relative tolerance on the objective
    pub(crate) ftol_rel: f64,
    /// Half width of the search box in prior standard deviations
    pub(crate) bound_sigmas: f64,
    /// Decomposition used to invert the hessian at the optimum
    pub(crate) solver: Solver,
}

impl Default for EmpBayesValidParams {
    fn default() -> Self {
        EmpBayesValidParams {
            algorithm: Algorithm::default(),
            max_eval: EMPBAYES_MAX_EVAL,
            ftol_rel: 1e-8,
            bound_sigmas: 5.,
            solver: Solver::Svd,
        }
    }
}

impl EmpBayesValidParams {
    /// Get the optimizer
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Get the max number of objective evaluations
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }

    /// Get the relative tolerance on the objective
    pub fn ftol_rel(&self) -> f64 {
        self.ftol_rel
    }

    /// Get the half width of the search box, in prior standard deviations
    pub fn bound_sigmas(&self) -> f64 {
        self.bound_sigmas
    }

    /// Get the decomposition used to invert the hessian
    pub fn solver(&self) -> &Solver {
        &self.solver
    }
}

#[derive(Clone, Debug, Default)]
/// The set of parameters of [`empbayes_fit`](crate::empbayes_fit).
pub struct EmpBayesParams(EmpBayesValidParams);

impl EmpBayesParams {
    /// Default parameters: SLSQP, search box of 5 prior standard deviations
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the optimizer.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.0.algorithm = algorithm;
        self
    }

    /// Set the max number of objective evaluations.
    /// Values below [crate::EMPBAYES_MIN_EVAL] are raised to it.
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = EMPBAYES_MIN_EVAL.max(max_eval);
        self
    }

    /// Set the relative tolerance on the objective.
    pub fn ftol_rel(mut self, ftol_rel: f64) -> Self {
        self.0.ftol_rel = ftol_rel;
        self
    }

    /// Set the half width of the search box in prior standard deviations.
    pub fn bound_sigmas(mut self, bound_sigmas: f64) -> Self {
        self.0.bound_sigmas = bound_sigmas;
        self
    }

    /// Set the decomposition used to invert the hessian.
    pub fn solver(mut self, solver: Solver) -> Self {
        self.0.solver = solver;
        self
    }
}

impl ParamGuard for EmpBayesParams {
    type Checked = EmpBayesValidParams;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !(self.0.ftol_rel.is_finite() && self.0.ftol_rel > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`ftol_rel` should be positive, got {}",
                self.0.ftol_rel
            )));
        }
        if !(self.0.bound_sigmas.is_finite() && self.0.bound_sigmas > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`bound_sigmas` should be positive, got {}",
                self.0.bound_sigmas
            )));
        }
        self.0.solver.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
