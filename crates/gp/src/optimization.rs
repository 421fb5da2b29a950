use ndarray::{Array1, arr1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{GpError, Result};

/// Optimizer used to maximize the hyperparameters posterior
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Algorithm {
    /// Sequential least squares programming, uses the gradient
    #[default]
    Slsqp,
    /// Derivative free linear approximations
    Cobyla,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Slsqp => write!(f, "slsqp"),
            Algorithm::Cobyla => write!(f, "cobyla"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = GpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "slsqp" => Ok(Algorithm::Slsqp),
            "cobyla" => Ok(Algorithm::Cobyla),
            other => Err(GpError::InvalidValueError(format!(
                "unknown optimizer '{other}', expected slsqp or cobyla"
            ))),
        }
    }
}

pub(crate) struct OptimParams {
    pub rhobeg: f64,
    pub ftol_rel: f64,
    pub maxeval: usize,
}

impl Default for OptimParams {
    fn default() -> Self {
        OptimParams {
            rhobeg: 0.5,
            ftol_rel: 1e-8,
            maxeval: 200,
        }
    }
}

/// Outcome of a bounded minimization
#[derive(Debug)]
pub(crate) struct OptimResult {
    pub x: Array1<f64>,
    pub fmin: f64,
    pub converged: bool,
}

/// Minimize `objfn` within `bounds` starting from `x0`.
///
/// A failed run still reports the last iterate, flagged as not converged.
pub(crate) fn optimize_params<ObjF>(
    algorithm: Algorithm,
    objfn: ObjF,
    x0: &Array1<f64>,
    bounds: &[(f64, f64)],
    params: OptimParams,
) -> OptimResult
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
{
    let xinit = x0.to_vec();
    let res = match algorithm {
        Algorithm::Slsqp => {
            let cons: Vec<&dyn slsqp::Func<()>> = vec![];
            slsqp::minimize(
                &objfn,
                &xinit,
                bounds,
                &cons,
                (),
                params.maxeval,
                Some(slsqp::StopTols {
                    ftol_rel: params.ftol_rel,
                    ..slsqp::StopTols::default()
                }),
            )
            .map(|(_, x, f)| (x, f))
            .map_err(|(status, x, f)| (format!("{status:?}"), x, f))
        }
        Algorithm::Cobyla => {
            let cons: Vec<&dyn cobyla::Func<()>> = vec![];
            cobyla::minimize(
                |x, u| objfn(x, None, u),
                &xinit,
                bounds,
                &cons,
                (),
                params.maxeval,
                cobyla::RhoBeg::All(params.rhobeg),
                Some(cobyla::StopTols {
                    ftol_rel: params.ftol_rel,
                    ..cobyla::StopTols::default()
                }),
            )
            .map(|(_, x, f)| (x, f))
            .map_err(|(status, x, f)| (format!("{status:?}"), x, f))
        }
    };
    match res {
        Ok((x_opt, fval)) => {
            let fmin = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            OptimResult {
                x: arr1(&x_opt),
                fmin,
                converged: fmin.is_finite(),
            }
        }
        Err((status, x_opt, fval)) => {
            log::warn!("{algorithm} optimizer did not converge, status={status}");
            OptimResult {
                x: arr1(&x_opt),
                fmin: if fval.is_nan() { f64::INFINITY } else { fval },
                converged: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn paraboloid(x: &[f64], gradient: Option<&mut [f64]>, _u: &mut ()) -> f64 {
        if let Some(g) = gradient {
            g[0] = 2. * (x[0] - 1.);
            g[1] = 4. * (x[1] + 0.5);
        }
        (x[0] - 1.).powi(2) + 2. * (x[1] + 0.5).powi(2)
    }

    #[test]
    fn test_optimize_paraboloid() {
        for algorithm in [Algorithm::Slsqp, Algorithm::Cobyla] {
            let res = optimize_params(
                algorithm,
                paraboloid,
                &arr1(&[3., 2.]),
                &[(-5., 5.), (-5., 5.)],
                OptimParams {
                    maxeval: 500,
                    ..OptimParams::default()
                },
            );
            assert!(res.converged, "{algorithm}");
            assert_abs_diff_eq!(res.x, arr1(&[1., -0.5]), epsilon = 1e-3);
            assert_abs_diff_eq!(res.fmin, 0., epsilon = 1e-5);
        }
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("SLSQP".parse::<Algorithm>().unwrap(), Algorithm::Slsqp);
        assert_eq!("cobyla".parse::<Algorithm>().unwrap(), Algorithm::Cobyla);
        assert!("lbfgs".parse::<Algorithm>().is_err());
    }
}
