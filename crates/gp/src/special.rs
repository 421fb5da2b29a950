//! Special functions needed by the kernel catalog.

use std::f64::consts::PI;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;
const MAX_ITER: usize = 10_000;

/// Modified Bessel function of the second kind `K_nu(x)` for real order.
///
/// Uses Temme's series for `x < 2` and Steed's continued fraction otherwise,
/// on the reduced order `|mu| <= 1/2`, then forward recurrence up to `nu`.
/// Returns `NaN` for `x <= 0` or non finite input.
pub fn bessel_k(nu: f64, x: f64) -> f64 {
    if !(x > 0.) || !nu.is_finite() || !x.is_finite() {
        return if x == f64::INFINITY { 0. } else { f64::NAN };
    }
    let nu = nu.abs();
    let nl = (nu + 0.5).floor();
    let xmu = nu - nl;
    let xi2 = 2. / x;
    let (mut rkmu, mut rk1) = if x < 2. {
        temme(xmu, x)
    } else {
        steed(xmu, x)
    };
    for i in 1..=(nl as usize) {
        let next = (xmu + i as f64) * xi2 * rk1 + rkmu;
        rkmu = rk1;
        rk1 = next;
    }
    rkmu
}

/// `(1/Gamma(1 - mu) - 1/Gamma(1 + mu)) / (2 mu)` and
/// `(1/Gamma(1 - mu) + 1/Gamma(1 + mu)) / 2`, plus both reciprocals.
fn gamma_terms(mu: f64) -> (f64, f64, f64, f64) {
    let gampl = 1. / libm::tgamma(1. + mu);
    let gammi = 1. / libm::tgamma(1. - mu);
    let gam1 = if mu.abs() < 1e-5 {
        // series limit, the difference cancels
        -EULER_GAMMA + 0.041_987_102_628_6 * mu * mu
    } else {
        (gammi - gampl) / (2. * mu)
    };
    let gam2 = (gammi + gampl) / 2.;
    (gam1, gam2, gampl, gammi)
}

fn temme(xmu: f64, x: f64) -> (f64, f64) {
    let xmu2 = xmu * xmu;
    let x2 = 0.5 * x;
    let pimu = PI * xmu;
    let fact = if pimu.abs() < f64::EPSILON {
        1.
    } else {
        pimu / pimu.sin()
    };
    let d = -x2.ln();
    let e = xmu * d;
    let fact2 = if e.abs() < f64::EPSILON {
        1.
    } else {
        e.sinh() / e
    };
    let (gam1, gam2, gampl, gammi) = gamma_terms(xmu);
    let mut ff = fact * (gam1 * e.cosh() + gam2 * fact2 * d);
    let mut sum = ff;
    let e = e.exp();
    let mut p = 0.5 * e / gampl;
    let mut q = 0.5 / (e * gammi);
    let mut c = 1.;
    let d = x2 * x2;
    let mut sum1 = p;
    for i in 1..MAX_ITER {
        let fi = i as f64;
        ff = (fi * ff + p + q) / (fi * fi - xmu2);
        c *= d / fi;
        p /= fi - xmu;
        q /= fi + xmu;
        let del = c * ff;
        sum += del;
        let del1 = c * (p - fi * ff);
        sum1 += del1;
        if del.abs() < sum.abs() * f64::EPSILON {
            break;
        }
    }
    (sum, sum1 * 2. / x)
}

fn steed(xmu: f64, x: f64) -> (f64, f64) {
    let xmu2 = xmu * xmu;
    let mut b = 2. * (1. + x);
    let mut d = 1. / b;
    let mut delh = d;
    let mut h = d;
    let mut q1 = 0.;
    let mut q2 = 1.;
    let a1 = 0.25 - xmu2;
    let mut q = a1;
    let mut c = a1;
    let mut a = -a1;
    let mut s = 1. + q * delh;
    for i in 2..MAX_ITER {
        let fi = i as f64;
        a -= 2. * (fi - 1.);
        c = -a * c / fi;
        let qnew = (q1 - b * q2) / a;
        q1 = q2;
        q2 = qnew;
        q += c * qnew;
        b += 2.;
        d = 1. / (b + a * d);
        delh = (b * d - 1.) * delh;
        h += delh;
        let dels = q * delh;
        s += dels;
        if (dels / s).abs() < f64::EPSILON {
            break;
        }
    }
    let h = a1 * h;
    let rkmu = (PI / (2. * x)).sqrt() * (-x).exp() / s;
    let rk1 = rkmu * (xmu + x + 0.5 - h) / x;
    (rkmu, rk1)
}
