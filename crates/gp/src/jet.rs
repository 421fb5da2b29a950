//! Forward-mode automatic differentiation for kernel functions.
//!
//! Kernel functions are written once, generically over [`Scalar`], and are
//! evaluated either on plain `f64` or on [`Jet`] values. A jet is a truncated
//! bivariate Taylor polynomial in two independent perturbations `dx` (first
//! kernel argument) and `dy` (second kernel argument):
//!
//! `f(x + dx, y + dy) = sum_{i <= px, j <= py} c_ij dx^i dy^j`
//!
//! so that `d^i/dx^i d^j/dy^j f = i! j! c_ij`. Elementary functions are
//! applied by composing their univariate Taylor expansion with the
//! nilpotent part of the argument.

use crate::special::bessel_k;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

mod private {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for super::Jet {}
}

/// Runtime view of a [`Scalar`], used to call type-erased kernel functions.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub enum ScalarRepr {
    Real(f64),
    Jet(Jet),
}

/// Numbers kernel functions are evaluated on: `f64` or [`Jet`].
///
/// The trait is sealed; user kernel functions are generic over it:
///
/// ```
/// use epigp_gp::Scalar;
///
/// fn cauchy<T: Scalar>(r2: T) -> T {
///     (r2 + 1.).powf(-1.)
/// }
/// assert_eq!(cauchy(1.0_f64), 0.5);
/// ```
pub trait Scalar:
    Clone
    + fmt::Debug
    + Send
    + Sync
    + 'static
    + private::Sealed
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// A value carrying no derivative
    fn constant(v: f64) -> Self;
    /// The plain value (zeroth order coefficient)
    fn value(&self) -> f64;
    /// Exponential
    fn exp(&self) -> Self;
    /// Natural logarithm
    fn ln(&self) -> Self;
    /// Square root
    fn sqrt(&self) -> Self;
    /// Real power
    fn powf(&self, p: f64) -> Self;
    /// Integer power
    fn powi(&self, n: i32) -> Self;
    /// Sine
    fn sin(&self) -> Self;
    /// Cosine
    fn cos(&self) -> Self;
    /// Arcsine
    fn asin(&self) -> Self;
    /// Modified Bessel function of the second kind `K_nu(self)`
    fn bessel_k(&self, nu: f64) -> Self;

    #[doc(hidden)]
    fn into_repr(self) -> ScalarRepr;
    #[doc(hidden)]
    fn from_repr(repr: ScalarRepr) -> Self;
}

impl Scalar for f64 {
    fn constant(v: f64) -> Self {
        v
    }
    fn value(&self) -> f64 {
        *self
    }
    fn exp(&self) -> Self {
        f64::exp(*self)
    }
    fn ln(&self) -> Self {
        f64::ln(*self)
    }
    fn sqrt(&self) -> Self {
        f64::sqrt(*self)
    }
    fn powf(&self, p: f64) -> Self {
        f64::powf(*self, p)
    }
    fn powi(&self, n: i32) -> Self {
        f64::powi(*self, n)
    }
    fn sin(&self) -> Self {
        f64::sin(*self)
    }
    fn cos(&self) -> Self {
        f64::cos(*self)
    }
    fn asin(&self) -> Self {
        f64::asin(*self)
    }
    fn bessel_k(&self, nu: f64) -> Self {
        bessel_k(nu, *self)
    }
    fn into_repr(self) -> ScalarRepr {
        ScalarRepr::Real(self)
    }
    fn from_repr(repr: ScalarRepr) -> Self {
        match repr {
            ScalarRepr::Real(v) => v,
            ScalarRepr::Jet(j) => j.value(),
        }
    }
}

/// Truncated bivariate Taylor polynomial.
///
/// A jet without order is a constant: it carries no perturbation and mixes
/// with jets of any order.
#[derive(Clone, Debug, PartialEq)]
pub struct Jet {
    order: Option<(usize, usize)>,
    coef: Vec<f64>,
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1., |acc, k| acc * k as f64)
}

impl Jet {
    /// A constant jet
    pub fn constant(v: f64) -> Self {
        Jet {
            order: None,
            coef: vec![v],
        }
    }

    fn zeros(px: usize, py: usize) -> Self {
        Jet {
            order: Some((px, py)),
            coef: vec![0.; (px + 1) * (py + 1)],
        }
    }

    /// The first-argument variable `x + dx`, truncated at orders `(px, py)`
    pub fn variable_x(x: f64, px: usize, py: usize) -> Self {
        let mut j = Self::zeros(px, py);
        j.coef[0] = x;
        if px > 0 {
            j.coef[py + 1] = 1.;
        }
        j
    }

    /// The second-argument variable `y + dy`, truncated at orders `(px, py)`
    pub fn variable_y(y: f64, px: usize, py: usize) -> Self {
        let mut j = Self::zeros(px, py);
        j.coef[0] = y;
        if py > 0 {
            j.coef[1] = 1.;
        }
        j
    }

    /// Truncation orders, `None` for constants
    pub fn order(&self) -> Option<(usize, usize)> {
        self.order
    }

    /// Plain value
    pub fn value(&self) -> f64 {
        self.coef[0]
    }

    /// Taylor coefficient of `dx^i dy^j`
    pub fn coefficient(&self, i: usize, j: usize) -> f64 {
        match self.order {
            None => {
                if i == 0 && j == 0 {
                    self.coef[0]
                } else {
                    0.
                }
            }
            Some((px, py)) => {
                if i <= px && j <= py {
                    self.coef[i * (py + 1) + j]
                } else {
                    0.
                }
            }
        }
    }

    /// Partial derivative `d^i/dx^i d^j/dy^j` at the expansion point
    pub fn derivative(&self, i: usize, j: usize) -> f64 {
        self.coefficient(i, j) * factorial(i) * factorial(j)
    }

    /// The jet of the partial derivative `d^a/dx^a d^b/dy^b` of this jet,
    /// truncated at orders `(px - a, py - b)`.
    pub fn shift(&self, a: usize, b: usize) -> Jet {
        match self.order {
            None => {
                if a + b == 0 {
                    self.clone()
                } else {
                    Jet::constant(0.)
                }
            }
            Some((px, py)) => {
                let (qx, qy) = (px.saturating_sub(a), py.saturating_sub(b));
                let mut out = Jet::zeros(qx, qy);
                for i in 0..=qx {
                    for j in 0..=qy {
                        let scale = factorial(i + a) / factorial(i) * factorial(j + b)
                            / factorial(j);
                        out.coef[i * (qy + 1) + j] = self.coefficient(i + a, j + b) * scale;
                    }
                }
                out
            }
        }
    }

    fn common_order(&self, other: &Jet) -> Option<(usize, usize)> {
        match (self.order, other.order) {
            (None, o) | (o, None) => o,
            (Some((ax, ay)), Some((bx, by))) => Some((ax.min(bx), ay.min(by))),
        }
    }

    fn coefs_at(&self, order: Option<(usize, usize)>) -> Vec<f64> {
        match order {
            None => vec![self.coef[0]],
            Some((px, py)) => {
                let mut c = vec![0.; (px + 1) * (py + 1)];
                for i in 0..=px {
                    for j in 0..=py {
                        c[i * (py + 1) + j] = self.coefficient(i, j);
                    }
                }
                c
            }
        }
    }

    fn zip_with(self, other: Jet, f: impl Fn(f64, f64) -> f64) -> Jet {
        let order = self.common_order(&other);
        let a = self.coefs_at(order);
        let b = other.coefs_at(order);
        Jet {
            order,
            coef: a.iter().zip(b.iter()).map(|(u, v)| f(*u, *v)).collect(),
        }
    }

    fn convolve(a: &[f64], b: &[f64], px: usize, py: usize) -> Vec<f64> {
        let w = py + 1;
        let mut c = vec![0.; (px + 1) * w];
        for i in 0..=px {
            for j in 0..=py {
                let mut s = 0.;
                for k in 0..=i {
                    for l in 0..=j {
                        s += a[k * w + l] * b[(i - k) * w + (j - l)];
                    }
                }
                c[i * w + j] = s;
            }
        }
        c
    }

    /// Apply a univariate function given its Taylor coefficients
    /// `taylor[k] = f^(k)(value) / k!` at the jet value.
    fn compose(&self, taylor: impl Fn(f64, usize) -> Vec<f64>) -> Jet {
        let Some((px, py)) = self.order else {
            return Jet::constant(taylor(self.coef[0], 0)[0]);
        };
        let n = px + py;
        let a = taylor(self.coef[0], n);
        let mut h = self.coef.clone();
        h[0] = 0.;
        // Horner over the nilpotent part, h^(n+1) vanishes
        let mut acc = vec![0.; h.len()];
        acc[0] = a[n];
        for k in (0..n).rev() {
            acc = Self::convolve(&acc, &h, px, py);
            acc[0] += a[k];
        }
        Jet {
            order: self.order,
            coef: acc,
        }
    }
}

fn exp_series(u: f64, n: usize) -> Vec<f64> {
    let e = u.exp();
    (0..=n).map(|k| e / factorial(k)).collect()
}

fn ln_series(u: f64, n: usize) -> Vec<f64> {
    (0..=n)
        .map(|k| {
            if k == 0 {
                u.ln()
            } else {
                let sign = if k % 2 == 1 { 1. } else { -1. };
                sign / (k as f64 * u.powi(k as i32))
            }
        })
        .collect()
}

fn pow_series(u: f64, p: f64, n: usize) -> Vec<f64> {
    let mut binom = 1.;
    let mut out = Vec::with_capacity(n + 1);
    for k in 0..=n {
        if k > 0 {
            binom *= (p - (k - 1) as f64) / k as f64;
        }
        out.push(if binom == 0. {
            0.
        } else {
            binom * u.powf(p - k as f64)
        });
    }
    out
}

fn sincos_series(u: f64, n: usize, cosine: bool) -> Vec<f64> {
    let (s, c) = u.sin_cos();
    let cycle = if cosine { [c, -s, -c, s] } else { [s, c, -s, -c] };
    (0..=n).map(|k| cycle[k % 4] / factorial(k)).collect()
}

fn asin_series(u: f64, n: usize) -> Vec<f64> {
    // asin' = w^(-1/2) with w(t) = 1 - (u + t)^2
    let w = [1. - u * u, -2. * u, -1.];
    let p = -0.5;
    let mut v = vec![0.; n.max(1)];
    v[0] = w[0].powf(p);
    for k in 1..v.len() {
        let mut s = 0.;
        for j in 1..=k.min(2) {
            s += ((p + 1.) * j as f64 - k as f64) * w[j] * v[k - j];
        }
        v[k] = s / (k as f64 * w[0]);
    }
    let mut out = vec![u.asin()];
    out.extend((1..=n).map(|k| v[k - 1] / k as f64));
    out
}

fn bessel_k_series(nu: f64, u: f64, n: usize) -> Vec<f64> {
    // d^k K_nu = (-1/2)^k sum_j C(k, j) K_{nu - k + 2j}
    (0..=n)
        .map(|k| {
            let mut binom = 1.;
            let mut s = 0.;
            for j in 0..=k {
                if j > 0 {
                    binom *= (k - j + 1) as f64 / j as f64;
                }
                s += binom * bessel_k((nu - k as f64 + 2. * j as f64).abs(), u);
            }
            (-0.5_f64).powi(k as i32) * s / factorial(k)
        })
        .collect()
}

impl Scalar for Jet {
    fn constant(v: f64) -> Self {
        Jet::constant(v)
    }
    fn value(&self) -> f64 {
        self.coef[0]
    }
    fn exp(&self) -> Self {
        self.compose(exp_series)
    }
    fn ln(&self) -> Self {
        self.compose(ln_series)
    }
    fn sqrt(&self) -> Self {
        self.compose(|u, n| pow_series(u, 0.5, n))
    }
    fn powf(&self, p: f64) -> Self {
        self.compose(|u, n| pow_series(u, p, n))
    }
    fn powi(&self, n: i32) -> Self {
        self.compose(|u, k| pow_series(u, n as f64, k))
    }
    fn sin(&self) -> Self {
        self.compose(|u, n| sincos_series(u, n, false))
    }
    fn cos(&self) -> Self {
        self.compose(|u, n| sincos_series(u, n, true))
    }
    fn asin(&self) -> Self {
        self.compose(asin_series)
    }
    fn bessel_k(&self, nu: f64) -> Self {
        self.compose(|u, n| bessel_k_series(nu, u, n))
    }
    fn into_repr(self) -> ScalarRepr {
        ScalarRepr::Jet(self)
    }
    fn from_repr(repr: ScalarRepr) -> Self {
        match repr {
            ScalarRepr::Real(v) => Jet::constant(v),
            ScalarRepr::Jet(j) => j,
        }
    }
}

impl Add for Jet {
    type Output = Jet;
    fn add(self, rhs: Jet) -> Jet {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub for Jet {
    type Output = Jet;
    fn sub(self, rhs: Jet) -> Jet {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl Mul for Jet {
    type Output = Jet;
    fn mul(self, rhs: Jet) -> Jet {
        let order = self.common_order(&rhs);
        match order {
            None => Jet::constant(self.coef[0] * rhs.coef[0]),
            Some((px, py)) => Jet {
                order,
                coef: Jet::convolve(&self.coefs_at(order), &rhs.coefs_at(order), px, py),
            },
        }
    }
}

impl Div for Jet {
    type Output = Jet;
    fn div(self, rhs: Jet) -> Jet {
        let order = self.common_order(&rhs);
        let Some((px, py)) = order else {
            return Jet::constant(self.coef[0] / rhs.coef[0]);
        };
        let p = self.coefs_at(order);
        let q = rhs.coefs_at(order);
        let w = py + 1;
        let mut r = vec![0.; p.len()];
        for i in 0..=px {
            for j in 0..=py {
                let mut s = p[i * w + j];
                for k in 0..=i {
                    for l in 0..=j {
                        if k + l > 0 {
                            s -= q[k * w + l] * r[(i - k) * w + (j - l)];
                        }
                    }
                }
                r[i * w + j] = s / q[0];
            }
        }
        Jet { order, coef: r }
    }
}

impl Neg for Jet {
    type Output = Jet;
    fn neg(mut self) -> Jet {
        self.coef.iter_mut().for_each(|c| *c = -*c);
        self
    }
}

impl Add<f64> for Jet {
    type Output = Jet;
    fn add(mut self, rhs: f64) -> Jet {
        self.coef[0] += rhs;
        self
    }
}

impl Sub<f64> for Jet {
    type Output = Jet;
    fn sub(mut self, rhs: f64) -> Jet {
        self.coef[0] -= rhs;
        self
    }
}

impl Mul<f64> for Jet {
    type Output = Jet;
    fn mul(mut self, rhs: f64) -> Jet {
        self.coef.iter_mut().for_each(|c| *c *= rhs);
        self
    }
}

impl Div<f64> for Jet {
    type Output = Jet;
    fn div(mut self, rhs: f64) -> Jet {
        self.coef.iter_mut().for_each(|c| *c /= rhs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn xy(x: f64, y: f64, px: usize, py: usize) -> (Jet, Jet) {
        (Jet::variable_x(x, px, py), Jet::variable_y(y, px, py))
    }

    #[test]
    fn test_product_rule() {
        let (x, y) = xy(0.3, 1.2, 2, 2);
        let f = x.exp() * y.sin();
        assert_abs_diff_eq!(f.derivative(0, 0), 0.3_f64.exp() * 1.2_f64.sin(), epsilon = 1e-14);
        assert_abs_diff_eq!(f.derivative(2, 1), 0.3_f64.exp() * 1.2_f64.cos(), epsilon = 1e-14);
        assert_abs_diff_eq!(f.derivative(1, 2), -0.3_f64.exp() * 1.2_f64.sin(), epsilon = 1e-14);
    }

    #[test]
    fn test_quotient_and_powers() {
        let (x, y) = xy(0.7, -0.4, 2, 1);
        // f = x^2 y / (1 + x)
        let f = x.clone().powi(2) * y / (x.clone() + 1.);
        let (u, v) = (0.7_f64, -0.4_f64);
        // df/dx = y (x^2 + 2x) / (1 + x)^2
        assert_abs_diff_eq!(
            f.derivative(1, 0),
            v * (u * u + 2. * u) / (1. + u).powi(2),
            epsilon = 1e-13
        );
        // d2f/dx dy = (x^2 + 2x) / (1 + x)^2
        assert_abs_diff_eq!(
            f.derivative(1, 1),
            (u * u + 2. * u) / (1. + u).powi(2),
            epsilon = 1e-13
        );
        // d2f/dx2 = 2 y / (1 + x)^3
        assert_abs_diff_eq!(f.derivative(2, 0), 2. * v / (1. + u).powi(3), epsilon = 1e-13);
        let g = x.sqrt();
        assert_abs_diff_eq!(g.derivative(2, 0), -0.25 * u.powf(-1.5), epsilon = 1e-13);
    }

    #[test]
    fn test_ln_and_asin() {
        let (x, _) = xy(0.35, 0., 3, 0);
        let f = x.ln();
        assert_abs_diff_eq!(f.derivative(3, 0), 2. / 0.35_f64.powi(3), epsilon = 1e-10);
        let g = x.asin();
        let u = 0.35_f64;
        assert_abs_diff_eq!(g.derivative(1, 0), 1. / (1. - u * u).sqrt(), epsilon = 1e-13);
        assert_abs_diff_eq!(
            g.derivative(2, 0),
            u / (1. - u * u).powf(1.5),
            epsilon = 1e-13
        );
        assert_abs_diff_eq!(
            g.derivative(3, 0),
            (1. + 2. * u * u) / (1. - u * u).powf(2.5),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_shift() {
        let (x, y) = xy(0.5, 0.25, 2, 2);
        let f = (x.clone() * y.clone()).exp();
        // d/dx exp(xy) = y exp(xy); d2/dxdy = (1 + xy) exp(xy)
        let dfdx = f.shift(1, 0);
        assert_eq!(dfdx.order(), Some((1, 2)));
        assert_abs_diff_eq!(dfdx.value(), 0.25 * 0.125_f64.exp(), epsilon = 1e-14);
        let d2 = dfdx.shift(0, 1);
        assert_abs_diff_eq!(d2.value(), 1.125 * 0.125_f64.exp(), epsilon = 1e-14);
        assert_abs_diff_eq!(f.shift(1, 1).value(), d2.value(), epsilon = 1e-14);
    }

    #[test]
    fn test_constants_mix() {
        let (x, _) = xy(2., 0., 1, 0);
        let c = Jet::constant(3.);
        let f = c.clone() * x.clone() + c;
        assert_eq!(f.order(), Some((1, 0)));
        assert_abs_diff_eq!(f.derivative(1, 0), 3.);
        assert_eq!(Jet::constant(1.).shift(1, 0), Jet::constant(0.));
    }

    #[test]
    fn test_bessel_k_derivative() {
        let nu = 1.3;
        let u = 0.8;
        let (x, _) = xy(u, 0., 1, 0);
        let d = x.bessel_k(nu).derivative(1, 0);
        let h = 1e-6;
        let fd = (bessel_k(nu, u + h) - bessel_k(nu, u - h)) / (2. * h);
        assert_abs_diff_eq!(d, fd, epsilon = 1e-7);
    }
}
