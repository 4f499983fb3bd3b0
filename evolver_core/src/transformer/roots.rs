//! Real roots of polynomials with real coefficients.
//!
//! Roots are the eigenvalues of the companion matrix. Eigenvalues with a
//! negligible imaginary part are kept and polished with Newton steps on the
//! original polynomial.

use nalgebra::DMatrix;

const NEWTON_STEPS: usize = 50;
/// Relative size of an imaginary part still treated as rounding noise.
const IMAG_EPS: f64 = 1e-6;
/// Roots closer than this (relative) are the same root.
const DEDUP_EPS: f64 = 1e-7;

/// Evaluate `c[0] + c[1] x + ... + c[n] x^n` with Horner's scheme.
#[inline]
pub(crate) fn horner(c: &[f64], x: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, ci| acc.mul_add(x, *ci))
}

fn derivative(c: &[f64]) -> Vec<f64> {
    c.iter()
        .enumerate()
        .skip(1)
        .map(|(i, ci)| ci * i as f64)
        .collect()
}

fn polish(c: &[f64], dc: &[f64], mut x: f64) -> f64 {
    for _ in 0..NEWTON_STEPS {
        let d = horner(dc, x);
        if d == 0.0 {
            break;
        }
        let step = horner(c, x) / d;
        if !step.is_finite() {
            break;
        }
        let next = x - step;
        // stop once Newton no longer improves the residual
        if horner(c, next).abs() >= horner(c, x).abs() {
            break;
        }
        x = next;
    }
    x
}

/// Companion matrix of the monic polynomial with ascending coefficients `c`.
fn companion(c: &[f64]) -> DMatrix<f64> {
    let n = c.len() - 1;
    let lead = c[n];
    DMatrix::from_fn(n, n, |i, j| {
        if j == n - 1 {
            -c[i] / lead
        } else if i == j + 1 {
            1.0
        } else {
            0.0
        }
    })
}

/// Real roots of the polynomial with ascending coefficients `c`, sorted
/// ascending and de-duplicated. Constant polynomials have no roots.
pub fn real_roots(c: &[f64]) -> Vec<f64> {
    let Some(top) = c.iter().rposition(|v| *v != 0.0) else {
        return Vec::new();
    };
    let c = &c[..=top];
    match c.len() {
        0 | 1 => Vec::new(),
        2 => vec![-c[0] / c[1]],
        _ => {
            let dc = derivative(c);
            let mut roots: Vec<f64> = companion(c)
                .complex_eigenvalues()
                .iter()
                .filter(|z| z.re.is_finite() && z.im.abs() <= IMAG_EPS * z.re.abs().max(1.0))
                .map(|z| polish(c, &dc, z.re))
                .collect();
            roots.sort_by(f64::total_cmp);
            roots.dedup_by(|a, b| (*a - *b).abs() <= DEDUP_EPS * a.abs().max(1.0));
            roots
        }
    }
}
