//! Dense least squares through `nalgebra`'s SVD.

use nalgebra::{DMatrix, DVector};

/// Singular values below this fraction of the largest count as zero.
const RANK_EPS: f64 = 1e-10;

/// Solve `min ||A x - b||` for a tall `A`.
///
/// Columns are scaled to unit norm before factoring, which keeps Vandermonde
/// systems with large x well conditioned enough for small degrees.
pub(crate) fn lstsq(mut a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, String> {
    let (m, n) = a.shape();
    if n == 0 || m < n {
        return Err(format!("need at least {n} equations, got {m}"));
    }
    if b.len() != m {
        return Err("ragged system".into());
    }

    let mut scale = DVector::zeros(n);
    for (j, mut col) in a.column_iter_mut().enumerate() {
        let norm = col.norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(format!("column {j} is degenerate"));
        }
        col /= norm;
        scale[j] = norm;
    }

    let svd = a.svd(true, true);
    let eps = RANK_EPS * svd.singular_values.max();
    if svd.rank(eps) < n {
        return Err("matrix is rank deficient".into());
    }
    let x = svd.solve(b, eps)?.component_div(&scale);
    if x.iter().any(|v| !v.is_finite()) {
        return Err("solution is not finite".into());
    }
    Ok(x)
}

/// Vandermonde matrix with columns `1, x, ..., x^degree`.
pub(crate) fn vandermonde(x: &[f64], degree: usize) -> DMatrix<f64> {
    DMatrix::from_fn(x.len(), degree + 1, |i, j| {
        (0..j).fold(1.0, |acc, _| acc * x[i])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_square_system() {
        // 2x + y = 5, x - y = 1
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, -1.0]);
        let x = lstsq(a, &DVector::from_vec(vec![5.0, 1.0])).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12);
        assert!((x[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn overdetermined_line() {
        let a = vandermonde(&[0.0, 1.0, 2.0, 3.0], 1);
        let c = lstsq(a, &DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0])).unwrap();
        assert!((c[0] - 1.0).abs() < 1e-12);
        assert!((c[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn dependent_columns_are_rejected() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        assert!(lstsq(a, &DVector::from_element(3, 1.0)).is_err());
    }

    #[test]
    fn underdetermined_is_rejected() {
        let a = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        assert!(lstsq(a, &DVector::from_element(1, 1.0)).is_err());
    }

    #[test]
    fn vandermonde_powers() {
        let v = vandermonde(&[2.0, 3.0], 2);
        assert_eq!(v.row(0).iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 4.0]);
        assert_eq!(v.row(1).iter().copied().collect::<Vec<_>>(), vec![1.0, 3.0, 9.0]);
    }
}
