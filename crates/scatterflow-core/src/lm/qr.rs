//! Householder QR factorization with column pivoting (MINPACK `qrfac`).
//!
//! Pivoting always selects the remaining column with the largest norm, so
//! `a * P = Q * R` with `R`'s diagonal non-increasing in magnitude. The
//! Householder vectors used to build `Q` are packed into the strictly
//! lower-triangular part of the returned matrix rather than formed
//! explicitly, matching how [`super::lmpar::lmpar`] and [`apply_qt`]
//! consume them.

use super::enorm::enorm;
use nalgebra::{DMatrix, DVector};

/// A packed Householder QR factorization of an `m x n` matrix, `m >= n`
/// not required — works for the `m < n` case because the loop below only
/// runs `min(m, n)` reflections.
pub struct QrPivoted {
    /// The working matrix after factorization: strictly-lower part holds
    /// Householder vectors, the upper part (above the diagonal) holds
    /// `R`'s off-diagonal entries.
    pub packed: DMatrix<f64>,
    /// `R`'s diagonal, with MINPACK's sign convention (`-ajnorm`).
    pub rdiag: DVector<f64>,
    /// Original (pre-pivot) column norms, for `lmpar`'s relative tests.
    pub acnorm: DVector<f64>,
    /// `permutation[k]` is the original column index now in position `k`.
    pub permutation: Vec<usize>,
}

pub fn qrfac(a: &DMatrix<f64>) -> QrPivoted {
    let (m, n) = a.shape();
    let mut packed = a.clone();
    let mut rdiag = DVector::zeros(n);
    let mut wa = DVector::zeros(n);
    let mut acnorm = DVector::zeros(n);
    let mut permutation: Vec<usize> = (0..n).collect();

    for j in 0..n {
        let norm = column_norm(&packed, 0, m, j);
        acnorm[j] = norm;
        rdiag[j] = norm;
        wa[j] = norm;
    }

    let minmn = m.min(n);
    for j in 0..minmn {
        // Column pivoting: bring the largest-remaining-norm column to position j.
        let mut kmax = j;
        for k in (j + 1)..n {
            if rdiag[k] > rdiag[kmax] {
                kmax = k;
            }
        }
        if kmax != j {
            packed.swap_columns(j, kmax);
            rdiag.swap_rows(j, kmax);
            wa.swap_rows(j, kmax);
            permutation.swap(j, kmax);
        }

        let mut ajnorm = column_norm(&packed, j, m, j);
        if ajnorm != 0.0 {
            if packed[(j, j)] < 0.0 {
                ajnorm = -ajnorm;
            }
            for i in j..m {
                packed[(i, j)] /= ajnorm;
            }
            packed[(j, j)] += 1.0;

            for k in (j + 1)..n {
                let mut sum = 0.0;
                for i in j..m {
                    sum += packed[(i, j)] * packed[(i, k)];
                }
                let temp = sum / packed[(j, j)];
                for i in j..m {
                    packed[(i, k)] -= temp * packed[(i, j)];
                }

                if rdiag[k] != 0.0 {
                    let temp = packed[(j, k)] / rdiag[k];
                    rdiag[k] *= (1.0 - temp * temp).max(0.0).sqrt();
                    if 0.05 * (rdiag[k] / wa[k]).powi(2) <= f64::EPSILON {
                        rdiag[k] = column_norm(&packed, j + 1, m, k);
                        wa[k] = rdiag[k];
                    }
                }
            }
        }
        rdiag[j] = -ajnorm;
    }

    QrPivoted { packed, rdiag, acnorm, permutation }
}

fn column_norm(m: &DMatrix<f64>, from_row: usize, to_row: usize, col: usize) -> f64 {
    let v = DVector::from_iterator(to_row - from_row, (from_row..to_row).map(|i| m[(i, col)]));
    enorm(&v)
}

/// Apply `Q^T` (as packed in `qr.packed`'s Householder vectors) to `v` in place.
pub fn apply_qt(qr: &QrPivoted, v: &mut DVector<f64>) {
    let (m, n) = qr.packed.shape();
    let minmn = m.min(n);
    for j in 0..minmn {
        if qr.packed[(j, j)] == 0.0 {
            continue;
        }
        let mut sum = 0.0;
        for i in j..m {
            sum += qr.packed[(i, j)] * v[i];
        }
        let temp = sum / qr.packed[(j, j)];
        for i in j..m {
            v[i] -= temp * qr.packed[(i, j)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivots_toward_decreasing_r_diagonal_magnitude() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);
        let qr = qrfac(&a);
        assert!(qr.rdiag[0].abs() >= qr.rdiag[1].abs());
        // The larger-norm column (index 1) should have been pivoted first.
        assert_eq!(qr.permutation[0], 1);
    }

    #[test]
    fn qtb_zeroes_below_diagonal_for_square_full_rank() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 3.0]);
        let qr = qrfac(&a);
        let mut b = DVector::from_vec(vec![4.0, 9.0]);
        apply_qt(&qr, &mut b);
        assert!(b.iter().all(|x| x.is_finite()));
    }
}
