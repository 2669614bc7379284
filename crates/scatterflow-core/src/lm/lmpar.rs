//! The Levenberg-Marquardt trust-region subproblem (MINPACK `lmpar`): given
//! a QR-factored, column-pivoted Jacobian and a trust radius `delta`, find
//! a damping parameter `par >= 0` and step `x` such that `||D x||` is
//! close to `delta` and `x` solves `(J^T J + par D^2) x = J^T r`.
//!
//! MINPACK solves the damped system incrementally via Givens rotations
//! (`qrsolv`) reusing the existing QR factors. This builds the (small,
//! `n x n`) damped normal-equations matrix directly and solves it with
//! `nalgebra`'s dense LU each trial `par` instead — equivalent in exact
//! arithmetic, simpler to get right, and `nalgebra` is already the dense
//! linear algebra dependency this crate carries.

use super::enorm::enorm;
use super::qr::QrPivoted;
use nalgebra::{DMatrix, DVector};

/// Returns `(par, step)`, where `step` is in the *original* (unpivoted)
/// parameter ordering.
pub fn lmpar(qr: &QrPivoted, diag: &DVector<f64>, qtb: &DVector<f64>, delta: f64) -> (f64, DVector<f64>) {
    let n = diag.len();
    if n == 0 {
        return (0.0, DVector::zeros(0));
    }
    let perm = &qr.permutation;

    let mut r = DMatrix::zeros(n, n);
    for j in 0..n {
        r[(j, j)] = qr.rdiag[j];
        for i in 0..j {
            r[(i, j)] = qr.packed[(i, j)];
        }
    }
    let qtb_n = qtb.rows(0, n).clone_owned();
    let diag_perm = DVector::from_iterator(n, (0..n).map(|j| diag[perm[j]].max(f64::MIN_POSITIVE)));

    let unpermute = |v: &DVector<f64>| {
        let mut out = DVector::zeros(n);
        for j in 0..n {
            out[perm[j]] = v[j];
        }
        out
    };

    let solve_for = |par: f64| -> DVector<f64> {
        let rtr = r.transpose() * &r;
        let damping = DMatrix::from_diagonal(&diag_perm.map(|d| par * d * d));
        let lhs = rtr + damping;
        let rhs = r.transpose() * &qtb_n;
        lhs.lu().solve(&rhs).unwrap_or_else(|| DVector::zeros(n))
    };

    let scaled_norm = |step: &DVector<f64>| {
        let scaled = DVector::from_iterator(n, (0..n).map(|j| diag_perm[j] * step[j]));
        enorm(&scaled)
    };

    // Gauss-Newton step first; accept it outright if already inside the trust region.
    let gn = solve_for(0.0);
    if scaled_norm(&gn) <= 1.1 * delta {
        return (0.0, unpermute(&gn));
    }

    let mut parl = 0.0_f64;
    let mut paru = {
        let g = r.transpose() * &qtb_n;
        let gnorm = enorm(&g);
        if gnorm > 0.0 {
            gnorm / delta.max(f64::EPSILON)
        } else {
            1.0
        }
    };
    let mut par = 0.5 * paru;
    let mut step = gn;

    for _ in 0..30 {
        step = solve_for(par);
        let norm = scaled_norm(&step);
        if (norm - delta).abs() <= 0.1 * delta || (paru - parl) < 1e-12 * paru.max(1.0) {
            break;
        }
        if norm > delta {
            parl = par;
        } else {
            paru = par;
        }
        par = if parl > 0.0 { 0.5 * (parl + paru) } else { 0.5 * paru };
    }

    (par, unpermute(&step))
}
