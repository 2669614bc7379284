//! Outer Levenberg-Marquardt iteration (MINPACK `lmdif`-style): numeric or
//! analytic Jacobian, trust-region step via [`super::lmpar::lmpar`], box
//! constraints enforced by pegging, and a simplified form of tied
//! parameters.

use super::enorm::enorm;
use super::lmpar::lmpar;
use super::qr::{apply_qt, qrfac};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Termination/status code. Positive values mirror MINPACK `lmdif`'s
/// `info` output; negative values are this crate's own input-validation
/// failures, raised before any iteration runs. This table is part of the
/// external contract — values must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmStatus(pub i32);

impl LmStatus {
    pub const IMPROPER_INPUT: LmStatus = LmStatus(0);
    pub const FTOL_REACHED: LmStatus = LmStatus(1);
    pub const XTOL_REACHED: LmStatus = LmStatus(2);
    pub const FTOL_AND_XTOL_REACHED: LmStatus = LmStatus(3);
    pub const GTOL_REACHED: LmStatus = LmStatus(4);
    pub const MAX_ITERATIONS_REACHED: LmStatus = LmStatus(5);
    pub const FTOL_TOO_SMALL: LmStatus = LmStatus(6);
    pub const XTOL_TOO_SMALL: LmStatus = LmStatus(7);
    pub const GTOL_TOO_SMALL: LmStatus = LmStatus(8);
    /// No free (non-fixed, non-tied) parameters to vary.
    pub const NO_FREE_PARAMETERS: LmStatus = LmStatus(-1);
    /// `params0.len() != param_info.len()`.
    pub const MISMATCHED_PARAM_INFO: LmStatus = LmStatus(-3);
    /// The residual function produced a non-finite parameter or function value.
    pub const NON_FINITE_RESIDUAL: LmStatus = LmStatus(-16);

    pub fn is_success(&self) -> bool {
        matches!(self.0, 1..=4)
    }

    pub fn is_error(&self) -> bool {
        self.0 <= 0
    }
}

fn status_message(status: LmStatus) -> Option<String> {
    let msg = match status.0 {
        0 => "improper input parameters",
        1 => "both actual and predicted relative reductions in the sum of squares are at most ftol",
        2 => "relative error between two consecutive iterates is at most xtol",
        3 => "conditions for status 1 and status 2 both hold",
        4 => "the cosine of the angle between fvec and any jacobian column is at most gtol",
        5 => "number of iterations has reached max_iter",
        6 => "ftol is too small; no further reduction in the sum of squares is possible",
        7 => "xtol is too small; no further improvement in the approximate solution is possible",
        8 => "gtol is too small; fvec is orthogonal to the jacobian columns to machine precision",
        -1 => "no free parameters to vary",
        -3 => "params0.len() does not match param_info.len()",
        -16 => "the residual function returned a non-finite parameter or function value",
        _ => return None,
    };
    Some(msg.to_string())
}

/// Which side(s) of the current value a numeric derivative is taken on.
/// Mirrors mpfit's `dside` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FiniteDiffSide {
    #[default]
    Auto,
    Forward,
    Backward,
    Central,
}

/// Per-parameter bounds and linkage: box constraints, parameter pegging,
/// and tied parameters. Tied parameters are simplified to "always equal to
/// another named parameter's current value" rather than an arbitrary
/// symbolic expression — this crate carries no expression evaluator, so
/// the one-parameter-mirrors-another case is what's implemented.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub fixed: bool,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub tied_to: Option<usize>,
    /// Caps the magnitude of a single trial step for this parameter.
    pub maxstep: Option<f64>,
    /// Smallest step magnitude below which this parameter is considered
    /// converged. Not independently enforced by the outer loop's xtol
    /// check today; carried on the descriptor so callers can read it back.
    pub minstep: Option<f64>,
    /// Which side(s) to use when differencing this parameter numerically.
    pub dside: FiniteDiffSide,
    /// Fixed step size override for numeric differencing of this
    /// parameter; falls back to `epsfcn`-derived scaling when unset.
    pub dstep: Option<f64>,
}

impl Default for ParamInfo {
    fn default() -> Self {
        Self {
            fixed: false,
            lower: None,
            upper: None,
            tied_to: None,
            maxstep: None,
            minstep: None,
            dside: FiniteDiffSide::Auto,
            dstep: None,
        }
    }
}

impl ParamInfo {
    pub fn free() -> Self {
        Self::default()
    }

    pub fn bounded(lower: f64, upper: f64) -> Self {
        Self { lower: Some(lower), upper: Some(upper), ..Self::default() }
    }
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub max_iter: usize,
    pub factor: f64,
    /// Outlier-robust residual damping via `damp * tanh(f / damp)`; `0.0`
    /// disables damping entirely.
    pub damp: f64,
    /// Relative step size used for numeric differencing when a parameter
    /// has no `dstep` override; `0.0` means "use machine epsilon".
    pub epsfcn: f64,
    /// Caller-supplied per-parameter scale factors, overriding the
    /// solver's own Jacobian-norm-based auto-scaling.
    pub diag: Option<Vec<f64>>,
    /// `true` (the default, matching mpfit): always differentiate
    /// numerically, ignoring any analytic Jacobian the residual function
    /// could supply. `false`: request the analytic Jacobian each
    /// iteration, falling back to numeric differencing only where the
    /// function returns `None`.
    pub autoderivative: bool,
}

impl From<&crate::config::LmDefaults> for FitOptions {
    fn from(d: &crate::config::LmDefaults) -> Self {
        Self {
            ftol: d.ftol,
            xtol: d.xtol,
            gtol: d.gtol,
            max_iter: d.max_iter,
            factor: d.factor,
            damp: d.damp,
            epsfcn: d.epsfcn,
            diag: None,
            autoderivative: d.autoderivative,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: DVector<f64>,
    pub status: LmStatus,
    pub iterations: usize,
    /// `n x n` parameter-space covariance; rows/columns for fixed, pegged
    /// (at termination), or tied parameters are reported as zero.
    pub covariance: DMatrix<f64>,
    /// Formal parameter uncertainties: `sqrt(diag(covariance))`.
    pub perror: DVector<f64>,
    /// Total number of calls made to the residual function.
    pub nfev: usize,
    pub final_cost: f64,
    /// Human-readable explanation of `status`, `None` for unrecognized codes.
    pub errmsg: Option<String>,
}

fn apply_ties(params: &mut DVector<f64>, info: &[ParamInfo]) {
    for (i, p) in info.iter().enumerate() {
        if let Some(source) = p.tied_to {
            params[i] = params[source];
        }
    }
}

/// Reweight raw residuals through `damp * tanh(f / damp)` for outlier
/// robustness, returning the damped residuals alongside the per-row
/// `d(damped)/d(raw) = 1 - tanh(f/damp)^2` chain-rule factor so a Jacobian
/// formed with respect to the raw residuals can be row-scaled to match.
/// `damp <= 0.0` disables damping: the factors are all `1.0`.
fn apply_damping(raw: &DVector<f64>, damp: f64) -> (DVector<f64>, Vec<f64>) {
    if damp <= 0.0 {
        return (raw.clone(), vec![1.0; raw.len()]);
    }
    let mut damped = DVector::zeros(raw.len());
    let mut scale = Vec::with_capacity(raw.len());
    for i in 0..raw.len() {
        let t = (raw[i] / damp).tanh();
        damped[i] = damp * t;
        scale.push(1.0 - t * t);
    }
    (damped, scale)
}

fn scale_rows_in_place(jac: &mut DMatrix<f64>, scale: &[f64]) {
    for r in 0..jac.nrows() {
        let s = scale[r];
        if s == 1.0 {
            continue;
        }
        for c in 0..jac.ncols() {
            jac[(r, c)] *= s;
        }
    }
}

fn select_columns(src: &DMatrix<f64>, cols: &[usize]) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(src.nrows(), cols.len());
    for (dst, &src_col) in cols.iter().enumerate() {
        out.set_column(dst, &src.column(src_col));
    }
    out
}

/// Largest `alpha` in `(0, 1]` such that `params[idx] + alpha * step[col]`
/// respects every active parameter's bounds and `maxstep` cap, for
/// `(col, idx)` pairs in `active`. `step` is indexed by `col` (the active,
/// packed ordering); `params`/`param_info` are indexed by `idx` (original
/// parameter ordering). Scaling the whole step by one scalar preserves its
/// direction; clamping each coordinate independently would not.
fn bounded_alpha(
    params: &DVector<f64>,
    active: &[usize],
    step: &DVector<f64>,
    param_info: &[ParamInfo],
) -> (f64, bool) {
    let mut alpha = 1.0_f64;
    let mut hit = false;
    for (col, &idx) in active.iter().enumerate() {
        let p = step[col];
        if p == 0.0 {
            continue;
        }
        let info = &param_info[idx];
        if let Some(lo) = info.lower {
            let end = params[idx] + p;
            if end < lo {
                let cap = ((lo - params[idx]) / p).max(0.0);
                if cap < alpha {
                    alpha = cap;
                    hit = true;
                }
            }
        }
        if let Some(hi) = info.upper {
            let end = params[idx] + p;
            if end > hi {
                let cap = ((hi - params[idx]) / p).max(0.0);
                if cap < alpha {
                    alpha = cap;
                    hit = true;
                }
            }
        }
        if let Some(maxstep) = info.maxstep {
            if p.abs() > maxstep {
                let cap = maxstep / p.abs();
                if cap < alpha {
                    alpha = cap;
                    hit = true;
                }
            }
        }
    }
    (alpha, hit)
}

/// Numeric Jacobian over `indices` (original parameter ordering) via finite
/// differences, one column per index. Columns are independent model
/// evaluations, so they fan out across a rayon pool — worthwhile once the
/// residual function itself is not trivially cheap. Honors each
/// parameter's `dside`/`dstep` override, falling back to an
/// `epsfcn`-derived forward-difference step.
fn numeric_jacobian<C>(
    call: &C,
    params: &DVector<f64>,
    residual0: &DVector<f64>,
    indices: &[usize],
    param_info: &[ParamInfo],
    epsfcn: f64,
) -> DMatrix<f64>
where
    C: Fn(&DVector<f64>, bool) -> (DVector<f64>, Option<DMatrix<f64>>) + Sync,
{
    let m = residual0.len();
    let base_eps = epsfcn.max(f64::EPSILON).sqrt();
    let columns: Vec<Vec<f64>> = indices
        .par_iter()
        .map(|&idx| {
            let info = &param_info[idx];
            let h = info.dstep.unwrap_or_else(|| base_eps * params[idx].abs().max(1.0));
            match info.dside {
                FiniteDiffSide::Backward => {
                    let mut perturbed = params.clone();
                    perturbed[idx] -= h;
                    let (r1, _) = call(&perturbed, false);
                    (0..m).map(|row| (residual0[row] - r1[row]) / h).collect()
                }
                FiniteDiffSide::Central => {
                    let mut plus = params.clone();
                    plus[idx] += h;
                    let mut minus = params.clone();
                    minus[idx] -= h;
                    let (r1, _) = call(&plus, false);
                    let (r2, _) = call(&minus, false);
                    (0..m).map(|row| (r1[row] - r2[row]) / (2.0 * h)).collect()
                }
                FiniteDiffSide::Auto | FiniteDiffSide::Forward => {
                    let mut perturbed = params.clone();
                    perturbed[idx] += h;
                    let (r1, _) = call(&perturbed, false);
                    (0..m).map(|row| (r1[row] - residual0[row]) / h).collect()
                }
            }
        })
        .collect();

    let mut jac = DMatrix::zeros(m, indices.len());
    for (col, column) in columns.into_iter().enumerate() {
        for (row, value) in column.into_iter().enumerate() {
            jac[(row, col)] = value;
        }
    }
    jac
}

/// Form the Jacobian over `indices`, preferring the residual function's own
/// analytic Jacobian when `options.autoderivative` is `false` and the
/// function actually supplies one for this call, and falling back to
/// [`numeric_jacobian`] otherwise. The analytic Jacobian, when used, is a
/// full `m x n` matrix over every parameter; only `indices`' columns are
/// kept.
fn form_jacobian<C>(
    call: &C,
    params: &DVector<f64>,
    residual0: &DVector<f64>,
    indices: &[usize],
    param_info: &[ParamInfo],
    epsfcn: f64,
    autoderivative: bool,
) -> DMatrix<f64>
where
    C: Fn(&DVector<f64>, bool) -> (DVector<f64>, Option<DMatrix<f64>>) + Sync,
{
    if !autoderivative {
        let (_, maybe_jac) = call(params, true);
        if let Some(full) = maybe_jac {
            return select_columns(&full, indices);
        }
    }
    numeric_jacobian(call, params, residual0, indices, param_info, epsfcn)
}

/// Run the Levenberg-Marquardt fit. `residual_fn(params, request_jac)`
/// returns `model(params) - data` (scaled by the per-point uncertainty if
/// weighted least squares is wanted by the caller), plus an analytic
/// Jacobian when `request_jac` is `true` and the caller can supply one —
/// `None` is always an acceptable answer, in which case the solver
/// differentiates numerically instead.
pub fn fit<F>(residual_fn: F, params0: DVector<f64>, param_info: &[ParamInfo], options: &FitOptions) -> FitResult
where
    F: Fn(&DVector<f64>, bool) -> (DVector<f64>, Option<DMatrix<f64>>) + Sync,
{
    let n = params0.len();
    let nfev = AtomicUsize::new(0);
    let call = |p: &DVector<f64>, want_jac: bool| -> (DVector<f64>, Option<DMatrix<f64>>) {
        nfev.fetch_add(1, Ordering::Relaxed);
        residual_fn(p, want_jac)
    };

    if param_info.len() != n {
        let status = LmStatus::MISMATCHED_PARAM_INFO;
        return FitResult {
            params: params0,
            status,
            iterations: 0,
            covariance: DMatrix::zeros(n, n),
            perror: DVector::zeros(n),
            nfev: 0,
            final_cost: f64::NAN,
            errmsg: status_message(status),
        };
    }

    let free_indices: Vec<usize> =
        (0..n).filter(|&i| !param_info[i].fixed && param_info[i].tied_to.is_none()).collect();
    if free_indices.is_empty() {
        let status = LmStatus::NO_FREE_PARAMETERS;
        return FitResult {
            params: params0,
            status,
            iterations: 0,
            covariance: DMatrix::zeros(n, n),
            perror: DVector::zeros(n),
            nfev: 0,
            final_cost: f64::NAN,
            errmsg: status_message(status),
        };
    }

    let mut params = params0;
    apply_ties(&mut params, param_info);

    let (mut raw_residuals, _) = call(&params, false);
    if !raw_residuals.iter().all(|v| v.is_finite()) {
        let status = LmStatus::NON_FINITE_RESIDUAL;
        return FitResult {
            params,
            status,
            iterations: 0,
            covariance: DMatrix::zeros(n, n),
            perror: DVector::zeros(n),
            nfev: nfev.load(Ordering::Relaxed),
            final_cost: f64::NAN,
            errmsg: status_message(status),
        };
    }
    let (mut residuals, mut jac_scale) = apply_damping(&raw_residuals, options.damp);
    let mut fnorm = enorm(&residuals);

    let user_diag = matches!(&options.diag, Some(d) if d.len() == n);
    let mut diag: DVector<f64> = match &options.diag {
        Some(d) if d.len() == n => DVector::from_vec(d.clone()),
        _ => DVector::from_element(n, 1.0),
    };

    let mut delta = 0.0_f64;
    let mut first_iteration = true;

    let mut status = LmStatus::MAX_ITERATIONS_REACHED;
    let mut iterations = 0;
    let mut last_jacobian_active: Vec<usize> = Vec::new();
    let mut last_jacobian = DMatrix::zeros(0, 0);

    for iter in 0..options.max_iter {
        iterations = iter + 1;
        apply_ties(&mut params, param_info);

        let mut free_jac =
            form_jacobian(&call, &params, &raw_residuals, &free_indices, param_info, options.epsfcn, options.autoderivative);
        scale_rows_in_place(&mut free_jac, &jac_scale);

        // Pegging is re-evaluated every iteration from the current
        // gradient, never accumulated: a parameter sitting on a bound is
        // excluded from this iteration's solve only if the gradient at its
        // current position points further past that bound.
        let grad_free = free_jac.transpose() * &residuals;
        let mut active: Vec<usize> = Vec::new();
        let mut active_cols: Vec<usize> = Vec::new();
        for (col, &idx) in free_indices.iter().enumerate() {
            let info = &param_info[idx];
            let at_lower = info.lower.map_or(false, |lo| params[idx] <= lo + 1e-12);
            let at_upper = info.upper.map_or(false, |hi| params[idx] >= hi - 1e-12);
            let g = grad_free[col];
            let pegged_now = (at_lower && g > 0.0) || (at_upper && g < 0.0);
            if !pegged_now {
                active.push(idx);
                active_cols.push(col);
            }
        }
        if active.is_empty() {
            status = LmStatus::NO_FREE_PARAMETERS;
            break;
        }

        let jac = select_columns(&free_jac, &active_cols);
        last_jacobian_active = active.clone();
        last_jacobian = jac.clone();

        let qr = qrfac(&jac);

        if !user_diag {
            if first_iteration {
                for (col, &idx) in active.iter().enumerate() {
                    diag[idx] = if qr.acnorm[col] > 0.0 { qr.acnorm[col] } else { 1.0 };
                }
            } else {
                for (col, &idx) in active.iter().enumerate() {
                    diag[idx] = diag[idx].max(qr.acnorm[col]);
                }
            }
        }
        if first_iteration {
            let scaled: Vec<f64> = active.iter().map(|&idx| diag[idx] * params[idx]).collect();
            let xnorm = enorm(&DVector::from_vec(scaled));
            delta = if xnorm > 0.0 { options.factor * xnorm } else { options.factor };
            first_iteration = false;
        }

        // Gradient-orthogonality (gtol) check, computed directly rather than
        // from the packed QR factors for clarity.
        let gnorm = (0..active.len())
            .map(|col| {
                let colnorm = (0..jac.nrows()).map(|r| jac[(r, col)].powi(2)).sum::<f64>().sqrt();
                if fnorm > 0.0 && colnorm > 0.0 {
                    (grad_free[active_cols[col]] / (fnorm * colnorm)).abs()
                } else {
                    0.0
                }
            })
            .fold(0.0_f64, f64::max);
        if gnorm <= options.gtol {
            status = LmStatus::GTOL_REACHED;
            break;
        }

        let diag_active = DVector::from_iterator(active.len(), active.iter().map(|&idx| diag[idx]));
        let mut qtf = residuals.clone();
        apply_qt(&qr, &mut qtf);

        let (par, step_raw) = lmpar(&qr, &diag_active, &qtf, delta);
        let (alpha, bound_hit) = bounded_alpha(&params, &active, &step_raw, param_info);
        let step_active = &step_raw * alpha;

        let mut candidate = params.clone();
        for (col, &idx) in active.iter().enumerate() {
            let mut v = params[idx] + step_active[col];
            // Snap floating-point overshoot at an active bound back onto it.
            if let Some(lo) = param_info[idx].lower {
                if v < lo {
                    v = lo;
                }
            }
            if let Some(hi) = param_info[idx].upper {
                if v > hi {
                    v = hi;
                }
            }
            candidate[idx] = v;
        }
        apply_ties(&mut candidate, param_info);

        let (raw_candidate, _) = call(&candidate, false);
        if !raw_candidate.iter().all(|v| v.is_finite()) {
            status = LmStatus::NON_FINITE_RESIDUAL;
            break;
        }
        let (new_residuals, new_jac_scale) = apply_damping(&raw_candidate, options.damp);
        let new_fnorm = enorm(&new_residuals);

        let jp = &jac * &step_active;
        let jp_norm = enorm(&jp);
        let scaled_step = DVector::from_iterator(active.len(), (0..active.len()).map(|c| diag_active[c] * step_active[c]));
        let dxnorm = enorm(&scaled_step);
        let predicted = if fnorm > 0.0 {
            (jp_norm / fnorm).powi(2) + 2.0 * (par.sqrt() * dxnorm / fnorm).powi(2)
        } else {
            0.0
        };
        let actual = if fnorm > 0.0 { 1.0 - (new_fnorm / fnorm).powi(2) } else { 0.0 };
        let ratio = if predicted > 0.0 { actual / predicted } else { 0.0 };

        if ratio < 0.25 {
            delta *= 0.5;
        } else if (ratio > 0.75 && par == 0.0) || bound_hit {
            delta = (2.0 * dxnorm).max(delta);
        }

        let accepted = ratio > 1e-4;
        if accepted {
            params = candidate;
            raw_residuals = raw_candidate;
            residuals = new_residuals;
            jac_scale = new_jac_scale;
            fnorm = new_fnorm;
        }

        let ftol_hit = actual.abs() <= options.ftol && predicted <= options.ftol && 0.5 * ratio <= 1.0;
        let xtol_hit = dxnorm <= options.xtol * enorm(&DVector::from_iterator(active.len(), active.iter().map(|&idx| diag[idx] * params[idx])));

        match (ftol_hit, xtol_hit) {
            (true, true) => {
                status = LmStatus::FTOL_AND_XTOL_REACHED;
                break;
            }
            (true, false) => {
                status = LmStatus::FTOL_REACHED;
                break;
            }
            (false, true) => {
                status = LmStatus::XTOL_REACHED;
                break;
            }
            (false, false) => {}
        }

        if delta < f64::EPSILON * 100.0 {
            status = LmStatus::XTOL_TOO_SMALL;
            break;
        }
    }

    let covariance = covariance_matrix(n, &last_jacobian_active, &last_jacobian);
    let perror = DVector::from_iterator(n, (0..n).map(|i| covariance[(i, i)].max(0.0).sqrt()));

    FitResult {
        params,
        status,
        iterations,
        covariance,
        perror,
        nfev: nfev.load(Ordering::Relaxed),
        final_cost: fnorm * fnorm,
        errmsg: status_message(status),
    }
}

/// `(J^T J)^-1` embedded into full parameter space, zero outside the
/// last-active parameter set.
fn covariance_matrix(n: usize, active: &[usize], jac: &DMatrix<f64>) -> DMatrix<f64> {
    let mut full = DMatrix::zeros(n, n);
    if active.is_empty() || jac.nrows() == 0 {
        return full;
    }
    let jtj = jac.transpose() * jac;
    if let Some(inv) = jtj.try_inverse() {
        for (a, &ia) in active.iter().enumerate() {
            for (b, &ib) in active.iter().enumerate() {
                full[(ia, ib)] = inv[(a, b)];
            }
        }
    }
    full
}
