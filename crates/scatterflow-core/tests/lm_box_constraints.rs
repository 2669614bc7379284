use nalgebra::DVector;
use proptest::prelude::*;
use scatterflow_core::lm::{fit, FitOptions, ParamInfo};

fn options() -> FitOptions {
    FitOptions {
        ftol: 1e-12,
        xtol: 1e-12,
        gtol: 1e-12,
        max_iter: 200,
        factor: 100.0,
        damp: 0.0,
        epsfcn: 0.0,
        diag: None,
        autoderivative: true,
    }
}

proptest! {
    #[test]
    fn a_pegged_parameter_never_leaves_its_box(
        lower in -50.0f64..0.0,
        width in 0.1f64..50.0,
        start in -100.0f64..100.0,
        target in -200.0f64..200.0,
    ) {
        let upper = lower + width;
        let start_clamped = start.clamp(lower, upper);
        // Residual pulls the single free parameter toward `target`, which may
        // lie well outside [lower, upper].
        let residual_fn = move |p: &DVector<f64>, _request_jac: bool| (DVector::from_vec(vec![p[0] - target]), None);
        let params0 = DVector::from_vec(vec![start_clamped]);
        let info = vec![ParamInfo::bounded(lower, upper)];
        let result = fit(residual_fn, params0, &info, &options());

        prop_assert!(result.params[0] >= lower - 1e-9);
        prop_assert!(result.params[0] <= upper + 1e-9);
    }

    #[test]
    fn a_fixed_parameter_never_moves(
        start in -100.0f64..100.0,
        target in -200.0f64..200.0,
    ) {
        let residual_fn = move |p: &DVector<f64>, _request_jac: bool| (DVector::from_vec(vec![p[0] - target]), None);
        let params0 = DVector::from_vec(vec![start]);
        let info = vec![ParamInfo { fixed: true, ..ParamInfo::free() }];
        let result = fit(residual_fn, params0, &info, &options());

        prop_assert!((result.params[0] - start).abs() < 1e-12);
    }

    #[test]
    fn an_unconstrained_fit_converges_to_the_target(target in -50.0f64..50.0) {
        let residual_fn = move |p: &DVector<f64>, _request_jac: bool| (DVector::from_vec(vec![p[0] - target]), None);
        let params0 = DVector::from_vec(vec![0.0]);
        let info = vec![ParamInfo::free()];
        let result = fit(residual_fn, params0, &info, &options());

        prop_assert!((result.params[0] - target).abs() < 1e-6);
    }
}
