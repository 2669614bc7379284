//! Levenberg-Marquardt least-squares solver: a MINPACK `lmdif`-style
//! implementation with box constraints, parameter pegging, and tied
//! parameters, used to fit reduced datasets to model curves.

mod enorm;
mod lmpar;
mod qr;
mod solver;

pub use enorm::enorm;
pub use solver::{fit, FiniteDiffSide, FitOptions, FitResult, LmStatus, ParamInfo};
