//! Engine configuration: the handful of operational knobs left to
//! deployment rather than to the template — whether to revalidate file
//! mtimes before evaluating, how aggressively to evict the persistent
//! cache, and where it lives on disk.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Deserializable from TOML via [`EngineConfig::from_toml`]; every field has
/// a default so a partial config file only overrides what it mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Revalidate bound files' mtimes before evaluating.
    /// Disabling this trades staleness-safety for fewer file-store round trips.
    pub mtime_revalidate: bool,
    /// Cache entries older than this many seconds are eligible for eviction.
    /// `None` disables age-based eviction entirely.
    pub cache_max_age_secs: Option<i64>,
    /// Cap on cache entry count; least-recently-used entries beyond this are
    /// evicted alongside age-based eviction. `None` disables the cap.
    pub cache_max_entries: Option<usize>,
    /// Directory for the persistent cache backend. `None` means in-memory only.
    pub persistent_cache_dir: Option<PathBuf>,
    /// Upper bound on concurrently in-flight ancestor sub-evaluations within
    /// a single `calc_terminal` call.
    pub max_parallel_subevaluations: usize,
    /// Default Levenberg-Marquardt tolerances, overridable per call.
    pub lm_defaults: LmDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtime_revalidate: true,
            cache_max_age_secs: Some(7 * 24 * 60 * 60),
            cache_max_entries: Some(10_000),
            persistent_cache_dir: None,
            max_parallel_subevaluations: 8,
            lm_defaults: LmDefaults::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

/// Default convergence tolerances for [`crate::lm::fit`], mirroring
/// MINPACK `lmdif`'s conventional defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LmDefaults {
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    pub max_iter: usize,
    pub factor: f64,
    /// Outlier-robust residual damping factor; `0.0` disables damping.
    pub damp: f64,
    /// Relative numeric-differencing step size; `0.0` means "use machine epsilon".
    pub epsfcn: f64,
    /// Whether the solver always differentiates numerically (mpfit's
    /// default) rather than using a module-supplied analytic Jacobian.
    pub autoderivative: bool,
}

impl Default for LmDefaults {
    fn default() -> Self {
        Self {
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            max_iter: 200,
            factor: 100.0,
            damp: 0.0,
            epsfcn: 0.0,
            autoderivative: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = EngineConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let parsed = EngineConfig::from_toml(&serialized).unwrap();
        assert_eq!(parsed.mtime_revalidate, cfg.mtime_revalidate);
        assert_eq!(parsed.max_parallel_subevaluations, cfg.max_parallel_subevaluations);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg = EngineConfig::from_toml("mtime_revalidate = false\n").unwrap();
        assert!(!cfg.mtime_revalidate);
        assert_eq!(cfg.max_parallel_subevaluations, EngineConfig::default().max_parallel_subevaluations);
    }
}
