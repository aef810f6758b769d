use serde::{Deserialize, Serialize};
use std::fmt;

/// Numerical method identifier understood by an [`OdeSolver`](crate::traits::OdeSolver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Explicit adaptive Runge-Kutta (Dormand-Prince 5(4) class).
    Rk45,
    /// Implicit multistep for stiff systems (BDF class).
    Bdf,
    /// Implicit Runge-Kutta for very stiff systems (Radau class).
    Radau,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Rk45 => write!(f, "RK45"),
            Method::Bdf => write!(f, "BDF"),
            Method::Radau => write!(f, "Radau"),
        }
    }
}

/// One named solver configuration: method, tolerances, step constraint.
/// Immutable once constructed; the cascade is an ordered list of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    pub name: String,
    pub method: Method,
    /// Relative tolerance for local error control.
    pub rtol: f64,
    /// Absolute tolerance for local error control.
    pub atol: f64,
    /// Upper bound on the internal step size.
    pub max_step: f64,
}

impl SolverConfig {
    pub fn new(name: &str, method: Method, rtol: f64, atol: f64, max_step: f64) -> Self {
        Self {
            name: name.to_string(),
            method,
            rtol,
            atol,
            max_step,
        }
    }
}

/// The default configuration cascade, ordered from fastest/least-robust to
/// slowest/most-robust. Attempted strictly in this order; the final entry is
/// also the one the segmented fallback reuses.
pub fn default_cascade() -> Vec<SolverConfig> {
    vec![
        SolverConfig::new("Optimized RK45", Method::Rk45, 1e-4, 1e-6, 0.5),
        SolverConfig::new("Relaxed BDF", Method::Bdf, 1e-2, 1e-4, 1.0),
        SolverConfig::new("Radau Stiff", Method::Radau, 1e-2, 1e-4, 0.5),
        SolverConfig::new("Ultra-conservative RK45", Method::Rk45, 1e-2, 1e-3, 0.01),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_orders_fast_to_conservative() {
        let cascade = default_cascade();
        assert_eq!(cascade.len(), 4);
        assert_eq!(cascade[0].name, "Optimized RK45");
        assert_eq!(cascade[0].method, Method::Rk45);
        assert_eq!(cascade[1].method, Method::Bdf);
        assert_eq!(cascade[2].method, Method::Radau);
        let last = cascade.last().unwrap();
        assert_eq!(last.name, "Ultra-conservative RK45");
        assert_eq!(last.max_step, 0.01);
    }

    #[test]
    fn first_entry_is_tightest_tolerance() {
        let cascade = default_cascade();
        let tightest = cascade
            .iter()
            .map(|c| c.rtol)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(cascade[0].rtol, tightest);
    }

    #[test]
    fn method_display_names() {
        assert_eq!(Method::Rk45.to_string(), "RK45");
        assert_eq!(Method::Bdf.to_string(), "BDF");
        assert_eq!(Method::Radau.to_string(), "Radau");
    }
}
