use anyhow::Result;
use nalgebra::{DMatrix, DVector};

/// The biochemical reaction-rate model: maps time and a concentration vector
/// to a derivative vector of the same length. Implementations are opaque to
/// the engine; they may fail and their output is not trusted to be finite.
pub trait RhsModel: Send + Sync {
    /// Returns the number of metabolite concentrations (state dimension).
    fn dimension(&self) -> usize;

    /// Evaluates the derivative vector at time `t` and state `x`.
    /// t: current time
    /// x: current state, length `dimension()`
    /// out: buffer to write dx/dt into
    fn apply(&self, t: f64, x: &DVector<f64>, out: &mut DVector<f64>) -> Result<()>;
}

/// A sanitized derivative function as seen by a numerical solver:
/// infallible, always finite. The RHS guard is the canonical implementor.
pub trait Derivative {
    fn eval(&self, t: f64, x: &DVector<f64>, out: &mut DVector<f64>);
}

/// What an external ODE solver reports back for one integration run.
#[derive(Debug, Clone)]
pub struct SolverOutput {
    /// Reported time points, strictly increasing.
    pub t: Vec<f64>,
    /// One column per reported time point, `dimension()` rows.
    pub y: DMatrix<f64>,
    /// Whether the solver considers the run converged.
    pub success: bool,
    /// Solver-specific diagnostic text.
    pub message: String,
}

/// Uniform interface over external differential-equation solvers.
///
/// The engine calls this synchronously from a worker thread so that a run
/// which never returns can be abandoned at its wall-clock deadline; hence
/// the `Send + Sync` bound.
pub trait OdeSolver: Send + Sync {
    /// Integrates `rhs` over `span` starting from `y0`, parameterized by the
    /// method, tolerances and maximum step of `config`. When `t_eval` is
    /// given the solution is reported exactly at those points; otherwise at
    /// the solver's own accepted steps.
    ///
    /// An `Err` means the solver itself blew up; a returned output with
    /// `success == false` means it ran but did not converge.
    fn solve(
        &self,
        rhs: &dyn Derivative,
        span: (f64, f64),
        y0: &DVector<f64>,
        config: &crate::config::SolverConfig,
        t_eval: Option<&[f64]>,
    ) -> Result<SolverOutput>;
}
