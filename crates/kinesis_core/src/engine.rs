use crate::attempt::{run_attempt, AttemptOutcome};
use crate::config::{default_cascade, SolverConfig};
use crate::traits::{OdeSolver, RhsModel};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Number of uniformly spaced evaluation points when the caller gives none.
const DEFAULT_EVAL_POINTS: usize = 50;

/// Default number of equal-width segments for the fallback integrator.
const DEFAULT_SEGMENTS: usize = 10;

/// Default wall-clock budget per integration attempt.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Caller-side misuse of the engine. Numerical failure is never an error;
/// it surfaces as an [`IntegrationResult`] with `success == false`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid time span: t_start {0} exceeds t_end {1}")]
    InvalidSpan(f64, f64),
    #[error("initial state dimension mismatch: model expects {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("configuration cascade is empty")]
    EmptyCascade,
    #[error("segment count must be at least one")]
    ZeroSegments,
    #[error("evaluation grid must be strictly increasing with at least one point inside the time span")]
    InvalidGrid,
}

/// Uniform result shape for both the direct-cascade and the segmented path.
///
/// Invariant: `t.len() == y.ncols()` whenever `success` is true; `y` keeps
/// the component ordering of the initial state vector, one column per
/// reported time point.
#[derive(Debug, Clone)]
pub struct IntegrationResult {
    /// Reported time points, strictly increasing, starting at `t_start`.
    pub t: Vec<f64>,
    /// State matrix, `N` rows by `t.len()` columns.
    pub y: DMatrix<f64>,
    pub success: bool,
    /// Provenance: which strategy produced this result.
    pub message: String,
}

impl IntegrationResult {
    /// Assembles a result from accumulated time points and state columns.
    /// Both integration paths funnel through here so the output shape is
    /// identical regardless of the strategy that produced it.
    pub(crate) fn from_columns(
        t: Vec<f64>,
        columns: &[DVector<f64>],
        success: bool,
        message: String,
    ) -> Self {
        debug_assert_eq!(t.len(), columns.len());
        Self {
            t,
            y: DMatrix::from_columns(columns),
            success,
            message,
        }
    }

    /// State at the `i`-th reported time point.
    pub fn state_at(&self, i: usize) -> DVector<f64> {
        self.y.column(i).into_owned()
    }

    /// State at the last reported time point.
    pub fn final_state(&self) -> DVector<f64> {
        self.state_at(self.y.ncols() - 1)
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

/// Adaptive integration engine for stiff metabolite-concentration systems.
///
/// Drives an ordered cascade of solver configurations against the full time
/// span, first success winning; when every configuration fails or times out,
/// falls back to integrating the span in fixed-count segments with the most
/// conservative configuration, chaining the terminal state of each segment
/// into the next.
pub struct AdaptiveSolver {
    model: Arc<dyn RhsModel>,
    solver: Arc<dyn OdeSolver>,
    timeout: Duration,
    cascade: Vec<SolverConfig>,
    segments: usize,
    nonnegative: bool,
}

impl AdaptiveSolver {
    pub fn new(model: Arc<dyn RhsModel>, solver: Arc<dyn OdeSolver>) -> Self {
        Self {
            model,
            solver,
            timeout: DEFAULT_TIMEOUT,
            cascade: default_cascade(),
            segments: DEFAULT_SEGMENTS,
            nonnegative: false,
        }
    }

    /// Wall-clock budget per attempt (default 30 s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the configuration cascade. Order encodes precedence; the
    /// last entry doubles as the segmented-fallback configuration.
    pub fn with_cascade(mut self, cascade: Vec<SolverConfig>) -> Self {
        self.cascade = cascade;
        self
    }

    /// Number of equal-width fallback segments (default 10).
    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    /// Clamp reported concentrations at zero, mirroring the model's
    /// semantically non-negative state. Off by default.
    pub fn with_nonnegative(mut self, nonnegative: bool) -> Self {
        self.nonnegative = nonnegative;
        self
    }

    /// Integrates the model over `span` from `x0`, reporting the solution at
    /// `t_eval` (or at 50 uniform points when `None`).
    ///
    /// Returns `Err` only for caller-side misuse; every numerical outcome,
    /// including total failure of all configurations and segments, comes
    /// back as an `IntegrationResult`.
    pub fn adaptive_solve(
        &self,
        span: (f64, f64),
        x0: &DVector<f64>,
        t_eval: Option<&[f64]>,
    ) -> Result<IntegrationResult, EngineError> {
        let (t_start, t_end) = span;
        if !(t_start <= t_end) {
            return Err(EngineError::InvalidSpan(t_start, t_end));
        }
        let expected = self.model.dimension();
        if x0.len() != expected {
            return Err(EngineError::DimensionMismatch {
                expected,
                got: x0.len(),
            });
        }
        let Some(conservative) = self.cascade.last().cloned() else {
            return Err(EngineError::EmptyCascade);
        };
        if self.segments == 0 {
            return Err(EngineError::ZeroSegments);
        }

        if t_start == t_end {
            // Degenerate span: nothing to integrate.
            return Ok(IntegrationResult::from_columns(
                vec![t_start],
                &[x0.clone()],
                true,
                "empty time span".to_string(),
            ));
        }

        let grid = self.evaluation_grid(span, t_eval)?;
        info!(
            "adaptive solve: span [{t_start:.3}, {t_end:.3}], {} time points",
            grid.len()
        );

        for config in &self.cascade {
            match run_attempt(
                &self.model,
                &self.solver,
                config,
                span,
                x0,
                &grid,
                self.timeout,
            ) {
                AttemptOutcome::Success { t, y, .. } => {
                    let message = format!("solved with {}", config.name);
                    return Ok(self.finish(IntegrationResult {
                        t,
                        y,
                        success: true,
                        message,
                    }));
                }
                // Failure and timeout both mean: escalate to the next
                // configuration. Diagnostics were logged by the executor.
                AttemptOutcome::Failure(_) | AttemptOutcome::Timeout => {}
            }
        }

        warn!("all configurations failed, trying segmented integration");
        Ok(self.finish(self.segmented_solve(span, x0, &grid, &conservative)))
    }

    /// Derives the evaluation grid: caller points restricted to the span,
    /// or a uniform default grid.
    fn evaluation_grid(
        &self,
        span: (f64, f64),
        t_eval: Option<&[f64]>,
    ) -> Result<Vec<f64>, EngineError> {
        match t_eval {
            None => Ok(linspace(span.0, span.1, DEFAULT_EVAL_POINTS)),
            Some(points) => {
                if points.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(EngineError::InvalidGrid);
                }
                let inside: Vec<f64> = points
                    .iter()
                    .copied()
                    .filter(|&t| t >= span.0 && t <= span.1)
                    .collect();
                if inside.is_empty() {
                    return Err(EngineError::InvalidGrid);
                }
                Ok(inside)
            }
        }
    }

    /// Last-resort strategy: partition the span into equal segments and
    /// re-run the most conservative configuration on each, seeding every
    /// segment with the terminal state of the previous one. Stops at the
    /// first segment failure; whatever accumulated up to that point is the
    /// result.
    fn segmented_solve(
        &self,
        span: (f64, f64),
        x0: &DVector<f64>,
        grid: &[f64],
        conservative: &SolverConfig,
    ) -> IntegrationResult {
        let bounds = linspace(span.0, span.1, self.segments + 1);

        let mut times = vec![span.0];
        let mut states = vec![x0.clone()];
        let mut current = x0.clone();

        for i in 0..self.segments {
            let (lo, hi) = (bounds[i], bounds[i + 1]);
            let segment_eval: Vec<f64> = grid
                .iter()
                .copied()
                .filter(|&t| t >= lo && t <= hi)
                .collect();
            if segment_eval.is_empty() {
                continue;
            }

            info!(
                "segment {}/{}: {:.3} to {:.3}",
                i + 1,
                self.segments,
                lo,
                hi
            );

            match run_attempt(
                &self.model,
                &self.solver,
                conservative,
                (lo, hi),
                &current,
                &segment_eval,
                self.timeout,
            ) {
                AttemptOutcome::Success { t, y, .. } => {
                    // The first reported point duplicates the previous
                    // segment's terminal point (or the initial condition).
                    for j in 1..t.len() {
                        times.push(t[j]);
                        states.push(y.column(j).into_owned());
                    }
                    if y.ncols() > 0 {
                        current = y.column(y.ncols() - 1).into_owned();
                    }
                }
                AttemptOutcome::Failure(_) | AttemptOutcome::Timeout => {
                    warn!("segment {} failed, stopping integration", i + 1);
                    break;
                }
            }
        }

        let success = times.len() > 1;
        IntegrationResult::from_columns(
            times,
            &states,
            success,
            "segmented integration".to_string(),
        )
    }

    fn finish(&self, mut result: IntegrationResult) -> IntegrationResult {
        if self.nonnegative {
            for v in result.y.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
        }
        if result.success {
            info!("integration succeeded: {}", result.message);
        } else {
            warn!("integration failed: {}", result.message);
        }
        result
    }
}

/// `n` uniformly spaced points over `[a, b]`, endpoints exact.
pub(crate) fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![a];
    }
    let step = (b - a) / (n - 1) as f64;
    let mut points: Vec<f64> = (0..n).map(|i| a + step * i as f64).collect();
    points[n - 1] = b;
    points
}
