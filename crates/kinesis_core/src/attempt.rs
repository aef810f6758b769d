use crate::config::SolverConfig;
use crate::guard::GuardedRhs;
use crate::traits::{OdeSolver, RhsModel};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Normalized outcome of one integration attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success {
        t: Vec<f64>,
        y: DMatrix<f64>,
        message: String,
    },
    Failure(String),
    Timeout,
}

/// Runs one (configuration, span, initial state) combination under a
/// wall-clock deadline.
///
/// The solver call happens on a worker thread that owns a [`GuardedRhs`]
/// armed with the same deadline; the caller waits on a channel with
/// `recv_timeout`. If the deadline fires the attempt is abandoned whole —
/// its partial progress is discarded and the orphaned thread winds down on
/// its own because the guard starts returning zero derivatives. Dropping the
/// receiver disarms everything, so a stale attempt can never deliver into a
/// later one.
pub(crate) fn run_attempt(
    model: &Arc<dyn RhsModel>,
    solver: &Arc<dyn OdeSolver>,
    config: &SolverConfig,
    span: (f64, f64),
    y0: &DVector<f64>,
    t_eval: &[f64],
    timeout: Duration,
) -> AttemptOutcome {
    info!(
        "trying {} over [{:.3}, {:.3}] ({} eval points)",
        config.name,
        span.0,
        span.1,
        t_eval.len()
    );

    let (tx, rx) = mpsc::channel();
    let worker_model = Arc::clone(model);
    let worker_solver = Arc::clone(solver);
    let worker_config = config.clone();
    let worker_y0 = y0.clone();
    let worker_eval = t_eval.to_vec();

    thread::spawn(move || {
        let guard = GuardedRhs::new(worker_model, Some(Instant::now() + timeout));
        let result =
            worker_solver.solve(&guard, span, &worker_y0, &worker_config, Some(&worker_eval));
        // The receiver may already be gone if the deadline fired.
        let _ = tx.send((result, guard.deadline_expired()));
    });

    let outcome = match rx.recv_timeout(timeout) {
        Ok((Ok(output), expired)) => {
            if output.success && expired {
                // Returned in time only because the guard zeroed its
                // derivatives; the budget was still breached.
                AttemptOutcome::Timeout
            } else if output.success {
                AttemptOutcome::Success {
                    t: output.t,
                    y: output.y,
                    message: output.message,
                }
            } else {
                AttemptOutcome::Failure(output.message)
            }
        }
        Ok((Err(err), _)) => AttemptOutcome::Failure(format!("{err:#}")),
        Err(_) => AttemptOutcome::Timeout,
    };

    match &outcome {
        AttemptOutcome::Success { t, .. } => {
            info!("{} succeeded ({} points)", config.name, t.len())
        }
        AttemptOutcome::Failure(msg) => warn!("{} failed: {msg}", config.name),
        AttemptOutcome::Timeout => warn!(
            "{} timed out after {:.1}s",
            config.name,
            timeout.as_secs_f64()
        ),
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use crate::traits::{Derivative, SolverOutput};
    use anyhow::bail;

    struct ZeroModel {
        dim: usize,
    }

    impl RhsModel for ZeroModel {
        fn dimension(&self) -> usize {
            self.dim
        }

        fn apply(&self, _t: f64, _x: &DVector<f64>, out: &mut DVector<f64>) -> anyhow::Result<()> {
            out.fill(0.0);
            Ok(())
        }
    }

    /// Scripted external solver for exercising each outcome class.
    enum Script {
        Succeed,
        ReportFailure,
        Error,
        Sleep(Duration),
    }

    struct ScriptedSolver {
        script: Script,
    }

    impl OdeSolver for ScriptedSolver {
        fn solve(
            &self,
            _rhs: &dyn Derivative,
            _span: (f64, f64),
            y0: &DVector<f64>,
            _config: &SolverConfig,
            t_eval: Option<&[f64]>,
        ) -> anyhow::Result<SolverOutput> {
            match &self.script {
                Script::Succeed => {
                    let t = t_eval.unwrap().to_vec();
                    let cols: Vec<DVector<f64>> = t.iter().map(|_| y0.clone()).collect();
                    Ok(SolverOutput {
                        t,
                        y: DMatrix::from_columns(&cols),
                        success: true,
                        message: "ok".into(),
                    })
                }
                Script::ReportFailure => Ok(SolverOutput {
                    t: Vec::new(),
                    y: DMatrix::zeros(y0.len(), 0),
                    success: false,
                    message: "required step size too small".into(),
                }),
                Script::Error => bail!("solver panic-equivalent"),
                Script::Sleep(d) => {
                    thread::sleep(*d);
                    Ok(SolverOutput {
                        t: vec![0.0],
                        y: DMatrix::from_columns(&[y0.clone()]),
                        success: true,
                        message: "late".into(),
                    })
                }
            }
        }
    }

    fn attempt(script: Script, timeout: Duration) -> AttemptOutcome {
        let model: Arc<dyn RhsModel> = Arc::new(ZeroModel { dim: 2 });
        let solver: Arc<dyn OdeSolver> = Arc::new(ScriptedSolver { script });
        let config = SolverConfig::new("test config", Method::Rk45, 1e-4, 1e-6, 0.5);
        let y0 = DVector::from_vec(vec![1.0, 2.0]);
        run_attempt(
            &model,
            &solver,
            &config,
            (0.0, 1.0),
            &y0,
            &[0.0, 0.5, 1.0],
            timeout,
        )
    }

    #[test]
    fn successful_run_reports_success() {
        match attempt(Script::Succeed, Duration::from_secs(5)) {
            AttemptOutcome::Success { t, y, .. } => {
                assert_eq!(t.len(), 3);
                assert_eq!(y.ncols(), 3);
                assert_eq!(y.nrows(), 2);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn unconverged_run_reports_failure_with_message() {
        match attempt(Script::ReportFailure, Duration::from_secs(5)) {
            AttemptOutcome::Failure(msg) => assert!(msg.contains("step size")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn solver_error_reports_failure() {
        match attempt(Script::Error, Duration::from_secs(5)) {
            AttemptOutcome::Failure(msg) => assert!(msg.contains("panic-equivalent")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    /// A solver that keeps evaluating the RHS until the guard starts
    /// returning zeros, then claims success. The executor must classify
    /// such a run as a timeout, not a success.
    struct SpinningSolver;

    impl OdeSolver for SpinningSolver {
        fn solve(
            &self,
            rhs: &dyn Derivative,
            span: (f64, f64),
            y0: &DVector<f64>,
            _config: &SolverConfig,
            _t_eval: Option<&[f64]>,
        ) -> anyhow::Result<SolverOutput> {
            let mut out = DVector::from_element(y0.len(), 1.0);
            let started = Instant::now();
            while out.iter().any(|&v| v != 0.0) && started.elapsed() < Duration::from_secs(2) {
                rhs.eval(span.0, y0, &mut out);
                thread::sleep(Duration::from_millis(5));
            }
            Ok(SolverOutput {
                t: vec![span.0],
                y: DMatrix::from_columns(&[y0.clone()]),
                success: true,
                message: "wound down".into(),
            })
        }
    }

    #[test]
    fn deadline_breach_is_never_reported_as_success() {
        // A model whose derivative stays nonzero until the guard's
        // deadline expires and zeros it.
        struct OnesModel;
        impl RhsModel for OnesModel {
            fn dimension(&self) -> usize {
                2
            }
            fn apply(
                &self,
                _t: f64,
                _x: &DVector<f64>,
                out: &mut DVector<f64>,
            ) -> anyhow::Result<()> {
                out.fill(1.0);
                Ok(())
            }
        }
        let model: Arc<dyn RhsModel> = Arc::new(OnesModel);
        let solver: Arc<dyn OdeSolver> = Arc::new(SpinningSolver);
        let config = SolverConfig::new("test config", Method::Rk45, 1e-4, 1e-6, 0.5);
        let y0 = DVector::from_vec(vec![1.0, 2.0]);
        let outcome = run_attempt(
            &model,
            &solver,
            &config,
            (0.0, 1.0),
            &y0,
            &[0.0, 1.0],
            Duration::from_millis(50),
        );
        assert!(matches!(outcome, AttemptOutcome::Timeout));
    }

    #[test]
    fn slow_run_reports_timeout() {
        let start = Instant::now();
        let outcome = attempt(
            Script::Sleep(Duration::from_millis(500)),
            Duration::from_millis(50),
        );
        assert!(matches!(outcome, AttemptOutcome::Timeout));
        // The caller must get control back at the deadline, not when the
        // abandoned worker finally finishes.
        assert!(start.elapsed() < Duration::from_millis(400));
    }
}
