use crate::traits::{Derivative, RhsModel};
use log::warn;
use nalgebra::DVector;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Largest derivative magnitude allowed through the guard. A single runaway
/// reaction-rate term is clipped here instead of producing an unbounded step.
pub const MAX_DERIVATIVE: f64 = 1e6;

/// Defensive wrapper around the user-supplied RHS model.
///
/// Every failure mode degrades to a zero derivative (integration pauses at
/// the current state rather than propagating corruption into the solver):
/// - the model returns an error,
/// - any derivative component is NaN or infinite,
/// - the attempt's wall-clock deadline has passed (cooperative wind-down of
///   an abandoned run).
///
/// Finite outputs are clamped componentwise to `[-MAX_DERIVATIVE, MAX_DERIVATIVE]`.
pub struct GuardedRhs {
    model: Arc<dyn RhsModel>,
    deadline: Option<Instant>,
    faults: AtomicUsize,
    expired: AtomicBool,
}

impl GuardedRhs {
    pub fn new(model: Arc<dyn RhsModel>, deadline: Option<Instant>) -> Self {
        Self {
            model,
            deadline,
            faults: AtomicUsize::new(0),
            expired: AtomicBool::new(false),
        }
    }

    /// Number of evaluations that had to be replaced by a zero derivative.
    pub fn fault_count(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    /// Whether the deadline passed during any evaluation.
    pub fn deadline_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }
}

impl Derivative for GuardedRhs {
    fn eval(&self, t: f64, x: &DVector<f64>, out: &mut DVector<f64>) {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expired.store(true, Ordering::Relaxed);
                out.fill(0.0);
                return;
            }
        }

        if let Err(err) = self.model.apply(t, x, out) {
            self.faults.fetch_add(1, Ordering::Relaxed);
            warn!("RHS error at t={t}: {err:#}");
            out.fill(0.0);
            return;
        }

        if out.iter().any(|v| !v.is_finite()) {
            self.faults.fetch_add(1, Ordering::Relaxed);
            warn!("non-finite derivative at t={t}, zeroing");
            out.fill(0.0);
            return;
        }

        for v in out.iter_mut() {
            *v = v.clamp(-MAX_DERIVATIVE, MAX_DERIVATIVE);
        }
    }
}
