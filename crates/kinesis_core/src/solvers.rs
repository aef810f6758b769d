use crate::config::{Method, SolverConfig};
use crate::traits::{Derivative, OdeSolver, SolverOutput};
use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

/// Default ODE solver shipped with the engine.
///
/// `Method::Rk45` is an adaptive Dormand-Prince 5(4) embedded pair;
/// `Method::Bdf` and `Method::Radau` map to one-step theta methods
/// (implicit Euler and implicit trapezoidal) with damped Newton correction
/// and a finite-difference Jacobian. The engine only ever talks to this
/// through the [`OdeSolver`] seam, so any external solver library can stand
/// in for it.
pub struct ReferenceSolver {
    /// Hard cap on internal steps before the run is reported unconverged.
    pub max_steps: usize,
}

impl Default for ReferenceSolver {
    fn default() -> Self {
        Self { max_steps: 100_000 }
    }
}

impl OdeSolver for ReferenceSolver {
    fn solve(
        &self,
        rhs: &dyn Derivative,
        span: (f64, f64),
        y0: &DVector<f64>,
        config: &SolverConfig,
        t_eval: Option<&[f64]>,
    ) -> Result<SolverOutput> {
        if !(config.max_step > 0.0) {
            bail!("max_step must be positive, got {}", config.max_step);
        }
        if !(config.rtol > 0.0) || !(config.atol >= 0.0) {
            bail!(
                "invalid tolerances: rtol {}, atol {}",
                config.rtol,
                config.atol
            );
        }
        if span.1 <= span.0 {
            bail!("time span must have positive width");
        }
        match config.method {
            Method::Rk45 => self.solve_rk45(rhs, span, y0, config, t_eval),
            Method::Bdf => self.solve_theta(rhs, span, y0, config, t_eval, 1.0),
            Method::Radau => self.solve_theta(rhs, span, y0, config, t_eval, 0.5),
        }
    }
}

// Dormand-Prince 5(4) tableau.
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A2: [f64; 1] = [1.0 / 5.0];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0];
const A5: [f64; 4] = [
    19372.0 / 6561.0,
    -25360.0 / 2187.0,
    64448.0 / 6561.0,
    -212.0 / 729.0,
];
const A6: [f64; 5] = [
    9017.0 / 3168.0,
    -355.0 / 33.0,
    46732.0 / 5247.0,
    49.0 / 176.0,
    -5103.0 / 18656.0,
];
// Seventh stage coefficients double as the 5th-order weights (FSAL).
const A7: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];
// 5th-order minus embedded 4th-order weights, for the error estimate.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const GRID_TOL: f64 = 1e-12;

impl ReferenceSolver {
    fn solve_rk45(
        &self,
        rhs: &dyn Derivative,
        (t0, t1): (f64, f64),
        y0: &DVector<f64>,
        config: &SolverConfig,
        t_eval: Option<&[f64]>,
    ) -> Result<SolverOutput> {
        let n = y0.len();
        let span_len = t1 - t0;
        let mut rec = Recorder::new(t_eval);

        let mut t = t0;
        let mut y = y0.clone();
        let mut f = DVector::zeros(n);
        rhs.eval(t, &y, &mut f);
        rec.record_initial(t0, &y);

        let hmax = config.max_step.min(span_len);
        let hmin = span_len * 1e-14;
        let mut h = (span_len / 100.0).min(hmax);
        let mut k: Vec<DVector<f64>> = (0..7).map(|_| DVector::zeros(n)).collect();
        let rows: [&[f64]; 6] = [&A2, &A3, &A4, &A5, &A6, &A7];
        let mut nsteps = 0usize;

        while t < t1 - GRID_TOL * span_len.max(1.0) {
            if nsteps >= self.max_steps {
                return Ok(rec.finish(
                    n,
                    false,
                    format!("maximum number of steps exceeded at t={t:.6}"),
                ));
            }
            nsteps += 1;
            if t + h > t1 {
                h = t1 - t;
            }

            k[0].copy_from(&f);
            let mut y_new = y.clone();
            for s in 1..7 {
                let mut ys = y.clone();
                for (j, &aij) in rows[s - 1].iter().enumerate() {
                    if aij != 0.0 {
                        ys.axpy(h * aij, &k[j], 1.0);
                    }
                }
                if s == 6 {
                    // Stage 7 argument is the 5th-order solution itself.
                    y_new = ys.clone();
                }
                rhs.eval(t + C[s] * h, &ys, &mut k[s]);
            }

            let mut err_vec = DVector::zeros(n);
            for (i, &ei) in E.iter().enumerate() {
                if ei != 0.0 {
                    err_vec.axpy(h * ei, &k[i], 1.0);
                }
            }
            let mut err = scaled_rms(&err_vec, &y, &y_new, config);
            if !err.is_finite() {
                err = 1e10;
            }

            if err <= 1.0 {
                rec.record_step(t, t + h, &y, &f, &y_new, &k[6]);
                t += h;
                y.copy_from(&y_new);
                f.copy_from(&k[6]);
            }

            let factor = (0.9 * err.powf(-0.2)).clamp(0.2, 5.0);
            h = (h * factor).min(hmax);
            if h < hmin {
                return Ok(rec.finish(
                    n,
                    false,
                    format!("required step size underflow at t={t:.6}"),
                ));
            }
        }

        rec.flush_tail(&y);
        Ok(rec.finish(n, true, "integration completed".to_string()))
    }

    /// One-step theta method: theta = 1 is implicit Euler, theta = 1/2 the
    /// implicit trapezoidal rule. Steps land exactly on the reporting
    /// points, with sub-steps capped by `max_step`; Newton non-convergence
    /// halves the step down to a floor before giving up.
    fn solve_theta(
        &self,
        rhs: &dyn Derivative,
        (t0, t1): (f64, f64),
        y0: &DVector<f64>,
        config: &SolverConfig,
        t_eval: Option<&[f64]>,
        theta: f64,
    ) -> Result<SolverOutput> {
        let n = y0.len();
        let span_len = t1 - t0;
        let hmin = span_len * 1e-12;

        let targets: Vec<f64> = match t_eval {
            Some(grid) => grid.to_vec(),
            None => {
                let m = (span_len / config.max_step).ceil().max(1.0) as usize;
                let mut points: Vec<f64> = (0..=m)
                    .map(|i| t0 + span_len * i as f64 / m as f64)
                    .collect();
                points[m] = t1;
                points
            }
        };

        let mut out_t: Vec<f64> = Vec::with_capacity(targets.len());
        let mut cols: Vec<DVector<f64>> = Vec::with_capacity(targets.len());
        let mut t = t0;
        let mut y = y0.clone();
        let mut nsteps = 0usize;

        for &target in &targets {
            while target - t > GRID_TOL * span_len.max(1.0) {
                if nsteps >= self.max_steps {
                    return Ok(theta_output(
                        n,
                        out_t,
                        cols,
                        false,
                        format!("maximum number of steps exceeded at t={t:.6}"),
                    ));
                }
                let remaining = target - t;
                let mut h = remaining.min(config.max_step);
                loop {
                    match implicit_step(rhs, t, &y, h, theta, config) {
                        Some(y_next) => {
                            nsteps += 1;
                            t = if h >= remaining { target } else { t + h };
                            y = y_next;
                            break;
                        }
                        None => {
                            h /= 2.0;
                            if h < hmin {
                                return Ok(theta_output(
                                    n,
                                    out_t,
                                    cols,
                                    false,
                                    format!(
                                        "Newton iteration failed to converge at t={t:.6}"
                                    ),
                                ));
                            }
                        }
                    }
                }
            }
            out_t.push(target);
            cols.push(y.clone());
        }

        Ok(theta_output(
            n,
            out_t,
            cols,
            true,
            "integration completed".to_string(),
        ))
    }
}

fn theta_output(
    n: usize,
    t: Vec<f64>,
    cols: Vec<DVector<f64>>,
    success: bool,
    message: String,
) -> SolverOutput {
    let y = if cols.is_empty() {
        DMatrix::zeros(n, 0)
    } else {
        DMatrix::from_columns(&cols)
    };
    SolverOutput {
        t,
        y,
        success,
        message,
    }
}

/// Newton iteration limits for the implicit steppers.
#[derive(Debug, Clone, Copy)]
struct NewtonSettings {
    max_steps: usize,
    damping: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 8,
            damping: 1.0,
        }
    }
}

/// Solves y_new = y + h * (theta * f(t+h, y_new) + (1-theta) * f(t, y))
/// by damped Newton with a finite-difference Jacobian. `None` means the
/// iteration did not converge (or the Newton matrix was singular); the
/// caller retries with a smaller step.
fn implicit_step(
    rhs: &dyn Derivative,
    t: f64,
    y: &DVector<f64>,
    h: f64,
    theta: f64,
    config: &SolverConfig,
) -> Option<DVector<f64>> {
    let n = y.len();
    let settings = NewtonSettings::default();
    let t_new = t + h;

    let mut f0 = DVector::zeros(n);
    rhs.eval(t, y, &mut f0);

    // Explicit Euler predictor.
    let mut y_new = y + &f0 * h;
    let mut f_new = DVector::zeros(n);

    for _ in 0..settings.max_steps {
        rhs.eval(t_new, &y_new, &mut f_new);
        let residual = &y_new - y - &f_new * (h * theta) - &f0 * (h * (1.0 - theta));
        let err = scaled_rms(&residual, &y_new, &y_new, config);
        if !err.is_finite() {
            return None;
        }
        // Residual well below the local error tolerance: converged.
        if err < 0.1 {
            return Some(y_new);
        }

        let jacobian = fd_jacobian(rhs, t_new, &y_new, &f_new);
        let mut lhs = jacobian * (-h * theta);
        for i in 0..n {
            lhs[(i, i)] += 1.0;
        }
        let delta = lhs.lu().solve(&residual)?;
        y_new.axpy(-settings.damping, &delta, 1.0);
    }

    // Accept a marginal iterate only if the residual is still within the
    // local tolerance outright.
    rhs.eval(t_new, &y_new, &mut f_new);
    let residual = &y_new - y - &f_new * (h * theta) - &f0 * (h * (1.0 - theta));
    let err = scaled_rms(&residual, &y_new, &y_new, config);
    if err.is_finite() && err < 1.0 {
        Some(y_new)
    } else {
        None
    }
}

/// Forward-difference Jacobian of the derivative function at (t, y).
fn fd_jacobian(rhs: &dyn Derivative, t: f64, y: &DVector<f64>, f: &DVector<f64>) -> DMatrix<f64> {
    let n = y.len();
    let mut jacobian = DMatrix::zeros(n, n);
    let mut y_pert = y.clone();
    let mut f_pert = DVector::zeros(n);
    for j in 0..n {
        let delta = y[j].abs().max(1.0) * 1e-8;
        let original = y_pert[j];
        y_pert[j] = original + delta;
        rhs.eval(t, &y_pert, &mut f_pert);
        for i in 0..n {
            jacobian[(i, j)] = (f_pert[i] - f[i]) / delta;
        }
        y_pert[j] = original;
    }
    jacobian
}

/// Weighted RMS norm of `v` against the tolerance profile
/// `atol + rtol * max(|a_i|, |b_i|)`.
fn scaled_rms(v: &DVector<f64>, a: &DVector<f64>, b: &DVector<f64>, config: &SolverConfig) -> f64 {
    let n = v.len();
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = v
        .iter()
        .zip(a.iter().zip(b.iter()))
        .map(|(&vi, (&ai, &bi))| {
            let scale = config.atol + config.rtol * ai.abs().max(bi.abs());
            (vi / scale) * (vi / scale)
        })
        .sum();
    (sum / n as f64).sqrt()
}

/// Buffers reported points for the adaptive RK path: either every accepted
/// step, or the evaluation grid via cubic Hermite interpolation inside each
/// accepted step.
struct Recorder<'a> {
    t_eval: Option<&'a [f64]>,
    next: usize,
    t: Vec<f64>,
    cols: Vec<DVector<f64>>,
}

impl<'a> Recorder<'a> {
    fn new(t_eval: Option<&'a [f64]>) -> Self {
        Self {
            t_eval,
            next: 0,
            t: Vec::new(),
            cols: Vec::new(),
        }
    }

    fn record_initial(&mut self, t0: f64, y0: &DVector<f64>) {
        match self.t_eval {
            Some(grid) => {
                while self.next < grid.len() && grid[self.next] <= t0 + GRID_TOL {
                    self.t.push(grid[self.next]);
                    self.cols.push(y0.clone());
                    self.next += 1;
                }
            }
            None => {
                self.t.push(t0);
                self.cols.push(y0.clone());
            }
        }
    }

    fn record_step(
        &mut self,
        t_old: f64,
        t_new: f64,
        y_old: &DVector<f64>,
        f_old: &DVector<f64>,
        y_new: &DVector<f64>,
        f_new: &DVector<f64>,
    ) {
        match self.t_eval {
            Some(grid) => {
                let h = t_new - t_old;
                while self.next < grid.len() && grid[self.next] <= t_new + GRID_TOL {
                    let s = ((grid[self.next] - t_old) / h).clamp(0.0, 1.0);
                    self.t.push(grid[self.next]);
                    self.cols.push(hermite(s, h, y_old, f_old, y_new, f_new));
                    self.next += 1;
                }
            }
            None => {
                self.t.push(t_new);
                self.cols.push(y_new.clone());
            }
        }
    }

    /// Consumes grid points left over by floating-point drift at the end of
    /// the span, reporting the terminal state for them.
    fn flush_tail(&mut self, y: &DVector<f64>) {
        if let Some(grid) = self.t_eval {
            while self.next < grid.len() {
                self.t.push(grid[self.next]);
                self.cols.push(y.clone());
                self.next += 1;
            }
        }
    }

    fn finish(self, n: usize, success: bool, message: String) -> SolverOutput {
        let y = if self.cols.is_empty() {
            DMatrix::zeros(n, 0)
        } else {
            DMatrix::from_columns(&self.cols)
        };
        SolverOutput {
            t: self.t,
            y,
            success,
            message,
        }
    }
}

/// Cubic Hermite interpolant over one accepted step, `s` in [0, 1].
fn hermite(
    s: f64,
    h: f64,
    y_old: &DVector<f64>,
    f_old: &DVector<f64>,
    y_new: &DVector<f64>,
    f_new: &DVector<f64>,
) -> DVector<f64> {
    let s2 = s * s;
    let s3 = s2 * s;
    let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
    let h10 = s3 - 2.0 * s2 + s;
    let h01 = -2.0 * s3 + 3.0 * s2;
    let h11 = s3 - s2;
    let mut out = y_old * h00;
    out.axpy(h10 * h, f_old, 1.0);
    out.axpy(h01, y_new, 1.0);
    out.axpy(h11 * h, f_new, 1.0);
    out
}
