//! The `kinesis_core` crate is the adaptive integration engine for stiff
//! metabolic ODE systems: it drives an opaque reaction-rate model to a
//! solution despite solver failures, runaway derivatives and wall-clock
//! overruns.
//!
//! Key components:
//! - **Traits**: `RhsModel` (the biochemical model), `Derivative` (sanitized
//!   derivative), `OdeSolver` (uniform external-solver interface).
//! - **Guard**: `GuardedRhs`, the defensive wrapper keeping derivatives
//!   finite and bounded.
//! - **Engine**: `AdaptiveSolver`, the configuration cascade with segmented
//!   fallback, producing a uniform `IntegrationResult`.
//! - **Solvers**: `ReferenceSolver`, a built-in Dormand-Prince / implicit
//!   theta-method implementation of the `OdeSolver` seam.
pub mod attempt;
pub mod config;
pub mod engine;
pub mod guard;
pub mod solvers;
pub mod traits;
